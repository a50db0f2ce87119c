//! Kernel feature detection and `/proc/sys` writes.

use std::fs;

use tracing::{debug, warn};

use crate::dataplane::{FeatureDetector, SysctlWriter};
use crate::error::DataplaneError;

const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// First kernel with masked fwmark matching in policy rules (FRA_FWMASK).
const MIN_MARK_MASK_KERNEL: (u32, u32, u32) = (2, 6, 19);

/// Kernel version as `(major, minor, patch)`.
pub type KernelVersion = (u32, u32, u32);

/// Features read once from the running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelFeatures {
    version: Option<KernelVersion>,
}

impl KernelFeatures {
    /// Reads the running kernel's release.
    ///
    /// An unreadable or unparsable release counts as unsupported.
    #[must_use]
    pub fn detect() -> Self {
        let version = match fs::read_to_string(OSRELEASE_PATH) {
            Ok(release) => parse_kernel_version(&release),
            Err(err) => {
                warn!(path = OSRELEASE_PATH, error = %err, "unable to read kernel release");
                None
            }
        };
        debug!(?version, "detected kernel version");
        Self { version }
    }

    /// Features of a known kernel version.
    #[must_use]
    pub const fn with_version(version: KernelVersion) -> Self {
        Self { version: Some(version) }
    }

    /// The detected version, if any.
    #[must_use]
    pub const fn version(&self) -> Option<KernelVersion> {
        self.version
    }
}

impl FeatureDetector for KernelFeatures {
    fn supports_inverted_mark_mask(&self) -> bool {
        self.version.is_some_and(|v| v >= MIN_MARK_MASK_KERNEL)
    }
}

/// Parses a release string such as `6.8.0-45-generic`.
#[must_use]
pub fn parse_kernel_version(release: &str) -> Option<KernelVersion> {
    let mut parts = release
        .trim()
        .split(['.', '-', '+', '_'])
        .map(|p| p.chars().take_while(char::is_ascii_digit).collect::<String>());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// Writes tunables straight to `/proc/sys`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcSysWriter;

impl SysctlWriter for ProcSysWriter {
    fn write(&mut self, path: &str, value: &str) -> Result<(), DataplaneError> {
        debug!(path, value, "writing sysctl");
        fs::write(path, value)?;
        Ok(())
    }
}
