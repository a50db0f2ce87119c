//! Rule and route ports backed by iproute2.
//!
//! Listing uses `ip -j` and parses the JSON; mutations run one `ip`
//! invocation each. Requires `CAP_NET_ADMIN`.

use std::net::IpAddr;
use std::process::Command;

use ipnet::IpNet;
use serde::Deserialize;
use tracing::debug;

use crate::dataplane::{RoutePort, RulePort};
use crate::error::DataplaneError;
use crate::types::{IpFamily, RouteEntry, RouteKind, RuleSpec};

/// Runs `ip` for one address family.
#[derive(Debug, Clone)]
struct IpCommand {
    family: IpFamily,
}

impl IpCommand {
    fn run(&self, args: &[String]) -> Result<Vec<u8>, DataplaneError> {
        let mut full = vec![self.family.ip_flag().to_string()];
        full.extend_from_slice(args);
        debug!(args = ?full, "running ip");

        let output = Command::new("ip").args(&full).output()?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let command = format!("ip {}", full.join(" "));
        // Deleting something already gone.
        if stderr.contains("No such file or directory") || stderr.contains("No such process") {
            return Err(DataplaneError::NotFound(command));
        }
        if stderr.contains("File exists") {
            return Err(DataplaneError::AlreadyExists(command));
        }
        Err(DataplaneError::Command { command, stderr })
    }
}

/// Policy rules via `ip rule`.
#[derive(Debug, Clone)]
pub struct IpRules {
    ip: IpCommand,
}

impl IpRules {
    /// Creates a rule port for `family`.
    #[must_use]
    pub fn new(family: IpFamily) -> Self {
        Self { ip: IpCommand { family } }
    }
}

impl RulePort for IpRules {
    fn list_rules(&mut self, priority: u32) -> Result<Vec<RuleSpec>, DataplaneError> {
        let out = self.ip.run(&strings(&["-j", "rule", "show", "pref", &priority.to_string()]))?;
        parse_rules(&out, self.ip.family)
    }

    fn add_rule(&mut self, rule: &RuleSpec) -> Result<(), DataplaneError> {
        self.ip.run(&rule_args("add", rule)).map(drop)
    }

    fn delete_rule(&mut self, rule: &RuleSpec) -> Result<(), DataplaneError> {
        self.ip.run(&rule_args("del", rule)).map(drop)
    }
}

/// Routes via `ip route`.
#[derive(Debug, Clone)]
pub struct IpRoutes {
    ip: IpCommand,
}

impl IpRoutes {
    /// Creates a route port for `family`.
    #[must_use]
    pub fn new(family: IpFamily) -> Self {
        Self { ip: IpCommand { family } }
    }
}

impl RoutePort for IpRoutes {
    fn list_routes(&mut self, table: u32, protocol: u8) -> Result<Vec<RouteEntry>, DataplaneError> {
        let args = strings(&[
            "-j",
            "route",
            "show",
            "table",
            &table.to_string(),
            "proto",
            &protocol.to_string(),
        ]);
        let out = self.ip.run(&args)?;
        parse_routes(&out, self.ip.family, table, protocol)
    }

    fn add_route(&mut self, route: &RouteEntry) -> Result<(), DataplaneError> {
        self.ip.run(&route_args("replace", route)).map(drop)
    }

    fn delete_route(&mut self, route: &RouteEntry) -> Result<(), DataplaneError> {
        self.ip.run(&route_args("del", route)).map(drop)
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

fn rule_args(verb: &str, rule: &RuleSpec) -> Vec<String> {
    let mut args = strings(&["rule", verb, "pref"]);
    args.push(rule.priority.to_string());
    if rule.invert {
        args.push("not".into());
    }
    if let Some(src) = rule.src {
        args.push("from".into());
        args.push(src.to_string());
    }
    args.push("fwmark".into());
    args.push(format!("{:#x}/{:#x}", rule.mark, rule.mask));
    args.push("table".into());
    args.push(rule.table.to_string());
    args
}

fn route_args(verb: &str, route: &RouteEntry) -> Vec<String> {
    let mut args = strings(&["route", verb]);
    match &route.kind {
        RouteKind::Interface { name, .. } => {
            args.push(route.cidr.to_string());
            args.push("dev".into());
            args.push(name.clone());
        }
        RouteKind::Throw => {
            args.push("throw".into());
            args.push(route.cidr.to_string());
        }
    }
    args.push("table".into());
    args.push(route.table.to_string());
    args.push("proto".into());
    args.push(route.protocol.to_string());
    args
}

#[derive(Debug, Deserialize)]
struct JsonRule {
    priority: u32,
    #[serde(default)]
    not: Option<serde_json::Value>,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    srclen: Option<u8>,
    #[serde(default)]
    fwmark: Option<String>,
    #[serde(default)]
    fwmask: Option<String>,
    #[serde(default)]
    table: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRoute {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    dst: String,
    #[serde(default)]
    dev: Option<String>,
}

fn parse_err(what: &'static str, detail: impl ToString) -> DataplaneError {
    DataplaneError::Parse { what, detail: detail.to_string() }
}

fn parse_hex(s: &str) -> Result<u32, DataplaneError> {
    let digits = s.trim_start_matches("0x");
    u32::from_str_radix(digits, 16).map_err(|e| parse_err("fwmark", format!("{s}: {e}")))
}

/// `ip` prints host destinations without a prefix length.
fn parse_net(dst: &str, len: Option<u8>, family: IpFamily) -> Result<IpNet, DataplaneError> {
    if dst.contains('/') {
        return dst.parse().map_err(|e| parse_err("cidr", format!("{dst}: {e}")));
    }
    let addr: IpAddr = dst.parse().map_err(|e| parse_err("address", format!("{dst}: {e}")))?;
    IpNet::new(addr, len.unwrap_or_else(|| family.full_prefix_len()))
        .map_err(|e| parse_err("prefix", format!("{dst}: {e}")))
}

fn parse_table(value: Option<&serde_json::Value>) -> Option<u32> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => match s.as_str() {
            "main" => Some(254),
            "local" => Some(255),
            "default" => Some(253),
            other => other.parse().ok(),
        },
        _ => None,
    }
}

fn parse_rules(out: &[u8], family: IpFamily) -> Result<Vec<RuleSpec>, DataplaneError> {
    if out.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let raw: Vec<JsonRule> = serde_json::from_slice(out).map_err(|e| parse_err("ip rule output", e))?;

    let mut rules = Vec::with_capacity(raw.len());
    for r in raw {
        // Rules without a table lookup (e.g. goto, blackhole) are not ours.
        let Some(table) = parse_table(r.table.as_ref()) else {
            continue;
        };
        let (mark, mask) = match r.fwmark.as_deref() {
            Some(spec) => match spec.split_once('/') {
                Some((mark, mask)) => (parse_hex(mark)?, parse_hex(mask)?),
                None => {
                    let mark = parse_hex(spec)?;
                    let mask = r.fwmask.as_deref().map_or(Ok(u32::MAX), parse_hex)?;
                    (mark, mask)
                }
            },
            None => (0, 0),
        };
        let src = match r.src.as_deref() {
            None | Some("all") => None,
            Some(src) => Some(parse_net(src, r.srclen, family)?),
        };
        rules.push(RuleSpec { priority: r.priority, table, invert: r.not.is_some(), mark, mask, src });
    }
    Ok(rules)
}

/// Listed interface routes carry index 0; `ip -j` reports only the name.
fn parse_routes(
    out: &[u8],
    family: IpFamily,
    table: u32,
    protocol: u8,
) -> Result<Vec<RouteEntry>, DataplaneError> {
    if out.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let raw: Vec<JsonRoute> = serde_json::from_slice(out).map_err(|e| parse_err("ip route output", e))?;

    let mut routes = Vec::with_capacity(raw.len());
    for r in raw {
        let cidr = if r.dst == "default" {
            IpNet::new(family.unspecified(), 0).map_err(|e| parse_err("prefix", e))?
        } else {
            parse_net(&r.dst, None, family)?
        };
        let kind = match (r.kind.as_deref(), r.dev) {
            (Some("throw"), _) => RouteKind::Throw,
            (_, Some(name)) => RouteKind::Interface { name, index: 0 },
            _ => {
                debug!(dst = %r.dst, "skipping route with no device");
                continue;
            }
        };
        routes.push(RouteEntry { table, cidr, kind, protocol });
    }
    Ok(routes)
}
