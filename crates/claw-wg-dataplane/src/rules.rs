//! Policy-rule reconciliation by whole-set replacement.
//!
//! Rules at one priority have no stable identity in the kernel, so when the
//! desired set differs from the last programmed one in any way, every old
//! rule is deleted and every new one added. An equal set issues no calls.

use std::collections::BTreeSet;

use tracing::debug;

use crate::dataplane::RulePort;
use crate::error::{Result, WireguardError};
use crate::types::RuleSpec;

/// Counts of rule operations issued by one reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleDelta {
    /// Rules added.
    pub added: usize,
    /// Rules deleted.
    pub deleted: usize,
}

/// Keeps the kernel's rules at one priority equal to a desired set.
#[derive(Debug, Clone)]
pub struct RuleReconciler {
    priority: u32,
    table: u32,
    // `None` until read back from the kernel.
    applied: Option<BTreeSet<RuleSpec>>,
}

impl RuleReconciler {
    /// Creates a reconciler owning rules at `priority` that look up `table`.
    #[must_use]
    pub fn new(priority: u32, table: u32) -> Self {
        Self { priority, table, applied: None }
    }

    /// The last programmed set, if known.
    #[must_use]
    pub fn applied(&self) -> Option<&BTreeSet<RuleSpec>> {
        self.applied.as_ref()
    }

    /// Forgets the programmed set so the next reconcile reads the kernel.
    pub fn invalidate(&mut self) {
        self.applied = None;
    }

    /// Brings the kernel to `desired`.
    pub fn reconcile(&mut self, port: &mut dyn RulePort, desired: &BTreeSet<RuleSpec>) -> Result<RuleDelta> {
        let (applied, duplicates) = self.load(port)?;
        let mut delta = RuleDelta { added: 0, deleted: duplicates };
        if applied == *desired {
            return Ok(delta);
        }

        let stale: Vec<RuleSpec> = applied.iter().copied().collect();
        for rule in stale {
            self.delete(port, &rule)?;
            delta.deleted += 1;
        }
        for rule in desired {
            port.add_rule(rule).map_err(|source| WireguardError::Rule { rule: Some(*rule), source })?;
            debug!(%rule, "added routing rule");
            self.cache().insert(*rule);
            delta.added += 1;
        }
        Ok(delta)
    }

    /// Deletes every rule this reconciler owns.
    pub fn clear(&mut self, port: &mut dyn RulePort) -> Result<usize> {
        let (applied, duplicates) = self.load(port)?;
        for rule in &applied {
            self.delete(port, rule)?;
        }
        Ok(applied.len() + duplicates)
    }

    // Returns the programmed set and how many duplicate kernel copies were removed.
    fn load(&mut self, port: &mut dyn RulePort) -> Result<(BTreeSet<RuleSpec>, usize)> {
        if let Some(applied) = &self.applied {
            return Ok((applied.clone(), 0));
        }
        let listed = port
            .list_rules(self.priority)
            .map_err(|source| WireguardError::Rule { rule: None, source })?;
        let mut ours = BTreeSet::new();
        let mut duplicates = Vec::new();
        for rule in listed.into_iter().filter(|r| r.table == self.table) {
            if !ours.insert(rule) {
                duplicates.push(rule);
            }
        }
        debug!(
            priority = self.priority,
            table = self.table,
            count = ours.len(),
            duplicates = duplicates.len(),
            "read routing rules from kernel"
        );
        // Identical rules delete one copy at a time; keep one per spec.
        for rule in &duplicates {
            Self::delete_from_kernel(port, rule)?;
        }
        self.applied = Some(ours.clone());
        Ok((ours, duplicates.len()))
    }

    fn delete(&mut self, port: &mut dyn RulePort, rule: &RuleSpec) -> Result<()> {
        Self::delete_from_kernel(port, rule)?;
        self.cache().remove(rule);
        Ok(())
    }

    fn delete_from_kernel(port: &mut dyn RulePort, rule: &RuleSpec) -> Result<()> {
        match port.delete_rule(rule) {
            Ok(()) => debug!(%rule, "deleted routing rule"),
            Err(err) if err.is_not_found() => debug!(%rule, "routing rule already gone"),
            Err(source) => return Err(WireguardError::Rule { rule: Some(*rule), source }),
        }
        Ok(())
    }

    fn cache(&mut self) -> &mut BTreeSet<RuleSpec> {
        self.applied.get_or_insert_with(BTreeSet::new)
    }
}
