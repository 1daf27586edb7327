//! Health monitor: per-capability outcome counters and threshold alerts.
//!
//! Per-capability counters are keyed `"<capability>:<outcome>"`. Totals per
//! outcome live in a separate table; thresholds name them `"*:<outcome>"`.
//! Because the two tables never share keys, a capability literally named
//! `*` is counted exactly once in each.
//!
//! Thresholds are checked after every observation. An alert fires once,
//! when its counter first reaches the threshold, and stays active until
//! [`HealthMonitor::clear_alert`].
//!
//! The monitor never touches lifecycle state. A `Critical` alert comes
//! back with `pause_requested` set and the node acts on it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::kernel::audit::AuditLog;
use crate::types::{Outcome, Severity};

/// Capability placeholder thresholds use to name an outcome total.
pub const AGGREGATE: &str = "*";

/// Counter key for one capability and outcome.
pub fn counter_key(capability: &str, outcome: Outcome) -> String {
    format!("{capability}:{}", outcome.as_str())
}

/// Threshold configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HealthError {
    /// Two thresholds share a name.
    #[error("duplicate health threshold name '{name}'")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },
    /// A threshold cannot produce a meaningful alert.
    #[error("health threshold '{name}' {reason}")]
    InvalidThreshold {
        /// Threshold name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// A configured alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThreshold {
    /// Unique alert name.
    pub name: String,
    /// Counter watched, e.g. `"*:denied"` or `"qsk.read:failed"`.
    pub counter: String,
    /// Fires when the counter reaches this value.
    pub threshold: u64,
    /// `Warning` or `Critical`.
    pub severity: Severity,
}

impl AlertThreshold {
    /// Check the threshold can fire a well-formed alert.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError::InvalidThreshold`] for a severity other than
    /// `Warning`/`Critical`, a zero threshold, or a counter that is not
    /// `"<capability>:<outcome>"`.
    pub fn validate(&self) -> Result<(), HealthError> {
        let invalid = |reason: String| HealthError::InvalidThreshold {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("has an empty name".to_owned()));
        }
        if !matches!(self.severity, Severity::Warning | Severity::Critical) {
            return Err(invalid(format!(
                "must be warning or critical, got {}",
                self.severity
            )));
        }
        if self.threshold == 0 {
            return Err(invalid("must be at least 1".to_owned()));
        }
        match self.counter.rsplit_once(':') {
            Some((capability, outcome))
                if !capability.is_empty() && outcome.parse::<Outcome>().is_ok() =>
            {
                Ok(())
            }
            _ => Err(invalid(format!(
                "watches '{}', expected '<capability>:<outcome>'",
                self.counter
            ))),
        }
    }
}

/// Validate every threshold and check names are unique.
///
/// # Errors
///
/// Returns the first [`HealthError`] found, in list order.
pub fn validate_thresholds(thresholds: &[AlertThreshold]) -> Result<(), HealthError> {
    let mut names = BTreeSet::new();
    for t in thresholds {
        t.validate()?;
        if !names.insert(t.name.as_str()) {
            return Err(HealthError::DuplicateName {
                name: t.name.clone(),
            });
        }
    }
    Ok(())
}

/// A fired alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthAlert {
    /// Threshold name.
    pub name: String,
    /// Severity of the incident to raise.
    pub severity: Severity,
    /// Counter that crossed.
    pub counter: String,
    /// Counter value at the time of firing.
    pub value: u64,
    /// Configured threshold.
    pub threshold: u64,
    /// Whether the node should pause.
    pub pause_requested: bool,
}

/// Point-in-time view of counters and active alerts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Non-zero per-capability counters.
    pub counters: BTreeMap<String, u64>,
    /// Non-zero totals per outcome.
    pub totals: BTreeMap<Outcome, u64>,
    /// Names of alerts that have fired and not been cleared.
    pub alerts: BTreeSet<String>,
}

/// Deterministic counter store with threshold alerts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthMonitor {
    thresholds: Vec<AlertThreshold>,
    counters: BTreeMap<String, u64>,
    totals: BTreeMap<Outcome, u64>,
    active: BTreeSet<String>,
}

impl HealthMonitor {
    /// Monitor with the given thresholds and zeroed counters. Thresholds are
    /// taken as given; see [`validate_thresholds`].
    pub fn new(thresholds: Vec<AlertThreshold>) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    /// Rebuild counters and active alerts by replaying `syscall.*` entries
    /// from `audit`. Entries of other types are skipped. Alerts re-fired
    /// here were already reported when they first crossed, so they are not
    /// logged again.
    pub fn rebuild(thresholds: Vec<AlertThreshold>, audit: &AuditLog) -> Self {
        let mut monitor = Self::new(thresholds);
        for entry in audit.iter() {
            let Some(outcome) = Outcome::from_event_type(&entry.event_type) else {
                continue;
            };
            let capability = entry
                .data
                .get("capability")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            monitor.record(capability, outcome, false);
        }
        monitor
    }

    /// Count one outcome for `capability` and return any alerts that fired.
    pub fn observe(&mut self, capability: &str, outcome: Outcome) -> Vec<HealthAlert> {
        self.record(capability, outcome, true)
    }

    /// Fire `name` if `counter` has reached `threshold` and the alert is
    /// not already active.
    pub fn alert_if_threshold(
        &mut self,
        name: &str,
        counter: &str,
        threshold: u64,
        severity: Severity,
    ) -> Option<HealthAlert> {
        self.check(name, counter, threshold, severity, true)
    }

    /// Re-arm a fired alert. Returns whether it was active.
    pub fn clear_alert(&mut self, name: &str) -> bool {
        self.active.remove(name)
    }

    /// Replace the active alert set, e.g. with one recorded in a snapshot
    /// after alerts were cleared by an operator.
    pub fn restore_alerts(&mut self, alerts: BTreeSet<String>) {
        self.active = alerts;
    }

    /// Current value of a threshold counter: `"*:<outcome>"` reads the
    /// total, anything else a per-capability counter. Zero when never
    /// observed.
    pub fn counter(&self, key: &str) -> u64 {
        match key
            .strip_prefix(AGGREGATE)
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|o| o.parse::<Outcome>().ok())
        {
            Some(outcome) => self.total(outcome),
            None => self.counters.get(key).copied().unwrap_or(0),
        }
    }

    /// Per-capability count, whatever the capability is named.
    pub fn capability_counter(&self, capability: &str, outcome: Outcome) -> u64 {
        self.counters
            .get(&counter_key(capability, outcome))
            .copied()
            .unwrap_or(0)
    }

    /// Total count of `outcome` across all capabilities.
    pub fn total(&self, outcome: Outcome) -> u64 {
        self.totals.get(&outcome).copied().unwrap_or(0)
    }

    /// Configured thresholds.
    pub fn thresholds(&self) -> &[AlertThreshold] {
        &self.thresholds
    }

    /// Whether `name` is currently active.
    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains(name)
    }

    /// Copy of counters and active alerts.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            counters: self.counters.clone(),
            totals: self.totals.clone(),
            alerts: self.active.clone(),
        }
    }

    fn record(&mut self, capability: &str, outcome: Outcome, announce: bool) -> Vec<HealthAlert> {
        let slot = self
            .counters
            .entry(counter_key(capability, outcome))
            .or_insert(0);
        *slot = slot.saturating_add(1);
        let total = self.totals.entry(outcome).or_insert(0);
        *total = total.saturating_add(1);

        let thresholds = self.thresholds.clone();
        thresholds
            .iter()
            .filter_map(|t| self.check(&t.name, &t.counter, t.threshold, t.severity, announce))
            .collect()
    }

    fn check(
        &mut self,
        name: &str,
        counter: &str,
        threshold: u64,
        severity: Severity,
        announce: bool,
    ) -> Option<HealthAlert> {
        let value = self.counter(counter);
        if value < threshold || self.active.contains(name) {
            return None;
        }
        self.active.insert(name.to_owned());
        let pause_requested = severity == Severity::Critical;
        if announce {
            warn!(
                alert = name,
                counter,
                value,
                threshold,
                severity = %severity,
                pause_requested,
                "health threshold crossed"
            );
        }
        Some(HealthAlert {
            name: name.to_owned(),
            severity,
            counter: counter.to_owned(),
            value,
            threshold,
            pause_requested,
        })
    }
}
