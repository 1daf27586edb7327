//! Incident log: structured records of denials, failures and health alerts.
//!
//! Strictly additive and ordered by append. Queries borrow the log and are
//! restartable: the same filter over the same log yields the same records.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Payload, Severity};

/// A single incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// How severe the incident is.
    pub severity: Severity,
    /// Short cause, e.g. the denial reason.
    pub cause: String,
    /// Structured context.
    pub context: Payload,
    /// ISO-8601 UTC timestamp (cosmetic).
    pub timestamp: String,
    /// Logical tick at which the incident was raised.
    pub tick: u64,
    /// Capability involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Correlating query id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

/// Filter for [`IncidentLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentFilter {
    min_severity: Option<Severity>,
    capability: Option<String>,
    since_tick: Option<u64>,
    until_tick: Option<u64>,
}

impl IncidentFilter {
    /// Match everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only records at or above `severity`.
    #[must_use]
    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    /// Only records for `capability`.
    #[must_use]
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Only records with `tick >= since`.
    #[must_use]
    pub fn since_tick(mut self, since: u64) -> Self {
        self.since_tick = Some(since);
        self
    }

    /// Only records with `tick <= until`.
    #[must_use]
    pub fn until_tick(mut self, until: u64) -> Self {
        self.until_tick = Some(until);
        self
    }

    /// Whether `record` passes the filter.
    pub fn matches(&self, record: &IncidentRecord) -> bool {
        self.min_severity.map_or(true, |min| record.severity >= min)
            && self
                .capability
                .as_deref()
                .map_or(true, |cap| record.capability.as_deref() == Some(cap))
            && self.since_tick.map_or(true, |since| record.tick >= since)
            && self.until_tick.map_or(true, |until| record.tick <= until)
    }
}

/// Append-only incident store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncidentLog {
    records: Vec<IncidentRecord>,
}

impl IncidentLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored records in order.
    pub fn from_records(records: Vec<IncidentRecord>) -> Self {
        Self { records }
    }

    /// Append a record.
    pub fn append(&mut self, record: IncidentRecord) {
        warn!(
            severity = %record.severity,
            cause = %record.cause,
            capability = record.capability.as_deref().unwrap_or(""),
            query_id = record.query_id.as_deref().unwrap_or(""),
            "incident recorded"
        );
        self.records.push(record);
    }

    /// Lazily yield records matching `filter`, in append order.
    pub fn query<'a>(
        &'a self,
        filter: &'a IncidentFilter,
    ) -> impl Iterator<Item = &'a IncidentRecord> + 'a {
        self.records.iter().filter(move |r| filter.matches(r))
    }

    /// All records, oldest first.
    pub fn records(&self) -> &[IncidentRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count of records per severity, in severity order.
    pub fn counts_by_severity(&self) -> Vec<(Severity, usize)> {
        [
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ]
        .into_iter()
        .map(|s| (s, self.records.iter().filter(|r| r.severity == s).count()))
        .collect()
    }
}
