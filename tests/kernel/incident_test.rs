//! Incident log ordering and filtered queries.

use nodekernel::kernel::incident::{IncidentFilter, IncidentLog, IncidentRecord};
use nodekernel::types::Severity;
use serde_json::json;

fn record(severity: Severity, capability: &str, tick: u64) -> IncidentRecord {
    IncidentRecord {
        severity,
        cause: format!("{capability}@{tick}"),
        context: json!({}),
        timestamp: String::new(),
        tick,
        capability: Some(capability.to_owned()),
        query_id: Some(format!("q-{tick}")),
    }
}

fn populated() -> IncidentLog {
    let mut log = IncidentLog::new();
    log.append(record(Severity::Warning, "bio.read", 1));
    log.append(record(Severity::Error, "qsk.write", 2));
    log.append(record(Severity::Critical, "qsk.write", 3));
    log.append(record(Severity::Warning, "qsk.read", 4));
    log
}

fn causes<'a>(it: impl Iterator<Item = &'a IncidentRecord>) -> Vec<&'a str> {
    it.map(|r| r.cause.as_str()).collect()
}

#[test]
fn append_preserves_order() {
    let log = populated();
    assert_eq!(log.len(), 4);
    let ticks: Vec<u64> = log.records().iter().map(|r| r.tick).collect();
    assert_eq!(ticks, vec![1, 2, 3, 4]);
}

#[test]
fn min_severity_filter() {
    let log = populated();
    let filter = IncidentFilter::new().min_severity(Severity::Error);
    assert_eq!(
        causes(log.query(&filter)),
        vec!["qsk.write@2", "qsk.write@3"]
    );
}

#[test]
fn capability_and_range_filters_combine() {
    let log = populated();
    let filter = IncidentFilter::new()
        .capability("qsk.write")
        .since_tick(3)
        .until_tick(10);
    assert_eq!(causes(log.query(&filter)), vec!["qsk.write@3"]);
}

#[test]
fn query_is_restartable() {
    let log = populated();
    let filter = IncidentFilter::new().min_severity(Severity::Warning);
    let first = causes(log.query(&filter));
    let second = causes(log.query(&filter));
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

#[test]
fn query_is_lazy_and_finite() {
    let log = populated();
    let filter = IncidentFilter::new();
    let mut it = log.query(&filter);
    assert_eq!(it.next().map(|r| r.tick), Some(1));
    assert_eq!(it.count(), 3);
}

#[test]
fn counts_by_severity_covers_all_levels() {
    let counts = populated().counts_by_severity();
    assert_eq!(
        counts,
        vec![
            (Severity::Info, 0),
            (Severity::Warning, 2),
            (Severity::Error, 1),
            (Severity::Critical, 1),
        ]
    );
}
