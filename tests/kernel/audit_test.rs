//! Audit chain: genesis, linkage, tamper detection, JSONL round trip.

use nodekernel::kernel::audit::{
    verify_chain, AuditEvent, AuditLog, ChainBreak, ChainVerificationFailure, GENESIS_HASH,
};
use serde_json::json;

fn sample_log(n: usize) -> AuditLog {
    let mut log = AuditLog::new();
    for i in 0..n {
        log.append(
            "syscall.completed",
            json!({ "capability": "qsk.read", "n": i }),
            &format!("q-{i}"),
            "1970-01-01T00:00:00Z".to_owned(),
        );
    }
    log
}

#[test]
fn empty_log_verifies() {
    let log = AuditLog::new();
    assert!(log.verify_chain());
    assert!(verify_chain(&[]));
    assert_eq!(log.tail_hash(), GENESIS_HASH);
}

#[test]
fn first_entry_links_to_genesis() {
    let log = sample_log(1);
    assert_eq!(log.entries()[0].prev_hash, "0".repeat(64));
}

#[test]
fn entries_link_to_predecessor() {
    let log = sample_log(4);
    for pair in log.entries().windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].event_id);
    }
    assert_eq!(log.tail_hash(), log.entries()[3].event_id);
    assert!(log.verify_chain());
}

#[test]
fn event_id_is_64_lowercase_hex() {
    let log = sample_log(1);
    let id = &log.entries()[0].event_id;
    assert_eq!(id.len(), 64);
    assert!(id.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
}

#[test]
fn event_id_ignores_key_order() {
    let a = AuditEvent::compute_id("t", &json!({"a": 1, "b": 2}), "q", GENESIS_HASH);
    let b = AuditEvent::compute_id("t", &json!({"b": 2, "a": 1}), "q", GENESIS_HASH);
    assert_eq!(a, b);
}

#[test]
fn flipping_a_data_byte_breaks_verification() {
    for index in 0..3 {
        let log = sample_log(3);
        let mut entries = log.entries().to_vec();
        entries[index].data["n"] = json!(99);
        assert!(!verify_chain(&entries), "tamper at {index} went unnoticed");

        let tampered = AuditLog::from_entries(entries);
        assert_eq!(
            tampered.verify_chain_detailed(),
            Err(ChainVerificationFailure {
                index,
                kind: ChainBreak::IdMismatch,
            })
        );
    }
}

#[test]
fn rehashing_a_tampered_entry_breaks_the_next_link() {
    let log = sample_log(3);
    let mut entries = log.entries().to_vec();
    entries[0].data["n"] = json!(99);
    entries[0].event_id = entries[0].recompute_id();

    let tampered = AuditLog::from_entries(entries);
    assert_eq!(
        tampered.verify_chain_detailed(),
        Err(ChainVerificationFailure {
            index: 1,
            kind: ChainBreak::LinkMismatch,
        })
    );
}

#[test]
fn dropping_an_entry_breaks_the_chain() {
    let log = sample_log(3);
    let mut entries = log.entries().to_vec();
    entries.remove(1);
    assert!(!verify_chain(&entries));
}

#[test]
fn timestamps_can_be_substituted_freely() {
    let log = sample_log(3);
    let mut entries = log.entries().to_vec();
    for e in &mut entries {
        e.timestamp = "2099-12-31T23:59:59Z".to_owned();
    }
    assert!(verify_chain(&entries));
}

#[test]
fn jsonl_round_trip_preserves_entries_and_verification() {
    let log = sample_log(5);
    let text = log.to_jsonl().expect("encode");
    assert_eq!(text.lines().count(), 5);

    let back = AuditLog::from_jsonl(&text).expect("decode");
    assert_eq!(back.entries(), log.entries());
    assert!(back.verify_chain());
}

#[test]
fn jsonl_load_keeps_tampering_visible() {
    let log = sample_log(2);
    let text = log
        .to_jsonl()
        .expect("encode")
        .replacen("\"n\":0", "\"n\":7", 1);
    let back = AuditLog::from_jsonl(&text).expect("decode");
    assert!(!back.verify_chain());
}

#[test]
fn write_jsonl_matches_to_jsonl() {
    let log = sample_log(3);
    let mut buf = Vec::new();
    log.write_jsonl(&mut buf).expect("write");
    assert_eq!(String::from_utf8(buf).expect("utf8"), log.to_jsonl().expect("encode"));
}

#[test]
fn serialized_record_has_expected_fields() {
    let log = sample_log(1);
    let line = log.to_jsonl().expect("encode");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    for key in ["timestamp", "event_type", "data", "query_id", "prev_hash", "event_id"] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
    assert_eq!(value["data"]["query_id"], value["query_id"]);
}

#[test]
fn find_by_query_id_returns_the_entry() {
    let log = sample_log(3);
    let found = log.find_by_query_id("q-1").expect("present");
    assert_eq!(found.data["n"], 1);
    assert!(log.find_by_query_id("q-9").is_none());
}
