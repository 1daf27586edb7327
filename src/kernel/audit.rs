//! Audit log: append-only, hash-chained record of every syscall outcome.
//!
//! Each [`AuditEvent`] carries the `event_id` of its predecessor in
//! `prev_hash` (64 `'0'` characters for the first entry) and its own
//! `event_id`, the lowercase hex SHA-256 of
//! `prefix ∥ event_type ∥ 0 ∥ canonical(data) ∥ 0 ∥ query_id ∥ 0 ∥ prev_hash`.
//! The timestamp is not hashed.
//!
//! Serialized form is JSON Lines, one entry per line.

use std::fmt;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::types::{canonical_json, domain_hash};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const AUDIT_PREFIX: &[u8] = b"NODEKERNEL-AUDIT\0";

/// Audit log I/O and decoding errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// A JSONL line failed to decode.
    #[error("invalid audit record on line {line}: {source}")]
    Decode {
        /// 1-based line number.
        line: usize,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// Encoding an entry failed.
    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
    /// Writing to a sink failed.
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a chain entry failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainBreak {
    /// Stored `event_id` differs from the hash of the entry's own fields.
    IdMismatch,
    /// Stored `prev_hash` differs from the predecessor's `event_id`.
    LinkMismatch,
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdMismatch => f.write_str("event_id does not match entry contents"),
            Self::LinkMismatch => f.write_str("prev_hash does not match previous event_id"),
        }
    }
}

/// First break found by [`AuditLog::verify_chain_detailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("audit chain broken at entry {index}: {kind}")]
pub struct ChainVerificationFailure {
    /// 0-based index of the first failing entry.
    pub index: usize,
    /// Which check failed.
    pub kind: ChainBreak,
}

/// A single audit chain entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// ISO-8601 UTC timestamp (cosmetic).
    pub timestamp: String,
    /// Event type, e.g. `"syscall.completed"`.
    pub event_type: String,
    /// Event payload; always an object containing `query_id`.
    pub data: Value,
    /// Correlation id of the originating request.
    pub query_id: String,
    /// `event_id` of the previous entry, or [`GENESIS_HASH`].
    pub prev_hash: String,
    /// Hash of this entry's fields.
    pub event_id: String,
}

impl AuditEvent {
    /// Compute the `event_id` for the given fields.
    pub fn compute_id(event_type: &str, data: &Value, query_id: &str, prev_hash: &str) -> String {
        let canonical = canonical_json(data);
        hex::encode(domain_hash(
            AUDIT_PREFIX,
            &[
                event_type.as_bytes(),
                canonical.as_bytes(),
                query_id.as_bytes(),
                prev_hash.as_bytes(),
            ],
        ))
    }

    /// Recompute this entry's id from its stored fields.
    pub fn recompute_id(&self) -> String {
        Self::compute_id(&self.event_type, &self.data, &self.query_id, &self.prev_hash)
    }
}

/// Append-only audit chain.
///
/// An optional mirror receives each appended entry as a JSON line. Mirror
/// write failures are logged and counted; the in-memory chain stays the
/// source of truth.
#[derive(Default)]
pub struct AuditLog {
    entries: Vec<AuditEvent>,
    mirror: Option<Box<dyn Write + Send>>,
    mirror_failures: u64,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("len", &self.entries.len())
            .field("tail", &self.tail_hash())
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}

impl AuditLog {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored entries, verbatim. Call [`Self::verify_chain`]
    /// before trusting the result.
    pub fn from_entries(entries: Vec<AuditEvent>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    /// Mirror every subsequent append to `writer` as JSON Lines.
    #[must_use]
    pub fn with_mirror(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.mirror = Some(writer);
        self
    }

    /// Append an event linked to the current tail.
    ///
    /// `data` is normalised to an object whose `query_id` equals the event's:
    /// objects get the key set (replacing any other value), other values are
    /// wrapped as `{"value": ..}`.
    pub fn append(
        &mut self,
        event_type: &str,
        data: Value,
        query_id: &str,
        timestamp: String,
    ) -> AuditEvent {
        let data = with_query_id(data, query_id);
        let prev_hash = self.tail_hash().to_owned();
        let event_id = AuditEvent::compute_id(event_type, &data, query_id, &prev_hash);
        let event = AuditEvent {
            timestamp,
            event_type: event_type.to_owned(),
            data,
            query_id: query_id.to_owned(),
            prev_hash,
            event_id,
        };
        debug!(
            event_type,
            query_id,
            event_id = %event.event_id,
            index = self.entries.len(),
            "audit append"
        );
        self.mirror_entry(&event);
        self.entries.push(event.clone());
        event
    }

    /// `event_id` of the last entry, or [`GENESIS_HASH`] when empty.
    pub fn tail_hash(&self) -> &str {
        self.entries
            .last()
            .map_or(GENESIS_HASH, |e| e.event_id.as_str())
    }

    /// Whether every entry hashes to its id and links to its predecessor.
    pub fn verify_chain(&self) -> bool {
        verify_chain(&self.entries)
    }

    /// Like [`Self::verify_chain`], reporting the first break.
    ///
    /// # Errors
    ///
    /// Returns the index and kind of the first failing entry.
    pub fn verify_chain_detailed(&self) -> Result<(), ChainVerificationFailure> {
        verify_entries(&self.entries)
    }

    /// First entry with the given query id.
    pub fn find_by_query_id(&self, query_id: &str) -> Option<&AuditEvent> {
        self.entries.iter().find(|e| e.query_id == query_id)
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[AuditEvent] {
        &self.entries
    }

    /// Iterate entries, oldest first.
    pub fn iter(&self) -> std::slice::Iter<'_, AuditEvent> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mirror writes that failed so far.
    pub fn mirror_failures(&self) -> u64 {
        self.mirror_failures
    }

    /// Encode as JSON Lines.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Encode`] if an entry fails to serialize.
    pub fn to_jsonl(&self) -> Result<String, AuditError> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Write the chain as JSON Lines to `writer`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on encoding or I/O failure.
    pub fn write_jsonl(&self, writer: &mut dyn Write) -> Result<(), AuditError> {
        for entry in &self.entries {
            serde_json::to_writer(&mut *writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Decode JSON Lines. Blank lines are skipped; entries are kept verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Decode`] with the failing line number.
    pub fn from_jsonl(input: &str) -> Result<Self, AuditError> {
        let mut entries = Vec::new();
        for (i, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(line).map_err(|source| AuditError::Decode {
                line: i.saturating_add(1),
                source,
            })?;
            entries.push(entry);
        }
        Ok(Self::from_entries(entries))
    }

    fn mirror_entry(&mut self, event: &AuditEvent) {
        let Some(writer) = self.mirror.as_mut() else {
            return;
        };
        let result = serde_json::to_string(event)
            .map_err(AuditError::from)
            .and_then(|line| {
                writeln!(writer, "{line}")?;
                writer.flush()?;
                Ok(())
            });
        if let Err(e) = result {
            self.mirror_failures = self.mirror_failures.saturating_add(1);
            error!(error = %e, event_id = %event.event_id, "audit mirror write failed");
        }
    }
}

/// Verify a sequence of entries as a chain. An empty sequence is valid.
pub fn verify_chain(entries: &[AuditEvent]) -> bool {
    verify_entries(entries).is_ok()
}

fn verify_entries(entries: &[AuditEvent]) -> Result<(), ChainVerificationFailure> {
    let mut expected_prev: &str = GENESIS_HASH;
    for (index, entry) in entries.iter().enumerate() {
        if entry.recompute_id() != entry.event_id {
            error!(index, event_id = %entry.event_id, "audit entry hash mismatch");
            return Err(ChainVerificationFailure {
                index,
                kind: ChainBreak::IdMismatch,
            });
        }
        if entry.prev_hash != expected_prev {
            error!(index, event_id = %entry.event_id, "audit chain link mismatch");
            return Err(ChainVerificationFailure {
                index,
                kind: ChainBreak::LinkMismatch,
            });
        }
        expected_prev = &entry.event_id;
    }
    Ok(())
}

fn with_query_id(data: Value, query_id: &str) -> Value {
    match data {
        Value::Object(mut map) => {
            map.insert("query_id".to_owned(), Value::String(query_id.to_owned()));
            Value::Object(map)
        }
        other => serde_json::json!({ "value": other, "query_id": query_id }),
    }
}
