//! Core types shared across the kernel: syscall requests, outcomes,
//! severities, and the canonical JSON / digest helpers the audit chain
//! and attestation schemes hash over.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Opaque argument / result payload carried through the kernel.
pub type Payload = Value;

/// A requested invocation of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallRequest {
    /// Dot-separated capability name (e.g. `"qsk.read"`). Opaque to routing.
    pub capability: String,
    /// Arguments handed verbatim to the capability handler.
    #[serde(default)]
    pub args: Payload,
    /// Node id of the requester.
    #[serde(default)]
    pub requester: String,
    /// Caller-supplied correlation id. Derived by the node when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

impl SyscallRequest {
    /// Build a request with no requester and no explicit query id.
    pub fn new(capability: impl Into<String>, args: Payload) -> Self {
        Self {
            capability: capability.into(),
            args,
            requester: String::new(),
            query_id: None,
        }
    }

    /// Attach a caller-supplied query id.
    #[must_use]
    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    /// Attach the requesting node id.
    #[must_use]
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }
}

/// Incident severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational record.
    Info,
    /// Expected but noteworthy (denials, rejections, soft alerts).
    Warning,
    /// A request failed inside its handler.
    Error,
    /// Node-level alert; requests a pause.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Terminal outcome kind of a syscall that passed the readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Handler ran and succeeded.
    Completed,
    /// Policy denied the request.
    Denied,
    /// Handler ran and failed.
    Failed,
    /// Rejected before policy (unknown capability, duplicate query id).
    Rejected,
}

impl Outcome {
    /// Counter suffix used by the health monitor.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Denied => "denied",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    /// Audit event type recorded for this outcome.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Completed => "syscall.completed",
            Self::Denied => "syscall.denied",
            Self::Failed => "syscall.failed",
            Self::Rejected => "syscall.rejected",
        }
    }

    /// Inverse of [`Outcome::event_type`].
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "syscall.completed" => Some(Self::Completed),
            "syscall.denied" => Some(Self::Denied),
            "syscall.failed" => Some(Self::Failed),
            "syscall.rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "denied" => Ok(Self::Denied),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

// ── Canonical JSON and digests ─────────────────────────────────

/// Render a JSON value compactly with object keys sorted at every depth.
///
/// The output is independent of map insertion order, so two values that
/// compare equal always produce identical bytes.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over `prefix` followed by each part, parts separated by `0x00`.
pub fn domain_hash(prefix: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
