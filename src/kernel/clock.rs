//! Timestamp sources for audit and incident records.
//!
//! Timestamps are cosmetic: nothing in the chain hashes them. The logical
//! clock makes them reproducible so replayed logs are byte-identical.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Renders an ISO-8601 UTC timestamp for a logical tick.
pub trait Clock: Send + Sync {
    /// Timestamp for the record written at `tick`.
    fn timestamp(&self, tick: u64) -> String;
}

/// `1970-01-01T00:00:00Z` plus `tick` seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalClock;

impl Clock for LogicalClock {
    fn timestamp(&self, tick: u64) -> String {
        let secs = i64::try_from(tick).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp(secs, 0)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Wall-clock time; ignores the tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn timestamp(&self, _tick: u64) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Serializable clock selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    /// [`LogicalClock`].
    #[default]
    Logical,
    /// [`SystemClock`].
    System,
}

impl ClockKind {
    /// Instantiate the clock.
    pub fn build(self) -> Box<dyn Clock> {
        match self {
            Self::Logical => Box::new(LogicalClock),
            Self::System => Box::new(SystemClock),
        }
    }
}

impl std::str::FromStr for ClockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logical" => Ok(Self::Logical),
            "system" => Ok(Self::System),
            other => Err(format!("unknown clock '{other}'")),
        }
    }
}
