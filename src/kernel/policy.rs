//! Policy engine: pure authorization decisions for syscalls.
//!
//! A [`PolicySet`] is an ordered list of [`Rule`]s. Evaluation walks the
//! rules in order and the first rule whose pattern matches the capability
//! decides (first-match-wins). No match is a denial. An allowing rule may
//! carry a [`Budget`], checked against an externally owned [`BudgetLedger`]
//! after the pattern match.
//!
//! [`evaluate`] never mutates anything: the router records admissions in
//! the ledger after the decision.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::SyscallRequest;

/// Denial reason when no rule matches.
pub const NO_MATCHING_RULE: &str = "no matching rule";

/// Denial reason when a rule's budget is exhausted.
pub const BUDGET_EXCEEDED: &str = "budget exceeded";

/// Policy configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// Pattern could not be compiled.
    #[error("invalid capability pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The raw pattern text.
        pattern: String,
        /// Why compilation failed.
        reason: String,
    },
    /// Budget window is empty.
    #[error("budget on rule '{pattern}' has a zero-tick window")]
    InvalidBudget {
        /// Pattern of the offending rule.
        pattern: String,
    },
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    /// The request may be dispatched.
    Allow,
    /// The request is refused with a reason.
    Deny(String),
}

impl PolicyDecision {
    /// Whether this is [`PolicyDecision::Allow`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Denial reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny(reason) => Some(reason),
        }
    }
}

// ── Patterns ───────────────────────────────────────────────────

/// Capability glob: exact name, `*`, or names with `*` wildcards
/// (`"qsk.*"`, `"*.read"`). Anchored at both ends.
#[derive(Clone)]
pub struct CapabilityPattern {
    raw: String,
    regex: Regex,
}

impl CapabilityPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] for an empty pattern.
    pub fn new(raw: impl Into<String>) -> Result<Self, PolicyError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(PolicyError::InvalidPattern {
                pattern: raw,
                reason: "pattern is empty".to_owned(),
            });
        }
        let body = raw
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$")).map_err(|e| PolicyError::InvalidPattern {
            pattern: raw.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { raw, regex })
    }

    /// Whether `capability` matches.
    pub fn matches(&self, capability: &str) -> bool {
        self.regex.is_match(capability)
    }

    /// Pattern text as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for CapabilityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CapabilityPattern").field(&self.raw).finish()
    }
}

impl PartialEq for CapabilityPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for CapabilityPattern {}

impl TryFrom<String> for CapabilityPattern {
    type Error = PolicyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<CapabilityPattern> for String {
    fn from(p: CapabilityPattern) -> Self {
        p.raw
    }
}

impl Serialize for CapabilityPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for CapabilityPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

// ── Rules ──────────────────────────────────────────────────────

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Permit (subject to budget).
    Allow,
    /// Refuse.
    Deny,
}

/// Request budget: at most `max_requests` admissions of one capability in
/// any window of `window_ticks` logical ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Admissions allowed per window.
    pub max_requests: u32,
    /// Window length in logical ticks.
    pub window_ticks: u64,
}

/// One pattern → decision rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Capability pattern.
    pub pattern: CapabilityPattern,
    /// Decision on match.
    pub action: RuleAction,
    /// Denial reason for `deny` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Optional budget for `allow` rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<Budget>,
}

impl Rule {
    /// Allow rule.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] if the pattern is empty.
    pub fn allow(pattern: &str) -> Result<Self, PolicyError> {
        Ok(Self {
            pattern: CapabilityPattern::new(pattern)?,
            action: RuleAction::Allow,
            reason: None,
            budget: None,
        })
    }

    /// Deny rule with an explicit reason.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] if the pattern is empty.
    pub fn deny(pattern: &str, reason: impl Into<String>) -> Result<Self, PolicyError> {
        Ok(Self {
            pattern: CapabilityPattern::new(pattern)?,
            action: RuleAction::Deny,
            reason: Some(reason.into()),
            budget: None,
        })
    }

    /// Attach a budget.
    #[must_use]
    pub fn with_budget(mut self, max_requests: u32, window_ticks: u64) -> Self {
        self.budget = Some(Budget {
            max_requests,
            window_ticks,
        });
        self
    }

    fn deny_reason(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| format!("denied by rule '{}'", self.pattern.as_str()))
    }
}

/// Ordered rule list. An empty set denies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySet {
    /// Rules in evaluation order.
    pub rules: Vec<Rule>,
}

impl PolicySet {
    /// Build from rules in evaluation order.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Check budgets are usable. Patterns are validated on construction.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidBudget`] for a zero-tick window.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for rule in &self.rules {
            if rule.budget.is_some_and(|b| b.window_ticks == 0) {
                return Err(PolicyError::InvalidBudget {
                    pattern: rule.pattern.as_str().to_owned(),
                });
            }
        }
        Ok(())
    }

    /// First rule matching `capability`, with its index.
    pub fn first_match(&self, capability: &str) -> Option<(usize, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.pattern.matches(capability))
    }

    /// Shorthand for [`evaluate`].
    pub fn evaluate(
        &self,
        request: &SyscallRequest,
        ledger: &BudgetLedger,
        now: u64,
    ) -> PolicyDecision {
        evaluate(self, request, ledger, now)
    }
}

// ── Budget ledger ──────────────────────────────────────────────

/// Admission ticks per capability. Owned and updated by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLedger {
    admitted: BTreeMap<String, Vec<u64>>,
}

impl BudgetLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admission of `capability` at `tick`.
    pub fn record(&mut self, capability: &str, tick: u64) {
        self.admitted
            .entry(capability.to_owned())
            .or_default()
            .push(tick);
    }

    /// Admissions of `capability` with tick in `(now - window, now]`.
    pub fn count_in_window(&self, capability: &str, now: u64, window_ticks: u64) -> u64 {
        let floor = now.saturating_sub(window_ticks);
        let count = self.admitted.get(capability).map_or(0, |ticks| {
            ticks.iter().filter(|&&t| t > floor && t <= now).count()
        });
        u64::try_from(count).unwrap_or(u64::MAX)
    }

    /// Drop admissions at or before `now - horizon`.
    pub fn prune(&mut self, now: u64, horizon: u64) {
        let floor = now.saturating_sub(horizon);
        for ticks in self.admitted.values_mut() {
            ticks.retain(|&t| t > floor);
        }
        self.admitted.retain(|_, ticks| !ticks.is_empty());
    }

    /// Total admissions recorded.
    pub fn total(&self) -> usize {
        self.admitted.values().map(Vec::len).sum()
    }
}

// ── Evaluation ─────────────────────────────────────────────────

/// Decide `request` against `policy` at logical time `now`.
///
/// Identical inputs always produce the identical decision.
pub fn evaluate(
    policy: &PolicySet,
    request: &SyscallRequest,
    ledger: &BudgetLedger,
    now: u64,
) -> PolicyDecision {
    let Some((index, rule)) = policy.first_match(&request.capability) else {
        debug!(capability = %request.capability, "no policy rule matched");
        return PolicyDecision::Deny(NO_MATCHING_RULE.to_owned());
    };
    debug!(
        capability = %request.capability,
        rule = index,
        pattern = rule.pattern.as_str(),
        "policy rule matched"
    );

    match rule.action {
        RuleAction::Deny => PolicyDecision::Deny(rule.deny_reason()),
        RuleAction::Allow => match rule.budget {
            Some(budget)
                if ledger.count_in_window(&request.capability, now, budget.window_ticks)
                    >= u64::from(budget.max_requests) =>
            {
                PolicyDecision::Deny(BUDGET_EXCEEDED.to_owned())
            }
            _ => PolicyDecision::Allow,
        },
    }
}
