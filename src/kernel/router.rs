//! Syscall router: capability resolution, policy, dispatch, and recording.
//!
//! For a request that has passed the readiness gate the router:
//! 1. Rejects reused query ids and unknown capabilities.
//! 2. Evaluates policy against the budget ledger.
//! 3. Dispatches admitted requests to their handler.
//! 4. Appends exactly one audit entry for the outcome, plus an incident
//!    for anything other than success.
//! 5. Feeds the outcome to the health monitor.
//!
//! The readiness gate itself and the logical tick belong to the node.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::kernel::audit::AuditLog;
use crate::kernel::clock::Clock;
use crate::kernel::handler::{HandlerError, HandlerRegistry};
use crate::kernel::health::{HealthAlert, HealthMonitor};
use crate::kernel::incident::{IncidentLog, IncidentRecord};
use crate::kernel::policy::{self, BudgetLedger, PolicyDecision, PolicySet};
use crate::kernel::KernelError;
use crate::types::{canonical_json, sha256_hex, Outcome, Payload, Severity, SyscallRequest};

/// Rejection reason for a reused query id.
pub const DUPLICATE_QUERY_ID: &str = "duplicate query id";

/// Rejection reason for an unregistered capability.
pub const UNKNOWN_CAPABILITY: &str = "unknown capability";

/// Successful terminal outcomes of `submit`. Everything else is a
/// [`KernelError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// Handler ran and succeeded.
    Completed {
        /// Correlating query id.
        query_id: String,
        /// Handler result.
        result: Payload,
        /// Audit entry written for the request.
        event_id: String,
    },
    /// Policy refused the request; no handler ran.
    Denied {
        /// Correlating query id.
        query_id: String,
        /// Denial reason.
        reason: String,
        /// Audit entry written for the request.
        event_id: String,
    },
}

impl SyscallOutcome {
    /// Correlating query id.
    pub fn query_id(&self) -> &str {
        match self {
            Self::Completed { query_id, .. } | Self::Denied { query_id, .. } => query_id,
        }
    }

    /// Audit entry id.
    pub fn event_id(&self) -> &str {
        match self {
            Self::Completed { event_id, .. } | Self::Denied { event_id, .. } => event_id,
        }
    }

    /// Whether the request completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Denial reason, if denied.
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            Self::Denied { reason, .. } => Some(reason),
            Self::Completed { .. } => None,
        }
    }

    /// Fold a denial into [`KernelError::PolicyDenied`] for callers that
    /// want a single error channel.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::PolicyDenied`] for a denial.
    pub fn into_result(self) -> Result<Payload, KernelError> {
        match self {
            Self::Completed { result, .. } => Ok(result),
            Self::Denied {
                query_id, reason, ..
            } => Err(KernelError::PolicyDenied { reason, query_id }),
        }
    }
}

/// Mutable node state the router writes to for one request.
pub struct RouteContext<'a> {
    /// Audit chain.
    pub audit: &'a mut AuditLog,
    /// Incident log.
    pub incidents: &'a mut IncidentLog,
    /// Health monitor.
    pub health: &'a mut HealthMonitor,
    /// Timestamp source.
    pub clock: &'a dyn Clock,
    /// Logical tick of this request.
    pub tick: u64,
}

/// What routing one request produced.
#[derive(Debug)]
pub struct Routed {
    /// Result handed back to the caller.
    pub result: Result<SyscallOutcome, KernelError>,
    /// Health alerts raised by this request's observation.
    pub alerts: Vec<HealthAlert>,
}

impl Routed {
    /// Whether any alert asked for the node to pause.
    pub fn pause_requested(&self) -> bool {
        self.alerts.iter().any(|a| a.pause_requested)
    }
}

/// Capability routing state: handlers, policy, budget ledger and the set of
/// query ids already used.
#[derive(Debug, Clone)]
pub struct SyscallRouter {
    handlers: HandlerRegistry,
    policy: PolicySet,
    ledger: BudgetLedger,
    seen: BTreeSet<String>,
    handler_timeout: Duration,
}

impl SyscallRouter {
    /// Router with an empty ledger.
    pub fn new(handlers: HandlerRegistry, policy: PolicySet, handler_timeout: Duration) -> Self {
        Self {
            handlers,
            policy,
            ledger: BudgetLedger::new(),
            seen: BTreeSet::new(),
            handler_timeout,
        }
    }

    /// Restore ledger and used query ids, e.g. after replay.
    #[must_use]
    pub fn with_state(
        mut self,
        ledger: BudgetLedger,
        seen: impl IntoIterator<Item = String>,
    ) -> Self {
        self.ledger = ledger;
        self.seen = seen.into_iter().collect();
        self
    }

    /// Handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Mutable handler registry.
    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Active policy.
    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }

    /// Budget ledger.
    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Whether `query_id` has been used.
    pub fn has_seen(&self, query_id: &str) -> bool {
        self.seen.contains(query_id)
    }

    /// Route one request. `query_id` is already resolved by the caller.
    pub fn route(
        &mut self,
        request: &SyscallRequest,
        query_id: String,
        mut ctx: RouteContext<'_>,
    ) -> Routed {
        let capability = request.capability.as_str();

        if !self.seen.insert(query_id.clone()) {
            let event_id = reject(&mut ctx, request, &query_id, DUPLICATE_QUERY_ID);
            return finish(
                ctx,
                request,
                Outcome::Rejected,
                Err(KernelError::DuplicateQueryId { query_id }),
                &event_id,
            );
        }

        let Some(handler) = self.handlers.get(capability) else {
            let event_id = reject(&mut ctx, request, &query_id, UNKNOWN_CAPABILITY);
            return finish(
                ctx,
                request,
                Outcome::Rejected,
                Err(KernelError::UnknownCapability {
                    capability: capability.to_owned(),
                    query_id,
                }),
                &event_id,
            );
        };

        if let PolicyDecision::Deny(reason) =
            policy::evaluate(&self.policy, request, &self.ledger, ctx.tick)
        {
            warn!(capability, query_id = %query_id, reason = %reason, "syscall denied");
            let event = ctx.audit.append(
                Outcome::Denied.event_type(),
                json!({
                    "capability": capability,
                    "requester": request.requester,
                    "reason": reason,
                }),
                &query_id,
                ctx.clock.timestamp(ctx.tick),
            );
            ctx.incidents.append(IncidentRecord {
                severity: Severity::Warning,
                cause: reason.clone(),
                context: json!({ "event_id": event.event_id, "requester": request.requester }),
                timestamp: event.timestamp.clone(),
                tick: ctx.tick,
                capability: Some(capability.to_owned()),
                query_id: Some(query_id.clone()),
            });
            let outcome = SyscallOutcome::Denied {
                query_id,
                reason,
                event_id: event.event_id.clone(),
            };
            return finish(ctx, request, Outcome::Denied, Ok(outcome), &event.event_id);
        }

        self.ledger.record(capability, ctx.tick);
        self.prune_ledger(ctx.tick);

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&request.args)))
            .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))));
        let elapsed = started.elapsed();
        if elapsed > self.handler_timeout {
            warn!(
                capability,
                query_id = %query_id,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX),
                "handler exceeded advisory timeout"
            );
        }

        match result {
            Ok(value) => {
                let event = ctx.audit.append(
                    Outcome::Completed.event_type(),
                    json!({
                        "capability": capability,
                        "requester": request.requester,
                        "result": result_summary(&value),
                    }),
                    &query_id,
                    ctx.clock.timestamp(ctx.tick),
                );
                info!(capability, query_id = %query_id, event_id = %event.event_id, "syscall completed");
                let outcome = SyscallOutcome::Completed {
                    query_id,
                    result: value,
                    event_id: event.event_id.clone(),
                };
                finish(ctx, request, Outcome::Completed, Ok(outcome), &event.event_id)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(capability, query_id = %query_id, error = %message, "syscall failed");
                let event = ctx.audit.append(
                    Outcome::Failed.event_type(),
                    json!({
                        "capability": capability,
                        "requester": request.requester,
                        "error": message,
                    }),
                    &query_id,
                    ctx.clock.timestamp(ctx.tick),
                );
                ctx.incidents.append(IncidentRecord {
                    severity: Severity::Error,
                    cause: message.clone(),
                    context: json!({ "event_id": event.event_id, "requester": request.requester }),
                    timestamp: event.timestamp.clone(),
                    tick: ctx.tick,
                    capability: Some(capability.to_owned()),
                    query_id: Some(query_id.clone()),
                });
                let err = KernelError::HandlerFailure {
                    capability: capability.to_owned(),
                    query_id,
                    message,
                };
                finish(ctx, request, Outcome::Failed, Err(err), &event.event_id)
            }
        }
    }

    fn prune_ledger(&mut self, now: u64) {
        let horizon = self
            .policy
            .rules
            .iter()
            .filter_map(|r| r.budget.map(|b| b.window_ticks))
            .max()
            .unwrap_or(0);
        self.ledger.prune(now, horizon);
    }
}

/// Write the `syscall.rejected` audit entry and its incident. Returns the
/// entry's id.
fn reject(
    ctx: &mut RouteContext<'_>,
    request: &SyscallRequest,
    query_id: &str,
    reason: &str,
) -> String {
    warn!(capability = %request.capability, query_id, reason, "syscall rejected");
    let event = ctx.audit.append(
        Outcome::Rejected.event_type(),
        json!({
            "capability": request.capability,
            "requester": request.requester,
            "reason": reason,
        }),
        query_id,
        ctx.clock.timestamp(ctx.tick),
    );
    ctx.incidents.append(IncidentRecord {
        severity: Severity::Warning,
        cause: reason.to_owned(),
        context: json!({ "event_id": event.event_id, "requester": request.requester }),
        timestamp: event.timestamp,
        tick: ctx.tick,
        capability: Some(request.capability.clone()),
        query_id: Some(query_id.to_owned()),
    });
    event.event_id
}

/// Observe the outcome and record an incident per alert it fires.
fn finish(
    ctx: RouteContext<'_>,
    request: &SyscallRequest,
    outcome: Outcome,
    result: Result<SyscallOutcome, KernelError>,
    event_id: &str,
) -> Routed {
    let alerts = ctx.health.observe(&request.capability, outcome);
    let query_id = match &result {
        Ok(o) => Some(o.query_id().to_owned()),
        Err(e) => e.query_id().map(str::to_owned),
    };
    for alert in &alerts {
        ctx.incidents.append(IncidentRecord {
            severity: alert.severity,
            cause: format!("health alert '{}'", alert.name),
            context: json!({
                "counter": alert.counter,
                "value": alert.value,
                "threshold": alert.threshold,
                "pause_requested": alert.pause_requested,
                "event_id": event_id,
            }),
            timestamp: ctx.clock.timestamp(ctx.tick),
            tick: ctx.tick,
            capability: Some(request.capability.clone()),
            query_id: query_id.clone(),
        });
    }
    Routed { result, alerts }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// Summary recorded in place of a handler result: digest and size of its
/// canonical encoding.
pub fn result_summary(result: &Value) -> Value {
    let canonical = canonical_json(result);
    json!({ "sha256": sha256_hex(canonical.as_bytes()), "bytes": canonical.len() })
}
