//! The node: composition root owning identity, lifecycle, policy, handlers,
//! the audit and incident logs, and the health monitor.
//!
//! A node is single-writer. Each `submit` runs to completion, audit entry
//! included, before the next begins; [`SharedNode`] extends that to
//! concurrent callers with one lock around the whole request.
//!
//! Logical time is a tick counter advanced once per gated `submit` and once
//! per recorded lifecycle transition. Query ids the caller does not supply
//! are derived from the node id and the request sequence number, so two
//! nodes bootstrapped from the same configuration and fed the same requests
//! produce byte-identical logs.

use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::kernel::audit::{AuditEvent, AuditLog};
use crate::kernel::clock::{Clock, ClockKind};
use crate::kernel::handler::{CapabilityHandler, HandlerError, HandlerRegistry};
use crate::kernel::health::{validate_thresholds, AlertThreshold, HealthMonitor, HealthSnapshot};
use crate::kernel::identity::NodeIdentity;
use crate::kernel::incident::{IncidentFilter, IncidentLog, IncidentRecord};
use crate::kernel::lifecycle::{Lifecycle, LifecycleState, Transition};
use crate::kernel::policy::{BudgetLedger, PolicySet};
use crate::kernel::router::{RouteContext, SyscallOutcome, SyscallRouter};
use crate::kernel::KernelError;
use crate::types::{Payload, SyscallRequest};

/// Default advisory handler timeout in milliseconds.
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 5_000;

/// Runtime knobs that are part of a node's recorded state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Advisory handler timeout; overruns are logged, never enforced.
    pub handler_timeout_ms: u64,
    /// Timestamp source.
    pub clock: ClockKind,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
            clock: ClockKind::Logical,
        }
    }
}

/// Full serialisable state of a node. Handlers are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Kernel settings.
    pub settings: KernelSettings,
    /// Node identity.
    pub identity: NodeIdentity,
    /// Policy rule set.
    pub policy: PolicySet,
    /// Health alert thresholds.
    pub thresholds: Vec<AlertThreshold>,
    /// Lifecycle state and history.
    pub lifecycle: Lifecycle,
    /// Audit chain, oldest first.
    pub audit: Vec<AuditEvent>,
    /// Incident records, oldest first.
    pub incidents: Vec<IncidentRecord>,
    /// Budget ledger.
    pub budget: BudgetLedger,
    /// Current logical tick.
    pub tick: u64,
    /// Number of gated submits so far.
    pub sequence: u64,
    /// Health counters and active alerts.
    pub health: HealthSnapshot,
}

/// A single policy-enforced node.
pub struct Node {
    settings: KernelSettings,
    identity: NodeIdentity,
    lifecycle: Lifecycle,
    router: SyscallRouter,
    audit: AuditLog,
    incidents: IncidentLog,
    health: HealthMonitor,
    clock: Box<dyn Clock>,
    tick: u64,
    sequence: u64,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.identity.node_id())
            .field("state", &self.lifecycle.state())
            .field("tick", &self.tick)
            .field("sequence", &self.sequence)
            .field("audit", &self.audit)
            .field("incidents", &self.incidents.len())
            .field("handlers", self.router.handlers())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Bootstrap a node in `Init` with empty logs and no handlers.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Identity`] if the identity is malformed or its
    /// attestation does not verify, [`KernelError::Policy`] for an unusable
    /// policy, and [`KernelError::Health`] for a threshold that cannot alert.
    pub fn bootstrap(
        identity: NodeIdentity,
        policy: PolicySet,
        thresholds: Vec<AlertThreshold>,
        settings: KernelSettings,
    ) -> Result<Self, KernelError> {
        identity.validate()?;
        policy.validate()?;
        validate_thresholds(&thresholds)?;
        info!(
            node_id = identity.node_id(),
            rules = policy.rules.len(),
            thresholds = thresholds.len(),
            "node bootstrapped"
        );
        let router = SyscallRouter::new(
            HandlerRegistry::new(),
            policy,
            Duration::from_millis(settings.handler_timeout_ms),
        );
        Ok(Self {
            clock: settings.clock.build(),
            settings,
            identity,
            lifecycle: Lifecycle::new(),
            router,
            audit: AuditLog::new(),
            incidents: IncidentLog::new(),
            health: HealthMonitor::new(thresholds),
            tick: 0,
            sequence: 0,
        })
    }

    /// Rebuild a node from a snapshot.
    ///
    /// The audit chain, lifecycle history and identity attestation are all
    /// re-verified; health counters are recomputed from the audit chain and
    /// must agree with the snapshot. `replay(s)?.snapshot() == s`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ChainVerification`] for a broken chain,
    /// [`KernelError::Lifecycle`] for a corrupt history,
    /// [`KernelError::Identity`] for a bad identity,
    /// [`KernelError::Health`] for unusable thresholds, and
    /// [`KernelError::Snapshot`] when the parts disagree with each other.
    pub fn replay(snapshot: NodeSnapshot, handlers: HandlerRegistry) -> Result<Self, KernelError> {
        let NodeSnapshot {
            settings,
            identity,
            policy,
            thresholds,
            lifecycle,
            audit,
            incidents,
            budget,
            tick,
            sequence,
            health,
        } = snapshot;

        identity.validate()?;
        policy.validate()?;
        validate_thresholds(&thresholds)?;

        let audit = AuditLog::from_entries(audit);
        audit.verify_chain_detailed()?;

        let rebuilt = Lifecycle::from_history(lifecycle.history().to_vec())?;
        if rebuilt.state() != lifecycle.state() {
            return Err(snapshot_error(format!(
                "lifecycle state {} does not follow from history (ends at {})",
                lifecycle.state(),
                rebuilt.state()
            )));
        }
        if rebuilt.history().last().is_some_and(|t| t.tick > tick)
            || incidents.iter().any(|r| r.tick > tick)
        {
            return Err(snapshot_error("records carry ticks beyond the node tick"));
        }

        let mut monitor = HealthMonitor::rebuild(thresholds, &audit);
        let rebuilt_health = monitor.snapshot();
        if rebuilt_health.counters != health.counters || rebuilt_health.totals != health.totals {
            return Err(snapshot_error("health counters disagree with the audit chain"));
        }
        monitor.restore_alerts(health.alerts);

        let seen: BTreeSet<String> = audit.iter().map(|e| e.query_id.clone()).collect();
        let router = SyscallRouter::new(
            handlers,
            policy,
            Duration::from_millis(settings.handler_timeout_ms),
        )
        .with_state(budget, seen);

        info!(
            node_id = identity.node_id(),
            state = %rebuilt.state(),
            audit_len = audit.len(),
            tick,
            "node replayed from snapshot"
        );
        Ok(Self {
            clock: settings.clock.build(),
            settings,
            identity,
            lifecycle: rebuilt,
            router,
            audit,
            incidents: IncidentLog::from_records(incidents),
            health: monitor,
            tick,
            sequence,
        })
    }

    /// Mirror every subsequent audit append to `writer` as JSON Lines.
    #[must_use]
    pub fn with_audit_mirror(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.audit = std::mem::take(&mut self.audit).with_mirror(writer);
        self
    }

    /// Register a handler for `capability`. Returns whether one was replaced.
    pub fn register(
        &mut self,
        capability: impl Into<String>,
        handler: impl CapabilityHandler + 'static,
    ) -> bool {
        self.router.handlers_mut().register(capability, handler)
    }

    /// Register a closure for `capability`.
    pub fn register_fn<F>(&mut self, capability: impl Into<String>, f: F) -> bool
    where
        F: Fn(&Payload) -> Result<Payload, HandlerError> + Send + Sync + 'static,
    {
        self.router.handlers_mut().register_fn(capability, f)
    }

    /// Submit a syscall.
    ///
    /// Every call that passes the readiness gate appends exactly one audit
    /// entry before returning. A `Critical` health alert raised by the
    /// request pauses a running node after that entry is written.
    ///
    /// A request without a query id gets [`derive_query_id`] for the current
    /// sequence. If a caller already used that id, further derived
    /// candidates are tried until an unused one is found, so a derived id
    /// never collides with an earlier request.
    ///
    /// # Errors
    ///
    /// - [`KernelError::NodeNotReady`] in `Init` or `Shutdown`; nothing is
    ///   recorded.
    /// - [`KernelError::UnknownCapability`], [`KernelError::DuplicateQueryId`]
    ///   and [`KernelError::HandlerFailure`], each already audited.
    ///
    /// A policy denial is `Ok(SyscallOutcome::Denied { .. })`.
    pub fn submit(&mut self, request: SyscallRequest) -> Result<SyscallOutcome, KernelError> {
        let state = self.lifecycle.state();
        if !state.accepts_syscalls() {
            warn!(capability = %request.capability, state = %state, "submit refused: node not ready");
            return Err(KernelError::NodeNotReady { state });
        }

        self.tick = self.tick.saturating_add(1);
        self.sequence = self.sequence.saturating_add(1);
        let query_id = match &request.query_id {
            Some(id) => id.clone(),
            None => self.fresh_query_id(),
        };

        let routed = self.router.route(
            &request,
            query_id,
            RouteContext {
                audit: &mut self.audit,
                incidents: &mut self.incidents,
                health: &mut self.health,
                clock: self.clock.as_ref(),
                tick: self.tick,
            },
        );

        if routed.pause_requested() && self.lifecycle.state() == LifecycleState::Running {
            warn!(node_id = self.identity.node_id(), "critical health alert; pausing node");
            if let Err(e) = self.transition(LifecycleState::Paused) {
                warn!(error = %e, "pause requested by health monitor was refused");
            }
        }
        routed.result
    }

    /// Derived id for the current sequence, skipping ids already used on
    /// this node.
    fn fresh_query_id(&self) -> String {
        let node_id = self.identity.node_id();
        let mut candidate = derive_query_id(node_id, self.sequence);
        let mut attempt: u64 = 0;
        while self.router.has_seen(&candidate) {
            attempt = attempt.saturating_add(1);
            candidate = derive_retry_query_id(node_id, self.sequence, attempt);
        }
        candidate
    }

    /// Move the lifecycle to `to`.
    ///
    /// Returns `Ok(None)` for a same-state no-op, which neither records
    /// history nor advances the tick.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Lifecycle`] for an illegal edge; state is
    /// unchanged.
    pub fn transition(&mut self, to: LifecycleState) -> Result<Option<Transition>, KernelError> {
        let next = self.tick.saturating_add(1);
        let recorded = self.lifecycle.transition(to, next)?;
        if recorded.is_some() {
            self.tick = next;
        }
        Ok(recorded)
    }

    /// Capture the full serialisable state.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            settings: self.settings.clone(),
            identity: self.identity.clone(),
            policy: self.router.policy().clone(),
            thresholds: self.health.thresholds().to_vec(),
            lifecycle: self.lifecycle.clone(),
            audit: self.audit.entries().to_vec(),
            incidents: self.incidents.records().to_vec(),
            budget: self.router.ledger().clone(),
            tick: self.tick,
            sequence: self.sequence,
            health: self.health.snapshot(),
        }
    }

    /// Verify the audit chain. A failure means the log can no longer be
    /// trusted; escalation is the caller's decision.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ChainVerification`] at the first break.
    pub fn verify_audit(&self) -> Result<(), KernelError> {
        self.audit.verify_chain_detailed()?;
        Ok(())
    }

    /// Incidents matching `filter`, in append order.
    pub fn query_incidents<'a>(
        &'a self,
        filter: &'a IncidentFilter,
    ) -> impl Iterator<Item = &'a IncidentRecord> + 'a {
        self.incidents.query(filter)
    }

    /// Re-arm a fired health alert.
    pub fn clear_alert(&mut self, name: &str) -> bool {
        self.health.clear_alert(name)
    }

    /// Node identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Lifecycle with history.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Audit chain.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Incident log.
    pub fn incidents(&self) -> &IncidentLog {
        &self.incidents
    }

    /// Health monitor.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Policy rule set.
    pub fn policy(&self) -> &PolicySet {
        self.router.policy()
    }

    /// Handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        self.router.handlers()
    }

    /// Kernel settings.
    pub fn settings(&self) -> &KernelSettings {
        &self.settings
    }

    /// Current logical tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Number of gated submits so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Deterministic query id for the `sequence`-th request on `node_id`.
///
/// This is the first candidate a node tries; see [`Node::submit`] for how a
/// candidate already taken by a caller-supplied id is skipped.
pub fn derive_query_id(node_id: &str, sequence: u64) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{node_id}/{sequence}").as_bytes()).to_string()
}

fn derive_retry_query_id(node_id: &str, sequence: u64, attempt: u64) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{node_id}/{sequence}/{attempt}").as_bytes(),
    )
    .to_string()
}

fn snapshot_error(message: impl Into<String>) -> KernelError {
    KernelError::Snapshot {
        message: message.into(),
    }
}

// ── SharedNode ─────────────────────────────────────────────────

/// A node behind a mutex, for callers submitting from several threads.
///
/// The lock is held for the whole of `submit`: budget read, handler
/// dispatch, audit append and health observation form one critical
/// section, so audit order is lock-acquisition order.
#[derive(Debug, Clone)]
pub struct SharedNode {
    inner: Arc<Mutex<Node>>,
}

impl SharedNode {
    /// Wrap `node`.
    pub fn new(node: Node) -> Self {
        Self {
            inner: Arc::new(Mutex::new(node)),
        }
    }

    /// See [`Node::submit`].
    ///
    /// # Errors
    ///
    /// As [`Node::submit`].
    pub fn submit(&self, request: SyscallRequest) -> Result<SyscallOutcome, KernelError> {
        self.lock().submit(request)
    }

    /// See [`Node::transition`].
    ///
    /// # Errors
    ///
    /// As [`Node::transition`].
    pub fn transition(&self, to: LifecycleState) -> Result<Option<Transition>, KernelError> {
        self.lock().transition(to)
    }

    /// See [`Node::snapshot`].
    pub fn snapshot(&self) -> NodeSnapshot {
        self.lock().snapshot()
    }

    /// Run `f` with exclusive access to the node.
    pub fn with<R>(&self, f: impl FnOnce(&mut Node) -> R) -> R {
        f(&mut self.lock())
    }

    // Handler panics are contained before they reach the lock, so a
    // poisoned mutex still holds a consistent node.
    fn lock(&self) -> MutexGuard<'_, Node> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
