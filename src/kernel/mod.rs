//! Kernel core: identity, policy, lifecycle, routing, and the audit and
//! incident logs a node owns.
//!
//! [`node::Node`] is the composition root. Everything else is a leaf it
//! owns and passes by reference; nothing here is global.

pub mod audit;
pub mod clock;
pub mod handler;
pub mod health;
pub mod identity;
pub mod incident;
pub mod lifecycle;
pub mod node;
pub mod policy;
pub mod router;

use thiserror::Error;

use self::audit::{AuditError, ChainVerificationFailure};
use self::health::HealthError;
use self::identity::IdentityError;
use self::lifecycle::{LifecycleError, LifecycleState};
use self::policy::PolicyError;

pub use self::node::{KernelSettings, Node, NodeSnapshot, SharedNode};
pub use self::router::SyscallOutcome;

/// Errors surfaced by the kernel to the caller of `submit` / `transition`.
///
/// Request-level kinds (`UnknownCapability`, `PolicyDenied`,
/// `HandlerFailure`, `DuplicateQueryId`) are also durable in the audit and
/// incident logs by the time the caller sees them.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Submit attempted while the node is `Init` or `Shutdown`. No side effects.
    #[error("node not ready: lifecycle state is {state}")]
    NodeNotReady {
        /// State at the time of the attempt.
        state: LifecycleState,
    },

    /// No handler is registered for the capability.
    #[error("unknown capability '{capability}' (query {query_id})")]
    UnknownCapability {
        /// Requested capability.
        capability: String,
        /// Correlating query id.
        query_id: String,
    },

    /// Policy refused the request.
    #[error("policy denied (query {query_id}): {reason}")]
    PolicyDenied {
        /// Denial reason.
        reason: String,
        /// Correlating query id.
        query_id: String,
    },

    /// The handler ran and failed.
    #[error("handler for '{capability}' failed (query {query_id}): {message}")]
    HandlerFailure {
        /// Capability whose handler failed.
        capability: String,
        /// Correlating query id.
        query_id: String,
        /// Handler error text.
        message: String,
    },

    /// A caller-supplied query id was already used on this node.
    #[error("duplicate query id '{query_id}'")]
    DuplicateQueryId {
        /// The reused id.
        query_id: String,
    },

    /// Illegal lifecycle edge or corrupt lifecycle history.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Identity failed well-formedness or attestation checks.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Policy configuration is invalid.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The audit chain does not verify.
    #[error(transparent)]
    ChainVerification(#[from] ChainVerificationFailure),

    /// Health thresholds are invalid.
    #[error(transparent)]
    Health(#[from] HealthError),

    /// Audit encoding or I/O failed.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A snapshot is internally inconsistent.
    #[error("invalid snapshot: {message}")]
    Snapshot {
        /// What was inconsistent.
        message: String,
    },
}

impl KernelError {
    /// Query id the error relates to, when it is request-level.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            Self::UnknownCapability { query_id, .. }
            | Self::PolicyDenied { query_id, .. }
            | Self::HandlerFailure { query_id, .. }
            | Self::DuplicateQueryId { query_id } => Some(query_id),
            _ => None,
        }
    }

    /// Whether an audit entry was written for the request that produced
    /// this error.
    pub fn is_audited(&self) -> bool {
        self.query_id().is_some()
    }
}
