//! Capability handlers and the capability → handler registry.
//!
//! A handler is anything that can `execute(args) -> Result<Value, HandlerError>`.
//! Closures of that shape implement [`CapabilityHandler`] directly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::types::Payload;

/// A handler signalled failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Arguments were not what the handler expects.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    /// The handler ran and failed.
    #[error("{0}")]
    Failed(String),
    /// The handler panicked; the panic was contained at dispatch.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// A capability implementation.
pub trait CapabilityHandler: Send + Sync {
    /// Run with the request's arguments.
    ///
    /// # Errors
    ///
    /// Any [`HandlerError`] is recorded as a failed syscall.
    fn execute(&self, args: &Payload) -> Result<Payload, HandlerError>;
}

impl<F> CapabilityHandler for F
where
    F: Fn(&Payload) -> Result<Payload, HandlerError> + Send + Sync,
{
    fn execute(&self, args: &Payload) -> Result<Payload, HandlerError> {
        self(args)
    }
}

/// Capability name → handler. Capability names are opaque strings.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn CapabilityHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("capabilities", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `capability`, replacing any previous one.
    /// Returns whether a handler was replaced.
    pub fn register(
        &mut self,
        capability: impl Into<String>,
        handler: impl CapabilityHandler + 'static,
    ) -> bool {
        self.register_arc(capability, Arc::new(handler))
    }

    /// Register a closure for `capability`.
    pub fn register_fn<F>(&mut self, capability: impl Into<String>, f: F) -> bool
    where
        F: Fn(&Payload) -> Result<Payload, HandlerError> + Send + Sync + 'static,
    {
        self.register_arc(capability, Arc::new(f))
    }

    /// Register a shared handler.
    pub fn register_arc(
        &mut self,
        capability: impl Into<String>,
        handler: Arc<dyn CapabilityHandler>,
    ) -> bool {
        let capability = capability.into();
        debug!(capability = %capability, "capability handler registered");
        self.handlers.insert(capability, handler).is_some()
    }

    /// Remove the handler for `capability`.
    pub fn unregister(&mut self, capability: &str) -> bool {
        self.handlers.remove(capability).is_some()
    }

    /// Handler for `capability`.
    pub fn get(&self, capability: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(capability).cloned()
    }

    /// Whether `capability` has a handler.
    pub fn contains(&self, capability: &str) -> bool {
        self.handlers.contains_key(capability)
    }

    /// Registered capability names, sorted.
    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
