//! nodekernel: a deterministic, policy-enforced syscall kernel for a
//! single node.
//!
//! Every requested operation passes a lifecycle gate and an authorization
//! policy, is dispatched to a registered capability handler, and is recorded
//! in a hash-chained audit log. The whole node can be snapshotted and
//! replayed bit-for-bit.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod kernel;
pub mod logging;
pub mod types;
