//! Offline Module
//!
//! Durable buffering of data-plane writes made while a tenant's backend is
//! unreachable, and their later replay:
//!
//! - `queue.rs`: buffered write types and the coalescing planner
//! - `buffer.rs`: the SQLite-backed write buffer, dead letters, cursors and
//!   the read cache
//! - `retry.rs`: retry ceiling and backoff
//! - `reconciliation.rs`: single-flight replay through the active handle

pub mod buffer;
pub mod queue;
pub mod reconciliation;
pub mod retry;

pub use buffer::{DeadLetter, FailureClass, LocalWriteBuffer};
pub use queue::{EnqueueOutcome, EnqueuePlan, NewWrite, PendingWrite, WriteOp, WriteState};
pub use reconciliation::{ReconcileReport, SyncEvent, SyncReconciler};
pub use retry::RetryPolicy;
