//! Shared contracts for the relay work-queue substrate.
//!
//! This crate defines the storage-agnostic shapes that `relay-postgres` and
//! `relay-dispatcher` build on: opaque identifiers, row/status types, the
//! clock abstractions used for lease renewal and backoff, the handler
//! registry contracts handlers are registered against, and the error
//! taxonomy callers are expected to match on.
//!
//! Nothing in this crate talks to a database. It exists so that the engine
//! (`relay-postgres`) and the runnable dispatcher (`relay-dispatcher`) share
//! one vocabulary instead of each inventing their own row/status types.

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod ids;
pub mod model;

pub use clock::{MonotonicClock, SystemMonotonicClock};
pub use config::{BackoffPolicy, BatchSize, LeaseSeconds, ResourceName, SemaphoreLimits, Topic};
pub use error::{Error, ErrorKind, Result};
pub use handler::{
    HandlerOutcome, InboxHandler, InboxHandlerRegistry, OutboxHandler, OutboxHandlerRegistry,
};
pub use ids::{FencingToken, MessageId, OwnerToken, WorkItemId};
pub use model::{
    FanoutCursorRow, FanoutPolicyRow, InboxRow, InboxStatus, JobDefinition, JobRunRow, JoinStatus,
    LeaseGrant, OutboxRow, SemaphoreAcquireOutcome, TimerRow, WorkItemStatus,
};
