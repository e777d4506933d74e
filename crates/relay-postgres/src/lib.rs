//! Postgres engine for the relay work-queue substrate.
//!
//! Implements every SQL operation this substrate needs against a single
//! `sqlx::PgPool`: `WorkQueueEngine` (the generic claim/ack/abandon/fail/
//! reap primitive), `OutboxStore`/`InboxStore` (which layer table-specific
//! columns and, for Outbox, join-counter advancement, on top of it),
//! `LeaseStore`/`LeaseHandle` (fencing + auto-renew), `SemaphoreStore`
//! (bounded concurrent holders), `JoinStore`/`JoinWaitHandler` (fan-in),
//! `TimerStore`/`JobStore`/`SchedulerStateStore` (one-shot and recurring
//! scheduling), and `FanoutStore` (policy-driven expansion).
//!
//! Everything here assumes one application database; `relay-dispatcher`
//! is what fans this engine out across many stores.

pub mod fanout;
pub mod inbox;
pub mod join;
pub mod lease;
pub mod outbox;
pub mod scheduler;
pub mod semaphore;
pub mod workqueue;

pub use fanout::FanoutStore;
pub use inbox::{InboxEnqueueOutcome, InboxStore};
pub use join::{JoinSnapshot, JoinStore, JoinWaitHandler, JoinWaitPayload};
pub use lease::{LeaseHandle, LeaseStore, RenewResult};
pub use scheduler::{JobStore, SchedulerStateStore, TimerStore};
pub use semaphore::SemaphoreStore;
pub use workqueue::{WorkQueueEngine, WorkQueueTable, INBOX_TABLE, JOB_RUNS_TABLE, OUTBOX_TABLE, TIMERS_TABLE};
