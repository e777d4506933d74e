//! Runnable background-task layer over `relay-postgres`.
//!
//! Everything here is long-lived `tokio::spawn` tasks woken on a polling
//! cadence (a `tokio::sync::watch::Receiver<bool>` shutdown signal threaded
//! through every loop, checked between iterations rather than forcing a
//! task to cancel mid-operation):
//!
//! - [`outbox_loop`] / [`inbox_loop`]: the generic claim-dispatch-ack/
//!   abandon/fail loop, parameterized by a frozen
//!   handler registry.
//! - [`scheduler_loop`]: timer and cron-job promotion into the Outbox
//!, lease-gated with a monotonic fencing-acceptance check.
//! - [`fanout_loop`]: policy-driven multi-destination expansion with a
//!   resumable cursor.
//! - [`background`]: the shared lease-reaper, semaphore-reaper, and
//!   retention-cleanup loops reused by every table.
//! - [`multistore`]: `MultiStoreDispatcher`, `SelectionStrategy`
//!   (`RoundRobin`/`DrainFirst`), and the `StoreProvider`/`Discovery`
//!   capability set that unifies single- and multi-database deployments
//!.
//! - [`router`]: write-path routing by key.

pub mod background;
pub mod fanout_loop;
pub mod inbox_loop;
pub mod multistore;
pub mod outbox_loop;
pub mod router;
pub mod scheduler_loop;

pub use background::{run_cleanup_loop, run_reap_loop, run_semaphore_reap_loop};
pub use fanout_loop::{FanoutDispatcher, FanoutDispatcherConfig};
pub use inbox_loop::{InboxDispatchConfig, InboxDispatcher};
pub use multistore::{
    DiscoveredStoreConfig, DrainFirst, DynamicStoreProvider, MultiStoreDispatcher,
    MultiStoreDispatcherConfig, RoundRobin, SelectionStrategy, Store, StoreDiscovery,
    StoreProvider,
};
pub use outbox_loop::{OutboxDispatchConfig, OutboxDispatcher};
pub use router::Router;
pub use scheduler_loop::{SchedulerDispatcher, SchedulerDispatcherConfig};
