//! Shared background loops: lease reaping, retention cleanup, and the
//! semaphore reaper.
//!
//! Each is a plain `tokio::spawn`-able async fn taking a `watch::Receiver`
//! shutdown signal and a fixed cadence.

use relay_postgres::SemaphoreStore;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Runs `reap_once` on a fixed cadence until `shutdown` fires. Used for
/// every WorkQueue-shaped table's `reapExpired` (Outbox, Inbox, Timers,
/// JobRuns).
pub async fn run_reap_loop<F, Fut>(
    name: &str,
    cadence: Duration,
    batch_limit: i64,
    mut shutdown: watch::Receiver<bool>,
    mut reap_once: F,
) where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = relay_core::Result<u64>>,
{
    while !*shutdown.borrow() {
        match reap_once(batch_limit).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(event = "relay.reap.reclaimed", table = %name, count = n),
            Err(err) => tracing::warn!(event = "relay.reap.error", table = %name, error = %err),
        }
        tokio::select! {
            _ = tokio::time::sleep(cadence) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Deletes `Done` rows older than `retention` on a fixed cadence.
pub async fn run_cleanup_loop<F, Fut>(
    name: &str,
    cadence: Duration,
    retention: Duration,
    batch_limit: i64,
    mut shutdown: watch::Receiver<bool>,
    mut delete_older_than: F,
) where
    F: FnMut(Duration, i64) -> Fut,
    Fut: Future<Output = relay_core::Result<u64>>,
{
    while !*shutdown.borrow() {
        match delete_older_than(retention, batch_limit).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(event = "relay.cleanup.deleted", table = %name, count = n),
            Err(err) => tracing::warn!(event = "relay.cleanup.error", table = %name, error = %err),
        }
        tokio::select! {
            _ = tokio::time::sleep(cadence) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Deletes expired semaphore child leases on a fixed cadence.
pub async fn run_semaphore_reap_loop(
    store: SemaphoreStore,
    cadence: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        match store.reap_expired().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(event = "relay.semaphore.reaped", count = n),
            Err(err) => tracing::warn!(event = "relay.semaphore.reap_error", error = %err),
        }
        tokio::select! {
            _ = tokio::time::sleep(cadence) => {}
            _ = shutdown.changed() => {}
        }
    }
}
