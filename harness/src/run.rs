//! Wires the stores and dispatch loops together and runs them until
//! `ctrl_c`: one `watch::Sender<bool>` flips to request shutdown, every
//! loop is a `tokio::spawn`ed task holding the matching `Receiver`, and
//! `main` joins them all before returning.

use crate::config::HarnessConfig;
use crate::handlers::{EchoInboxHandler, EchoOutboxHandler};
use crate::store_discovery::StaticStoreDiscovery;
use relay_core::{
    InboxHandlerRegistry, MonotonicClock, OutboxHandlerRegistry, OwnerToken, SystemMonotonicClock,
};
use relay_dispatcher::{
    run_cleanup_loop, run_reap_loop, run_semaphore_reap_loop, DynamicStoreProvider,
    FanoutDispatcher, FanoutDispatcherConfig, InboxDispatchConfig, InboxDispatcher,
    MultiStoreDispatcher, MultiStoreDispatcherConfig, OutboxDispatchConfig, OutboxDispatcher,
    RoundRobin, SchedulerDispatcher, SchedulerDispatcherConfig, StoreDiscovery,
};
use relay_postgres::{
    FanoutStore, InboxStore, JoinWaitHandler, JobStore, LeaseStore, OutboxStore,
    SchedulerStateStore, SemaphoreStore, TimerStore,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Resource name the scheduler leader-election lease is acquired under.
/// Fixed across instances so exactly one process promotes timers/jobs at
/// a time.
const SCHEDULER_LEASE_NAME: &str = "scheduler:default";

pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    if cfg.enable_schema_deployment {
        crate::migrate::run(cfg).await?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;

    let owner = OwnerToken::new();
    let clock: Arc<dyn MonotonicClock> = Arc::new(SystemMonotonicClock::new());

    let outbox = OutboxStore::new(pool.clone());
    let inbox = InboxStore::new(pool.clone());
    let lease_store = Arc::new(LeaseStore::new(pool.clone()));
    let semaphore_store = SemaphoreStore::with_limits(pool.clone(), cfg.semaphore_limits()?);
    let timer_store = TimerStore::new(pool.clone());
    let job_store = JobStore::new(pool.clone());
    let scheduler_state = SchedulerStateStore::new(pool.clone());
    let fanout_store = FanoutStore::new(pool.clone());

    let join_wait: Arc<dyn relay_core::OutboxHandler> =
        Arc::new(JoinWaitHandler::new(pool.clone(), outbox.clone()));
    let outbox_handlers = Arc::new(OutboxHandlerRegistry::new(vec![
        join_wait,
        Arc::new(EchoOutboxHandler),
    ])?);
    let inbox_handlers = Arc::new(InboxHandlerRegistry::new(vec![Arc::new(EchoInboxHandler)])?);

    let backoff = cfg.backoff_policy();
    let batch_size = cfg.batch_size()?;
    let lease_seconds = cfg.lease_seconds()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let outbox_dispatch_cfg = OutboxDispatchConfig { lease_seconds, batch_size };
    let extra_stores = cfg.extra_store_urls();

    let inbox_dispatcher = Arc::new(InboxDispatcher::new(
        inbox.clone(),
        inbox_handlers,
        backoff,
        InboxDispatchConfig { lease_seconds, batch_size },
    ));
    let scheduler_dispatcher = Arc::new(SchedulerDispatcher::new(
        lease_store.clone(),
        scheduler_state,
        job_store.clone(),
        timer_store.clone(),
        outbox.clone(),
        clock.clone(),
        SchedulerDispatcherConfig {
            lease_name: SCHEDULER_LEASE_NAME.to_string(),
            lease_duration: cfg.scheduler_poll_interval() * 4,
            lease_seconds,
            batch_size,
            poll_interval: cfg.scheduler_poll_interval(),
        },
    ));
    let fanout_dispatcher = Arc::new(FanoutDispatcher::new(
        lease_store.clone(),
        fanout_store,
        outbox.clone(),
        clock.clone(),
        FanoutDispatcherConfig {
            lease_duration: cfg.fanout_poll_interval() * 4,
            batch_size,
            poll_interval: cfg.fanout_poll_interval(),
        },
    ));

    let mut tasks = Vec::new();

    if extra_stores.is_empty() {
        let outbox_dispatcher = Arc::new(OutboxDispatcher::new(
            outbox.clone(),
            outbox_handlers,
            backoff,
            outbox_dispatch_cfg,
        ));
        tasks.push(tokio::spawn({
            let d = outbox_dispatcher.clone();
            let rx = shutdown_rx.clone();
            async move { d.run_loop(owner, rx).await }
        }));
    } else {
        let provider = Arc::new(DynamicStoreProvider::new());
        let discovery = Arc::new(StaticStoreDiscovery::new(
            ("primary".to_string(), cfg.database_url.clone()),
            extra_stores,
        ));
        // Populate the roster once before the dispatcher's first iteration
        // instead of waiting out the first discovery cadence.
        provider.refresh(discovery.discover().await?).await?;

        let multistore_dispatcher = Arc::new(MultiStoreDispatcher::new(
            provider.clone(),
            Box::new(RoundRobin::default()),
            outbox_handlers,
            backoff,
            MultiStoreDispatcherConfig {
                owner,
                outbox: outbox_dispatch_cfg,
                per_store_lease: Duration::from_secs(lease_seconds as u64),
                idle_poll_interval: backoff.base,
            },
        ));
        tasks.push(tokio::spawn({
            let d = multistore_dispatcher.clone();
            let rx = shutdown_rx.clone();
            async move { d.run_loop(rx).await }
        }));
        tasks.push(tokio::spawn(provider.run_discovery_loop(
            discovery,
            cfg.discovery_refresh_interval(),
            shutdown_rx.clone(),
        )));
    }

    tasks.push(tokio::spawn({
        let d = inbox_dispatcher.clone();
        let rx = shutdown_rx.clone();
        async move { d.run_loop(owner, rx).await }
    }));
    tasks.push(tokio::spawn({
        let d = scheduler_dispatcher.clone();
        let rx = shutdown_rx.clone();
        async move { d.run_loop(owner, rx).await }
    }));
    tasks.push(tokio::spawn({
        let d = fanout_dispatcher.clone();
        let rx = shutdown_rx.clone();
        async move { d.run_loop(owner, rx).await }
    }));

    let reaper_interval = cfg.reaper_interval();
    let reaper_batch = batch_size;

    tasks.push(tokio::spawn({
        let store = outbox.clone();
        let rx = shutdown_rx.clone();
        run_reap_loop("outbox", reaper_interval, reaper_batch, rx, move |limit| {
            let store = store.clone();
            async move { store.reap_expired(limit).await }
        })
    }));
    tasks.push(tokio::spawn({
        let store = inbox.clone();
        let rx = shutdown_rx.clone();
        run_reap_loop("inbox", reaper_interval, reaper_batch, rx, move |limit| {
            let store = store.clone();
            async move { store.reap_expired(limit).await }
        })
    }));
    tasks.push(tokio::spawn({
        let store = timer_store.clone();
        let rx = shutdown_rx.clone();
        run_reap_loop("timers", reaper_interval, reaper_batch, rx, move |limit| {
            let store = store.clone();
            async move { store.reap_expired(limit).await }
        })
    }));
    tasks.push(tokio::spawn({
        let store = job_store.clone();
        let rx = shutdown_rx.clone();
        run_reap_loop("job_runs", reaper_interval, reaper_batch, rx, move |limit| {
            let store = store.clone();
            async move { store.reap_expired_runs(limit).await }
        })
    }));
    tasks.push(tokio::spawn(run_semaphore_reap_loop(
        semaphore_store,
        reaper_interval,
        shutdown_rx.clone(),
    )));

    let cleanup_interval = cfg.cleanup_interval();
    let retention = cfg.retention();
    tasks.push(tokio::spawn({
        let store = outbox.clone();
        let rx = shutdown_rx.clone();
        run_cleanup_loop(
            "outbox",
            cleanup_interval,
            retention,
            reaper_batch,
            rx,
            move |retention, limit| {
                let store = store.clone();
                async move { store.delete_done_older_than(retention, limit).await }
            },
        )
    }));
    tasks.push(tokio::spawn({
        let store = inbox.clone();
        let rx = shutdown_rx.clone();
        run_cleanup_loop(
            "inbox",
            cleanup_interval,
            retention,
            reaper_batch,
            rx,
            move |retention, limit| {
                let store = store.clone();
                async move { store.delete_done_older_than(retention, limit).await }
            },
        )
    }));

    tracing::info!(event = "relay.harness.started", owner = %owner);

    tokio::signal::ctrl_c().await?;
    tracing::info!(event = "relay.harness.shutdown_requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(event = "relay.harness.task_join_error", error = %err);
        }
    }

    Ok(())
}
