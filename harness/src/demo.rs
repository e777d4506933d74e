//! `relay-harness demo-enqueue`: seeds a visible exercise of every module
//! against a running database, for manual smoke-testing the `run` loops.

use crate::config::HarnessConfig;
use chrono::{Duration as ChronoDuration, Utc};
use relay_core::Topic;
use relay_dispatcher::Router;
use relay_postgres::{FanoutStore, JobStore, OutboxStore, TimerStore};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;

/// `routing_key` only matters when `STORE_URLS` configures more than one
/// store; it selects which one the demo message is routed into via
/// `Router`. Timers/jobs/fanout policies always seed against the primary
/// store, matching `run`'s scoping.
pub async fn run(cfg: &HarnessConfig, routing_key: &str) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await?;

    let extra_stores = cfg.extra_store_urls();
    let outbox = if extra_stores.is_empty() {
        OutboxStore::new(pool.clone())
    } else {
        let mut writers = HashMap::new();
        writers.insert("primary".to_string(), OutboxStore::new(pool.clone()));
        for (i, url) in extra_stores.iter().enumerate() {
            let store_pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            writers.insert(format!("store-{i}"), OutboxStore::new(store_pool));
        }
        let router = Router::new(writers);
        router.resolve(routing_key)?
    };
    let timers = TimerStore::new(pool.clone());
    let jobs = JobStore::new(pool.clone());
    let fanout = FanoutStore::new(pool.clone());

    let topic = Topic::new("demo.echo")?;
    let (id, message_id) = outbox
        .enqueue(&topic, json!({"greeting": "hello from relay-harness"}), None, None)
        .await?;
    tracing::info!(event = "relay.demo.enqueued", id = %id, message_id = %message_id);

    let due = Utc::now() + ChronoDuration::seconds(10);
    let timer_id = timers
        .schedule_timer("demo.echo", json!({"kind": "timer"}), due)
        .await?;
    tracing::info!(event = "relay.demo.timer_scheduled", id = %timer_id, due_time_utc = %due);

    jobs.create_or_update(
        "demo-minutely",
        "demo.echo",
        "0 * * * * *",
        Some(json!({"kind": "job"})),
    )
    .await?;
    tracing::info!(event = "relay.demo.job_registered", job_name = "demo-minutely");

    fanout
        .register_policy(
            "demo-fanout",
            "demo.echo",
            &["demo.echo.copy-a".to_string(), "demo.echo.copy-b".to_string()],
            true,
        )
        .await?;
    tracing::info!(event = "relay.demo.fanout_registered", policy = "demo-fanout");

    Ok(())
}
