use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::HarnessConfig;

/// Runs `harness/migrations` against the configured database.
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect relay database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate relay schema")?;

    tracing::info!(event = "relay.migrate.complete");
    Ok(())
}
