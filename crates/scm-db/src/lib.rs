//! Postgres pool construction and migration running, grounded in the
//! teacher's `server` binary: `PgPoolOptions` with a bounded pool,
//! `sqlx::migrate!` against an in-tree `migrations/` directory.

use anyhow::{Context, Result};
use scm_config::AppConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Shared handle threaded through constructors instead of a global
/// singleton (spec §9 "Globals / module-level state").
#[derive(Clone)]
pub struct AppContext {
    pub pool: PgPool,
    pub config: AppConfig,
}

impl AppContext {
    pub async fn connect(config: AppConfig) -> Result<Self> {
        tracing::info!("connecting to postgres");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.postgres_dsn)
            .await
            .context("failed to connect to postgres")?;
        tracing::info!("postgres connected");
        Ok(Self { pool, config })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        tracing::info!("migrations complete");
        Ok(())
    }
}
