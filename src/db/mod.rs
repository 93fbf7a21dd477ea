//! Database connection pool, migrations, and health check.
//!
//! Postgres is the only source of truth and the only synchronization point
//! between engine instances. Row locks taken here are what keep concurrent
//! workers and scanners from stepping on each other.

pub mod audit;
pub mod filter;
pub mod followups;
pub mod queue;
pub mod tasks;
pub mod users;

pub use filter::FollowUpFilter;
pub use tasks::TaskOutcome;

use crate::error::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = pool_options().connect(url).await?;
        Ok(Self { pool })
    }

    /// Build a pool without opening a connection. Nothing touches the
    /// network until the first query.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = pool_options().connect_lazy(url)?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
}
