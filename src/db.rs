//! Database helpers shared by the Postgres backend and the binary.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::backends::BackendResult;

/// Run the embedded SQLx migrations.
pub async fn run_migrations(pool: &PgPool) -> BackendResult<()> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

/// Open a pool sized for one coordinating instance.
pub async fn connect_pool(dsn: &str, max_connections: u32) -> BackendResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(dsn)
        .await?;
    Ok(pool)
}
