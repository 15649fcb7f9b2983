use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

/// PostgreSQL connection pool type alias.
pub type PgPool = sqlx::PgPool;

/// Create a PostgreSQL connection pool from the given database URL.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}
