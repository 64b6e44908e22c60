//! PostgreSQL access shared through the router state.

use axum::extract::FromRef;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::AppState;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "studyroom";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Connection pool handle cloned into every request.
#[derive(Clone)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Open a bounded pool against the given instance.
    pub async fn new(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool_size: u32,
    ) -> Result<Self, sqlx::Error> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let postgres = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(&addr)
            .await?;

        tracing::info!(%hostname, %db, pool_size, "postgres connected");

        Ok(Self { postgres })
    }
}

impl FromRef<AppState> for Database {
    fn from_ref(state: &AppState) -> Database {
        state.db.clone()
    }
}
