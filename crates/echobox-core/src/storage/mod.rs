//! Database access layer implementing the repository pattern for job
//! persistence.
//!
//! The repository layer translates between domain models and the database
//! schema. All job-row SQL lives here; the delivery engine and the HTTP
//! handlers go through these repositories rather than issuing queries of
//! their own.

use std::sync::Arc;

use sqlx::PgPool;

pub mod jobs;

use crate::error::Result;

/// Container for repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for scheduled delivery jobs.
    pub jobs: Arc<jobs::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self { jobs: Arc::new(jobs::Repository::new(pool)) }
    }

    /// Performs a health check on the database connection.
    ///
    /// Used by the `/ready` endpoint for readiness probes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.jobs.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        // Instantiation only; real database coverage lives in integration
        // tests against the mock store.
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
