//! Schema-aware availability probe for the notification store.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use super::database_availability::{AvailabilityProbe, ProbeError};

/// Tables the services read and write.
pub const REQUIRED_TABLES: &[&str] = &["notifications"];

/// Probes the database by reading from every required table
pub struct DatabaseValidator {
    pool: SqlitePool,
    required_tables: Vec<String>,
}

impl DatabaseValidator {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_tables(pool, REQUIRED_TABLES)
    }

    pub fn with_tables(pool: SqlitePool, required_tables: &[&str]) -> Self {
        Self {
            pool,
            required_tables: required_tables.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Returns the required tables that do not exist.
    pub async fn missing_tables(&self) -> Result<Vec<String>, sqlx::Error> {
        let mut missing = Vec::new();

        for table in &self.required_tables {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
            )
            .bind(table)
            .fetch_one(&self.pool)
            .await?
                > 0;

            if !exists {
                missing.push(table.clone());
            }
        }

        Ok(missing)
    }
}

#[async_trait]
impl AvailabilityProbe for DatabaseValidator {
    async fn probe(&self) -> Result<(), ProbeError> {
        let missing = self.missing_tables().await.map_err(classify)?;
        if !missing.is_empty() {
            return Err(ProbeError::ResourceMissing(missing.join(", ")));
        }

        // Touch each table the way real traffic will, so permission and
        // corruption problems show up here rather than on the first write.
        for table in &self.required_tables {
            sqlx::query(&format!("SELECT 1 FROM \"{table}\" LIMIT 1"))
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)?;
        }

        debug!(tables = self.required_tables.len(), "Database probe read succeeded");
        Ok(())
    }
}

fn classify(error: sqlx::Error) -> ProbeError {
    match &error {
        sqlx::Error::Database(db_error) if db_error.message().contains("no such table") => {
            ProbeError::ResourceMissing(db_error.message().to_string())
        }
        _ => ProbeError::Failed(error.to_string()),
    }
}
