//! Schema migrations for the PostgreSQL backend.
//!
//! Every statement from [`schema`](super::schema) is one numbered migration.
//! Runners started by several processes at once serialize on an advisory
//! lock, so each migration is applied exactly once.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;

use super::schema;

/// Advisory lock key held while migrations run.
const MIGRATION_LOCK_KEY: i64 = 0x6a6f_6266_6f72_6765; // "jobforge"

/// Name under which statement `index` of the schema is recorded.
fn migration_name(index: usize) -> String {
    format!("{:04}_jobforge", index + 1)
}

/// Applies pending schema statements and reports what has been applied.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration not yet recorded and returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        create_ledger(&mut tx).await?;

        let done: HashSet<String> = sqlx::query_scalar::<_, String>("SELECT name FROM _migrations")
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

        let mut applied = 0;
        for (index, statement) in schema::all_schema_statements().into_iter().enumerate() {
            let name = migration_name(index);
            if done.contains(&name) {
                continue;
            }

            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Migration(format!("{}: {}", name, e)))?;
            sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
                .bind(&name)
                .execute(&mut *tx)
                .await?;

            debug!(migration = %name, "Applied migration");
            applied += 1;
        }

        tx.commit().await?;
        if applied > 0 {
            info!(applied = applied, "Database schema updated");
        }
        Ok(applied)
    }

    /// Migrations recorded so far, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, StoreError> {
        let mut tx = self.pool.begin().await?;
        create_ledger(&mut tx).await?;
        let rows: Vec<AppliedMigration> = sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY name")
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(rows)
    }
}

async fn create_ledger(tx: &mut Transaction<'_, Postgres>) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// One row of the `_migrations` ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}
