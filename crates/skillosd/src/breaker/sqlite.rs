//! SQLite-backed circuit store shared across processes.
//!
//! Every process pointing at the same database file sees the same breaker
//! state. Compare-and-set is a conditional upsert on `version`; failure
//! counting is a single `UPDATE ... RETURNING`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skillos_core::{CircuitPhase, CircuitState};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use super::store::{CircuitStore, Result, StoreError};

const CIRCUIT_COLUMNS: &str =
    "handler, phase, failure_count, last_failure_at, trial_count, trial_successes, version";

#[derive(Debug, Clone)]
pub struct SqliteCircuitStore {
    pool: Pool<Sqlite>,
}

impl SqliteCircuitStore {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../../migrations/0001_circuit_state.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    /// Open and migrate in one step.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let store = Self::new(db_path).await?;
        store.migrate_embedded().await?;
        Ok(store)
    }
}

#[async_trait]
impl CircuitStore for SqliteCircuitStore {
    async fn get(&self, handler: &str) -> Result<CircuitState> {
        let query = format!("SELECT {CIRCUIT_COLUMNS} FROM circuit_state WHERE handler = ?1");
        let row = sqlx::query_as::<_, CircuitRow>(&query)
            .bind(handler)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row.into_state(),
            None => Ok(CircuitState::closed(handler)),
        }
    }

    async fn compare_and_set(&self, expected_version: u64, next: &CircuitState) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO circuit_state (
                handler, phase, failure_count, last_failure_at,
                trial_count, trial_successes, version, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(handler) DO UPDATE SET
                phase = excluded.phase,
                failure_count = excluded.failure_count,
                last_failure_at = excluded.last_failure_at,
                trial_count = excluded.trial_count,
                trial_successes = excluded.trial_successes,
                version = excluded.version,
                updated_at = excluded.updated_at
            WHERE circuit_state.version = ?9
            ",
        )
        .bind(&next.handler)
        .bind(next.phase.as_str())
        .bind(i64::from(next.failure_count))
        .bind(next.last_failure_at.map(|t| t.timestamp_millis()))
        .bind(i64::from(next.trial_count))
        .bind(i64::from(next.trial_successes))
        .bind(next.version as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn increment_failure(
        &self,
        handler: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<CircuitState>> {
        let query = format!(
            r"
            INSERT INTO circuit_state (
                handler, phase, failure_count, last_failure_at,
                trial_count, trial_successes, version, updated_at
            )
            VALUES (?1, 'CLOSED', 1, ?2, 0, 0, 1, ?2)
            ON CONFLICT(handler) DO UPDATE SET
                failure_count = circuit_state.failure_count + 1,
                last_failure_at = excluded.last_failure_at,
                version = circuit_state.version + 1,
                updated_at = excluded.updated_at
            WHERE circuit_state.phase = 'CLOSED'
            RETURNING {CIRCUIT_COLUMNS}
            "
        );
        let row = sqlx::query_as::<_, CircuitRow>(&query)
            .bind(handler)
            .bind(at.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CircuitRow::into_state).transpose()
    }

    async fn list(&self) -> Result<Vec<CircuitState>> {
        let query = format!("SELECT {CIRCUIT_COLUMNS} FROM circuit_state ORDER BY handler");
        let rows = sqlx::query_as::<_, CircuitRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CircuitRow::into_state).collect()
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct CircuitRow {
    handler: String,
    phase: String,
    failure_count: i64,
    last_failure_at: Option<i64>,
    trial_count: i64,
    trial_successes: i64,
    version: i64,
}

impl CircuitRow {
    fn into_state(self) -> Result<CircuitState> {
        let phase = CircuitPhase::parse(&self.phase).ok_or_else(|| StoreError::Corrupt {
            handler: self.handler.clone(),
            reason: format!("unknown phase '{}'", self.phase),
        })?;
        let last_failure_at = match self.last_failure_at {
            Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                StoreError::Corrupt {
                    handler: self.handler.clone(),
                    reason: format!("timestamp out of range: {ms}"),
                }
            })?),
            None => None,
        };
        Ok(CircuitState {
            handler: self.handler,
            phase,
            failure_count: self.failure_count.max(0) as u32,
            last_failure_at,
            trial_count: self.trial_count.max(0) as u32,
            trial_successes: self.trial_successes.max(0) as u32,
            version: self.version.max(0) as u64,
        })
    }
}
