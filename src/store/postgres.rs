//! PostgreSQL Registry Store.
//!
//! Ownership transitions are expressed as conditional `UPDATE ... WHERE`
//! statements so the owner check and the write are a single atomic
//! statement; the row count tells us whether the condition held.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;
use tokio_postgres::Row;

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::registry::{
    Capabilities, SessionRecord, SessionStatus, WorkerRecord, WorkerStatus,
};
use crate::store::{RegistryStore, WriteOutcome};

const ACTIVE_STATUSES: [&str; 4] = ["init", "qr_required", "connected", "reconnecting"];

/// Registry Store backed by Postgres.
pub struct PgRegistryStore {
    pool: Pool,
}

impl PgRegistryStore {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        // Migrations live in migrations/ and are applied externally:
        // refinery migrate -c refinery.toml -p migrations
        tracing::info!("Database migrations should be run via: refinery migrate -c refinery.toml");
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    fn worker_from_row(row: &Row) -> Result<WorkerRecord, DatabaseError> {
        let status_str: String = row.get("status");
        let status = WorkerStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown worker status: {}", status_str))
        })?;
        let capabilities: serde_json::Value = row.get("capabilities");
        let capabilities = serde_json::from_value(capabilities)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        Ok(WorkerRecord {
            worker_id: row.get("worker_id"),
            endpoint: row.get("endpoint"),
            status,
            capacity: row.get::<_, i32>("capacity") as u32,
            session_count: row.get::<_, i32>("session_count") as u32,
            capabilities,
            last_heartbeat: row.get("last_heartbeat"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn session_from_row(row: &Row) -> Result<SessionRecord, DatabaseError> {
        let status_str: String = row.get("status");
        let status = SessionStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown session status: {}", status_str))
        })?;

        Ok(SessionRecord {
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            owner_worker: row.get("owner_worker"),
            status,
            external_identity: row.get("external_identity"),
            last_seen: row.get("last_seen"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Classify a conditional session write that updated zero rows.
    async fn classify_miss(
        &self,
        session_id: &str,
        claimant: &str,
    ) -> Result<WriteOutcome, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT owner_worker FROM sessions WHERE session_id = $1",
                &[&session_id],
            )
            .await?;

        match row {
            None => Ok(WriteOutcome::NotFound),
            Some(row) => match row.get::<_, Option<String>>("owner_worker") {
                Some(owner) if owner != claimant => Ok(WriteOutcome::OwnedByOther(owner)),
                Some(_) | None => Ok(WriteOutcome::Unowned),
            },
        }
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn upsert_worker(
        &self,
        worker_id: &str,
        endpoint: &str,
        capacity: u32,
        capabilities: &Capabilities,
    ) -> Result<WorkerRecord, DatabaseError> {
        let conn = self.conn().await?;
        let capabilities_json = serde_json::to_value(capabilities)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let row = conn
            .query_one(
                r#"
                INSERT INTO workers (worker_id, endpoint, status, capacity, capabilities)
                VALUES ($1, $2, 'online', $3, $4)
                ON CONFLICT (worker_id) DO UPDATE SET
                    endpoint = EXCLUDED.endpoint,
                    status = 'online',
                    capacity = EXCLUDED.capacity,
                    capabilities = EXCLUDED.capabilities,
                    last_heartbeat = NOW(),
                    updated_at = NOW()
                RETURNING worker_id, endpoint, status, capacity, session_count,
                          capabilities, last_heartbeat, created_at, updated_at
                "#,
                &[&worker_id, &endpoint, &(capacity as i32), &capabilities_json],
            )
            .await?;

        Self::worker_from_row(&row)
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT worker_id, endpoint, status, capacity, session_count,
                       capabilities, last_heartbeat, created_at, updated_at
                FROM workers WHERE worker_id = $1
                "#,
                &[&worker_id],
            )
            .await?;

        row.map(|r| Self::worker_from_row(&r)).transpose()
    }

    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        session_count: u32,
        capabilities: &Capabilities,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let capabilities_json = serde_json::to_value(capabilities)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let updated = conn
            .execute(
                r#"
                UPDATE workers SET
                    status = $2,
                    session_count = $3,
                    capabilities = $4,
                    last_heartbeat = NOW(),
                    updated_at = NOW()
                WHERE worker_id = $1
                "#,
                &[
                    &worker_id,
                    &status.as_str(),
                    &(session_count as i32),
                    &capabilities_json,
                ],
            )
            .await?;

        Ok(updated > 0)
    }

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE workers SET status = $2, updated_at = NOW() WHERE worker_id = $1",
                &[&worker_id, &status.as_str()],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn set_worker_session_count(
        &self,
        worker_id: &str,
        count: u32,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE workers SET session_count = $2, updated_at = NOW() WHERE worker_id = $1",
            &[&worker_id, &(count as i32)],
        )
        .await?;
        Ok(())
    }

    async fn list_stale_workers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT worker_id, endpoint, status, capacity, session_count,
                       capabilities, last_heartbeat, created_at, updated_at
                FROM workers
                WHERE status = 'online' AND last_heartbeat < $1
                ORDER BY last_heartbeat
                "#,
                &[&cutoff],
            )
            .await?;

        rows.iter().map(Self::worker_from_row).collect()
    }

    async fn demote_worker_if_stale(
        &self,
        worker_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE workers SET status = 'offline', updated_at = NOW()
                WHERE worker_id = $1 AND status = 'online' AND last_heartbeat < $2
                "#,
                &[&worker_id, &cutoff],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO sessions (session_id, user_id, name, owner_worker, status,
                                      external_identity, last_seen, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (session_id) DO NOTHING
                "#,
                &[
                    &record.session_id,
                    &record.user_id,
                    &record.name,
                    &record.owner_worker,
                    &record.status.as_str(),
                    &record.external_identity,
                    &record.last_seen,
                    &record.created_at,
                    &record.updated_at,
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                r#"
                SELECT session_id, user_id, name, owner_worker, status,
                       external_identity, last_seen, created_at, updated_at
                FROM sessions WHERE session_id = $1
                "#,
                &[&session_id],
            )
            .await?;

        row.map(|r| Self::session_from_row(&r)).transpose()
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM sessions WHERE session_id = $1", &[&session_id])
            .await?;
        Ok(deleted > 0)
    }

    async fn list_active_sessions_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<SessionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let statuses: Vec<&str> = ACTIVE_STATUSES.to_vec();
        let rows = conn
            .query(
                r#"
                SELECT session_id, user_id, name, owner_worker, status,
                       external_identity, last_seen, created_at, updated_at
                FROM sessions
                WHERE owner_worker = $1 AND status = ANY($2)
                ORDER BY created_at
                "#,
                &[&worker_id, &statuses],
            )
            .await?;

        rows.iter().map(Self::session_from_row).collect()
    }

    async fn count_active_sessions(&self, worker_id: &str) -> Result<u32, DatabaseError> {
        let conn = self.conn().await?;
        let statuses: Vec<&str> = ACTIVE_STATUSES.to_vec();
        let row = conn
            .query_one(
                "SELECT COUNT(*) AS n FROM sessions WHERE owner_worker = $1 AND status = ANY($2)",
                &[&worker_id, &statuses],
            )
            .await?;
        Ok(row.get::<_, i64>("n") as u32)
    }

    async fn claim_session(
        &self,
        session_id: &str,
        worker_id: &str,
        status: SessionStatus,
        external_identity: Option<&str>,
    ) -> Result<WriteOutcome, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE sessions SET
                    owner_worker = $2,
                    status = $3,
                    external_identity = COALESCE($4, external_identity),
                    last_seen = NOW(),
                    updated_at = NOW()
                WHERE session_id = $1
                  AND (owner_worker IS NULL OR owner_worker = $2)
                "#,
                &[&session_id, &worker_id, &status.as_str(), &external_identity],
            )
            .await?;

        if updated > 0 {
            return Ok(WriteOutcome::Applied);
        }
        self.classify_miss(session_id, worker_id).await
    }

    async fn release_session(
        &self,
        session_id: &str,
        expected_owner: &str,
    ) -> Result<WriteOutcome, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE sessions SET
                    owner_worker = NULL,
                    status = 'disconnected',
                    updated_at = NOW()
                WHERE session_id = $1
                  AND (owner_worker IS NULL OR owner_worker = $2)
                "#,
                &[&session_id, &expected_owner],
            )
            .await?;

        if updated > 0 {
            return Ok(WriteOutcome::Applied);
        }
        self.classify_miss(session_id, expected_owner).await
    }

    async fn release_sessions_for_worker(
        &self,
        worker_id: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn().await?;
        let statuses: Vec<&str> = ACTIVE_STATUSES.to_vec();
        let rows = conn
            .query(
                r#"
                UPDATE sessions SET
                    owner_worker = NULL,
                    status = 'disconnected',
                    updated_at = NOW()
                WHERE owner_worker = $1 AND status = ANY($2)
                RETURNING session_id
                "#,
                &[&worker_id, &statuses],
            )
            .await?;

        Ok(rows.iter().map(|r| r.get("session_id")).collect())
    }

    async fn sync_session_state(
        &self,
        session_id: &str,
        worker_id: &str,
        status: SessionStatus,
        external_identity: Option<&str>,
    ) -> Result<WriteOutcome, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE sessions SET
                    status = $3,
                    external_identity = COALESCE($4, external_identity),
                    last_seen = NOW(),
                    updated_at = NOW()
                WHERE session_id = $1 AND owner_worker = $2
                "#,
                &[&session_id, &worker_id, &status.as_str(), &external_identity],
            )
            .await?;

        if updated > 0 {
            return Ok(WriteOutcome::Applied);
        }
        self.classify_miss(session_id, worker_id).await
    }
}
