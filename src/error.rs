//! Error types shared across the registry core and the worker runtime.

/// Errors from the Registry Store backends.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Failed to create or use the connection pool.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// Migration run failed.
    #[error("Migration failed: {reason}")]
    Migration { reason: String },

    /// A stored value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

/// Errors from the routing cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache backend is unreachable.
    #[error("Cache unavailable: {reason}")]
    Unavailable { reason: String },

    /// A cached value could not be decoded.
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by registrar, reconciler, and monitor operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A required field was missing or malformed.
    #[error("Validation failed: {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The referenced worker has no registry record.
    #[error("Unknown worker: {worker_id}")]
    UnknownWorker { worker_id: String },

    /// The referenced session has no registry record.
    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },

    /// A write tried to move a session away from a different recorded owner
    /// without going through release.
    #[error("Session {session_id} is owned by {current_owner}, not {claimant}")]
    StaleOwnership {
        session_id: String,
        current_owner: String,
        claimant: String,
    },

    /// Some entries of a batch write failed; the successful subset is
    /// committed. `failed` lists the session ids to re-report.
    #[error("Partial write: {} of {total} entries failed", failed.len())]
    PartialWrite { failed: Vec<String>, total: usize },

    /// Registry Store failure, propagated to the caller.
    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    /// Routing cache failure, propagated to the caller.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Errors from the external messaging-protocol client.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// No persisted session material for this session on this host.
    #[error("No local session material for {session_id}")]
    MissingMaterial { session_id: String },

    /// The remote end rejected the resume attempt.
    #[error("Resume rejected for {session_id}: {reason}")]
    ResumeRejected { session_id: String, reason: String },

    /// The protocol connection failed.
    #[error("Connection failed: {reason}")]
    Connection { reason: String },

    /// The attempt exceeded its deadline.
    #[error("Protocol operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from the worker-side registrar client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure reaching the registrar.
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The registrar returned a non-success status.
    #[error("Registrar returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The call exceeded its deadline.
    #[error("Registrar call timed out after {0:?}")]
    Timeout(std::time::Duration),
}
