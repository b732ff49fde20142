use thiserror::Error;

/// Storage-layer errors, shared by the durable store and the credential
/// backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database operation error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Engine-level errors. Everything here is recoverable at some scope:
/// nothing from event processing propagates into the transport's event
/// loop, and a failed connect attempt never takes the process down.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fatal to one connect attempt; the reconnect policy decides what
    /// happens next.
    #[error("connection init failed: {0}")]
    ConnectionInit(String),

    #[error("credential load failed: {0}")]
    CredentialLoad(#[source] StoreError),

    /// Caught per-event at the pipeline edge; the batch continues.
    #[error("event handler '{event}' failed: {source}")]
    EventHandler {
        event: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("group metadata refresh failed for {jid}: {source}")]
    CacheRefresh {
        jid: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("recovery retry failed for message {message_id}: {source}")]
    RecoveryRetry {
        message_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("instance is not connected")]
    NotConnected,

    #[error("instance is already connected")]
    AlreadyConnected,

    #[error("a connect attempt is already in flight")]
    AlreadyConnecting,

    #[error("instance session has ended")]
    SessionEnded,
}

pub type Result<T> = std::result::Result<T, EngineError>;
