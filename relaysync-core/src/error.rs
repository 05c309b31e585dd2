use thiserror::Error;

/// Error kinds produced anywhere in the event pipeline.
///
/// Resolver and Node Client implementations never panic or propagate raw
/// transport errors across the worker boundary; they return one of these
/// variants (or a narrower per-component error that converts into one).
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("unknown source node: {0}")]
    UnknownSource(String),

    #[error("no matching user for target node")]
    NoMatchingUser,

    #[error("item not found on target: {0}")]
    ItemAbsent(String),

    #[error("transient node error: {0}")]
    TransientNode(String),

    #[error("permanent node error: {0}")]
    PermanentNode(String),

    #[error("node rejected credentials")]
    Unauthorized,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("shutting down")]
    ShuttingDown,
}

/// Errors surfaced by the durable store. Kept distinct from [`RelayError`]
/// so repository implementations don't need to know about pipeline-level
/// concerns; `RelayError::Store` is the seam where the two meet.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

/// Errors returned from a [`crate::node_client::NodeClient`] call.
///
/// The Sync Worker classifies on this type to decide
/// applied/retry/failed.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("{kind} not found on node")]
    NotFound { kind: NotFoundKind },

    #[error("transient node failure: {0}")]
    Transient(String),

    #[error("permanent node failure: {0}")]
    Permanent(String),

    #[error("node rejected credentials")]
    Unauthorized,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NotFoundKind {
    User,
    Item,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundKind::User => write!(f, "user"),
            NotFoundKind::Item => write!(f, "item"),
        }
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            NodeError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                NodeError::Unauthorized
            } else if status.is_server_error() {
                NodeError::Transient(err.to_string())
            } else {
                NodeError::Permanent(err.to_string())
            }
        } else {
            NodeError::Transient(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
