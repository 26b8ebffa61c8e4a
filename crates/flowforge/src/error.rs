use thiserror::Error;

/// Every error kind observable at the engine boundary (see the error handling
/// design: each variant names its disposition at the call site that produces it).
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown variable referenced: {0}")]
    UnknownVariable(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("input validation failed for action '{action_id}': {source}")]
    InputValidation {
        action_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("action '{action_id}' raised an exception: {message}")]
    ActionException { action_id: String, message: String },

    #[error("timed out waiting on '{task_id}' after {timeout_secs}s")]
    Timeout { task_id: String, timeout_secs: f64 },

    #[error("cache backend error: {0}")]
    CacheBackendError(String),

    #[error("blob backend error: {0}")]
    BlobBackendError(String),

    #[error("dependency merge stalled for '{task_id}'")]
    MergeStall { task_id: String },

    #[error("'{id}' is not an action")]
    NotAnAction { id: String },

    #[error("'{id}' is not a loop")]
    NotALoop { id: String },

    #[error("unknown action type: {0}")]
    UnknownActionType(String),

    #[error("{0} is not iterable")]
    NotIterable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Template(#[from] tera::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
