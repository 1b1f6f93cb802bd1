use thiserror::Error;

#[derive(Debug, Error)]
pub enum YarDbError {
    #[error("database {path} is already in use by PID {pid}")]
    AlreadyLocked { path: String, pid: String },

    #[error("document validation error: {0}")]
    DocumentValidation(#[from] DocumentValidationError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DocumentValidationError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct CodecError(pub String);
