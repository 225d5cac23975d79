use thiserror::Error;

/// Main error type for strand core operations
#[derive(Debug, Error)]
pub enum StrandError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicated id: {0}")]
    DuplicatedId(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("ID parse error: {0}")]
    IdParse(#[from] crate::types::ids::IdParseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StrandError {
    /// Get the error code used in logs and daemon output
    pub fn error_code(&self) -> &'static str {
        match self {
            StrandError::InvalidArgs(_) => "invalid_args",
            StrandError::NotFound(_) => "not_found",
            StrandError::DuplicatedId(_) => "duplicated_id",
            StrandError::Conflict(_) => "conflict",
            StrandError::Io(_) => "io_error",
            StrandError::Sled(_) => "db_error",
            StrandError::Json(_) => "internal_error",
            StrandError::TomlParse(_) => "invalid_args",
            StrandError::TomlSerialize(_) => "internal_error",
            StrandError::IdParse(_) => "invalid_args",
            StrandError::Internal(_) => "internal_error",
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            StrandError::InvalidArgs(_) => 2,
            StrandError::NotFound(_) => 3,
            StrandError::DuplicatedId(_) => 4,
            StrandError::Conflict(_) => 4,
            StrandError::Io(_) => 5,
            StrandError::Sled(_) => 5,
            StrandError::TomlParse(_) => 2,
            StrandError::IdParse(_) => 2,
            _ => 1,
        }
    }

    /// Create a NotFound error for a listener
    pub fn listener_not_found(listener_id: &str) -> Self {
        StrandError::NotFound(format!("Listener '{}' not found", listener_id))
    }

    /// Create a NotFound error for a sync unit
    pub fn sync_unit_not_found(sync_unit_id: &str) -> Self {
        StrandError::NotFound(format!("Sync unit '{}' not found", sync_unit_id))
    }

    /// Whether this is a structural caller error (duplicate or unknown id)
    pub fn is_caller_error(&self) -> bool {
        matches!(self, StrandError::NotFound(_) | StrandError::DuplicatedId(_))
    }
}
