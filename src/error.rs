use thiserror::Error;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("VM '{0}' not found or not in a migratable state")]
    NoSuchVM(String),
    #[error("Destination migration limit exceeded: {0}")]
    MigrationLimitExceeded(String),
    #[error("Hypervisor error ({code}): {message}")]
    Hypervisor { code: i32, message: String },
    #[error("Job stats missing required field '{0}'")]
    MissingField(String),
    #[error("Migration cancelled")]
    Cancelled,
    #[error("Migration stalled: {0}")]
    Stalled(String),
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("System command failed: {0}")]
    SystemCommandFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    SerdeError(String),
}

impl FerryError {
    pub fn hypervisor(code: i32, message: impl Into<String>) -> Self {
        FerryError::Hypervisor {
            code,
            message: message.into(),
        }
    }

    /// Only a destination at capacity is worth asking again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FerryError::MigrationLimitExceeded(_))
    }
}

impl From<toml::de::Error> for FerryError {
    fn from(err: toml::de::Error) -> Self {
        FerryError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        FerryError::SerdeError(err.to_string())
    }
}
