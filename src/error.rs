use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    // Credential errors
    AuthRequired,
    Unauthorized(String),

    // Network errors
    TransientNetwork(String),
    Timeout,
    NotConnected,
    ConnectionClosed,

    // Server rejected a request
    ValidationRejected { status: u16, message: String },

    // Local state errors
    StateLock(String),
    NotFound(String),
    StorageError(String),

    // Messages errors
    MessageParseError(String),

    // Configuration errors
    ConfigError(String),
}

impl SyncError {
    /// True for failures caused by the credential rather than the network
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthRequired | Self::Unauthorized(_))
    }

    /// True for failures the connection manager retries with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::Timeout | Self::ConnectionClosed
        )
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthRequired => write!(f, "Authentication required"),
            Self::Unauthorized(msg) => write!(f, "Credential rejected: {}", msg),
            Self::TransientNetwork(msg) => write!(f, "Network error: {}", msg),
            Self::Timeout => write!(f, "Request timed out"),
            Self::NotConnected => write!(f, "Channel is not connected"),
            Self::ConnectionClosed => write!(f, "Connection closed unexpectedly"),
            Self::ValidationRejected { status, message } => {
                write!(f, "Rejected by server ({}): {}", status, message)
            }
            Self::StateLock(msg) => write!(f, "State lock error: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for SyncError {}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for SyncError {
    fn from(err: PoisonError<T>) -> Self {
        SyncError::StateLock(format!("Mutex poisoned: {}", err))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MessageParseError(err.to_string())
    }
}

// Generic result type for RustySync
pub type Result<T> = std::result::Result<T, SyncError>;
