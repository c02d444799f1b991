use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum TroveError {
    // The handle refers to an operation that was already destroyed, or to a manager that was dropped
    InvalidHandle,
    // Acquire/release was called on an operation from inside its own destroyed callback
    ReferenceChangeDuringDestroy,
    // Complete was called on an operation that already reached a terminal state
    AlreadyCompleted,
    UnknownProvider {
        provider_id: String,
        location: String,
    },
    TypeMismatch {
        expected: &'static str,
        context: String,
    },
    DependencyFailed(String),
    InvalidPath(String),
    ProvideFailed(String),
    StringError(String),
    IoError(Arc<std::io::Error>),
    JsonError(Arc<serde_json::Error>),
    BincodeError(Arc<bincode::Error>),
}

impl Error for TroveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TroveError::IoError(e) => Some(&**e),
            TroveError::JsonError(e) => Some(&**e),
            TroveError::BincodeError(e) => Some(&**e),
            _ => None,
        }
    }
}

impl Display for TroveError {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            TroveError::InvalidHandle => write!(f, "Attempting to use an invalid operation handle"),
            TroveError::ReferenceChangeDuringDestroy => write!(
                f,
                "Cannot acquire or release an operation from inside its destroyed callback"
            ),
            TroveError::AlreadyCompleted => write!(f, "Operation was already completed"),
            TroveError::UnknownProvider {
                provider_id,
                location,
            } => write!(
                f,
                "No provider could be found, ProviderId={}, Location={}",
                provider_id, location
            ),
            TroveError::TypeMismatch { expected, context } => write!(
                f,
                "{} provided a result which cannot be converted to requested type {}",
                context, expected
            ),
            TroveError::DependencyFailed(message) => write!(f, "{}", message),
            TroveError::InvalidPath(message) => write!(f, "{}", message),
            TroveError::ProvideFailed(message) => write!(f, "{}", message),
            TroveError::StringError(message) => write!(f, "{}", message),
            TroveError::IoError(e) => e.fmt(f),
            TroveError::JsonError(e) => e.fmt(f),
            TroveError::BincodeError(e) => e.fmt(f),
        }
    }
}

impl From<String> for TroveError {
    fn from(error: String) -> Self {
        TroveError::StringError(error)
    }
}

impl From<&str> for TroveError {
    fn from(error: &str) -> Self {
        TroveError::StringError(error.to_string())
    }
}

impl From<std::io::Error> for TroveError {
    fn from(error: std::io::Error) -> Self {
        TroveError::IoError(Arc::new(error))
    }
}

impl From<serde_json::Error> for TroveError {
    fn from(error: serde_json::Error) -> Self {
        TroveError::JsonError(Arc::new(error))
    }
}

impl From<bincode::Error> for TroveError {
    fn from(error: bincode::Error) -> Self {
        TroveError::BincodeError(Arc::new(error))
    }
}

pub type TroveResult<T> = Result<T, TroveError>;
