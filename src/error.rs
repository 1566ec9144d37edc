use std::fmt;

/// Central error types for the mission sync engine
#[derive(Debug)]
pub enum AppError {
    /// Database error (rusqlite)
    Database(rusqlite::Error),
    /// Filesystem error
    Filesystem(std::io::Error),
    /// Payload (de)serialization error
    Serialization(serde_json::Error),
    /// Validation error (e.g. completing a report without signatures)
    Validation(String),
    /// Resource not found
    NotFound(String),
    /// Local store could not be opened; offline features are disabled
    StoreUnavailable(String),
    /// A queue entry violates an invariant (orphaned, undecodable)
    QueueIntegrity(String),
    /// Invalid or unreadable configuration
    Config(String),
    /// General error
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::Filesystem(e) => write!(f, "Filesystem error: {}", e),
            AppError::Serialization(e) => write!(f, "Serialization error: {}", e),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::StoreUnavailable(msg) => write!(f, "Local store unavailable: {}", msg),
            AppError::QueueIntegrity(msg) => write!(f, "Queue integrity error: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Database(e) => Some(e),
            AppError::Filesystem(e) => Some(e),
            AppError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from other error types
impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e)
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Filesystem(e)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Serialization(e)
    }
}

/// User-friendly error messages for UI (can be translated by the caller)
impl AppError {
    pub fn user_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Serialization(_) => {
                "A storage error occurred. Please try again.".to_string()
            }
            AppError::Filesystem(_) => {
                "Error accessing files. Please check app permissions.".to_string()
            }
            AppError::Validation(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("{} was not found.", msg),
            AppError::StoreUnavailable(_) => {
                "Offline mode is unavailable on this device. Changes are sent directly."
                    .to_string()
            }
            AppError::QueueIntegrity(_) => {
                "A pending change could not be synchronized and was dropped.".to_string()
            }
            AppError::Config(msg) => format!("Invalid settings: {}", msg),
            AppError::Other(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_user_message() {
        let err = AppError::Validation("client signature missing".to_string());
        assert_eq!(err.to_string(), "Validation error: client signature missing");
        assert_eq!(err.user_message(), "client signature missing");

        let err = AppError::NotFound("Report".to_string());
        assert_eq!(err.user_message(), "Report was not found.");
    }

    #[test]
    fn test_from_rusqlite() {
        let err: AppError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, AppError::Database(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
