//! Error types for kiln.

pub mod unified;

pub use unified::{is_retryable_status, ErrorCategory, RETRYABLE_STATUSES};

use thiserror::Error;

/// Primary error type for all kiln operations.
#[derive(Error, Debug)]
pub enum KilnError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("The {tool} tool was called with invalid arguments: {message}")]
    InvalidToolInput { tool: String, message: String },

    #[error("Permission rejected for '{permission}'{}", feedback_suffix(.feedback))]
    PermissionRejected {
        permission: String,
        feedback: Option<String>,
    },

    #[error("Question dismissed by user")]
    QuestionRejected,

    #[error("Provider error{}: {message}", status_suffix(.status))]
    Provider {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Patch(#[from] crate::patch::PatchError),
}

impl KilnError {
    /// Create a provider error from an HTTP status.
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status: Some(status),
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a provider error that is explicitly flagged as transient.
    pub fn provider_retryable(message: impl Into<String>) -> Self {
        Self::Provider {
            status: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::InvalidToolInput { .. } | Self::Patch(_) => ErrorCategory::Validation,
            Self::PermissionRejected { .. } | Self::QuestionRejected => ErrorCategory::Permission,
            Self::Provider {
                status, retryable, ..
            } => match status {
                Some(429) => ErrorCategory::RateLimit,
                Some(s) if is_retryable_status(*s) => ErrorCategory::Server,
                _ if *retryable => ErrorCategory::Server,
                _ => ErrorCategory::Provider,
            },
            Self::NotFound(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Canceled => ErrorCategory::Canceled,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::InvalidState(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is a transient provider failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit | ErrorCategory::Server
        )
    }

    /// Whether this error is a policy outcome (permission or question rejection).
    pub fn is_rejection(&self) -> bool {
        self.category() == ErrorCategory::Permission
    }

    /// Whether this error is a storage miss rather than a corrupt or unreadable document.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

fn feedback_suffix(feedback: &Option<String>) -> String {
    feedback
        .as_deref()
        .map(|f| format!(": {f}"))
        .unwrap_or_default()
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_statuses_classify_as_retryable() {
        for status in RETRYABLE_STATUSES {
            let err = KilnError::provider(status, "upstream");
            assert!(err.is_retryable(), "status {status} should retry");
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        for status in [400, 401, 403, 404, 413] {
            let err = KilnError::provider(status, "bad request");
            assert!(!err.is_retryable(), "status {status} should not retry");
            assert_eq!(err.category(), ErrorCategory::Provider);
        }
    }

    #[test]
    fn explicit_retryable_flag_wins_without_status() {
        let err = KilnError::provider_retryable("connection reset");
        assert!(err.is_retryable());
    }

    #[test]
    fn rate_limit_has_its_own_category() {
        assert_eq!(
            KilnError::provider(429, "slow down").category(),
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn rejections_are_not_retryable() {
        let err = KilnError::PermissionRejected {
            permission: "bash".to_string(),
            feedback: None,
        };
        assert!(err.is_rejection());
        assert!(!err.is_retryable());
        assert!(KilnError::QuestionRejected.is_rejection());
    }

    #[test]
    fn rejection_display_includes_feedback() {
        let err = KilnError::PermissionRejected {
            permission: "edit".to_string(),
            feedback: Some("use the other file".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("edit"), "expected permission in message: {msg}");
        assert!(
            msg.contains("use the other file"),
            "expected feedback in message: {msg}"
        );
    }

    #[test]
    fn provider_display_includes_status() {
        let msg = KilnError::provider(503, "overloaded").to_string();
        assert!(msg.contains("503"), "expected status in message: {msg}");
    }

    #[test]
    fn not_found_is_distinct_from_io() {
        assert!(KilnError::NotFound("session/x".into()).is_not_found());
        let io = KilnError::Io(std::io::Error::other("disk"));
        assert!(!io.is_not_found());
    }
}
