use thiserror::Error;

pub type OutreachResult<T> = Result<T, OutreachError>;

#[derive(Error, Debug)]
pub enum OutreachError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Mail transport error: {0}")]
    Transport(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Data consistency error: {0}")]
    DataConsistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OutreachError {
    /// Errors raised by external collaborators. These are logged against the
    /// enrollment and retried on the next due tick instead of surfacing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OutreachError::Transport(_)
                | OutreachError::Webhook(_)
                | OutreachError::Collaborator(_)
                | OutreachError::Timeout { .. }
        )
    }

    /// Short machine-readable tag, stored on `error` activities.
    pub fn kind(&self) -> &'static str {
        match self {
            OutreachError::Validation(_) => "validation",
            OutreachError::NotFound(_) => "not_found",
            OutreachError::Permission(_) => "permission",
            OutreachError::Transport(_) => "transport",
            OutreachError::Webhook(_) => "webhook",
            OutreachError::Collaborator(_) => "collaborator",
            OutreachError::Timeout { .. } => "timeout",
            OutreachError::DataConsistency(_) => "data_consistency",
            OutreachError::Config(_) => "config",
            OutreachError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(OutreachError::Transport("smtp down".into()).is_recoverable());
        assert!(OutreachError::Timeout {
            operation: "webhook".into(),
            timeout_ms: 50
        }
        .is_recoverable());
        assert!(!OutreachError::Validation("bad".into()).is_recoverable());
        assert!(!OutreachError::Permission("nope".into()).is_recoverable());
    }

    #[test]
    fn test_display_includes_operation() {
        let err = OutreachError::Timeout {
            operation: "mail.send".into(),
            timeout_ms: 100,
        };
        assert_eq!(err.to_string(), "Timed out after 100ms: mail.send");
        assert_eq!(err.kind(), "timeout");
    }
}
