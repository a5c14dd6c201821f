use thiserror::Error;

/// Classified failures crossing a pipeline stage boundary.
///
/// Stages return `anyhow::Result`; callers that need to decide between
/// degrading and aborting downcast to this type.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("{service} call failed: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },

    #[error("{service} call timed out")]
    Timeout { service: &'static str },

    #[error("malformed {what}: {detail}")]
    MalformedOutput { what: &'static str, detail: String },

    #[error("answer synthesis failed: {0}")]
    Synthesis(String),

    #[error("request abandoned by the client")]
    Cancelled,
}

impl RagError {
    pub fn upstream(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Upstream {
            service,
            message: err.to_string(),
        }
    }

    /// Map a transport error, keeping timeouts distinguishable.
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { service }
        } else {
            Self::upstream(service, err)
        }
    }

    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::MalformedOutput {
            what,
            detail: detail.into(),
        }
    }

    /// Recoverable errors degrade to a conservative default (empty
    /// retrieval, empty evidence, default route). Synthesis failures and
    /// cancellation end the request.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Synthesis(_) | Self::Cancelled)
    }
}

/// Whether an `anyhow` error may be swallowed by a fail-closed stage.
/// Unclassified errors count as recoverable upstream failures.
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RagError>()
        .map(RagError::is_recoverable)
        .unwrap_or(true)
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<RagError>(), Some(RagError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesis_is_terminal() {
        let err = anyhow::Error::new(RagError::Synthesis("timeout".into()));
        assert!(!is_recoverable(&err));
    }

    #[test]
    fn test_malformed_and_unclassified_are_recoverable() {
        let err = anyhow::Error::new(RagError::malformed("cypher", "no MATCH"));
        assert!(is_recoverable(&err));
        assert!(is_recoverable(&anyhow::anyhow!("connection reset")));
    }

    #[test]
    fn test_cancelled_is_terminal_and_recognized() {
        let err = anyhow::Error::new(RagError::Cancelled);
        assert!(is_cancelled(&err));
        assert!(!is_recoverable(&err));
        assert!(!is_cancelled(&anyhow::Error::new(RagError::Synthesis("x".into()))));
    }
}
