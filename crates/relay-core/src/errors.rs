use std::time::Duration;

use crate::ids::ClientId;

/// Structural problems with an inbound event.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("event type must not be empty")]
    EmptyType,
    #[error("{event_type} event requires a runId")]
    MissingRunId { event_type: String },
    #[error("{event_type} event requires a stepName")]
    MissingStepName { event_type: String },
    #[error("{event_type} event requires a toolCallId")]
    MissingToolCallId { event_type: String },
}

/// Failures on the outbound tool-call path.
///
/// Classifies by origin: the transport died, the request aged out, the frame
/// was garbage, or the remote endpoint ran the tool and reported failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timeout for tool {tool} after {after:?}")]
    Timeout { tool: String, after: Duration },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("client closed")]
    Closed,
}

impl RpcError {
    /// Whether the failure was connection-scoped rather than request-scoped.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Protocol(_) => "protocol",
            Self::Tool(_) => "tool",
            Self::Closed => "closed",
        }
    }
}

/// Failures on the inbound event path.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_kinds() {
        assert_eq!(RpcError::Transport("closed".into()).error_kind(), "transport");
        assert_eq!(
            RpcError::Timeout {
                tool: "echo".into(),
                after: Duration::from_millis(50)
            }
            .error_kind(),
            "timeout"
        );
        assert_eq!(RpcError::Tool("boom".into()).error_kind(), "tool");
        assert_eq!(RpcError::Closed.error_kind(), "closed");
    }

    #[test]
    fn connection_scoped_classification() {
        assert!(RpcError::Transport("gone".into()).is_connection_scoped());
        assert!(RpcError::Closed.is_connection_scoped());
        assert!(!RpcError::Tool("boom".into()).is_connection_scoped());
        assert!(!RpcError::Timeout {
            tool: "echo".into(),
            after: Duration::from_secs(30)
        }
        .is_connection_scoped());
    }

    #[test]
    fn validation_error_names_the_event_type() {
        let err = ValidationError::MissingRunId {
            event_type: "RunFinished".into(),
        };
        assert!(err.to_string().contains("RunFinished"));
    }

    #[test]
    fn gateway_error_wraps_validation() {
        let err: GatewayError = ValidationError::EmptyType.into();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
