//! MCP error types.

use crate::oauth::OAuthError;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Which wire transport produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Streamable HTTP.
    Http,
    /// Legacy Server-Sent Events.
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("HTTP"),
            Self::Sse => f.write_str("SSE"),
        }
    }
}

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Connectivity failure, unexpected HTTP status or broken framing.
    #[error("MCP {kind} Transport Error: {message}")]
    Transport { kind: TransportKind, message: String },

    /// A payload could not be decoded as a JSON-RPC message.
    #[error("Invalid JSON-RPC message: {0}")]
    Decode(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server negotiated a protocol version this client does not speak.
    #[error("Server's protocol version is not supported: {0}")]
    UnsupportedProtocolVersion(String),

    /// The server did not advertise the capability a method needs.
    #[error("Server does not support {0}")]
    CapabilityNotSupported(&'static str),

    /// JSON-RPC error object returned by the server.
    #[error("{message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Tool output did not match the caller's output schema.
    #[error("Tool output failed schema validation: {0}")]
    SchemaValidation(String),

    /// Typed OAuth error returned by an authorization server.
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    /// Authorization could not be completed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The server rejected our credentials and no fresh ones are available.
    #[error("Unauthorized")]
    Unauthorized,

    /// The caller cancelled the operation.
    #[error("The operation was aborted")]
    Cancelled,

    /// Request timeout.
    #[error("Request timed out")]
    Timeout,

    /// The transport closed while a request was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A request was issued on a client that is not connected.
    #[error("Attempted to send a request from a closed client")]
    ClientClosed,

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl McpError {
    /// Create a Streamable HTTP transport error.
    pub fn http_transport(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Http,
            message: message.into(),
        }
    }

    /// Create a legacy SSE transport error.
    pub fn sse_transport(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Sse,
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an authorization failure.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed(message.into())
    }

    /// JSON-RPC error code, for errors that came back from the server.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error reports a caller-side cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Copy of this error suitable for handing to several observers.
    ///
    /// Variants that wrap non-cloneable sources are flattened to their message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Transport { kind, message } => Self::Transport {
                kind: *kind,
                message: message.clone(),
            },
            Self::Decode(m) => Self::Decode(m.clone()),
            Self::Protocol(m) => Self::Protocol(m.clone()),
            Self::UnsupportedProtocolVersion(v) => Self::UnsupportedProtocolVersion(v.clone()),
            Self::CapabilityNotSupported(c) => Self::CapabilityNotSupported(c),
            Self::Server {
                code,
                message,
                data,
            } => Self::Server {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::SchemaValidation(m) => Self::SchemaValidation(m.clone()),
            Self::OAuth(e) => Self::OAuth(e.clone()),
            Self::AuthFailed(m) => Self::AuthFailed(m.clone()),
            Self::Unauthorized => Self::Unauthorized,
            Self::Cancelled => Self::Cancelled,
            Self::Timeout => Self::Timeout,
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::ClientClosed => Self::ClientClosed,
            Self::Url(e) => Self::Url(*e),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::OAuthErrorKind;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                McpError::http_transport("POSTing to endpoint (HTTP 500): boom"),
                "MCP HTTP Transport Error: POSTing to endpoint (HTTP 500): boom",
            ),
            (
                McpError::sse_transport("Not connected"),
                "MCP SSE Transport Error: Not connected",
            ),
            (
                McpError::protocol("bad id"),
                "Protocol error: bad id",
            ),
            (
                McpError::UnsupportedProtocolVersion("1999-01-01".to_string()),
                "Server's protocol version is not supported: 1999-01-01",
            ),
            (
                McpError::CapabilityNotSupported("tools"),
                "Server does not support tools",
            ),
            (McpError::Cancelled, "The operation was aborted"),
            (McpError::ConnectionClosed, "Connection closed"),
            (
                McpError::ClientClosed,
                "Attempted to send a request from a closed client",
            ),
            (McpError::Unauthorized, "Unauthorized"),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_server_error_carries_code() {
        let err = McpError::Server {
            code: -32602,
            message: "Invalid params".to_string(),
            data: Some(serde_json::json!({"field": "foo"})),
        };
        assert_eq!(err.code(), Some(-32602));
        assert_eq!(err.to_string(), "Invalid params");
        assert_eq!(McpError::Timeout.code(), None);
    }

    #[test]
    fn test_cancelled_is_distinct_from_network_failure() {
        assert!(McpError::Cancelled.is_cancelled());
        assert!(!McpError::ConnectionClosed.is_cancelled());
        assert!(!McpError::http_transport("connect refused").is_cancelled());
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let err = McpError::OAuth(OAuthError::new(OAuthErrorKind::InvalidGrant, "expired"));
        assert!(matches!(
            err.duplicate(),
            McpError::OAuth(ref e) if e.kind == OAuthErrorKind::InvalidGrant
        ));

        let json_err = serde_json::from_str::<Value>("invalid").unwrap_err();
        let flattened = McpError::from(json_err).duplicate();
        assert!(matches!(flattened, McpError::Protocol(ref m) if m.contains("JSON error")));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let mcp_err: McpError = io_err.into();
        assert!(mcp_err.to_string().contains("IO error"));
    }
}
