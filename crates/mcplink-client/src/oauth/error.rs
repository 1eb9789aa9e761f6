//! Typed OAuth errors.

use super::types::OAuthErrorResponse;
use thiserror::Error;

/// Standard OAuth error codes (RFC 6749, RFC 6750, RFC 7591).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    AccessDenied,
    ServerError,
    TemporarilyUnavailable,
    UnsupportedResponseType,
    UnsupportedTokenType,
    InvalidToken,
    MethodNotAllowed,
    TooManyRequests,
    InvalidClientMetadata,
    InsufficientScope,
}

impl OAuthErrorKind {
    const ALL: [Self; 16] = [
        Self::InvalidRequest,
        Self::InvalidClient,
        Self::InvalidGrant,
        Self::UnauthorizedClient,
        Self::UnsupportedGrantType,
        Self::InvalidScope,
        Self::AccessDenied,
        Self::ServerError,
        Self::TemporarilyUnavailable,
        Self::UnsupportedResponseType,
        Self::UnsupportedTokenType,
        Self::InvalidToken,
        Self::MethodNotAllowed,
        Self::TooManyRequests,
        Self::InvalidClientMetadata,
        Self::InsufficientScope,
    ];

    /// Wire code, e.g. `invalid_grant`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::UnsupportedTokenType => "unsupported_token_type",
            Self::InvalidToken => "invalid_token",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::TooManyRequests => "too_many_requests",
            Self::InvalidClientMetadata => "invalid_client_metadata",
            Self::InsufficientScope => "insufficient_scope",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

/// An OAuth error returned by an authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub message: String,
    pub error_uri: Option<String>,
}

impl OAuthError {
    pub fn new(kind: OAuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_uri: None,
        }
    }

    /// Wire representation of this error.
    pub fn to_response(&self) -> OAuthErrorResponse {
        OAuthErrorResponse {
            error: self.kind.code().to_string(),
            error_description: Some(self.message.clone()),
            error_uri: self.error_uri.clone(),
        }
    }
}

/// Parse a token or registration endpoint error body.
///
/// Unknown codes become `server_error`. A body that is not an OAuth error
/// document becomes `server_error` with the status and raw body in the message.
pub fn parse_error_response(status: Option<u16>, body: &str) -> OAuthError {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(response) => {
            let kind =
                OAuthErrorKind::from_code(&response.error).unwrap_or(OAuthErrorKind::ServerError);
            OAuthError {
                kind,
                message: response.error_description.unwrap_or_default(),
                error_uri: response.error_uri,
            }
        }
        Err(e) => {
            let prefix = status.map(|s| format!("HTTP {s}: ")).unwrap_or_default();
            OAuthError::new(
                OAuthErrorKind::ServerError,
                format!("{prefix}Invalid OAuth error response: {e}. Raw body: {body}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_map_to_kinds() {
        let err = parse_error_response(
            Some(400),
            r#"{"error": "invalid_grant", "error_description": "Code expired"}"#,
        );
        assert_eq!(err.kind, OAuthErrorKind::InvalidGrant);
        assert_eq!(err.message, "Code expired");
        assert_eq!(err.to_string(), "Code expired");

        for kind in OAuthErrorKind::ALL {
            assert_eq!(OAuthErrorKind::from_code(kind.code()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_code_falls_back_to_server_error() {
        let err = parse_error_response(
            Some(400),
            r#"{"error": "something_custom", "error_description": "nope", "error_uri": "https://docs"}"#,
        );
        assert_eq!(err.kind, OAuthErrorKind::ServerError);
        assert_eq!(err.message, "nope");
        assert_eq!(err.error_uri.as_deref(), Some("https://docs"));
    }

    #[test]
    fn test_non_json_body_keeps_status_and_raw_body() {
        let err = parse_error_response(Some(502), "<html>Bad Gateway</html>");
        assert_eq!(err.kind, OAuthErrorKind::ServerError);
        assert!(err.message.starts_with("HTTP 502: Invalid OAuth error response: "));
        assert!(err.message.ends_with("Raw body: <html>Bad Gateway</html>"));

        let no_status = parse_error_response(None, "oops");
        assert!(no_status.message.starts_with("Invalid OAuth error response"));
    }

    #[test]
    fn test_to_response() {
        let response = OAuthError::new(OAuthErrorKind::InvalidClient, "bad secret").to_response();
        assert_eq!(response.error, "invalid_client");
        assert_eq!(response.error_description.as_deref(), Some("bad secret"));
    }
}
