//! OAuth value types exchanged during discovery and authorization.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::ops::Deref;
use url::Url;

/// A URL that must not use a script-capable scheme.
///
/// Endpoints arrive from untrusted metadata documents and may end up in a
/// browser, so `javascript:`, `data:` and `vbscript:` are refused on decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafeUrl(Url);

impl SafeUrl {
    pub fn parse(input: &str) -> Result<Self, String> {
        let url = Url::parse(input).map_err(|e| format!("URL must be parseable: {input} ({e})"))?;
        Self::try_from(url)
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn into_url(self) -> Url {
        self.0
    }
}

impl TryFrom<Url> for SafeUrl {
    type Error = String;

    fn try_from(url: Url) -> Result<Self, Self::Error> {
        match url.scheme() {
            scheme @ ("javascript" | "data" | "vbscript") => Err(format!(
                "URL cannot use javascript:, data:, or vbscript: scheme (got {scheme}) for {url}"
            )),
            _ => Ok(Self(url)),
        }
    }
}

impl Deref for SafeUrl {
    type Target = Url;

    fn deref(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for SafeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for SafeUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for SafeUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SafeUrl::parse(&raw).map_err(de::Error::custom)
    }
}

/// OAuth 2.1 token response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl OAuthTokens {
    /// Bearer tokens with only an access token set.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_in: None,
            scope: None,
            refresh_token: None,
        }
    }
}

/// OAuth 2.0 Protected Resource Metadata (RFC 9728).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: Url,
    #[serde(default)]
    pub authorization_servers: Vec<SafeUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_methods_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_documentation: Option<String>,
}

/// Authorization server metadata (RFC 8414 or OpenID Connect discovery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: SafeUrl,
    pub token_endpoint: SafeUrl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<SafeUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    pub response_types_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,
}

impl AuthorizationServerMetadata {
    pub fn supports_code_challenge_method(&self, method: &str) -> bool {
        self.code_challenge_methods_supported
            .as_ref()
            .is_some_and(|methods| methods.iter().any(|m| m == method))
    }
}

/// Client credentials, from configuration or dynamic registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientInformation {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
}

impl OAuthClientInformation {
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            client_id_issued_at: None,
            client_secret_expires_at: None,
        }
    }
}

/// RFC 7591 client metadata sent when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientMetadata {
    pub redirect_uris: Vec<SafeUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<SafeUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

/// Registration response: issued credentials plus the echoed metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientInformationFull {
    #[serde(flatten)]
    pub information: OAuthClientInformation,
    #[serde(flatten)]
    pub metadata: OAuthClientMetadata,
}

/// Error body returned by token and registration endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

/// PKCE verifier and its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub code_verifier: String,
    pub code_challenge: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_url_rejects_script_schemes() {
        assert!(SafeUrl::parse("https://auth.example.com/authorize").is_ok());
        for bad in ["javascript:alert(1)", "data:text/html,hi", "vbscript:msgbox"] {
            let err = SafeUrl::parse(bad).unwrap_err();
            assert!(err.contains("cannot use javascript:, data:, or vbscript:"));
        }
        assert!(SafeUrl::parse("not a url").is_err());
    }

    #[test]
    fn test_authorization_server_metadata_decoding() {
        let metadata: AuthorizationServerMetadata = serde_json::from_value(json!({
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "https://auth.example.com/authorize",
            "token_endpoint": "https://auth.example.com/token",
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"],
            "unknown_extension": true
        }))
        .unwrap();
        assert!(metadata.supports_code_challenge_method("S256"));
        assert!(!metadata.supports_code_challenge_method("plain"));
        assert_eq!(metadata.authorization_endpoint.path(), "/authorize");

        let bad = serde_json::from_value::<AuthorizationServerMetadata>(json!({
            "issuer": "https://auth.example.com",
            "authorization_endpoint": "javascript:alert(1)",
            "token_endpoint": "https://auth.example.com/token",
            "response_types_supported": ["code"]
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_protected_resource_metadata_requires_resource() {
        let ok: ProtectedResourceMetadata = serde_json::from_value(json!({
            "resource": "https://resource.example.com",
            "authorization_servers": ["https://auth.example.com"]
        }))
        .unwrap();
        assert_eq!(ok.authorization_servers.len(), 1);

        assert!(serde_json::from_value::<ProtectedResourceMetadata>(json!({
            "authorization_servers": ["https://auth.example.com"]
        }))
        .is_err());
    }

    #[test]
    fn test_oauth_tokens_minimal() {
        let tokens: OAuthTokens =
            serde_json::from_str(r#"{"access_token": "abc", "token_type": "Bearer"}"#).unwrap();
        assert_eq!(tokens, OAuthTokens::bearer("abc"));
        let json = serde_json::to_string(&tokens).unwrap();
        assert!(!json.contains("refresh_token"));
    }

    #[test]
    fn test_client_information_full_flattens() {
        let full: OAuthClientInformationFull = serde_json::from_value(json!({
            "client_id": "abc",
            "client_secret": "shh",
            "redirect_uris": ["http://127.0.0.1:19876/callback"],
            "client_name": "mcplink"
        }))
        .unwrap();
        assert_eq!(full.information.client_id, "abc");
        assert_eq!(full.metadata.client_name.as_deref(), Some("mcplink"));
    }
}
