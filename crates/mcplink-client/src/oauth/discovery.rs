//! Protected resource and authorization server metadata discovery.

use super::types::{AuthorizationServerMetadata, ProtectedResourceMetadata};
use crate::error::{McpError, McpResult};
use crate::protocol::LATEST_PROTOCOL_VERSION;
use reqwest::StatusCode;
use std::sync::OnceLock;
use tracing::debug;
use url::Url;

const PROTECTED_RESOURCE_WELL_KNOWN: &str = "/.well-known/oauth-protected-resource";
const OAUTH_SERVER_WELL_KNOWN: &str = "/.well-known/oauth-authorization-server";
const OPENID_WELL_KNOWN: &str = "/.well-known/openid-configuration";

static RESOURCE_METADATA_REGEX: OnceLock<regex::Regex> = OnceLock::new();

fn resource_metadata_regex() -> &'static regex::Regex {
    RESOURCE_METADATA_REGEX.get_or_init(|| {
        regex::Regex::new(r#"resource_metadata="([^"]*)""#)
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// Which kind of document a discovery candidate points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// RFC 8414 authorization server metadata.
    OAuth,
    /// OpenID Connect provider configuration.
    Oidc,
}

impl DiscoveryKind {
    fn label(self) -> &'static str {
        match self {
            Self::OAuth => "OAuth",
            Self::Oidc => "OpenID provider",
        }
    }
}

/// Pull the `resource_metadata` URL out of a `WWW-Authenticate: Bearer ...` challenge.
pub fn extract_resource_metadata_url(www_authenticate: &str) -> Option<Url> {
    let (scheme, params) = www_authenticate.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let captures = resource_metadata_regex().captures(params)?;
    Url::parse(captures.get(1)?.as_str()).ok()
}

/// GET a metadata document.
///
/// When the request fails at the transport level with the protocol version
/// header attached, it is retried once without it. Returns `None` when no
/// response could be obtained at all.
async fn fetch_with_retry(
    http: &reqwest::Client,
    url: &Url,
    protocol_version: Option<&str>,
) -> Option<(StatusCode, String)> {
    let mut version = protocol_version;
    loop {
        let mut request = http.get(url.clone());
        if let Some(version) = version {
            request = request.header("MCP-Protocol-Version", version);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                debug!(url = %url, status = %status, "Fetched metadata");
                return Some((status, body));
            }
            Err(e) if version.is_some() => {
                debug!(url = %url, error = %e, "Metadata fetch failed, retrying without version header");
                version = None;
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Metadata fetch failed");
                return None;
            }
        }
    }
}

fn trimmed_path(url: &Url) -> &str {
    url.path().trim_end_matches('/')
}

fn with_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Fetch the protected resource metadata for an MCP server.
///
/// Tries `{origin}/.well-known/oauth-protected-resource{path}` first. If that
/// yields a 4xx (or nothing) and the server URL has a non-root path, the root
/// well-known URL is tried instead. An explicit `resource_metadata_url`
/// disables the fallback.
pub async fn discover_protected_resource_metadata(
    http: &reqwest::Client,
    server_url: &Url,
    protocol_version: Option<&str>,
    resource_metadata_url: Option<&Url>,
) -> McpResult<ProtectedResourceMetadata> {
    let version = protocol_version.unwrap_or(LATEST_PROTOCOL_VERSION);

    let url = match resource_metadata_url {
        Some(url) => url.clone(),
        None => {
            let mut url = server_url.clone();
            url.set_path(&format!(
                "{PROTECTED_RESOURCE_WELL_KNOWN}{}",
                trimmed_path(server_url)
            ));
            url.set_fragment(None);
            url
        }
    };

    let mut response = fetch_with_retry(http, &url, Some(version)).await;

    let may_fall_back = resource_metadata_url.is_none() && server_url.path() != "/";
    let should_fall_back = match &response {
        None => true,
        Some((status, _)) => status.is_client_error(),
    };
    if may_fall_back && should_fall_back {
        let root = with_path(server_url, PROTECTED_RESOURCE_WELL_KNOWN);
        debug!(url = %root, "Falling back to root protected resource metadata");
        response = fetch_with_retry(http, &root, Some(version)).await;
    }

    let (status, body) = match response {
        Some((status, _)) if status == StatusCode::NOT_FOUND => {
            return Err(not_implemented());
        }
        Some(response) => response,
        None => return Err(not_implemented()),
    };

    if !status.is_success() {
        return Err(McpError::auth_failed(format!(
            "HTTP {} trying to load well-known OAuth protected resource metadata.",
            status.as_u16()
        )));
    }

    Ok(serde_json::from_str(&body)?)
}

fn not_implemented() -> McpError {
    McpError::auth_failed(
        "Resource server does not implement OAuth 2.0 Protected Resource Metadata.",
    )
}

/// Candidate metadata URLs for an authorization server, in the order to try them.
pub fn build_discovery_urls(authorization_server_url: &Url) -> Vec<(Url, DiscoveryKind)> {
    let path = trimmed_path(authorization_server_url);

    if path.is_empty() {
        return vec![
            (
                with_path(authorization_server_url, OAUTH_SERVER_WELL_KNOWN),
                DiscoveryKind::OAuth,
            ),
            (
                with_path(authorization_server_url, OPENID_WELL_KNOWN),
                DiscoveryKind::Oidc,
            ),
        ];
    }

    vec![
        (
            with_path(
                authorization_server_url,
                &format!("{OAUTH_SERVER_WELL_KNOWN}{path}"),
            ),
            DiscoveryKind::OAuth,
        ),
        (
            with_path(authorization_server_url, OAUTH_SERVER_WELL_KNOWN),
            DiscoveryKind::OAuth,
        ),
        (
            with_path(authorization_server_url, &format!("{OPENID_WELL_KNOWN}{path}")),
            DiscoveryKind::Oidc,
        ),
        (
            with_path(authorization_server_url, &format!("{path}{OPENID_WELL_KNOWN}")),
            DiscoveryKind::Oidc,
        ),
    ]
}

/// Walk [`build_discovery_urls`] and return the first metadata document found.
///
/// 4xx responses and unreachable candidates are skipped; any other failure
/// stops the walk. OpenID documents must advertise `S256`.
pub async fn discover_authorization_server_metadata(
    http: &reqwest::Client,
    authorization_server_url: &Url,
    protocol_version: Option<&str>,
) -> McpResult<Option<AuthorizationServerMetadata>> {
    let version = protocol_version.unwrap_or(LATEST_PROTOCOL_VERSION);

    for (url, kind) in build_discovery_urls(authorization_server_url) {
        let Some((status, body)) = fetch_with_retry(http, &url, Some(version)).await else {
            continue;
        };

        if !status.is_success() {
            if status.is_client_error() {
                continue;
            }
            return Err(McpError::auth_failed(format!(
                "HTTP {} trying to load {} metadata from {url}",
                status.as_u16(),
                kind.label()
            )));
        }

        let metadata: AuthorizationServerMetadata = serde_json::from_str(&body)?;
        if kind == DiscoveryKind::Oidc && !metadata.supports_code_challenge_method("S256") {
            return Err(McpError::auth_failed(format!(
                "Incompatible OIDC provider at {url}: does not support S256 code challenge method required by MCP specification"
            )));
        }
        return Ok(Some(metadata));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resource_doc(server: &MockServer) -> serde_json::Value {
        json!({
            "resource": format!("{}/mcp", server.uri()),
            "authorization_servers": [server.uri()]
        })
    }

    fn auth_server_doc(server: &MockServer) -> serde_json::Value {
        json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "response_types_supported": ["code"],
            "code_challenge_methods_supported": ["S256"]
        })
    }

    #[test]
    fn test_extract_resource_metadata_url() {
        let url = extract_resource_metadata_url(
            r#"Bearer error="invalid_token", resource_metadata="https://example.com/.well-known/oauth-protected-resource""#,
        )
        .unwrap();
        assert_eq!(url.path(), "/.well-known/oauth-protected-resource");

        assert!(extract_resource_metadata_url(r#"Basic resource_metadata="https://x.com""#).is_none());
        assert!(extract_resource_metadata_url("Bearer").is_none());
        assert!(extract_resource_metadata_url(r#"Bearer realm="x""#).is_none());
    }

    #[test]
    fn test_build_discovery_urls_root() {
        let urls = build_discovery_urls(&Url::parse("https://auth.example.com").unwrap());
        let rendered: Vec<_> = urls.iter().map(|(u, k)| (u.as_str(), *k)).collect();
        assert_eq!(
            rendered,
            vec![
                (
                    "https://auth.example.com/.well-known/oauth-authorization-server",
                    DiscoveryKind::OAuth
                ),
                (
                    "https://auth.example.com/.well-known/openid-configuration",
                    DiscoveryKind::Oidc
                ),
            ]
        );
    }

    #[test]
    fn test_build_discovery_urls_with_path() {
        let urls = build_discovery_urls(&Url::parse("https://auth.example.com/tenant1/").unwrap());
        let rendered: Vec<_> = urls.iter().map(|(u, k)| (u.as_str(), *k)).collect();
        assert_eq!(
            rendered,
            vec![
                (
                    "https://auth.example.com/.well-known/oauth-authorization-server/tenant1",
                    DiscoveryKind::OAuth
                ),
                (
                    "https://auth.example.com/.well-known/oauth-authorization-server",
                    DiscoveryKind::OAuth
                ),
                (
                    "https://auth.example.com/.well-known/openid-configuration/tenant1",
                    DiscoveryKind::Oidc
                ),
                (
                    "https://auth.example.com/tenant1/.well-known/openid-configuration",
                    DiscoveryKind::Oidc
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_protected_resource_path_aware_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource/mcp"))
            .and(header("MCP-Protocol-Version", LATEST_PROTOCOL_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(resource_doc(&server)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let server_url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let metadata = discover_protected_resource_metadata(&http, &server_url, None, None)
            .await
            .unwrap();
        assert_eq!(metadata.authorization_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_protected_resource_falls_back_to_root_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource/mcp"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resource_doc(&server)))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let server_url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        assert!(discover_protected_resource_metadata(&http, &server_url, None, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_protected_resource_500_does_not_fall_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource/mcp"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resource_doc(&server)))
            .expect(0)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let server_url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let err = discover_protected_resource_metadata(&http, &server_url, None, None)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("HTTP 500 trying to load well-known OAuth protected resource metadata."));
    }

    #[tokio::test]
    async fn test_protected_resource_404_at_root_is_not_implemented() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let server_url = Url::parse(&server.uri()).unwrap();
        let err = discover_protected_resource_metadata(&http, &server_url, None, None)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Resource server does not implement OAuth 2.0 Protected Resource Metadata."));
    }

    #[tokio::test]
    async fn test_protected_resource_explicit_url_skips_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/custom/metadata"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resource_doc(&server)))
            .expect(0)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let server_url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let metadata_url = Url::parse(&format!("{}/custom/metadata", server.uri())).unwrap();
        assert!(
            discover_protected_resource_metadata(&http, &server_url, None, Some(&metadata_url))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_not_implemented() {
        let http = reqwest::Client::new();
        let server_url = Url::parse("http://127.0.0.1:1/mcp").unwrap();
        let err = discover_protected_resource_metadata(&http, &server_url, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not implement"));
    }

    /// Matches requests that carry no protocol version header.
    struct WithoutVersionHeader;

    impl wiremock::Match for WithoutVersionHeader {
        fn matches(&self, request: &wiremock::Request) -> bool {
            !request.headers.contains_key("mcp-protocol-version")
        }
    }

    #[tokio::test]
    async fn test_transport_failure_retries_without_version_header() {
        let server = MockServer::start().await;
        // Never answered in time: the client gives up with a transport error
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource/mcp"))
            .and(header_exists("MCP-Protocol-Version"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-protected-resource/mcp"))
            .and(WithoutVersionHeader)
            .respond_with(ResponseTemplate::new(200).set_body_json(resource_doc(&server)))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let server_url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let metadata = discover_protected_resource_metadata(&http, &server_url, None, None)
            .await
            .unwrap();
        assert_eq!(
            metadata.resource.as_str(),
            format!("{}/mcp", server.uri())
        );

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0]
                .headers
                .get("mcp-protocol-version")
                .and_then(|v| v.to_str().ok()),
            Some(LATEST_PROTOCOL_VERSION)
        );
        assert!(!requests[1].headers.contains_key("mcp-protocol-version"));
    }

    #[tokio::test]
    async fn test_authorization_server_skips_4xx_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server/tenant"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_server_doc(&server)))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let url = Url::parse(&format!("{}/tenant", server.uri())).unwrap();
        let metadata = discover_authorization_server_metadata(&http, &url, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.token_endpoint.path(), "/token");
    }

    #[tokio::test]
    async fn test_authorization_server_5xx_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let url = Url::parse(&server.uri()).unwrap();
        let err = discover_authorization_server_metadata(&http, &url, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTTP 503 trying to load OAuth metadata from"));
    }

    #[tokio::test]
    async fn test_oidc_without_s256_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/oauth-authorization-server"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let mut doc = auth_server_doc(&server);
        doc["code_challenge_methods_supported"] = json!(["plain"]);
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(doc))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let url = Url::parse(&server.uri()).unwrap();
        let err = discover_authorization_server_metadata(&http, &url, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Incompatible OIDC provider"));
    }

    #[tokio::test]
    async fn test_authorization_server_none_found() {
        let server = MockServer::start().await;
        let http = reqwest::Client::new();
        let url = Url::parse(&server.uri()).unwrap();
        let result = discover_authorization_server_metadata(&http, &url, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
