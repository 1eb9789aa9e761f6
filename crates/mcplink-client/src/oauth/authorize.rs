//! Authorization code flow with PKCE: authorization URL, token endpoint and
//! dynamic client registration.

use super::error::parse_error_response;
use super::types::{
    AuthorizationServerMetadata, OAuthClientInformation, OAuthClientInformationFull,
    OAuthClientMetadata, OAuthTokens, PkcePair,
};
use crate::error::{McpError, McpResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

const RESPONSE_TYPE: &str = "code";
const CODE_CHALLENGE_METHOD: &str = "S256";

/// Generate PKCE code verifier.
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Generate PKCE code challenge from verifier.
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a fresh verifier/challenge pair.
pub fn pkce_challenge() -> PkcePair {
    let code_verifier = generate_code_verifier();
    let code_challenge = generate_code_challenge(&code_verifier);
    PkcePair {
        code_verifier,
        code_challenge,
    }
}

/// Generate OAuth state parameter.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Where to send the user, plus the verifier to keep for the code exchange.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorization_url: Url,
    pub code_verifier: String,
}

/// Inputs for [`start_authorization`].
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationParams<'a> {
    pub authorization_server_url: &'a Url,
    pub metadata: Option<&'a AuthorizationServerMetadata>,
    pub client_information: &'a OAuthClientInformation,
    pub redirect_url: &'a Url,
    pub scope: Option<&'a str>,
    pub state: Option<&'a str>,
    pub resource: Option<&'a Url>,
}

/// Build the authorization URL for a PKCE authorization code flow.
///
/// With metadata, the server must support the `code` response type and the
/// `S256` challenge method. Without it, `/authorize` on the server is assumed.
pub fn start_authorization(params: AuthorizationParams<'_>) -> McpResult<AuthorizationRequest> {
    let mut authorization_url = match params.metadata {
        Some(metadata) => {
            if !metadata
                .response_types_supported
                .iter()
                .any(|t| t == RESPONSE_TYPE)
            {
                return Err(McpError::auth_failed(format!(
                    "Incompatible auth server: does not support response type {RESPONSE_TYPE}"
                )));
            }
            if !metadata.supports_code_challenge_method(CODE_CHALLENGE_METHOD) {
                return Err(McpError::auth_failed(format!(
                    "Incompatible auth server: does not support code challenge method {CODE_CHALLENGE_METHOD}"
                )));
            }
            metadata.authorization_endpoint.url().clone()
        }
        None => params.authorization_server_url.join("/authorize")?,
    };

    let pkce = pkce_challenge();
    {
        let mut query = authorization_url.query_pairs_mut();
        query
            .append_pair("response_type", RESPONSE_TYPE)
            .append_pair("client_id", &params.client_information.client_id)
            .append_pair("code_challenge", &pkce.code_challenge)
            .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD)
            .append_pair("redirect_uri", params.redirect_url.as_str());
        if let Some(state) = params.state {
            query.append_pair("state", state);
        }
        if let Some(scope) = params.scope {
            query.append_pair("scope", scope);
            if scope.contains("offline_access") {
                query.append_pair("prompt", "consent");
            }
        }
        if let Some(resource) = params.resource {
            query.append_pair("resource", resource.as_str());
        }
    }

    Ok(AuthorizationRequest {
        authorization_url,
        code_verifier: pkce.code_verifier,
    })
}

/// How the client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientAuthMethod {
    SecretBasic,
    SecretPost,
    None,
}

fn select_client_auth_method(
    client: &OAuthClientInformation,
    supported: &[String],
) -> ClientAuthMethod {
    let has_secret = client.client_secret.is_some();
    let supports = |m: &str| supported.iter().any(|s| s == m);

    if supported.is_empty() {
        return if has_secret {
            ClientAuthMethod::SecretPost
        } else {
            ClientAuthMethod::None
        };
    }
    if has_secret && supports("client_secret_basic") {
        return ClientAuthMethod::SecretBasic;
    }
    if has_secret && supports("client_secret_post") {
        return ClientAuthMethod::SecretPost;
    }
    if supports("none") {
        return ClientAuthMethod::None;
    }
    if has_secret {
        ClientAuthMethod::SecretPost
    } else {
        ClientAuthMethod::None
    }
}

/// Shared inputs for calls to the token endpoint.
#[derive(Debug, Clone, Copy)]
pub struct TokenEndpointContext<'a> {
    pub http: &'a reqwest::Client,
    pub authorization_server_url: &'a Url,
    pub metadata: Option<&'a AuthorizationServerMetadata>,
    pub client_information: &'a OAuthClientInformation,
    pub resource: Option<&'a Url>,
}

impl TokenEndpointContext<'_> {
    fn token_url(&self) -> McpResult<Url> {
        match self.metadata {
            Some(metadata) => Ok(metadata.token_endpoint.url().clone()),
            None => Ok(self.authorization_server_url.join("/token")?),
        }
    }

    fn check_grant_type(&self, grant_type: &str) -> McpResult<()> {
        let supported = self
            .metadata
            .and_then(|m| m.grant_types_supported.as_ref());
        match supported {
            Some(grants) if !grants.iter().any(|g| g == grant_type) => {
                Err(McpError::auth_failed(format!(
                    "Incompatible auth server: does not support grant type {grant_type}"
                )))
            }
            _ => Ok(()),
        }
    }

    async fn request_tokens(&self, mut params: BTreeMap<&str, String>) -> McpResult<OAuthTokens> {
        let url = self.token_url()?;
        let client = self.client_information;
        let supported = self
            .metadata
            .and_then(|m| m.token_endpoint_auth_methods_supported.as_deref())
            .unwrap_or_default();

        let mut request = self
            .http
            .post(url.clone())
            .header(reqwest::header::ACCEPT, "application/json");

        match select_client_auth_method(client, supported) {
            ClientAuthMethod::SecretBasic => {
                request = request.basic_auth(&client.client_id, client.client_secret.as_ref());
            }
            ClientAuthMethod::SecretPost => {
                params.insert("client_id", client.client_id.clone());
                if let Some(secret) = &client.client_secret {
                    params.insert("client_secret", secret.clone());
                }
            }
            ClientAuthMethod::None => {
                params.insert("client_id", client.client_id.clone());
            }
        }
        if let Some(resource) = self.resource {
            params.insert("resource", resource.to_string());
        }

        debug!(url = %url, grant_type = ?params.get("grant_type"), "Requesting tokens");
        let response = request.form(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(parse_error_response(Some(status.as_u16()), &body).into());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Exchange an authorization code for tokens.
pub async fn exchange_authorization(
    ctx: TokenEndpointContext<'_>,
    authorization_code: &str,
    code_verifier: &str,
    redirect_uri: &Url,
) -> McpResult<OAuthTokens> {
    let grant_type = "authorization_code";
    ctx.check_grant_type(grant_type)?;

    let params = BTreeMap::from([
        ("grant_type", grant_type.to_string()),
        ("code", authorization_code.to_string()),
        ("code_verifier", code_verifier.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
    ]);
    ctx.request_tokens(params).await
}

/// Trade a refresh token for fresh tokens.
///
/// When the server omits a new refresh token the old one is kept.
pub async fn refresh_authorization(
    ctx: TokenEndpointContext<'_>,
    refresh_token: &str,
) -> McpResult<OAuthTokens> {
    let grant_type = "refresh_token";
    ctx.check_grant_type(grant_type)?;

    let params = BTreeMap::from([
        ("grant_type", grant_type.to_string()),
        ("refresh_token", refresh_token.to_string()),
    ]);
    let mut tokens = ctx.request_tokens(params).await?;
    if tokens.refresh_token.is_none() {
        tokens.refresh_token = Some(refresh_token.to_string());
    }
    Ok(tokens)
}

/// Register a client dynamically (RFC 7591).
pub async fn register_client(
    http: &reqwest::Client,
    authorization_server_url: &Url,
    metadata: Option<&AuthorizationServerMetadata>,
    client_metadata: &OAuthClientMetadata,
) -> McpResult<OAuthClientInformationFull> {
    let url = match metadata {
        Some(metadata) => match &metadata.registration_endpoint {
            Some(endpoint) => endpoint.url().clone(),
            None => {
                return Err(McpError::auth_failed(
                    "Incompatible auth server: does not support dynamic client registration",
                ))
            }
        },
        None => authorization_server_url.join("/register")?,
    };

    let response = http.post(url).json(client_metadata).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(parse_error_response(Some(status.as_u16()), &body).into());
    }
    Ok(serde_json::from_str(&body)?)
}
