//! OAuth client provider contract and the `auth()` orchestration.
//!
//! A provider owns credential storage and user interaction; [`auth`] walks
//! discovery, resource selection, registration, code exchange, refresh and
//! finally redirect, persisting everything through the provider.

use super::authorize::{
    exchange_authorization, generate_state, refresh_authorization, register_client,
    start_authorization, AuthorizationParams, TokenEndpointContext,
};
use super::discovery::{discover_authorization_server_metadata, discover_protected_resource_metadata};
use super::error::OAuthErrorKind;
use super::resource::{check_resource_allowed, resource_url_from_server_url};
use super::types::{
    OAuthClientInformation, OAuthClientMetadata, OAuthTokens, ProtectedResourceMetadata, SafeUrl,
};
use crate::error::{McpError, McpResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// OAuth callback port.
pub const OAUTH_CALLBACK_PORT: u16 = 19876;

/// OAuth callback path.
pub const OAUTH_CALLBACK_PATH: &str = "/oauth/callback";

/// Seconds before expiry at which tokens are treated as stale.
const EXPIRY_MARGIN_SECS: u64 = 60;

/// Outcome of [`auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Usable tokens are stored.
    Authorized,
    /// The user was sent to the authorization endpoint; call [`auth`] again
    /// with the returned code.
    Redirect,
}

/// Which stored credentials to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    All,
    Client,
    Tokens,
    Verifier,
}

/// Storage and user interaction for the OAuth flow.
#[async_trait]
pub trait OAuthClientProvider: Send + Sync {
    /// Current tokens, if any.
    async fn tokens(&self) -> McpResult<Option<OAuthTokens>>;

    async fn save_tokens(&self, tokens: OAuthTokens) -> McpResult<()>;

    /// Send the user to the authorization URL.
    async fn redirect_to_authorization(&self, authorization_url: Url) -> McpResult<()>;

    async fn save_code_verifier(&self, code_verifier: String) -> McpResult<()>;

    async fn code_verifier(&self) -> McpResult<String>;

    async fn client_information(&self) -> McpResult<Option<OAuthClientInformation>>;

    /// Persist credentials obtained through dynamic registration.
    async fn save_client_information(&self, information: OAuthClientInformation)
        -> McpResult<()>;

    /// Metadata sent when registering dynamically.
    fn client_metadata(&self) -> OAuthClientMetadata;

    fn redirect_url(&self) -> Url;

    /// `state` parameter for the authorization request.
    async fn state(&self) -> McpResult<Option<String>> {
        Ok(None)
    }

    /// Drop credentials the server reported as invalid.
    async fn invalidate_credentials(&self, _scope: InvalidationScope) -> McpResult<()> {
        Ok(())
    }
}

/// Options for [`auth`].
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// Code returned to the redirect URL, to exchange for tokens.
    pub authorization_code: Option<String>,
    /// Scope to request; defaults to the client metadata's scope.
    pub scope: Option<String>,
    /// Metadata URL from a `WWW-Authenticate` challenge.
    pub resource_metadata_url: Option<Url>,
}

/// Run the authorization flow for `server_url`.
///
/// Retries once after invalidating credentials when the authorization server
/// rejects the client (all credentials) or the grant (tokens only).
pub async fn auth(
    provider: &dyn OAuthClientProvider,
    http: &reqwest::Client,
    server_url: &Url,
    options: &AuthOptions,
) -> McpResult<AuthResult> {
    let scope = match auth_once(provider, http, server_url, options).await {
        Err(McpError::OAuth(e))
            if matches!(
                e.kind,
                OAuthErrorKind::InvalidClient | OAuthErrorKind::UnauthorizedClient
            ) =>
        {
            InvalidationScope::All
        }
        Err(McpError::OAuth(e)) if e.kind == OAuthErrorKind::InvalidGrant => {
            InvalidationScope::Tokens
        }
        result => return result,
    };

    warn!(?scope, "Authorization server rejected stored credentials, retrying");
    provider.invalidate_credentials(scope).await?;
    auth_once(provider, http, server_url, options).await
}

/// Resource indicator to send with authorization requests.
///
/// Without resource metadata none is sent. Otherwise the advertised resource
/// must cover the server URL.
pub fn select_resource_url(
    server_url: &Url,
    resource_metadata: Option<&ProtectedResourceMetadata>,
) -> McpResult<Option<Url>> {
    let Some(metadata) = resource_metadata else {
        return Ok(None);
    };
    let default_resource = resource_url_from_server_url(server_url);
    if !check_resource_allowed(&default_resource, &metadata.resource) {
        return Err(McpError::auth_failed(format!(
            "Protected resource {} does not match expected {default_resource} (or origin)",
            metadata.resource
        )));
    }
    Ok(Some(metadata.resource.clone()))
}

async fn auth_once(
    provider: &dyn OAuthClientProvider,
    http: &reqwest::Client,
    server_url: &Url,
    options: &AuthOptions,
) -> McpResult<AuthResult> {
    let resource_metadata = match discover_protected_resource_metadata(
        http,
        server_url,
        None,
        options.resource_metadata_url.as_ref(),
    )
    .await
    {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            debug!(error = %e, "No protected resource metadata, using server as authorization server");
            None
        }
    };

    let authorization_server_url = resource_metadata
        .as_ref()
        .and_then(|m| m.authorization_servers.first())
        .map(|u| u.url().clone())
        .unwrap_or_else(|| server_url.clone());

    let resource = select_resource_url(server_url, resource_metadata.as_ref())?;
    let metadata = discover_authorization_server_metadata(http, &authorization_server_url, None)
        .await?;

    let client_information = match provider.client_information().await? {
        Some(info) => info,
        None => {
            if options.authorization_code.is_some() {
                return Err(McpError::auth_failed(
                    "Existing OAuth client information is required when exchanging an authorization code",
                ));
            }
            let full = register_client(
                http,
                &authorization_server_url,
                metadata.as_ref(),
                &provider.client_metadata(),
            )
            .await?;
            info!(client_id = %full.information.client_id, "Registered OAuth client");
            provider
                .save_client_information(full.information.clone())
                .await?;
            full.information
        }
    };

    let ctx = TokenEndpointContext {
        http,
        authorization_server_url: &authorization_server_url,
        metadata: metadata.as_ref(),
        client_information: &client_information,
        resource: resource.as_ref(),
    };

    if let Some(code) = &options.authorization_code {
        let verifier = provider.code_verifier().await?;
        let tokens =
            exchange_authorization(ctx, code, &verifier, &provider.redirect_url()).await?;
        provider.save_tokens(tokens).await?;
        return Ok(AuthResult::Authorized);
    }

    let refresh_token = provider
        .tokens()
        .await?
        .and_then(|tokens| tokens.refresh_token);
    if let Some(refresh_token) = refresh_token {
        match refresh_authorization(ctx, &refresh_token).await {
            Ok(tokens) => {
                provider.save_tokens(tokens).await?;
                return Ok(AuthResult::Authorized);
            }
            Err(McpError::OAuth(e)) if e.kind != OAuthErrorKind::ServerError => {
                return Err(McpError::OAuth(e));
            }
            Err(e) => {
                warn!(error = %e, "Could not refresh OAuth tokens, starting interactive authorization");
            }
        }
    }

    let state = provider.state().await?;
    let client_metadata = provider.client_metadata();
    let redirect_url = provider.redirect_url();
    let authorization = start_authorization(AuthorizationParams {
        authorization_server_url: &authorization_server_url,
        metadata: metadata.as_ref(),
        client_information: &client_information,
        redirect_url: &redirect_url,
        scope: options.scope.as_deref().or(client_metadata.scope.as_deref()),
        state: state.as_deref(),
        resource: resource.as_ref(),
    })?;

    provider
        .save_code_verifier(authorization.code_verifier)
        .await?;
    provider
        .redirect_to_authorization(authorization.authorization_url)
        .await?;
    Ok(AuthResult::Redirect)
}

/// OAuth configuration.
#[derive(Debug, Clone, Default)]
pub struct OAuthConfig {
    /// Pre-registered client ID (optional).
    pub client_id: Option<String>,
    /// Pre-registered client secret (optional).
    pub client_secret: Option<String>,
    /// Requested scopes.
    pub scope: Option<String>,
    /// Callback port; defaults to [`OAUTH_CALLBACK_PORT`].
    pub redirect_port: Option<u16>,
}

/// Tokens stored with expiration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp when token expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// OAuth state stored for an MCP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthState {
    /// Server URL this auth is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Dynamic client registration info.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<OAuthClientInformation>,
    /// OAuth tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<StoredTokens>,
    /// PKCE code verifier (temporary, during auth flow).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    /// OAuth state parameter (temporary, during auth flow).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_state: Option<String>,
}

/// Callback invoked with the authorization URL.
pub type RedirectHandler = Arc<dyn Fn(&Url) + Send + Sync>;

static LOOPBACK_URL: OnceLock<Url> = OnceLock::new();

fn loopback_url() -> &'static Url {
    LOOPBACK_URL.get_or_init(|| {
        Url::parse("http://127.0.0.1/").expect("Invalid URL - this is a compile-time constant")
    })
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Provider that keeps credentials in memory.
///
/// The whole state can be exported and restored, so callers can persist it
/// wherever they like between runs.
pub struct InMemoryOAuthProvider {
    /// Server name, for logging.
    name: String,
    server_url: String,
    config: OAuthConfig,
    state: Arc<RwLock<OAuthState>>,
    authorization_url: Arc<RwLock<Option<Url>>>,
    on_redirect: Option<RedirectHandler>,
}

impl InMemoryOAuthProvider {
    pub fn new(name: impl Into<String>, server_url: impl Into<String>, config: OAuthConfig) -> Self {
        Self {
            name: name.into(),
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(OAuthState::default())),
            authorization_url: Arc::new(RwLock::new(None)),
            on_redirect: None,
        }
    }

    /// Start from previously exported state.
    pub fn with_state(self, state: OAuthState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            ..self
        }
    }

    /// Run `f` whenever the flow redirects to the authorization server.
    pub fn on_redirect(mut self, f: impl Fn(&Url) + Send + Sync + 'static) -> Self {
        self.on_redirect = Some(Arc::new(f));
        self
    }

    /// Snapshot of the stored state.
    pub async fn export_state(&self) -> OAuthState {
        self.state.read().await.clone()
    }

    /// Most recent authorization URL the flow redirected to.
    pub async fn authorization_url(&self) -> Option<Url> {
        self.authorization_url.read().await.clone()
    }

    /// `state` value issued for the pending authorization, if any.
    pub async fn pending_state(&self) -> Option<String> {
        self.state.read().await.oauth_state.clone()
    }

    /// Check if tokens are valid (not expired).
    pub async fn has_valid_tokens(&self) -> bool {
        let state = self.state.read().await;
        match &state.tokens {
            Some(tokens) => match tokens.expires_at {
                Some(expires_at) => expires_at > now_secs() + EXPIRY_MARGIN_SECS,
                None => true,
            },
            None => false,
        }
    }

    /// Clear temporary auth state after completion.
    pub async fn clear_temp_state(&self) {
        let mut state = self.state.write().await;
        state.code_verifier = None;
        state.oauth_state = None;
    }

    fn matches_server(&self, state: &OAuthState) -> bool {
        state.server_url.as_deref() == Some(self.server_url.as_str())
    }
}

#[async_trait]
impl OAuthClientProvider for InMemoryOAuthProvider {
    async fn tokens(&self) -> McpResult<Option<OAuthTokens>> {
        let state = self.state.read().await;
        if !self.matches_server(&state) {
            return Ok(None);
        }

        let now = now_secs();
        Ok(state.tokens.as_ref().map(|t| OAuthTokens {
            access_token: t.access_token.clone(),
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_in: t.expires_at.map(|exp| exp.saturating_sub(now)),
            scope: t.scope.clone(),
            refresh_token: t.refresh_token.clone(),
        }))
    }

    async fn save_tokens(&self, tokens: OAuthTokens) -> McpResult<()> {
        let mut state = self.state.write().await;
        state.server_url = Some(self.server_url.clone());
        state.tokens = Some(StoredTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_in.map(|exp| now_secs() + exp),
            scope: tokens.scope,
        });
        info!(mcp = %self.name, "Saved OAuth tokens");
        Ok(())
    }

    async fn redirect_to_authorization(&self, authorization_url: Url) -> McpResult<()> {
        info!(mcp = %self.name, url = %authorization_url, "Authorization required");
        if let Some(f) = &self.on_redirect {
            f(&authorization_url);
        }
        *self.authorization_url.write().await = Some(authorization_url);
        Ok(())
    }

    async fn save_code_verifier(&self, code_verifier: String) -> McpResult<()> {
        self.state.write().await.code_verifier = Some(code_verifier);
        Ok(())
    }

    async fn code_verifier(&self) -> McpResult<String> {
        self.state
            .read()
            .await
            .code_verifier
            .clone()
            .ok_or_else(|| McpError::auth_failed(format!("No code verifier saved for {}", self.name)))
    }

    async fn client_information(&self) -> McpResult<Option<OAuthClientInformation>> {
        if let Some(client_id) = &self.config.client_id {
            return Ok(Some(OAuthClientInformation {
                client_id: client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                client_id_issued_at: None,
                client_secret_expires_at: None,
            }));
        }

        let state = self.state.read().await;
        if !self.matches_server(&state) {
            return Ok(None);
        }
        match &state.client_info {
            // Zero means the secret never expires.
            Some(info)
                if info
                    .client_secret_expires_at
                    .is_some_and(|at| at != 0 && at < now_secs()) =>
            {
                info!(mcp = %self.name, "Client secret expired");
                Ok(None)
            }
            other => Ok(other.clone()),
        }
    }

    async fn save_client_information(
        &self,
        information: OAuthClientInformation,
    ) -> McpResult<()> {
        let mut state = self.state.write().await;
        state.server_url = Some(self.server_url.clone());
        state.client_info = Some(information);
        info!(mcp = %self.name, "Saved dynamically registered client");
        Ok(())
    }

    fn client_metadata(&self) -> OAuthClientMetadata {
        let redirect_uris = SafeUrl::try_from(self.redirect_url())
            .map(|u| vec![u])
            .unwrap_or_default();
        let auth_method = if self.config.client_secret.is_some() {
            "client_secret_post"
        } else {
            "none"
        };
        OAuthClientMetadata {
            redirect_uris,
            token_endpoint_auth_method: Some(auth_method.to_string()),
            grant_types: Some(vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ]),
            response_types: Some(vec!["code".to_string()]),
            client_name: Some("mcplink".to_string()),
            client_uri: None,
            scope: self.config.scope.clone(),
            software_id: None,
            software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    fn redirect_url(&self) -> Url {
        let port = self.config.redirect_port.unwrap_or(OAUTH_CALLBACK_PORT);
        let mut url = loopback_url().clone();
        // Setting a port only fails for host-less URLs.
        let _ = url.set_port(Some(port));
        url.set_path(OAUTH_CALLBACK_PATH);
        url
    }

    async fn state(&self) -> McpResult<Option<String>> {
        let value = generate_state();
        self.state.write().await.oauth_state = Some(value.clone());
        Ok(Some(value))
    }

    async fn invalidate_credentials(&self, scope: InvalidationScope) -> McpResult<()> {
        let mut state = self.state.write().await;
        match scope {
            InvalidationScope::All => *state = OAuthState::default(),
            InvalidationScope::Client => state.client_info = None,
            InvalidationScope::Tokens => state.tokens = None,
            InvalidationScope::Verifier => state.code_verifier = None,
        }
        debug!(mcp = %self.name, ?scope, "Invalidated credentials");
        Ok(())
    }
}
