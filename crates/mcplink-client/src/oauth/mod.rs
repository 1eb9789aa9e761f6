//! OAuth 2.1 support for MCP servers.
//!
//! Discovery of protected resource and authorization server metadata, the
//! PKCE authorization code flow, token refresh, dynamic client registration
//! and typed OAuth errors.

mod authorize;
mod discovery;
mod error;
mod provider;
mod resource;
mod types;

pub use authorize::{
    exchange_authorization, generate_code_challenge, generate_code_verifier, generate_state,
    pkce_challenge, refresh_authorization, register_client, start_authorization,
    AuthorizationParams, AuthorizationRequest, TokenEndpointContext,
};
pub use discovery::{
    build_discovery_urls, discover_authorization_server_metadata,
    discover_protected_resource_metadata, extract_resource_metadata_url, DiscoveryKind,
};
pub use error::{parse_error_response, OAuthError, OAuthErrorKind};
pub use provider::{
    auth, select_resource_url, AuthOptions, AuthResult, InMemoryOAuthProvider,
    InvalidationScope, OAuthClientProvider, OAuthConfig, OAuthState, RedirectHandler,
    StoredTokens, OAUTH_CALLBACK_PATH, OAUTH_CALLBACK_PORT,
};
pub use resource::{check_resource_allowed, resource_url_from_server_url};
pub use types::{
    AuthorizationServerMetadata, OAuthClientInformation, OAuthClientInformationFull,
    OAuthClientMetadata, OAuthErrorResponse, OAuthTokens, PkcePair, ProtectedResourceMetadata,
    SafeUrl,
};
