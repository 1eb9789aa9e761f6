//! Command handlers for the mcplink CLI.
//!
//! Every handler takes a [`Context`] holding the loaded configuration and
//! output mode.

pub mod auth;
pub mod discover;
pub mod logging;
pub mod prompts;
pub mod resources;
pub mod servers;
pub mod tools;

pub use auth::*;
pub use discover::*;
pub use logging::*;
pub use prompts::*;
pub use resources::*;
pub use servers::*;
pub use tools::*;

use crate::config::Config;
use crate::credentials::CredentialStore;
use anyhow::anyhow;
use mcplink_client::{
    InMemoryOAuthProvider, McpClient, McpClientConfig, McpError, OAuthClientProvider,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// State shared by all commands.
pub struct Context {
    pub config_path: PathBuf,
    pub config: Config,
    /// Print machine-readable JSON instead of tables.
    pub json: bool,
}

impl Context {
    /// Load the config from `config_path`, or the default location.
    pub async fn load(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => Config::default_path()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?,
        };
        let config = Config::load(&config_path).await?;
        Ok(Self {
            config_path,
            config,
            json,
        })
    }

    pub fn credentials(&self) -> CredentialStore {
        CredentialStore::for_config(&self.config_path)
    }

    /// OAuth provider for `name`, seeded with any stored credentials.
    pub async fn oauth_provider(&self, name: &str) -> anyhow::Result<InMemoryOAuthProvider> {
        let server = self.config.server(name)?;
        let provider = InMemoryOAuthProvider::new(name, &server.url, server.oauth_config());
        Ok(match self.credentials().load(name).await? {
            Some(state) => provider.with_state(state),
            None => provider,
        })
    }

    /// Connect to a configured server.
    pub async fn connect(&self, name: &str) -> anyhow::Result<Session> {
        let server = self.config.server(name)?;
        let provider = Arc::new(self.oauth_provider(name).await?);

        let mut client_config = McpClientConfig::default()
            .with_name(env!("CARGO_PKG_NAME"))
            .on_uncaught_error(|e| warn!(error = %e, "MCP connection error"));
        if let Some(secs) = server.timeout_secs {
            client_config = client_config.with_request_timeout(Duration::from_secs(secs));
        }

        let auth_provider: Arc<dyn OAuthClientProvider> = provider.clone();
        let client = McpClient::connect_with(&server.transport(), Some(auth_provider), client_config)
            .await
            .map_err(|e| match e {
                McpError::Unauthorized => anyhow!(
                    "Server '{name}' requires authorization. Run `mcplink auth {name}` first."
                ),
                e => anyhow::Error::new(e).context(format!("Failed to connect to '{name}'")),
            })?;

        Ok(Session {
            name: name.to_string(),
            client,
            provider,
            store: self.credentials(),
        })
    }

    /// Print `value` as pretty JSON.
    pub fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

/// A connected client plus the credentials it may have refreshed.
pub struct Session {
    name: String,
    pub client: McpClient,
    provider: Arc<InMemoryOAuthProvider>,
    store: CredentialStore,
}

impl Session {
    /// Close the connection and persist refreshed tokens.
    pub async fn finish(self) -> anyhow::Result<()> {
        if let Err(e) = self.client.close().await {
            warn!(error = %e, "Error closing connection");
        }
        let state = self.provider.export_state().await;
        if state.tokens.is_some() {
            self.store.save(&self.name, &state).await?;
        }
        Ok(())
    }
}

/// Parse a `--args` value into a JSON object.
pub fn parse_arguments(raw: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(anyhow!("Invalid --args: expected a JSON object")),
        Err(e) => Err(anyhow!("Invalid --args: {e}")),
    }
}

/// First line of `text`, cut to `max` characters.
pub fn summary(text: Option<&str>, max: usize) -> String {
    let line = text.and_then(|t| t.lines().next()).unwrap_or("");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert!(parse_arguments(None).unwrap().is_empty());
        let args = parse_arguments(Some(r#"{"path": "/tmp", "n": 2}"#)).unwrap();
        assert_eq!(args["path"], "/tmp");
        assert_eq!(args["n"], 2);

        let err = parse_arguments(Some("[1, 2]")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid --args: expected a JSON object");
        assert!(parse_arguments(Some("{oops"))
            .unwrap_err()
            .to_string()
            .starts_with("Invalid --args: "));
    }

    #[test]
    fn test_summary() {
        assert_eq!(summary(None, 10), "");
        assert_eq!(summary(Some("short\nsecond line"), 10), "short");
        assert_eq!(summary(Some("a rather long description"), 10), "a rathe...");
    }
}
