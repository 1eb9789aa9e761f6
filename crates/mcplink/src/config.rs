//! Configuration loading for mcplink.
//!
//! The config file is JSON with comments:
//!
//! ```jsonc
//! {
//!   "servers": {
//!     // Streamable HTTP server with a token from the environment
//!     "docs": {
//!       "type": "http",
//!       "url": "https://mcp.example.com/mcp",
//!       "headers": { "X-Api-Key": "{env:DOCS_API_KEY}" }
//!     },
//!     "legacy": { "type": "sse", "url": "http://localhost:8080/sse", "enabled": false }
//!   }
//! }
//! ```

use mcplink_client::{OAuthConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

static VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

/// Get the variable substitution regex, compiling it once on first use.
fn var_regex() -> &'static regex::Regex {
    VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\{(env|file):([^}]+)\}")
            .expect("Invalid regex pattern - this is a compile-time constant")
    })
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid JSON in {path}: {message}")]
    InvalidJson { path: String, message: String },

    #[error("Environment variable not found: {name}")]
    EnvVarNotFound { name: String },

    #[error("Referenced file not found: {path}")]
    FileRefNotFound { path: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// MCP servers by name.
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Transport a server speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    #[default]
    Http,
    Sse,
}

impl ServerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

/// A configured MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(rename = "type", default)]
    pub kind: ServerKind,

    pub url: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Per-request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
}

fn default_enabled() -> bool {
    true
}

/// OAuth client settings for a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_port: Option<u16>,
}

impl ServerConfig {
    /// Transport settings for the client library.
    pub fn transport(&self) -> TransportConfig {
        let mut config = match self.kind {
            ServerKind::Http => TransportConfig::http(&self.url),
            ServerKind::Sse => TransportConfig::sse(&self.url),
        };
        for (key, value) in &self.headers {
            config = config.with_header(key, value);
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(secs);
        }
        config
    }

    pub fn oauth_config(&self) -> OAuthConfig {
        let settings = self.oauth.clone().unwrap_or_default();
        OAuthConfig {
            client_id: settings.client_id,
            client_secret: settings.client_secret,
            scope: settings.scope,
            redirect_port: settings.redirect_port,
        }
    }
}

impl Config {
    /// Default config file: `~/.config/mcplink/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.json"))
    }

    /// Get the global config directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        // On Unix, prefer ~/.config/mcplink (common for CLI tools)
        #[cfg(unix)]
        {
            if let Some(home) = dirs::home_dir() {
                return Some(home.join(".config").join("mcplink"));
            }
        }

        dirs::config_dir().map(|p| p.join("mcplink"))
    }

    /// Load a config file. A missing file yields an empty configuration.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let content = Self::substitute_variables(&content, path)?;
        Self::parse_jsonc(&content, &path.display().to_string())
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> anyhow::Result<&ServerConfig> {
        let Some(server) = self.servers.get(name) else {
            return Err(anyhow::anyhow!("Server '{name}' not found in configuration"));
        };
        if !server.enabled {
            return Err(anyhow::anyhow!("Server '{name}' is disabled"));
        }
        Ok(server)
    }

    /// Parse JSONC (JSON with comments).
    fn parse_jsonc(content: &str, source: &str) -> Result<Self, ConfigError> {
        let stripped = strip_comments(content);

        serde_json::from_str(&stripped).map_err(|e| ConfigError::InvalidJson {
            path: source.to_string(),
            message: e.to_string(),
        })
    }

    /// Substitute variables in config content.
    ///
    /// Supports:
    /// - `{env:VAR_NAME}` - Environment variable
    /// - `{file:path}` - File contents (relative to config file)
    fn substitute_variables(content: &str, config_path: &Path) -> Result<String, ConfigError> {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        let mut result = content.to_string();

        for cap in var_regex().captures_iter(content) {
            let (Some(full_match), Some(kind), Some(value)) = (cap.get(0), cap.get(1), cap.get(2))
            else {
                continue;
            };

            let replacement = match kind.as_str() {
                "env" => std::env::var(value.as_str()).map_err(|_| ConfigError::EnvVarNotFound {
                    name: value.as_str().to_string(),
                })?,
                "file" => {
                    let file_path = config_dir.join(value.as_str());
                    std::fs::read_to_string(&file_path)
                        .map_err(|_| ConfigError::FileRefNotFound {
                            path: file_path.display().to_string(),
                        })?
                        .trim()
                        .to_string()
                }
                _ => continue,
            };

            result = result.replace(full_match.as_str(), &replacement);
        }

        Ok(result)
    }
}

/// Strip `//` and `/* */` comments outside string literals.
fn strip_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if in_string {
            match c {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            result.push(c);
            continue;
        }

        if c == '"' {
            in_string = true;
            result.push(c);
            continue;
        }

        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if c == '\n' {
                            result.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = ' ';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        // Keep line numbers stable for parse errors
                        if c == '\n' {
                            result.push('\n');
                        }
                        prev = c;
                    }
                    continue;
                }
                _ => {}
            }
        }

        result.push(c);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comments() {
        let input = r#"{
            // line comment
            "url": "http://host/a//b", /* block
            comment */ "x": "/* not a comment */"
        }"#;
        let stripped = strip_comments(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["url"], "http://host/a//b");
        assert_eq!(value["x"], "/* not a comment */");
        assert_eq!(stripped.lines().count(), input.lines().count());
    }

    #[test]
    fn test_strip_comments_escaped_quote() {
        let stripped = strip_comments(r#"{"a": "say \"hi\" // still text"} // gone"#);
        assert_eq!(stripped.trim_end(), r#"{"a": "say \"hi\" // still text"}"#);
    }

    #[test]
    fn test_parse_servers() {
        let config = Config::parse_jsonc(
            r#"{
                "servers": {
                    "docs": {
                        "type": "http",
                        "url": "https://mcp.example.com/mcp",
                        "headers": {"X-Key": "abc"},
                        "timeoutSecs": 5,
                        "oauth": {"clientId": "cid", "redirectPort": 4000}
                    },
                    // defaults to http
                    "plain": {"url": "http://localhost/mcp"},
                    "legacy": {"type": "sse", "url": "http://localhost/sse", "enabled": false}
                }
            }"#,
            "test",
        )
        .unwrap();

        assert_eq!(config.servers.len(), 3);

        let docs = &config.servers["docs"];
        let transport = docs.transport();
        assert!(matches!(transport, TransportConfig::Http(_)));
        assert_eq!(transport.endpoint().timeout_secs, 5);
        assert_eq!(transport.endpoint().headers["X-Key"], "abc");
        let oauth = docs.oauth_config();
        assert_eq!(oauth.client_id.as_deref(), Some("cid"));
        assert_eq!(oauth.redirect_port, Some(4000));

        assert_eq!(config.servers["plain"].kind, ServerKind::Http);
        assert!(config.servers["plain"].enabled);
        assert!(matches!(
            config.servers["legacy"].transport(),
            TransportConfig::Sse(_)
        ));
    }

    #[test]
    fn test_server_lookup() {
        let config = Config::parse_jsonc(
            r#"{"servers": {"off": {"url": "http://x", "enabled": false}}}"#,
            "test",
        )
        .unwrap();

        let err = config.server("missing").unwrap_err();
        assert!(err.to_string().contains("not found"));
        let err = config.server("off").unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn test_invalid_json() {
        let err = Config::parse_jsonc("{ not json", "bad.json").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJson { .. }));
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn test_substitute_env_and_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token.txt"), "secret\n").unwrap();
        std::env::set_var("MCPLINK_CONFIG_TEST_HOST", "example.org");

        let content = r#"{"url": "https://{env:MCPLINK_CONFIG_TEST_HOST}", "t": "{file:token.txt}"}"#;
        let result =
            Config::substitute_variables(content, &dir.path().join("config.json")).unwrap();
        assert_eq!(result, r#"{"url": "https://example.org", "t": "secret"}"#);
    }

    #[test]
    fn test_substitute_missing_env() {
        let err = Config::substitute_variables(
            r#"{"a": "{env:MCPLINK_CONFIG_TEST_MISSING}"}"#,
            Path::new("config.json"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound { name } if name == "MCPLINK_CONFIG_TEST_MISSING"));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).await.unwrap();
        assert!(config.servers.is_empty());
    }
}
