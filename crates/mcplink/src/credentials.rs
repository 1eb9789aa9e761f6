//! Per-server OAuth credential storage.
//!
//! Each server's [`OAuthState`] lives in `{dir}/{server}.json`, readable only
//! by the owner on Unix.

use anyhow::Context;
use mcplink_client::OAuthState;
use std::path::{Path, PathBuf};

/// File-backed credential store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store next to the config file, in its `auth/` directory.
    pub fn for_config(config_path: &Path) -> Self {
        let base = config_path.parent().unwrap_or(Path::new("."));
        Self::new(base.join("auth"))
    }

    /// File holding the credentials of `server`.
    pub fn path(&self, server: &str) -> PathBuf {
        let file_name: String = server
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }

    pub async fn load(&self, server: &str) -> anyhow::Result<Option<OAuthState>> {
        let path = self.path(server);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Invalid credentials file {}", path.display()))?;
        Ok(Some(state))
    }

    pub async fn save(&self, server: &str, state: &OAuthState) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.path(server);
        let content = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tracing::debug!(server, path = %path.display(), "Saved credentials");
        Ok(())
    }

    /// Delete stored credentials. Returns whether anything was removed.
    pub async fn remove(&self, server: &str) -> anyhow::Result<bool> {
        let path = self.path(server);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcplink_client::oauth::StoredTokens;

    fn state() -> OAuthState {
        OAuthState {
            server_url: Some("https://mcp.example.com/mcp".to_string()),
            tokens: Some(StoredTokens {
                access_token: "at".to_string(),
                refresh_token: Some("rt".to_string()),
                expires_at: Some(4_000_000_000),
                scope: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_path_sanitizes_name() {
        let store = CredentialStore::new("/tmp/auth");
        assert_eq!(store.path("docs"), PathBuf::from("/tmp/auth/docs.json"));
        assert_eq!(store.path("../x y"), PathBuf::from("/tmp/auth/___x_y.json"));
    }

    #[test]
    fn test_for_config() {
        let store = CredentialStore::for_config(Path::new("/home/u/.config/mcplink/config.json"));
        assert_eq!(
            store.path("a"),
            PathBuf::from("/home/u/.config/mcplink/auth/a.json")
        );
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("auth"));

        assert!(store.load("docs").await.unwrap().is_none());
        store.save("docs", &state()).await.unwrap();

        let loaded = store.load("docs").await.unwrap().unwrap();
        assert_eq!(loaded.server_url, state().server_url);
        assert_eq!(loaded.tokens.unwrap().access_token, "at");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path("docs"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(store.remove("docs").await.unwrap());
        assert!(!store.remove("docs").await.unwrap());
        assert!(store.load("docs").await.unwrap().is_none());
    }
}
