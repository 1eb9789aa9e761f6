//! Loopback listener for the OAuth redirect.
//!
//! Accepts browser requests on `127.0.0.1` until one hits the callback path
//! with the expected `state`, then hands back the authorization code.

use anyhow::{anyhow, Context};
use mcplink_client::OAUTH_CALLBACK_PATH;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// How long to wait for the user to finish in the browser.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head><title>mcplink - Authorization Successful</title></head>
<body style="font-family: system-ui, sans-serif; text-align: center; padding: 4rem;">
  <h1>Authorization Successful</h1>
  <p>You can close this window and return to the terminal.</p>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#;

fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>mcplink - Authorization Failed</title></head>
<body style="font-family: system-ui, sans-serif; text-align: center; padding: 4rem;">
  <h1>Authorization Failed</h1>
  <pre>{}</pre>
</body>
</html>"#,
        html_escape(error)
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Error",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// What a single browser request amounted to.
enum Callback {
    /// Not the callback path; keep listening.
    Ignored,
    Code(String),
    Failed(String),
}

/// Listener bound before the browser is opened.
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    /// Bind `127.0.0.1:{port}`. Port 0 picks a free port.
    pub async fn bind(port: u16) -> anyhow::Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind OAuth callback listener on {addr}"))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the redirect carrying `expected_state` and return its code.
    pub async fn wait_for_code(
        &self,
        expected_state: &str,
        timeout: Duration,
    ) -> anyhow::Result<String> {
        tokio::time::timeout(timeout, self.accept_loop(expected_state))
            .await
            .map_err(|_| anyhow!("OAuth callback timeout - authorization took too long"))?
    }

    async fn accept_loop(&self, expected_state: &str) -> anyhow::Result<String> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "OAuth callback connection");
            match handle_connection(stream, expected_state).await {
                Ok(Callback::Ignored) => continue,
                Ok(Callback::Code(code)) => return Ok(code),
                Ok(Callback::Failed(message)) => return Err(anyhow!(message)),
                Err(e) => warn!(error = %e, "Error handling OAuth callback"),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    expected_state: &str,
) -> anyhow::Result<Callback> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1));
    let Some(target) = target else {
        respond(&mut stream, 400, "text/plain", "Bad Request").await;
        return Ok(Callback::Ignored);
    };

    let Ok(parsed) = url::Url::parse(&format!("http://127.0.0.1{target}")) else {
        respond(&mut stream, 400, "text/plain", "Invalid URL").await;
        return Ok(Callback::Ignored);
    };

    if parsed.path() != OAUTH_CALLBACK_PATH {
        respond(&mut stream, 404, "text/plain", "Not Found").await;
        return Ok(Callback::Ignored);
    }

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let outcome = classify(&params, expected_state);
    match &outcome {
        Callback::Code(_) => respond(&mut stream, 200, "text/html", HTML_SUCCESS).await,
        Callback::Failed(message) => {
            respond(&mut stream, 400, "text/html", &html_error(message)).await
        }
        Callback::Ignored => {}
    }
    Ok(outcome)
}

fn classify(params: &HashMap<String, String>, expected_state: &str) -> Callback {
    if let Some(error) = params.get("error") {
        let message = match params.get("error_description") {
            Some(description) => format!("Authorization failed: {error}: {description}"),
            None => format!("Authorization failed: {error}"),
        };
        return Callback::Failed(message);
    }

    match params.get("state") {
        None => {
            return Callback::Failed(
                "Missing required state parameter - potential CSRF attack".to_string(),
            )
        }
        Some(state) if state != expected_state => {
            return Callback::Failed("Invalid state parameter - potential CSRF attack".to_string())
        }
        Some(_) => {}
    }

    match params.get("code") {
        Some(code) if !code.is_empty() => Callback::Code(code.clone()),
        _ => Callback::Failed("No authorization code provided".to_string()),
    }
}

async fn respond(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let response = http_response(status, content_type, body);
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "Failed to write OAuth callback response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn browser_get(addr: SocketAddr, target: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {target} HTTP/1.1\r\nHost: {addr}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_receives_code() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let browser = tokio::spawn(async move {
            let other = browser_get(addr, "/favicon.ico").await;
            assert!(other.starts_with("HTTP/1.1 404"));
            browser_get(addr, "/oauth/callback?code=abc%20123&state=s1").await
        });

        let code = listener
            .wait_for_code("s1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, "abc 123");

        let page = browser.await.unwrap();
        assert!(page.starts_with("HTTP/1.1 200"));
        assert!(page.contains("Authorization Successful"));
    }

    #[tokio::test]
    async fn test_state_mismatch_fails() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let browser =
            tokio::spawn(
                async move { browser_get(addr, "/oauth/callback?code=abc&state=evil").await },
            );

        let err = listener
            .wait_for_code("s1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid state parameter"));
        assert!(browser.await.unwrap().starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn test_classify() {
        let params = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };

        let denied = classify(
            &params(&[("error", "access_denied"), ("error_description", "nope")]),
            "s",
        );
        assert!(
            matches!(denied, Callback::Failed(m) if m == "Authorization failed: access_denied: nope")
        );
        assert!(matches!(
            classify(&params(&[("code", "c")]), "s"),
            Callback::Failed(m) if m.contains("Missing required state")
        ));
        assert!(matches!(
            classify(&params(&[("state", "s")]), "s"),
            Callback::Failed(m) if m == "No authorization code provided"
        ));
        assert!(matches!(
            classify(&params(&[("state", "s"), ("code", "c")]), "s"),
            Callback::Code(c) if c == "c"
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let err = listener
            .wait_for_code("s", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }
}
