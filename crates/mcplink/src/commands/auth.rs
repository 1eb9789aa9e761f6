//! `mcplink auth` and `mcplink logout`.
//!
//! The browser flow: bind the loopback listener, run [`auth`] which
//! redirects to the authorization server, wait for the redirect back with the
//! code, then run [`auth`] again to exchange it.

use super::Context;
use crate::callback::{CallbackListener, CALLBACK_TIMEOUT};
use anyhow::{anyhow, Context as _};
use mcplink_client::{auth, AuthOptions, AuthResult, OAUTH_CALLBACK_PORT};
use tracing::{info, warn};
use url::Url;

/// Authorize against a server and store the tokens.
pub async fn authenticate(ctx: &Context, name: &str, no_browser: bool) -> anyhow::Result<()> {
    let server = ctx.config.server(name)?;
    let server_url =
        Url::parse(&server.url).with_context(|| format!("Invalid server URL: {}", server.url))?;
    let port = server
        .oauth
        .as_ref()
        .and_then(|o| o.redirect_port)
        .unwrap_or(OAUTH_CALLBACK_PORT);

    let listener = CallbackListener::bind(port).await?;
    let provider = ctx.oauth_provider(name).await?.on_redirect(move |url| {
        eprintln!("Open this URL to authorize mcplink:");
        eprintln!();
        eprintln!("  {url}");
        eprintln!();
        if no_browser {
            return;
        }
        if let Err(e) = open::that(url.as_str()) {
            warn!(error = %e, "Could not open browser");
        }
    });
    let http = reqwest::Client::new();

    let first = auth(&provider, &http, &server_url, &AuthOptions::default()).await?;
    if first == AuthResult::Redirect {
        let state = provider
            .pending_state()
            .await
            .ok_or_else(|| anyhow!("Authorization flow did not issue a state parameter"))?;
        eprintln!("Waiting for authorization...");
        let code = listener.wait_for_code(&state, CALLBACK_TIMEOUT).await?;

        let options = AuthOptions {
            authorization_code: Some(code),
            ..Default::default()
        };
        let second = auth(&provider, &http, &server_url, &options).await?;
        if second != AuthResult::Authorized {
            return Err(anyhow!("Authorization server did not issue tokens"));
        }
    }

    provider.clear_temp_state().await;
    let store = ctx.credentials();
    store.save(name, &provider.export_state().await).await?;
    info!(server = name, "Stored OAuth credentials");
    println!(
        "Authorized '{name}'. Credentials saved to {}",
        store.path(name).display()
    );
    Ok(())
}

/// Remove stored credentials for a server.
pub async fn logout(ctx: &Context, name: &str) -> anyhow::Result<()> {
    if ctx.credentials().remove(name).await? {
        println!("Removed stored credentials for '{name}'.");
    } else {
        println!("No stored credentials for '{name}'.");
    }
    Ok(())
}
