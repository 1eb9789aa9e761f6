//! `mcplink discover`.

use anyhow::Context as _;
use mcplink_client::oauth::{
    discover_authorization_server_metadata, discover_protected_resource_metadata,
};
use serde_json::json;
use url::Url;

/// Print the OAuth metadata an MCP server URL advertises.
///
/// Without protected resource metadata the server's origin is assumed to be
/// its own authorization server.
pub async fn discover(url: &str) -> anyhow::Result<()> {
    let server_url = Url::parse(url).with_context(|| format!("Invalid URL: {url}"))?;
    let http = reqwest::Client::new();

    let resource = match discover_protected_resource_metadata(&http, &server_url, None, None).await
    {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::info!(error = %e, "No protected resource metadata");
            None
        }
    };

    let authorization_server = match resource
        .as_ref()
        .and_then(|m| m.authorization_servers.first())
    {
        Some(server) => server.url().clone(),
        None => server_url.join("/")?,
    };

    let metadata =
        discover_authorization_server_metadata(&http, &authorization_server, None).await?;

    let found = metadata.is_some();
    let output = json!({
        "protectedResource": resource,
        "authorizationServerUrl": authorization_server.as_str(),
        "authorizationServer": metadata,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if !found {
        eprintln!("No authorization server metadata found at {authorization_server}");
    }
    Ok(())
}
