//! `mcplink servers`.

use super::Context;

/// List the configured servers.
pub async fn list_servers(ctx: &Context) -> anyhow::Result<()> {
    if ctx.json {
        return ctx.print_json(&ctx.config.servers);
    }

    if ctx.config.servers.is_empty() {
        println!("No servers configured.");
        println!("Add servers to {}", ctx.config_path.display());
        return Ok(());
    }

    let store = ctx.credentials();
    println!("{:<20} {:<6} {:<9} {}", "NAME", "TYPE", "STATUS", "URL");
    println!("{}", "-".repeat(70));

    for (name, server) in &ctx.config.servers {
        let status = if !server.enabled {
            "disabled"
        } else if store.path(name).exists() {
            "authed"
        } else {
            "enabled"
        };
        println!(
            "{:<20} {:<6} {:<9} {}",
            name,
            server.kind.as_str(),
            status,
            server.url
        );
    }

    Ok(())
}
