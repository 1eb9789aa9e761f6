//! `mcplink resources` and `mcplink read`.

use super::{summary, Context};
use mcplink_client::protocol::ResourceContents;

/// List resources and resource templates.
pub async fn list_resources(ctx: &Context, server: &str) -> anyhow::Result<()> {
    let session = ctx.connect(server).await?;
    let listed = async {
        let resources = session.client.list_resources(None).await?;
        // Templates are optional even when resources are supported
        let templates = session
            .client
            .list_resource_templates(None)
            .await
            .map(|r| r.resource_templates)
            .unwrap_or_default();
        Ok::<_, mcplink_client::McpError>((resources, templates))
    }
    .await;
    session.finish().await?;
    let (resources, templates) = listed?;

    if ctx.json {
        return ctx.print_json(&serde_json::json!({
            "resources": resources.resources,
            "resourceTemplates": templates,
        }));
    }

    if resources.resources.is_empty() && templates.is_empty() {
        println!("Server '{server}' has no resources.");
        return Ok(());
    }

    println!("{:<40} {:<20} {}", "URI", "NAME", "DESCRIPTION");
    println!("{}", "-".repeat(90));
    for resource in &resources.resources {
        println!(
            "{:<40} {:<20} {}",
            resource.uri,
            resource.name,
            summary(resource.description.as_deref(), 30)
        );
    }
    for template in &templates {
        println!(
            "{:<40} {:<20} {}",
            template.uri_template,
            template.name,
            summary(template.description.as_deref(), 30)
        );
    }
    if resources.next_cursor.is_some() {
        println!("(more resources available)");
    }

    Ok(())
}

/// Read one resource and print its contents.
pub async fn read_resource(ctx: &Context, server: &str, uri: &str) -> anyhow::Result<()> {
    let session = ctx.connect(server).await?;
    let result = session.client.read_resource(uri).await;
    session.finish().await?;
    let result = result?;

    if ctx.json {
        return ctx.print_json(&result);
    }

    for contents in &result.contents {
        match contents {
            ResourceContents::Text { text, .. } => println!("{text}"),
            ResourceContents::Blob {
                uri,
                mime_type,
                blob,
            } => println!(
                "[{uri}: {} blob, {} bytes base64]",
                mime_type.as_deref().unwrap_or("binary"),
                blob.len()
            ),
        }
    }
    Ok(())
}
