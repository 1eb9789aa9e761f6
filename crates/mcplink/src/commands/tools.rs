//! `mcplink tools` and `mcplink call`.

use super::{parse_arguments, summary, Context};
use anyhow::anyhow;
use mcplink_client::protocol::ResourceContents;
use mcplink_client::{CallToolResult, ToolContent, ToolOutput, ToolSchemas};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// List the tools a server offers.
pub async fn list_tools(ctx: &Context, server: &str) -> anyhow::Result<()> {
    let session = ctx.connect(server).await?;
    let tools = session.client.list_all_tools().await;
    session.finish().await?;
    let tools = tools?;

    if ctx.json {
        return ctx.print_json(&tools);
    }

    if tools.is_empty() {
        println!("Server '{server}' has no tools.");
        return Ok(());
    }

    println!("{:<30} {}", "NAME", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for tool in &tools {
        println!(
            "{:<30} {}",
            tool.name,
            summary(tool.description.as_deref(), 50)
        );
    }

    Ok(())
}

/// Call a tool. Ctrl-C cancels the call.
pub async fn call_tool(
    ctx: &Context,
    server: &str,
    tool: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let arguments = Value::Object(parse_arguments(args)?);
    let session = ctx.connect(server).await?;

    let result = run_tool(&session.client, server, tool, arguments).await;
    session.finish().await?;
    let output = result?;

    if ctx.json {
        return ctx.print_json(&output.to_value());
    }

    match &output {
        ToolOutput::Structured(value) => println!("{}", serde_json::to_string_pretty(value)?),
        ToolOutput::Content(result) => {
            print_content(result);
            if result.is_error {
                return Err(anyhow!("Tool '{tool}' reported an error"));
            }
        }
    }
    Ok(())
}

async fn run_tool(
    client: &mcplink_client::McpClient,
    server: &str,
    tool: &str,
    arguments: Value,
) -> anyhow::Result<ToolOutput> {
    let tools = client.tools(&ToolSchemas::Automatic).await?;
    let Some(remote) = tools.iter().find(|t| t.name == tool) else {
        let available: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        return Err(anyhow!(
            "Tool '{tool}' not found on server '{server}'. Available: {}",
            available.join(", ")
        ));
    };

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let output = remote.call(arguments, Some(&cancel)).await;
    interrupt.abort();
    Ok(output?)
}

fn print_content(result: &CallToolResult) {
    if let Some(legacy) = &result.tool_result {
        println!("{legacy}");
    }
    for item in &result.content {
        match item {
            ToolContent::Text { text } => println!("{text}"),
            ToolContent::Image { mime_type, data } | ToolContent::Audio { mime_type, data } => {
                println!("[{mime_type}, {} bytes base64]", data.len())
            }
            ToolContent::Resource { resource } => match resource {
                ResourceContents::Text { text, .. } => println!("{text}"),
                ResourceContents::Blob { uri, blob, .. } => {
                    println!("[{uri}, {} bytes base64]", blob.len())
                }
            },
            ToolContent::ResourceLink { uri, .. } => println!("[link: {uri}]"),
            ToolContent::Unknown => println!("[unsupported content]"),
        }
    }
    if let Some(structured) = &result.structured_content {
        println!("{structured}");
    }
}
