//! `mcplink prompts` and `mcplink prompt`.

use super::{parse_arguments, summary, Context};
use mcplink_client::protocol::Role;
use mcplink_client::ToolContent;

/// List the prompts a server offers.
pub async fn list_prompts(ctx: &Context, server: &str) -> anyhow::Result<()> {
    let session = ctx.connect(server).await?;
    let result = session.client.list_prompts(None).await;
    session.finish().await?;
    let result = result?;

    if ctx.json {
        return ctx.print_json(&result.prompts);
    }

    if result.prompts.is_empty() {
        println!("Server '{server}' has no prompts.");
        return Ok(());
    }

    println!("{:<25} {:<25} {}", "NAME", "ARGUMENTS", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for prompt in &result.prompts {
        let arguments: Vec<String> = prompt
            .arguments
            .iter()
            .map(|a| {
                if a.required.unwrap_or(false) {
                    format!("{}*", a.name)
                } else {
                    a.name.clone()
                }
            })
            .collect();
        println!(
            "{:<25} {:<25} {}",
            prompt.name,
            arguments.join(","),
            summary(prompt.description.as_deref(), 30)
        );
    }

    Ok(())
}

/// Render a prompt with arguments.
pub async fn get_prompt(
    ctx: &Context,
    server: &str,
    name: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let arguments = parse_arguments(args)?;
    let arguments = (!arguments.is_empty()).then_some(arguments);

    let session = ctx.connect(server).await?;
    let result = session.client.get_prompt(name, arguments).await;
    session.finish().await?;
    let result = result?;

    if ctx.json {
        return ctx.print_json(&result);
    }

    if let Some(description) = &result.description {
        println!("# {description}");
        println!();
    }
    for message in &result.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match &message.content {
            ToolContent::Text { text } => println!("[{role}] {text}"),
            other => println!("[{role}] {}", serde_json::to_string(other)?),
        }
    }
    Ok(())
}
