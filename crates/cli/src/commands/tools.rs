//! `omnibridge tools`: list tools from every configured MCP server.

use std::path::Path;

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    if config.tool_servers.is_empty() {
        println!("No tool servers configured. Add a [[tool_servers]] entry to your config.");
        return Ok(());
    }

    let client = super::connect_tools(&config).await?;
    let servers = client.servers().await;
    let tools = client.list_tools().await;

    println!("Tool servers: {}", servers.join(", "));
    println!();
    for tool in &tools {
        let owner = client.tool_owner(&tool.name).await.unwrap_or_default();
        let summary = tool.description.lines().next().unwrap_or_default();
        println!("  {:<24} [{owner}] {summary}", tool.name);
    }
    println!();
    println!("{} tool(s)", tools.len());

    client.disconnect().await;
    Ok(())
}
