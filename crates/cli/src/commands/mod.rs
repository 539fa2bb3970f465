//! Subcommand handlers and the wiring they share.

pub mod chat;
pub mod ingest;
pub mod init;
pub mod search;
pub mod tools;

use std::path::{Path, PathBuf};

use anyhow::Context;
use omnibridge_config::AppConfig;
use omnibridge_mcp::ToolProtocolClient;
use omnibridge_retrieval::Retriever;

pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Load the config file (or defaults) and apply environment overrides.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    let path = config_path(explicit);
    let mut config = AppConfig::load_from(&path).with_context(|| format!("loading {}", path.display()))?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn store_path(config: &AppConfig) -> PathBuf {
    config
        .retrieval
        .store_path
        .clone()
        .unwrap_or_else(AppConfig::default_store_path)
}

/// The retriever described by `[retrieval]`, enabled or not.
pub async fn open_retriever(config: &AppConfig) -> anyhow::Result<Retriever> {
    let path = store_path(config);
    let retriever = Retriever::from_config(
        &config.retrieval,
        &config.backend.remote.base_url,
        config.backend.remote.api_key.clone(),
        &path,
    )
    .await
    .with_context(|| format!("opening vector store at {}", path.display()))?;
    Ok(retriever)
}

/// Connect to every `[[tool_servers]]` entry. Any failure aborts.
pub async fn connect_tools(config: &AppConfig) -> anyhow::Result<ToolProtocolClient> {
    let client = ToolProtocolClient::new(&config.mcp);
    if let Err(e) = client.connect_all(&config.tool_servers).await {
        client.disconnect().await;
        return Err(e).context("connecting to tool servers");
    }
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(config_path(Some(Path::new("/etc/ob.toml"))), PathBuf::from("/etc/ob.toml"));
        assert!(config_path(None).ends_with(".omnibridge/config.toml"));
    }

    #[test]
    fn store_path_defaults_next_to_config() {
        let mut config = AppConfig::default();
        assert_eq!(store_path(&config), AppConfig::default_store_path());
        config.retrieval.store_path = Some(PathBuf::from("/data/v.json"));
        assert_eq!(store_path(&config), PathBuf::from("/data/v.json"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = std::env::temp_dir().join("omnibridge-cli-missing");
        let config = load_config(Some(&dir.join("nope.toml"))).unwrap();
        assert_eq!(config.agent.max_turns, 10);
    }

    #[tokio::test]
    async fn no_tool_servers_connects_trivially() {
        let client = connect_tools(&AppConfig::default()).await.unwrap();
        assert!(client.servers().await.is_empty());
    }
}
