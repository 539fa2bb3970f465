//! `omnibridge init`: write the default config file.

use std::path::Path;

use anyhow::{Context, bail};
use omnibridge_config::AppConfig;

pub fn run(config_path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = super::config_path(config_path);
    write_default(&path, force)?;

    println!("Wrote default config to {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set OPENAI_API_KEY or edit [backend.remote] in the config");
    println!("  2. Add [[tool_servers]] entries for your MCP servers");
    println!("  3. Run: omnibridge chat");
    Ok(())
}

fn write_default(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml()).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
