//! `omnibridge search`: query the retrieval store directly.

use std::path::Path;

pub async fn run(config_path: Option<&Path>, query: &str, k: Option<usize>) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let mut retriever = super::open_retriever(&config).await?;
    if let Some(k) = k {
        retriever = retriever.with_top_k(k);
    }

    let hits = retriever.retrieve(query).await?;
    if hits.is_empty() {
        println!("No matches. Run `omnibridge ingest <files>` first.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let source = hit.metadata.get("source").and_then(|s| s.as_str()).unwrap_or("-");
        let preview: String = hit.text.chars().take(160).collect();
        println!("[{}] {:.3}  {source}", i + 1, hit.score);
        println!("    {}", preview.replace('\n', " "));
    }
    Ok(())
}
