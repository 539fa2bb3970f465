//! `omnibridge ingest`: add documents to the retrieval store.

use std::path::{Path, PathBuf};

use anyhow::Context;
use omnibridge_retrieval::Document;
use tracing::info;

pub async fn run(config_path: Option<&Path>, files: &[PathBuf]) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let retriever = super::open_retriever(&config).await?;

    let mut documents = Vec::with_capacity(files.len());
    for path in files {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        documents.push(Document::new(text).with_source(path.display().to_string()));
    }

    let added = retriever.add_documents(documents).await?;
    let store_path = super::store_path(&config);
    retriever.store().save(&store_path).await?;

    info!(files = files.len(), chunks = added, store = %store_path.display(), "Ingest complete");
    println!(
        "Ingested {} file(s) as {added} chunk(s); store now holds {} chunk(s) at {}",
        files.len(),
        retriever.store().len().await,
        store_path.display()
    );
    if !config.retrieval.enabled {
        println!("Note: retrieval is disabled; set retrieval.enabled = true to use it in chat.");
    }
    Ok(())
}
