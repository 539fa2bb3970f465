//! Build the configured backend.

use std::sync::Arc;
use std::time::Duration;

use omnibridge_config::BackendConfig;
use omnibridge_core::{Backend, BackendError, BackendKind};
use tracing::info;

use crate::openai_compat::OpenAiCompatBackend;

/// Construct the backend named by `config.kind`.
///
/// Local kinds load weights on a blocking thread and need the `local` feature.
pub async fn build_backend(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    info!(kind = %config.kind, model = %config.model, "Building backend");
    match config.kind {
        BackendKind::Remote => Ok(Arc::new(remote(config))),
        BackendKind::Prompted | BackendKind::Native => local(config).await,
    }
}

fn remote(config: &BackendConfig) -> OpenAiCompatBackend {
    let remote = &config.remote;
    let name = if remote.base_url.contains("api.openai.com") { "openai" } else { "remote" };
    OpenAiCompatBackend::new(name, remote.base_url.clone(), remote.api_key.clone())
        .with_vision(remote.vision)
        .with_timeout(Duration::from_secs(remote.timeout_secs))
}

#[cfg(feature = "local")]
async fn local(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    use crate::candle::CandleEngine;
    use crate::local::LocalBackend;

    let local = config.local.clone();
    let model = local.model.clone();
    let tokenizer = local.tokenizer_path.clone();
    let engine = tokio::task::spawn_blocking(move || CandleEngine::load(&model, tokenizer.as_deref()))
        .await
        .map_err(|e| BackendError::Unavailable(format!("Model loading task failed: {e}")))??;

    let backend: Arc<dyn Backend> = match config.kind {
        BackendKind::Native => Arc::new(LocalBackend::native(engine, local.lease)),
        _ => Arc::new(LocalBackend::prompted(engine, local.markers, local.lease)),
    };
    Ok(backend)
}

#[cfg(not(feature = "local"))]
async fn local(config: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    Err(BackendError::Unavailable(format!(
        "backend kind '{}' needs a local engine; rebuild with `--features local`",
        config.kind
    )))
}
