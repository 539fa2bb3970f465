//! Exclusive access to a local model instance.
//!
//! Local inference engines are CPU/GPU bound and hold mutable KV-cache state,
//! so two generations must never interleave on one instance. A
//! [`ModelInstance`] hands out [`ModelLease`]s; a lease owns the instance's
//! mutex guard and moves it onto a blocking thread for the duration of one
//! generation.

use std::sync::Arc;

use omnibridge_config::LeasePolicy;
use omnibridge_core::{BackendError, ImageFrame, Modality};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// One prompt ready for an engine.
#[derive(Debug, Clone, Default)]
pub struct EngineRequest {
    /// Fully rendered prompt text, including image placeholders
    pub prompt: String,

    /// Images referenced by the prompt, in placeholder order
    pub images: Vec<ImageFrame>,

    pub max_tokens: u32,
    pub temperature: f32,

    /// Generation stops when any of these appear in the output
    pub stop: Vec<String>,
}

/// A synchronous inference engine (weights + tokenizer + sampler).
///
/// Engines are driven from `spawn_blocking`, never from the async runtime.
pub trait InferenceEngine: Send + 'static {
    /// Short identifier for logs (e.g. "candle/qwen:1.5b").
    fn name(&self) -> &str;

    /// Modalities the underlying model can consume.
    fn modalities(&self) -> &[Modality] {
        &[Modality::Text]
    }

    /// Whether weights are resident and generation can start.
    fn is_loaded(&self) -> bool {
        true
    }

    /// Generate a completion, calling `on_token` with each decoded piece.
    fn generate(
        &mut self,
        request: &EngineRequest,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String, BackendError>;
}

/// A shareable handle to one engine.
pub struct ModelInstance<E> {
    engine: Arc<Mutex<E>>,
    policy: LeasePolicy,
}

impl<E> Clone for ModelInstance<E> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), policy: self.policy }
    }
}

impl<E: InferenceEngine> ModelInstance<E> {
    pub fn new(engine: E, policy: LeasePolicy) -> Self {
        Self { engine: Arc::new(Mutex::new(engine)), policy }
    }

    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    /// Wait until the instance is free, then take it.
    pub async fn lease(&self) -> ModelLease<E> {
        ModelLease { guard: self.engine.clone().lock_owned().await }
    }

    /// Take the instance only if nobody else holds it.
    pub fn try_lease(&self) -> Result<ModelLease<E>, BackendError> {
        self.engine
            .clone()
            .try_lock_owned()
            .map(|guard| ModelLease { guard })
            .map_err(|_| BackendError::Busy("model instance is serving another generation".into()))
    }

    /// Lease according to the configured policy.
    pub async fn acquire(&self) -> Result<ModelLease<E>, BackendError> {
        match self.policy {
            LeasePolicy::Queue => Ok(self.lease().await),
            LeasePolicy::Reject => self.try_lease(),
        }
    }
}

/// Scoped exclusive access to an engine. Released when dropped.
pub struct ModelLease<E> {
    guard: OwnedMutexGuard<E>,
}

impl<E: InferenceEngine> ModelLease<E> {
    /// Run `f` against the engine on a blocking thread, consuming the lease.
    pub async fn run<T, F>(self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut E) -> Result<T, BackendError> + Send + 'static,
    {
        let mut guard = self.guard;
        debug!(engine = %guard.name(), "lease acquired");
        tokio::task::spawn_blocking(move || f(&mut *guard))
            .await
            .map_err(|e| BackendError::Unavailable(format!("inference task failed: {e}")))?
    }

    pub fn engine(&self) -> &E {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl InferenceEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        fn generate(&mut self, request: &EngineRequest, on_token: &mut dyn FnMut(&str)) -> Result<String, BackendError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            on_token(&request.prompt);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(request.prompt.clone())
        }
    }

    fn instance(policy: LeasePolicy) -> (ModelInstance<CountingEngine>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let engine = CountingEngine { active: Arc::new(AtomicUsize::new(0)), peak: peak.clone() };
        (ModelInstance::new(engine, policy), peak)
    }

    #[tokio::test]
    async fn generations_never_overlap() {
        let (model, peak) = instance(LeasePolicy::Queue);
        let mut handles = Vec::new();
        for i in 0..4 {
            let model = model.clone();
            handles.push(tokio::spawn(async move {
                let lease = model.lease().await;
                lease
                    .run(move |engine| {
                        let request = EngineRequest { prompt: format!("p{i}"), ..Default::default() };
                        engine.generate(&request, &mut |_| {})
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn try_lease_rejects_when_held() {
        let (model, _) = instance(LeasePolicy::Reject);
        let held = model.lease().await;
        assert!(matches!(model.try_lease(), Err(BackendError::Busy(_))));
        assert!(matches!(model.acquire().await, Err(BackendError::Busy(_))));
        drop(held);
        assert!(model.try_lease().is_ok());
    }

    #[tokio::test]
    async fn lease_exposes_engine() {
        let (model, _) = instance(LeasePolicy::Queue);
        let lease = model.acquire().await.unwrap();
        assert_eq!(lease.engine().name(), "counting");
        assert_eq!(model.policy(), LeasePolicy::Queue);
    }
}
