//! # OmniBridge Backends
//!
//! Adapters that put each model family behind the [`Backend`](omnibridge_core::Backend)
//! trait:
//!
//! - [`OpenAiCompatBackend`]: remote OpenAI-compatible APIs (structured tool calls)
//! - [`LocalBackend`]: locally hosted models, prompt-engineered or native-tool
//! - `CandleEngine` (feature `local`): GGUF inference via Candle
//!
//! Local engines are reached only through [`ModelInstance`] leases.

pub mod factory;
pub mod lease;
pub mod local;
pub mod openai_compat;
pub mod template;

#[cfg(feature = "local")]
pub mod candle;

pub use factory::build_backend;
pub use lease::{EngineRequest, InferenceEngine, ModelInstance, ModelLease};
pub use local::LocalBackend;
pub use openai_compat::OpenAiCompatBackend;
pub use template::{PromptDialect, RenderedPrompt};

#[cfg(feature = "local")]
pub use candle::CandleEngine;
