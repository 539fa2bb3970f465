//! # OmniBridge Core
//!
//! Domain types, traits, and error definitions for the OmniBridge multimodal
//! agent runtime. This crate does no I/O of its own: it defines
//! the domain model that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every seam is defined as a trait here. Implementations live in their
//! respective crates:
//! - [`Backend`] is implemented by `omnibridge-backends`
//! - [`ToolInvoker`] is implemented by `omnibridge-mcp`
//! - canonical tool calls are produced only by `omnibridge-normalizer`
//!
//! All crates depend inward on core.

pub mod agent;
pub mod backend;
pub mod error;
pub mod event;
pub mod input;
pub mod markers;
pub mod message;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentSettings, AgentState};
pub use backend::{
    Backend, BackendKind, GenerateConfig, Modality, ProviderToolCall, RawFragment, RawOutput,
    ToolDefinition,
};
pub use error::{BackendError, Error, Result, RetrievalError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use input::{DeviceInput, Gaze, Gesture, ImageFrame};
pub use markers::SentinelMarkers;
pub use message::{ContentPart, Conversation, ConversationId, Message, MessageContent, MessageToolCall, Role};
pub use tool::{ToolInvoker, ToolResult};
