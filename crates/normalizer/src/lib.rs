//! # OmniBridge Normalizer
//!
//! Turns a backend's [`RawOutput`](omnibridge_core::RawOutput) into zero or
//! more [`CanonicalToolCall`]s plus the leftover answer text.
//!
//! Three conventions are reconciled here and nowhere else:
//! - prompt-engineered models writing calls between sentinel markers
//!   (often imperfectly, hence the fallback chain)
//! - native-tool runtimes emitting their own `<tool_call>` markers
//! - remote APIs returning structured `tool_calls`
//!
//! Every result records which [`Strategy`] produced it, so the confidence of
//! a parse is visible in logs and tests.

pub mod call;
mod extract;
pub mod normalize;

pub use call::{CallStatus, CanonicalToolCall, Confidence, Strategy};
pub use normalize::{Diagnostic, Normalized, Normalizer, normalize, render_calls};
