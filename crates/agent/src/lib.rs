//! The agent loop: the heart of OmniBridge.
//!
//! A turn follows a **Generate → Normalize → Execute** cycle:
//!
//! 1. **Receive** a user message (text, image, or device input)
//! 2. **Generate** with the configured backend over the full history
//! 3. **Normalize** whatever the backend produced into canonical tool calls
//! 4. **If calls**: execute them through the tool client, append results, loop back to step 2
//! 5. **If plain text**: that is the answer
//!
//! The loop also stops when the per-turn generation budget is spent or the
//! session deadline passes.

pub mod loop_runner;
pub mod session;
pub mod stream_event;

pub use loop_runner::{AgentLoop, CANCELLED_DIAGNOSTIC, TurnOutcome, truncation_notice};
pub use session::Session;
pub use stream_event::AgentStreamEvent;
