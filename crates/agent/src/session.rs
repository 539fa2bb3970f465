//! Per-conversation state owned by the caller.

use omnibridge_core::{AgentState, Conversation, ConversationId, Message};

/// One conversation with the agent.
///
/// History only grows: messages can be appended and read, never edited or
/// removed. Sessions share nothing, so any number of them can run turns
/// against the same [`AgentLoop`](crate::AgentLoop) concurrently.
#[derive(Debug, Default)]
pub struct Session {
    conversation: Conversation,
    state: AgentState,
    primed: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> &ConversationId {
        &self.conversation.id
    }

    pub fn history(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn push(&mut self, message: Message) {
        self.conversation.push(message);
    }

    /// State the last turn ended in.
    pub fn state(&self) -> AgentState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: AgentState) {
        self.state = state;
    }

    /// Mark the system prompt as emitted. Returns `false` if it already was.
    pub(crate) fn prime(&mut self) -> bool {
        !std::mem::replace(&mut self.primed, true)
    }

    pub fn len(&self) -> usize {
        self.conversation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_empty()
    }
}
