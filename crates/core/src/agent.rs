//! Agent loop states and settings.

use serde::{Deserialize, Serialize};

/// Settings for the agent loop's behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum generations per user turn (safety limit against tool-call loops)
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Wall-clock budget for one user turn, in seconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Use `generate_stream` instead of `generate`
    #[serde(default)]
    pub stream: bool,

    /// Prepended once at the start of every session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_max_turns() -> u32 {
    10
}
fn default_session_timeout() -> u64 {
    120
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            session_timeout_secs: default_session_timeout(),
            stream: false,
            system_prompt: None,
        }
    }
}

/// States of the agent loop state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    AwaitingInput,
    Generating,
    Normalizing,
    ExecutingTools,
    Done,
    Error,
}

impl AgentState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (_, Error) => self != Error,
            (AwaitingInput, Generating) => true,
            (Generating, Normalizing) => true,
            // turn budget forces termination without normalizing further calls
            (Generating, Done) => true,
            (Normalizing, ExecutingTools) | (Normalizing, Done) => true,
            (ExecutingTools, Generating) | (ExecutingTools, Done) => true,
            (Done, AwaitingInput) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Done | AgentState::Error)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::AwaitingInput => "AWAITING_INPUT",
            AgentState::Generating => "GENERATING",
            AgentState::Normalizing => "NORMALIZING",
            AgentState::ExecutingTools => "EXECUTING_TOOLS",
            AgentState::Done => "DONE",
            AgentState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let s = AgentSettings::default();
        assert_eq!(s.max_turns, 10);
        assert_eq!(s.session_timeout_secs, 120);
        assert!(!s.stream);
    }

    #[test]
    fn legal_transitions() {
        use AgentState::*;
        assert!(AwaitingInput.can_transition_to(Generating));
        assert!(Normalizing.can_transition_to(ExecutingTools));
        assert!(ExecutingTools.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Error));
        assert!(!AwaitingInput.can_transition_to(ExecutingTools));
        assert!(!Error.can_transition_to(Error));
    }

    #[test]
    fn display_uses_upper_snake_case() {
        assert_eq!(AgentState::ExecutingTools.to_string(), "EXECUTING_TOOLS");
    }
}
