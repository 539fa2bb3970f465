//! The agent state machine.
//!
//! One call to [`AgentLoop::run_turn`] drives a session from
//! `AwaitingInput` to `Done` or `Error`:
//!
//! 1. **Receive** the user message, prefixed by retrieved context if a
//!    retriever is attached
//! 2. **Generate** over the full history
//! 3. **Normalize** the raw output into canonical calls
//! 4. **Execute** the calls in emission order, appending one `tool` message
//!    per call, then go back to 2
//! 5. **Finish** when a generation carries no calls, or when the turn
//!    budget runs out
//!
//! Every exit path leaves a visible trace in history: an answer, a
//! truncation notice, or an `Error: …` assistant message.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use omnibridge_core::{
    AgentSettings, AgentState, Backend, BackendError, DomainEvent, Error, EventBus, GenerateConfig, Message,
    RawOutput, SentinelMarkers, ToolDefinition, ToolInvoker, ToolResult,
};
use omnibridge_normalizer::{CallStatus, CanonicalToolCall, Normalizer, Strategy};
use omnibridge_retrieval::{Retriever, format_context};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::session::Session;
use crate::stream_event::AgentStreamEvent;

/// Diagnostic recorded for calls cut off by the session deadline.
pub const CANCELLED_DIAGNOSTIC: &str = "Cancelled: session timeout";

pub fn truncation_notice(max_turns: u32) -> String {
    format!("[Turn budget of {max_turns} generations exhausted; stopping tool execution.]")
}

/// What a completed turn did.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Final answer text, or the truncation notice
    pub answer: String,

    /// Terminal state (always `Done` for a returned outcome)
    pub state: AgentState,

    /// Every state visited, starting with `AwaitingInput`
    pub transitions: Vec<AgentState>,

    /// Backend calls made during the turn
    pub generations: u32,

    /// Normalizer strategy per generation; `None` for a plain answer
    pub strategies: Vec<Option<Strategy>>,

    /// Results in the order they were appended to history
    pub tool_results: Vec<ToolResult>,

    /// Whether the turn budget stopped the loop
    pub truncated: bool,
}

/// Bookkeeping for one turn in flight.
struct Turn<'a> {
    session: &'a mut Session,
    sink: Option<&'a mpsc::Sender<AgentStreamEvent>>,
    state: AgentState,
    transitions: Vec<AgentState>,
    generations: u32,
    strategies: Vec<Option<Strategy>>,
    tool_results: Vec<ToolResult>,
}

/// Orchestrates backend generations and tool execution.
///
/// The loop itself is immutable; all per-conversation state lives in the
/// [`Session`] passed to each turn.
pub struct AgentLoop {
    backend: Arc<dyn Backend>,
    invoker: Arc<dyn ToolInvoker>,
    normalizer: Normalizer,
    config: GenerateConfig,
    settings: AgentSettings,
    retriever: Option<Arc<Retriever>>,
    event_bus: Option<Arc<EventBus>>,
}

impl AgentLoop {
    pub fn new(backend: Arc<dyn Backend>, invoker: Arc<dyn ToolInvoker>, config: GenerateConfig) -> Self {
        Self {
            backend,
            invoker,
            normalizer: Normalizer::default(),
            config,
            settings: AgentSettings::default(),
            retriever: None,
            event_bus: None,
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Call markers a prompted backend was configured with.
    pub fn with_markers(mut self, markers: SentinelMarkers) -> Self {
        self.normalizer = Normalizer::new(markers);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Process one user message to completion.
    pub async fn run_turn(&self, session: &mut Session, input: Message) -> Result<TurnOutcome, Error> {
        self.drive(session, input, None).await
    }

    /// Like [`run_turn`](Self::run_turn), streaming the generation and
    /// reporting progress on `sink`.
    pub async fn run_turn_streaming(
        &self,
        session: &mut Session,
        input: Message,
        sink: mpsc::Sender<AgentStreamEvent>,
    ) -> Result<TurnOutcome, Error> {
        self.drive(session, input, Some(&sink)).await
    }

    async fn drive(
        &self,
        session: &mut Session,
        input: Message,
        sink: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<TurnOutcome, Error> {
        let deadline = Instant::now() + Duration::from_secs(self.settings.session_timeout_secs);
        session.set_state(AgentState::AwaitingInput);
        let mut turn = Turn {
            session,
            sink,
            state: AgentState::AwaitingInput,
            transitions: vec![AgentState::AwaitingInput],
            generations: 0,
            strategies: Vec::new(),
            tool_results: Vec::new(),
        };

        info!(
            session_id = %turn.session.id(),
            backend = %self.backend.name(),
            kind = %self.backend.kind(),
            "Turn started"
        );
        self.publish(DomainEvent::TurnStarted {
            session_id: turn.session.id().to_string(),
            timestamp: Utc::now(),
        });

        if turn.session.prime() {
            if let Some(prompt) = &self.settings.system_prompt {
                turn.session.push(Message::system(prompt));
            }
        }
        if let Some(retriever) = &self.retriever {
            self.inject_context(retriever, &mut turn, &input.text(), deadline).await;
        }
        turn.session.push(input);

        let Ok(tools) = timeout_at(deadline, self.invoker.list_tools()).await else {
            let err = Error::SessionTimeout { timeout_secs: self.settings.session_timeout_secs };
            return Err(self.fail(&mut turn, err).await);
        };
        debug!(tools = tools.len(), "Tools available for turn");

        loop {
            self.advance(&mut turn, AgentState::Generating);
            turn.generations += 1;

            let sink = turn.sink;
            let generated = timeout_at(deadline, self.generate(turn.session.history(), &tools, sink)).await;
            let raw = match generated {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => return Err(self.fail(&mut turn, Error::Backend(e)).await),
                Err(_) => {
                    let err = Error::SessionTimeout { timeout_secs: self.settings.session_timeout_secs };
                    return Err(self.fail(&mut turn, err).await);
                }
            };

            self.advance(&mut turn, AgentState::Normalizing);
            let normalized = self.normalizer.normalize(&raw, self.backend.kind(), &tools);
            for diagnostic in &normalized.diagnostics {
                warn!(%diagnostic, "Normalizer diagnostic");
            }
            turn.strategies.push(normalized.strategy);
            self.publish(DomainEvent::Generated {
                session_id: turn.session.id().to_string(),
                backend: self.backend.name().to_string(),
                strategy: normalized.strategy.map(|s| s.name().to_string()),
                call_count: normalized.calls.len(),
                timestamp: Utc::now(),
            });

            let calls = normalized.calls;
            let mut assistant = Message::assistant_with_calls(
                normalized.text_remainder.clone(),
                calls.iter().map(CanonicalToolCall::to_message_call).collect(),
            );
            if let Some(strategy) = normalized.strategy {
                assistant = assistant.with_metadata("strategy", strategy.name().into());
            }
            turn.session.push(assistant);

            if calls.is_empty() {
                self.advance(&mut turn, AgentState::Done);
                return Ok(self.finish(turn, normalized.text_remainder, false).await);
            }

            self.advance(&mut turn, AgentState::ExecutingTools);
            if let Err(e) = self.execute_calls(&mut turn, &calls, deadline).await {
                return Err(self.fail(&mut turn, e).await);
            }

            if turn.generations >= self.settings.max_turns {
                let notice = truncation_notice(self.settings.max_turns);
                warn!(
                    session_id = %turn.session.id(),
                    generations = turn.generations,
                    "Turn budget exhausted"
                );
                turn.session.push(Message::assistant(&notice).with_metadata("truncated", true.into()));
                self.advance(&mut turn, AgentState::Done);
                return Ok(self.finish(turn, notice, true).await);
            }
        }
    }

    /// One generation, streamed when configured or when a sink is listening.
    async fn generate(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
        sink: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> Result<RawOutput, BackendError> {
        if !self.settings.stream && sink.is_none() {
            return self.backend.generate(history, tools, &self.config).await;
        }

        let mut rx = self.backend.generate_stream(history, tools, &self.config).await?;
        let mut fragments = Vec::new();
        while let Some(fragment) = rx.recv().await {
            let fragment = fragment?;
            if let (Some(sink), Some(text)) = (sink, fragment.text.as_deref()) {
                if !text.is_empty() {
                    let _ = sink.send(AgentStreamEvent::Chunk { content: text.to_string() }).await;
                }
            }
            let done = fragment.done;
            fragments.push(fragment);
            if done {
                break;
            }
        }
        Ok(RawOutput::from_fragments(fragments))
    }

    async fn execute_calls(
        &self,
        turn: &mut Turn<'_>,
        calls: &[CanonicalToolCall],
        deadline: Instant,
    ) -> Result<(), Error> {
        for (index, call) in calls.iter().enumerate() {
            emit(
                turn.sink,
                AgentStreamEvent::ToolCall {
                    id: call.id().to_string(),
                    name: call.name().to_string(),
                    input: serde_json::Value::Object(call.arguments().clone()),
                    strategy: call.strategy().name().to_string(),
                },
            )
            .await;

            let started = std::time::Instant::now();
            let result = match call.status() {
                CallStatus::Unresolved => ToolResult::error(call.id(), format!("Tool not found: {}", call.name())),
                CallStatus::MalformedArguments(reason) => {
                    ToolResult::error(call.id(), format!("Invalid JSON arguments: {reason}"))
                }
                CallStatus::Resolved => {
                    let execution = self.invoker.execute(call.id(), call.name(), call.arguments().clone());
                    match timeout_at(deadline, execution).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(tool = %call.name(), remaining = calls.len() - index, "Session deadline hit during tool execution");
                            for pending in &calls[index..] {
                                self.record(turn, pending, ToolResult::error(pending.id(), CANCELLED_DIAGNOSTIC), 0)
                                    .await;
                            }
                            return Err(Error::SessionTimeout { timeout_secs: self.settings.session_timeout_secs });
                        }
                    }
                }
            };
            self.record(turn, call, result, started.elapsed().as_millis() as u64).await;
        }
        Ok(())
    }

    /// Append the result for `call`, keyed to the call's id.
    async fn record(&self, turn: &mut Turn<'_>, call: &CanonicalToolCall, mut result: ToolResult, duration_ms: u64) {
        if result.tool_call_id != call.id() {
            result.tool_call_id = call.id().to_string();
        }
        debug!(tool = %call.name(), is_error = result.is_error, duration_ms, "Tool result recorded");

        self.publish(DomainEvent::ToolExecuted {
            tool_name: call.name().to_string(),
            is_error: result.is_error,
            duration_ms,
            timestamp: Utc::now(),
        });
        emit(
            turn.sink,
            AgentStreamEvent::ToolResult {
                id: result.tool_call_id.clone(),
                name: call.name().to_string(),
                output: result.content.clone(),
                is_error: result.is_error,
            },
        )
        .await;

        turn.session.push(Message::tool_result(&result));
        turn.tool_results.push(result);
    }

    async fn inject_context(&self, retriever: &Retriever, turn: &mut Turn<'_>, query: &str, deadline: Instant) {
        if query.trim().is_empty() {
            return;
        }
        match timeout_at(deadline, retriever.retrieve(query)).await {
            Ok(Ok(chunks)) => {
                if let Some(context) = format_context(&chunks) {
                    debug!(chunks = chunks.len(), "Injecting retrieved context");
                    turn.session
                        .push(Message::system(context).with_metadata("retrieved", chunks.len().into()));
                    self.publish(DomainEvent::ContextRetrieved { count: chunks.len(), timestamp: Utc::now() });
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Retrieval failed; continuing without context");
                self.publish(DomainEvent::ErrorOccurred {
                    context: "retrieval".into(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
            Err(_) => warn!("Retrieval hit the session deadline; continuing without context"),
        }
    }

    fn advance(&self, turn: &mut Turn<'_>, next: AgentState) {
        debug_assert!(
            turn.state.can_transition_to(next),
            "illegal transition {} -> {}",
            turn.state,
            next
        );
        debug!(session_id = %turn.session.id(), from = %turn.state, to = %next, "State transition");
        self.publish(DomainEvent::StateChanged {
            session_id: turn.session.id().to_string(),
            from: turn.state,
            to: next,
        });
        turn.state = next;
        turn.transitions.push(next);
        turn.session.set_state(next);
    }

    /// Record a fatal error in history and move to `Error`.
    async fn fail(&self, turn: &mut Turn<'_>, err: Error) -> Error {
        error!(session_id = %turn.session.id(), state = %turn.state, error = %err, "Turn failed");
        turn.session
            .push(Message::assistant(format!("Error: {err}")).with_metadata("error", true.into()));
        self.advance(turn, AgentState::Error);
        self.publish(DomainEvent::ErrorOccurred {
            context: format!("session {}", turn.session.id()),
            error_message: err.to_string(),
            timestamp: Utc::now(),
        });
        emit(turn.sink, AgentStreamEvent::Error { message: err.to_string() }).await;
        err
    }

    async fn finish(&self, turn: Turn<'_>, answer: String, truncated: bool) -> TurnOutcome {
        info!(
            session_id = %turn.session.id(),
            generations = turn.generations,
            tool_calls = turn.tool_results.len(),
            truncated,
            "Turn finished"
        );
        self.publish(DomainEvent::TurnFinished {
            session_id: turn.session.id().to_string(),
            generations: turn.generations,
            truncated,
            timestamp: Utc::now(),
        });
        emit(
            turn.sink,
            AgentStreamEvent::Done {
                session_id: turn.session.id().to_string(),
                generations: turn.generations,
                tool_calls_made: turn.tool_results.len(),
                truncated,
            },
        )
        .await;

        TurnOutcome {
            answer,
            state: turn.state,
            transitions: turn.transitions,
            generations: turn.generations,
            strategies: turn.strategies,
            tool_results: turn.tool_results,
            truncated,
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

async fn emit(sink: Option<&mpsc::Sender<AgentStreamEvent>>, event: AgentStreamEvent) {
    if let Some(sink) = sink {
        let _ = sink.send(event).await;
    }
}
