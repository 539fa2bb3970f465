//! End-to-end tests for the OmniBridge runtime.
//!
//! These wire the pieces the `chat` command wires (config, retrieval, MCP
//! client, normalizer, agent loop) with a scripted backend and an in-process
//! MCP server, and follow one user turn through all of them.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use omnibridge_agent::{AgentLoop, Session, truncation_notice};
use omnibridge_config::AppConfig;
use omnibridge_core::{
    Backend, BackendError, BackendKind, GenerateConfig, Message, RawOutput, Role, ToolDefinition, ToolError,
};
use omnibridge_mcp::{ToolProtocolClient, Transport};
use omnibridge_retrieval::{Document, Retriever};
use serde_json::{Value, json};

// ── In-process MCP server ────────────────────────────────────────────────

/// Speaks just enough MCP for a travel desk: `book_flight` and `cancel_flight`.
struct TravelServer {
    calls: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl Transport for TravelServer {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "travel", "version": "1.0"}
            })),
            "tools/list" => Ok(json!({
                "tools": [
                    {
                        "name": "book_flight",
                        "description": "Book a flight",
                        "inputSchema": {
                            "type": "object",
                            "properties": {"destination": {"type": "string"}},
                            "required": ["destination"]
                        }
                    },
                    {"name": "cancel_flight", "description": "Cancel a booking"}
                ]
            })),
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                self.calls.lock().unwrap().push(params.clone());
                let destination = params["arguments"]["destination"].as_str().unwrap_or("?");
                Ok(match params["name"].as_str() {
                    Some("book_flight") => json!({
                        "content": [{"type": "text", "text": format!("Booked flight to {destination}")}]
                    }),
                    _ => json!({
                        "content": [{"type": "text", "text": "No booking to cancel"}],
                        "isError": true
                    }),
                })
            }
            other => Err(ToolError::Rpc { code: -32601, message: format!("Method not found: {other}") }),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), ToolError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ToolError> {
        Ok(())
    }
}

// ── Scripted backend ─────────────────────────────────────────────────────

struct ScriptedBackend {
    replies: Mutex<VecDeque<String>>,
    repeat_last: bool,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedBackend {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            repeat_last: false,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn forever(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::from([reply.to_string()])),
            repeat_last: true,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Prompted
    }

    async fn generate(
        &self,
        history: &[Message],
        _tools: &[ToolDefinition],
        _config: &GenerateConfig,
    ) -> Result<RawOutput, BackendError> {
        self.seen.lock().unwrap().push(history.to_vec());
        let mut replies = self.replies.lock().unwrap();
        let reply = if self.repeat_last {
            replies.front().cloned()
        } else {
            replies.pop_front()
        };
        reply
            .map(RawOutput::Text)
            .ok_or_else(|| BackendError::Unavailable("script exhausted".into()))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn load_config(dir: &tempfile::TempDir, extra: &str) -> AppConfig {
    let path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"
[backend]
kind = "prompted"
model = "phi-4-mini"

[backend.local.markers]
call_open = "<call>"
call_close = "</call>"

[retrieval]
enabled = true
encoder = "hashing"
dimensions = 128
top_k = 1
store_path = "{}"

{extra}
"#,
        dir.path().join("vectors.json").display()
    )
    .unwrap();
    AppConfig::load_from(&path).unwrap()
}

async fn travel_client(config: &AppConfig) -> (Arc<ToolProtocolClient>, Arc<Mutex<Vec<Value>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let client = ToolProtocolClient::new(&config.mcp);
    client
        .attach("travel", Box::new(TravelServer { calls: calls.clone() }))
        .await
        .expect("handshake should succeed");
    (Arc::new(client), calls)
}

async fn agent_for(config: &AppConfig, backend: Arc<ScriptedBackend>, client: Arc<ToolProtocolClient>) -> AgentLoop {
    let store_path = config.retrieval.store_path.clone().unwrap();
    let retriever = Retriever::from_config(&config.retrieval, "http://unused", None, &store_path)
        .await
        .unwrap();
    retriever
        .add_documents(vec![
            Document::new("The traveller prefers aisle seats on flights to Paris.").with_source("prefs.md"),
            Document::new("Quarterly budget review is due on Friday.").with_source("work.md"),
        ])
        .await
        .unwrap();

    AgentLoop::new(backend, client, GenerateConfig::new(config.backend.model.clone()))
        .with_settings(config.agent.clone())
        .with_markers(config.backend.local.markers.clone())
        .with_retriever(Arc::new(retriever))
}

// ── E2E ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_book_flight_through_mcp_with_retrieved_context() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&dir, "");
    let (client, calls) = travel_client(&config).await;
    let backend = ScriptedBackend::new(&[
        r#"<call>[{"name": "book_flight", "arguments": {"destination": "Paris"}}]</call>"#,
        "Done: you are booked to Paris, aisle seat requested.",
    ]);
    let agent = agent_for(&config, backend.clone(), client.clone()).await;
    let mut session = Session::new();

    let outcome = agent
        .run_turn(&mut session, Message::user("Book my usual flight to Paris"))
        .await
        .expect("turn should succeed");

    assert_eq!(outcome.answer, "Done: you are booked to Paris, aisle seat requested.");
    assert_eq!(outcome.generations, 2);

    let recorded = calls.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0]["name"], "book_flight");
    assert_eq!(recorded[0]["arguments"]["destination"], "Paris");

    let history = session.history();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert!(history[0].text().contains("aisle seats"));
    assert_eq!(history[3].text(), "Booked flight to Paris");
    assert!(!history[3].is_error());

    // The first generation already saw the retrieved context.
    let seen = backend.seen.lock().unwrap().clone();
    assert_eq!(seen[0][0].role, Role::System);

    client.disconnect().await;
    assert!(client.servers().await.is_empty());
}

#[tokio::test]
async fn e2e_server_side_tool_error_reaches_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&dir, "");
    let (client, _calls) = travel_client(&config).await;
    let backend = ScriptedBackend::new(&[
        r#"<call>[{"name": "cancel_flight", "arguments": {}}]</call>"#,
        "There was nothing to cancel.",
    ]);
    let agent = agent_for(&config, backend.clone(), client).await;
    let mut session = Session::new();

    let outcome = agent.run_turn(&mut session, Message::user("cancel my booking")).await.unwrap();
    assert_eq!(outcome.answer, "There was nothing to cancel.");
    assert!(outcome.tool_results[0].is_error);
    assert_eq!(outcome.tool_results[0].content, "No booking to cancel");

    let seen = backend.seen.lock().unwrap().clone();
    let tool_message = seen[1].iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_message.is_error());
}

#[tokio::test]
async fn e2e_configured_budget_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&dir, "[agent]\nmax_turns = 2\n");
    let (client, calls) = travel_client(&config).await;
    let backend = ScriptedBackend::forever(r#"<call>[{"name": "book_flight", "arguments": {"destination": "Lima"}}]</call>"#);
    let agent = agent_for(&config, backend, client).await;
    let mut session = Session::new();

    let outcome = agent.run_turn(&mut session, Message::user("book again and again")).await.unwrap();
    assert!(outcome.truncated);
    assert_eq!(outcome.generations, 2);
    assert_eq!(calls.lock().unwrap().len(), 2);
    assert_eq!(session.history().last().unwrap().text(), truncation_notice(2));
}

#[tokio::test]
async fn e2e_fenced_json_recovered_without_sentinels() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(&dir, "");
    let (client, calls) = travel_client(&config).await;
    let backend = ScriptedBackend::new(&[
        "```json\n{\"name\": \"book_flight\", \"arguments\": {\"destination\": \"Oslo\"}}\n```",
        "Booked Oslo.",
    ]);
    let agent = agent_for(&config, backend, client).await;
    let mut session = Session::new();

    let outcome = agent.run_turn(&mut session, Message::user("fly me to Oslo")).await.unwrap();
    assert_eq!(outcome.strategies[0].map(|s| s.name()), Some("fenced_block"));
    assert_eq!(calls.lock().unwrap()[0]["arguments"]["destination"], "Oslo");
}
