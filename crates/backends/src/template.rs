//! Prompt rendering for locally hosted models.
//!
//! A local model sees one flat string. The dialect decides how roles, tool
//! schemas, earlier tool calls, and tool results are spelled in it:
//!
//! - [`PromptDialect::Phi`]: `<|system|>…<|end|>` turns, tool schemas inside
//!   the schema markers, calls requested inside the call markers.
//! - [`PromptDialect::ChatMl`]: `<|im_start|>role … <|im_end|>` turns with a
//!   Hermes-style `<tools>` section and `<tool_call>` replies.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use omnibridge_core::message::{ContentPart, MessageContent};
use omnibridge_core::{BackendError, ImageFrame, Message, MessageToolCall, Role, SentinelMarkers, ToolDefinition};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDialect {
    Phi,
    ChatMl,
}

impl PromptDialect {
    /// The end-of-turn token a model of this dialect emits.
    pub fn end_of_turn(&self) -> &'static str {
        match self {
            PromptDialect::Phi => "<|end|>",
            PromptDialect::ChatMl => "<|im_end|>",
        }
    }
}

/// A rendered prompt plus the images its placeholders refer to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedPrompt {
    pub text: String,
    pub images: Vec<ImageFrame>,
}

/// Render `history` and `tools` in `dialect`, ending with an open assistant turn.
pub fn render(
    dialect: PromptDialect,
    markers: &SentinelMarkers,
    history: &[Message],
    tools: &[ToolDefinition],
) -> Result<RenderedPrompt, BackendError> {
    let mut out = RenderedPrompt::default();
    let preamble = match dialect {
        PromptDialect::Phi => phi_tool_preamble(markers, tools),
        PromptDialect::ChatMl => hermes_tool_preamble(markers, tools),
    };

    // Tool instructions ride on the first system turn, or open the prompt.
    let mut pending_preamble = preamble;
    if !history.iter().any(|m| m.role == Role::System) {
        if let Some(p) = pending_preamble.take() {
            push_turn(&mut out.text, dialect, Role::System, &p);
        }
    }

    for msg in history {
        let body = match msg.role {
            Role::System => {
                let mut body = msg.text();
                if let Some(p) = pending_preamble.take() {
                    body.push_str("\n\n");
                    body.push_str(&p);
                }
                body
            }
            Role::User => user_body(dialect, &msg.content, &mut out.images)?,
            Role::Assistant => {
                let mut body = msg.text();
                if !msg.tool_calls.is_empty() {
                    body.push_str(&render_calls(dialect, markers, &msg.tool_calls));
                }
                body
            }
            Role::Tool => match dialect {
                PromptDialect::Phi => format!("<|tool_result|>{}<|/tool_result|>", msg.text()),
                PromptDialect::ChatMl => format!("<tool_response>\n{}\n</tool_response>", msg.text()),
            },
        };
        push_turn(&mut out.text, dialect, msg.role, &body);
    }

    match dialect {
        PromptDialect::Phi => out.text.push_str("<|assistant|>"),
        PromptDialect::ChatMl => out.text.push_str("<|im_start|>assistant\n"),
    }
    Ok(out)
}

fn push_turn(prompt: &mut String, dialect: PromptDialect, role: Role, body: &str) {
    match dialect {
        PromptDialect::Phi => {
            // Phi has no tool role; results are fed back as a user turn.
            let tag = match role {
                Role::System => "<|system|>",
                Role::User | Role::Tool => "<|user|>",
                Role::Assistant => "<|assistant|>",
            };
            prompt.push_str(tag);
            prompt.push_str(body);
            prompt.push_str("<|end|>");
        }
        PromptDialect::ChatMl => {
            let role = match role {
                Role::Tool => "user",
                other => other.as_str(),
            };
            prompt.push_str("<|im_start|>");
            prompt.push_str(role);
            prompt.push('\n');
            prompt.push_str(body);
            prompt.push_str("<|im_end|>\n");
        }
    }
}

fn user_body(dialect: PromptDialect, content: &MessageContent, images: &mut Vec<ImageFrame>) -> Result<String, BackendError> {
    let parts = match content {
        MessageContent::Text(t) => return Ok(t.clone()),
        MessageContent::Parts(parts) => parts,
    };

    let mut placeholders = String::new();
    let mut text = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text: t } => text.push(t.as_str()),
            ContentPart::Image { mime_type, data } => {
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| BackendError::InvalidInput(format!("image part is not valid base64: {e}")))?;
                images.push(ImageFrame { mime_type: mime_type.clone(), bytes });
                match dialect {
                    PromptDialect::Phi => placeholders.push_str(&format!("<|image_{}|>", images.len())),
                    PromptDialect::ChatMl => placeholders.push_str("<|vision_start|><|image_pad|><|vision_end|>"),
                }
            }
        }
    }
    Ok(format!("{placeholders}{}", text.join("\n")))
}

fn phi_tool_preamble(markers: &SentinelMarkers, tools: &[ToolDefinition]) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    let mut s = String::from("You can call the following tools:\n");
    for tool in tools {
        s.push_str(&markers.wrap_schema(&schema_json(tool).to_string()));
        s.push('\n');
    }
    s.push_str(&format!(
        "To call tools, reply with a JSON array of {{\"name\": <tool name>, \"arguments\": {{...}}}} objects \
         wrapped in {open} and {close}, for example {open}[{{\"name\": \"tool\", \"arguments\": {{\"key\": \"value\"}}}}]{close}. \
         Put several calls in the same array. Follow each tool's JSON schema and do not invent arguments.",
        open = markers.call_open,
        close = markers.call_close,
    ));
    Some(s)
}

fn hermes_tool_preamble(markers: &SentinelMarkers, tools: &[ToolDefinition]) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    let listing = tools
        .iter()
        .map(|t| serde_json::json!({ "type": "function", "function": schema_json(t) }).to_string())
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!(
        "# Tools\n\nYou may call one or more functions to assist with the user query.\n\n\
         You are provided with function signatures within {schema_open}{schema_close} XML tags:\n\
         {schema_open}\n{listing}\n{schema_close}\n\n\
         For each function call, return a json object with function name and arguments within \
         {call_open}{call_close} XML tags:\n{call_open}\n{{\"name\": <function-name>, \"arguments\": <args-json-object>}}\n{call_close}",
        schema_open = markers.schema_open,
        schema_close = markers.schema_close,
        call_open = markers.call_open,
        call_close = markers.call_close,
    ))
}

fn schema_json(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

/// Earlier assistant calls, spelled the way the model is asked to write them.
fn render_calls(dialect: PromptDialect, markers: &SentinelMarkers, calls: &[MessageToolCall]) -> String {
    let as_json = |c: &MessageToolCall| {
        let arguments = serde_json::from_str::<Value>(&c.arguments).unwrap_or_else(|_| Value::String(c.arguments.clone()));
        serde_json::json!({ "name": c.name, "arguments": arguments })
    };
    match dialect {
        PromptDialect::Phi => {
            let array = Value::Array(calls.iter().map(as_json).collect());
            markers.wrap_calls(&array.to_string())
        }
        PromptDialect::ChatMl => calls
            .iter()
            .map(|c| format!("\n{}", markers.wrap_calls(&format!("\n{}\n", as_json(c)))))
            .collect(),
    }
}
