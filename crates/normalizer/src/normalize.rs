//! The strategy chain.
//!
//! For text-producing backends the chain runs in strict priority order and
//! stops at the first strategy that yields a call:
//!
//! 1. sentinel markers for the backend family
//! 2. fenced code block tagged as JSON
//! 3. first balanced JSON value with a `name` key (low confidence)
//! 4. nothing found: the whole text is a plain answer
//!
//! Remote backends are never scraped; their calls come from the structured
//! response field only.

use serde::Serialize;
use tracing::{debug, warn};

use omnibridge_core::{BackendKind, RawOutput, SentinelMarkers, ToolDefinition};

use crate::call::{CallStatus, CanonicalToolCall, Strategy};
use crate::extract::{self, Extraction};

/// Non-fatal observations made while normalizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A block was located but its body was not JSON.
    UnparsableBlock { strategy: Strategy, span: (usize, usize) },
    /// An element of a call array had no tool name and was skipped.
    DroppedElement { strategy: Strategy, index: usize },
    /// Calls were only found by the lowest-confidence fallback.
    Ambiguous { strategy: Strategy },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnparsableBlock { strategy, span } => {
                write!(f, "{strategy}: block at {}..{} is not valid JSON", span.0, span.1)
            }
            Diagnostic::DroppedElement { strategy, index } => {
                write!(f, "{strategy}: element {index} has no tool name")
            }
            Diagnostic::Ambiguous { strategy } => {
                write!(f, "{strategy}: calls recovered by fallback scan only")
            }
        }
    }
}

/// Result of normalizing one [`RawOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Text left after removing matched call regions.
    pub text_remainder: String,
    /// Calls in emission order.
    pub calls: Vec<CanonicalToolCall>,
    /// Strategy that produced `calls`; `None` for a plain answer.
    pub strategy: Option<Strategy>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Normalized {
    fn plain(text: &str, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            text_remainder: text.to_string(),
            calls: Vec::new(),
            strategy: None,
            diagnostics,
        }
    }

    pub fn is_plain_answer(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &CanonicalToolCall> {
        self.calls.iter().filter(|c| c.status() == &CallStatus::Unresolved)
    }
}

/// Normalizes backend output into canonical calls.
#[derive(Debug, Clone)]
pub struct Normalizer {
    prompted: SentinelMarkers,
    native: SentinelMarkers,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(SentinelMarkers::default())
    }
}

impl Normalizer {
    /// Use `prompted` as the call markers for prompt-engineered backends.
    pub fn new(prompted: SentinelMarkers) -> Self {
        Self {
            prompted,
            native: SentinelMarkers::native(),
        }
    }

    pub fn with_native_markers(mut self, native: SentinelMarkers) -> Self {
        self.native = native;
        self
    }

    pub fn markers_for(&self, kind: BackendKind) -> Option<&SentinelMarkers> {
        match kind {
            BackendKind::Prompted => Some(&self.prompted),
            BackendKind::Native => Some(&self.native),
            BackendKind::Remote => None,
        }
    }

    pub fn normalize(&self, raw: &RawOutput, kind: BackendKind, tools: &[ToolDefinition]) -> Normalized {
        let normalized = match raw {
            RawOutput::Structured { text, tool_calls } if !tool_calls.is_empty() => {
                from_structured(text, tool_calls, tools)
            }
            _ => match self.markers_for(kind) {
                Some(markers) => from_text(raw.text(), markers, tools),
                None => Normalized::plain(raw.text(), Vec::new()),
            },
        };

        debug!(
            kind = %kind,
            strategy = normalized.strategy.map(|s| s.name()).unwrap_or("none"),
            calls = normalized.calls.len(),
            diagnostics = normalized.diagnostics.len(),
            "normalized backend output"
        );
        normalized
    }
}

/// Normalize with the default marker set.
pub fn normalize(raw: &RawOutput, kind: BackendKind, tools: &[ToolDefinition]) -> Normalized {
    Normalizer::default().normalize(raw, kind, tools)
}

fn from_structured(
    text: &str,
    tool_calls: &[omnibridge_core::ProviderToolCall],
    tools: &[ToolDefinition],
) -> Normalized {
    let calls = tool_calls
        .iter()
        .enumerate()
        .map(|(index, tc)| {
            let id = if tc.id.is_empty() { format!("call_{index}") } else { tc.id.clone() };
            let arguments = extract::parse_argument_string(&tc.arguments);
            build(id, tc.name.clone(), arguments, None, Strategy::Structured, tools)
        })
        .collect();

    Normalized {
        text_remainder: text.to_string(),
        calls,
        strategy: Some(Strategy::Structured),
        diagnostics: Vec::new(),
    }
}

fn from_text(text: &str, markers: &SentinelMarkers, tools: &[ToolDefinition]) -> Normalized {
    let mut diagnostics = Vec::new();

    let attempts: [(Strategy, &dyn Fn(&str) -> Extraction); 3] = [
        (Strategy::Sentinel, &|t: &str| extract::sentinel(t, &markers.call_open, &markers.call_close)),
        (Strategy::FencedBlock, &extract::fenced),
        (Strategy::BraceScan, &extract::brace_scan),
    ];

    for (strategy, run) in attempts {
        let extraction = run(text);
        diagnostics.extend(extraction.diagnostics);
        if extraction.candidates.is_empty() {
            continue;
        }

        if strategy == Strategy::BraceScan {
            warn!(strategy = %strategy, "tool calls recovered by fallback scan only");
            diagnostics.push(Diagnostic::Ambiguous { strategy });
        }

        let mut spans: Vec<(usize, usize)> = extraction.candidates.iter().map(|c| c.span).collect();
        spans.dedup();

        let calls = extraction
            .candidates
            .into_iter()
            .enumerate()
            .map(|(index, c)| build(format!("call_{index}"), c.name, c.arguments, Some(c.span), strategy, tools))
            .collect();

        return Normalized {
            text_remainder: strip_spans(text, &spans),
            calls,
            strategy: Some(strategy),
            diagnostics,
        };
    }

    Normalized::plain(text, diagnostics)
}

fn build(
    id: String,
    name: String,
    arguments: Result<serde_json::Map<String, serde_json::Value>, String>,
    span: Option<(usize, usize)>,
    strategy: Strategy,
    tools: &[ToolDefinition],
) -> CanonicalToolCall {
    let known = tools.iter().any(|t| t.name == name);
    let (arguments, status) = match (known, arguments) {
        (false, args) => (args.unwrap_or_default(), CallStatus::Unresolved),
        (true, Ok(args)) => (args, CallStatus::Resolved),
        (true, Err(reason)) => (serde_json::Map::new(), CallStatus::MalformedArguments(reason)),
    };
    if status == CallStatus::Unresolved {
        warn!(tool = %name, "model requested a tool that is not registered");
    }
    CanonicalToolCall::new(id, name, arguments, span, status, strategy)
}

/// Remove sorted, non-overlapping byte ranges and trim the result.
fn strip_spans(text: &str, spans: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for &(start, end) in spans {
        if start < cursor {
            continue;
        }
        out.push_str(&text[cursor..start]);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

/// Serialize calls back into the marker format a prompted model is asked to emit.
pub fn render_calls(calls: &[CanonicalToolCall], markers: &SentinelMarkers) -> String {
    let array: Vec<serde_json::Value> = calls
        .iter()
        .map(|c| {
            serde_json::json!({
                "name": c.name(),
                "arguments": serde_json::Value::Object(c.arguments().clone()),
            })
        })
        .collect();
    markers.wrap_calls(&serde_json::Value::Array(array).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnibridge_core::ProviderToolCall;
    use serde_json::json;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    fn text(s: &str) -> RawOutput {
        RawOutput::Text(s.to_string())
    }

    #[test]
    fn sentinel_call_is_extracted() {
        let raw = text(r#"Let me check.<|tool_call|>[{"name":"lookup","arguments":{"query":"x"}}]<|/tool_call|>"#);
        let n = normalize(&raw, BackendKind::Prompted, &[tool("lookup")]);

        assert_eq!(n.strategy, Some(Strategy::Sentinel));
        assert_eq!(n.calls.len(), 1);
        assert_eq!(n.calls[0].name(), "lookup");
        assert_eq!(n.calls[0].arguments()["query"], "x");
        assert_eq!(n.calls[0].id(), "call_0");
        assert!(n.calls[0].is_resolved());
        assert_eq!(n.text_remainder, "Let me check.");
    }

    #[test]
    fn normalization_is_deterministic() {
        let raw = text(
            r#"a <|tool_call|>[{"name":"b","arguments":{"z":1,"a":2}},{"name":"c","parameters":"{\"k\":true}"}]<|/tool_call|> ```json
{"name":"ignored"}
``` {"name":"also_ignored"}"#,
        );
        let tools = [tool("b"), tool("c")];
        let first = normalize(&raw, BackendKind::Prompted, &tools);
        for _ in 0..20 {
            assert_eq!(normalize(&raw, BackendKind::Prompted, &tools), first);
        }
    }

    #[test]
    fn sentinel_wins_over_fenced_block() {
        let raw = text(
            "```json\n[{\"name\":\"from_fence\",\"arguments\":{}}]\n```\n<|tool_call|>[{\"name\":\"from_marker\",\"arguments\":{}}]<|/tool_call|>",
        );
        let n = normalize(&raw, BackendKind::Prompted, &[tool("from_fence"), tool("from_marker")]);
        assert_eq!(n.strategy, Some(Strategy::Sentinel));
        let names: Vec<_> = n.calls.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["from_marker"]);
    }

    #[test]
    fn fenced_block_used_when_no_markers() {
        let raw = text("Calling:\n```json\n{\"function\": \"get_time\", \"parameters\": {}}\n```");
        let n = normalize(&raw, BackendKind::Prompted, &[tool("get_time")]);
        assert_eq!(n.strategy, Some(Strategy::FencedBlock));
        assert_eq!(n.text_remainder, "Calling:");
    }

    #[test]
    fn brace_scan_is_flagged_low_confidence() {
        let raw = text(r#"I'll do {"name": "get_time", "arguments": {}} now"#);
        let n = normalize(&raw, BackendKind::Prompted, &[tool("get_time")]);
        assert_eq!(n.strategy, Some(Strategy::BraceScan));
        assert!(n.diagnostics.contains(&Diagnostic::Ambiguous { strategy: Strategy::BraceScan }));
        assert_eq!(n.calls[0].strategy(), Strategy::BraceScan);
    }

    #[test]
    fn malformed_output_is_plain_answer() {
        let body = "I could not {quite} figure out [what] you meant.";
        let n = normalize(&text(body), BackendKind::Prompted, &[tool("x")]);
        assert!(n.is_plain_answer());
        assert_eq!(n.strategy, None);
        assert_eq!(n.text_remainder, body);
    }

    #[test]
    fn round_trip_through_markers() {
        let markers = SentinelMarkers::default();
        let tools = [tool("lookup")];
        let source = markers.wrap_calls(r#"[{"name":"lookup","arguments":{"query":"x"}}]"#);
        let first = normalize(&text(&source), BackendKind::Prompted, &tools);

        let rendered = render_calls(&first.calls, &markers);
        assert!(rendered.starts_with(&markers.call_open) && rendered.ends_with(&markers.call_close));
        let second = normalize(&text(&rendered), BackendKind::Prompted, &tools);
        assert_eq!(second.calls, first.calls);
    }

    #[test]
    fn custom_markers() {
        let normalizer = Normalizer::new(SentinelMarkers::default().with_call_markers("<call>", "</call>"));
        let raw = text(r#"<call>[{"name":"book_flight","arguments":{"destination":"Paris"}}]</call>"#);
        let n = normalizer.normalize(&raw, BackendKind::Prompted, &[tool("book_flight")]);
        assert_eq!(n.strategy, Some(Strategy::Sentinel));
        assert_eq!(n.calls[0].arguments()["destination"], "Paris");
        assert_eq!(n.text_remainder, "");
    }

    #[test]
    fn native_markers_for_native_kind() {
        let raw = text("<tool_call>\n{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Oslo\"}}\n</tool_call>");
        let n = normalize(&raw, BackendKind::Native, &[tool("get_weather")]);
        assert_eq!(n.strategy, Some(Strategy::Sentinel));
        assert_eq!(n.calls[0].arguments()["city"], "Oslo");

        // prompted markers are not native markers; only the fallback scan recovers the call
        let prompted = text(r#"<|tool_call|>[{"name":"get_weather","arguments":{}}]<|/tool_call|>"#);
        let n = normalize(&prompted, BackendKind::Native, &[tool("get_weather")]);
        assert_eq!(n.strategy, Some(Strategy::BraceScan));
    }

    #[test]
    fn unknown_name_is_retained_unresolved() {
        let raw = text(r#"<|tool_call|>[{"name":"teleport","arguments":{}}]<|/tool_call|>"#);
        let n = normalize(&raw, BackendKind::Prompted, &[tool("lookup")]);
        assert_eq!(n.calls.len(), 1);
        assert_eq!(n.calls[0].status(), &CallStatus::Unresolved);
        assert_eq!(n.unresolved().count(), 1);
    }

    #[test]
    fn bad_argument_string_is_malformed() {
        let raw = text(r#"<|tool_call|>[{"name":"lookup","arguments":"{not json"}]<|/tool_call|>"#);
        let n = normalize(&raw, BackendKind::Prompted, &[tool("lookup")]);
        assert!(matches!(n.calls[0].status(), CallStatus::MalformedArguments(_)));
        assert!(n.calls[0].arguments().is_empty());
    }

    #[test]
    fn remote_reads_structured_field_only() {
        let raw = RawOutput::Structured {
            text: r#"ignore {"name":"scraped"}"#.into(),
            tool_calls: vec![ProviderToolCall {
                id: "call_abc".into(),
                name: "lookup".into(),
                arguments: r#"{"query":"x"}"#.into(),
            }],
        };
        let n = normalize(&raw, BackendKind::Remote, &[tool("lookup"), tool("scraped")]);
        assert_eq!(n.strategy, Some(Strategy::Structured));
        assert_eq!(n.calls.len(), 1);
        assert_eq!(n.calls[0].id(), "call_abc");
        assert!(n.calls[0].raw_span().is_none());
    }

    #[test]
    fn remote_text_is_never_scraped() {
        let body = r#"<|tool_call|>[{"name":"lookup","arguments":{}}]<|/tool_call|>"#;
        let n = normalize(&text(body), BackendKind::Remote, &[tool("lookup")]);
        assert!(n.is_plain_answer());
        assert_eq!(n.text_remainder, body);
    }

    #[test]
    fn multiple_calls_keep_emission_order() {
        let raw = text(
            r#"<|tool_call|>[{"name":"a","arguments":{}},{"name":"b","arguments":{}}]<|/tool_call|><|tool_call|>{"name":"c"}<|/tool_call|>"#,
        );
        let n = normalize(&raw, BackendKind::Prompted, &[tool("a"), tool("b"), tool("c")]);
        let ids: Vec<_> = n.calls.iter().map(|c| (c.id(), c.name())).collect();
        assert_eq!(ids, vec![("call_0", "a"), ("call_1", "b"), ("call_2", "c")]);
        assert_eq!(n.calls[0].raw_span(), n.calls[1].raw_span());
    }
}
