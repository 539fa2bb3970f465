//! Text extraction strategies.
//!
//! Each function scans generated text for one call convention and returns
//! the candidate calls it found with the byte span they came from. None of
//! them decide priority; that lives in [`crate::Normalizer`].

use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::call::Strategy;
use crate::normalize::Diagnostic;

/// A call shape found in text, before name validation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub name: String,
    pub arguments: Result<Map<String, Value>, String>,
    pub span: (usize, usize),
}

#[derive(Debug, Default)]
pub(crate) struct Extraction {
    pub candidates: Vec<Candidate>,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Sentinel markers ──

/// Every `open … close` region, in order. A trailing open marker with no
/// close runs to the end of the text.
pub(crate) fn sentinel(text: &str, open: &str, close: &str) -> Extraction {
    let mut out = Extraction::default();
    if open.is_empty() || close.is_empty() {
        return out;
    }

    let mut pos = 0;
    while let Some(found) = text[pos..].find(open) {
        let start = pos + found;
        let body_start = start + open.len();
        let (body_end, span_end) = match text[body_start..].find(close) {
            Some(rel) => (body_start + rel, body_start + rel + close.len()),
            None => (text.len(), text.len()),
        };
        pos = span_end;

        let body = &text[body_start..body_end];
        match parse_block(body) {
            Some(value) => collect(&value, (start, span_end), Strategy::Sentinel, &mut out),
            None => {
                warn!(strategy = "sentinel", "call block is not valid JSON");
                out.diagnostics.push(Diagnostic::UnparsableBlock {
                    strategy: Strategy::Sentinel,
                    span: (start, span_end),
                });
            }
        }

        if pos >= text.len() {
            break;
        }
    }
    out
}

// ── Fenced code blocks ──

static FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_-]*)[^\n]*\n(.*?)```").ok());

/// Fenced blocks tagged as structured data. Untagged blocks qualify when
/// their body starts like JSON.
pub(crate) fn fenced(text: &str) -> Extraction {
    let mut out = Extraction::default();
    let Some(re) = FENCE.as_ref() else {
        return out;
    };

    for caps in re.captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let tag = caps.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
        let trimmed = body.as_str().trim_start();
        let qualifies = match tag.as_str() {
            "json" | "tool_call" | "tool_calls" | "json5" => true,
            "" => trimmed.starts_with('{') || trimmed.starts_with('['),
            _ => false,
        };
        if !qualifies {
            continue;
        }

        let span = (whole.start(), whole.end());
        match parse_block(body.as_str()) {
            Some(value) => collect(&value, span, Strategy::FencedBlock, &mut out),
            None => out.diagnostics.push(Diagnostic::UnparsableBlock {
                strategy: Strategy::FencedBlock,
                span,
            }),
        }
    }
    out
}

// ── Balanced brace scan ──

/// The first balanced `{…}` or `[…]` region that parses as JSON and holds
/// at least one call shape. Later regions are not considered.
pub(crate) fn brace_scan(text: &str) -> Extraction {
    let bytes = text.as_bytes();
    let mut ends: Vec<Option<Option<usize>>> = vec![None; bytes.len()];

    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' && b != b'[' {
            continue;
        }
        if ends[start].is_none() {
            scan_regions(bytes, start, &mut ends);
        }
        let Some(Some(end)) = ends[start] else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text[start..end]) else {
            continue;
        };
        let mut attempt = Extraction::default();
        collect(&value, (start, end), Strategy::BraceScan, &mut attempt);
        if !attempt.candidates.is_empty() {
            return attempt;
        }
    }
    Extraction::default()
}

/// Resolve the region opening at `start` together with every opener the
/// same pass reaches outside a string literal, since a scan from any of
/// those would retrace this one. `ends[p]` becomes `Some(Some(end))` for a
/// region closing at `end` and `Some(None)` for one that never balances.
fn scan_regions(bytes: &[u8], start: usize, ends: &mut [Option<Option<usize>>]) {
    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push((b'}', i)),
            b'[' => stack.push((b']', i)),
            b'}' | b']' => {
                let Some((close, open)) = stack.pop() else {
                    return;
                };
                if close != b {
                    // A mismatched closer aborts every region still open.
                    ends[open] = Some(None);
                    break;
                }
                ends[open] = Some(Some(i + 1));
                if stack.is_empty() {
                    return;
                }
            }
            _ => {}
        }
    }
    for (_, open) in stack {
        ends[open] = Some(None);
    }
}

/// End offset (exclusive) of the bracket region opening at `start`.
/// String literals and escapes are skipped; mismatched closers abort.
pub(crate) fn find_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Shape handling ──

/// Parse a block body as JSON, tolerating prose or a code fence around it.
fn parse_block(body: &str) -> Option<Value> {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let bytes = trimmed.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let end = find_balanced(bytes, start)?;
    serde_json::from_str::<Value>(&trimmed[start..end]).ok()
}

fn collect(value: &Value, span: (usize, usize), strategy: Strategy, out: &mut Extraction) {
    match value {
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                match item.as_object().and_then(|obj| candidate(obj, span)) {
                    Some(c) => out.candidates.push(c),
                    None => {
                        // Brace scan only reports hits, so misses there are not worth logging.
                        if strategy != Strategy::BraceScan {
                            warn!(strategy = %strategy, index, "dropping element without a tool name");
                            out.diagnostics.push(Diagnostic::DroppedElement { strategy, index });
                        }
                    }
                }
            }
        }
        Value::Object(obj) => match candidate(obj, span) {
            Some(c) => out.candidates.push(c),
            None if strategy != Strategy::BraceScan => {
                warn!(strategy = %strategy, "dropping object without a tool name");
                out.diagnostics.push(Diagnostic::DroppedElement { strategy, index: 0 });
            }
            None => {}
        },
        _ => {
            if strategy != Strategy::BraceScan {
                out.diagnostics.push(Diagnostic::DroppedElement { strategy, index: 0 });
            }
        }
    }
}

/// Accepts `{name, arguments}`, `{name, parameters}`, `{function: name, parameters}`
/// and the OpenAI-style `{function: {name, arguments}}`.
fn candidate(obj: &Map<String, Value>, span: (usize, usize)) -> Option<Candidate> {
    if let Some(Value::Object(inner)) = obj.get("function") {
        return candidate(inner, span);
    }
    let name = obj
        .get("name")
        .or_else(|| obj.get("function"))
        .and_then(Value::as_str)?
        .trim();
    if name.is_empty() {
        return None;
    }
    let raw = obj.get("arguments").or_else(|| obj.get("parameters"));
    Some(Candidate {
        name: name.to_string(),
        arguments: parse_arguments(raw),
        span,
    })
}

pub(crate) fn parse_arguments(raw: Option<&Value>) -> Result<Map<String, Value>, String> {
    match raw {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(s)) => parse_argument_string(s),
        Some(other) => Err(format!("arguments must be an object, got {}", json_type(other))),
    }
}

/// Arguments delivered as a JSON-encoded string (OpenAI style, or models imitating it).
pub(crate) fn parse_argument_string(s: &str) -> Result<Map<String, Value>, String> {
    if s.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("arguments must be an object, got {}", json_type(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
