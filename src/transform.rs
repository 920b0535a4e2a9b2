//! Streaming response transformation
//!
//! Rewrites the backend's token stream in flight, one SSE event at a time:
//!
//! * thinking spans (`<think>`...`</think>`) are routed out of the visible
//!   `content` field into `reasoning_content`, with tags that arrive split
//!   across any number of deltas handled by a held-back partial-tag buffer;
//! * structured tool-call fragments with missing function names are
//!   repaired from accumulated hints;
//! * models that only describe tool calls in free text get one synthetic
//!   tool-call chunk at end of stream, reconstructed by a fixed priority
//!   list of convention parsers.
//!
//! A malformed JSON fragment never aborts the response: that chunk passes
//! through untouched and the stream continues.

use crate::sse::SseEventStream;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, trace};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Parser state spanning one client-facing streamed response.
#[derive(Debug, Default)]
pub struct StreamParseState {
    in_thinking: bool,
    /// Trailing text withheld because it may be the start of a split tag
    pending: String,
    /// All visible text seen so far (fallback tool-call parsing needs it)
    text_buf: String,
    reasoning_buf: String,
    /// Accumulated structured tool-call argument fragments
    args_buf: String,
    resolved_tool_name: Option<String>,
    /// A structured tool call arrived on some delta
    saw_structured_tool: bool,
    synth_counter: u32,
    last_id: Option<String>,
    last_model: Option<String>,
    last_created: Option<u64>,
}

impl StreamParseState {
    /// Split one delta's visible text into (visible, reasoning), updating
    /// the in-span flag and holding back a trailing partial tag.
    fn split_thinking(&mut self, input: &str) -> (String, String) {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(input);

        let mut visible = String::new();
        let mut reasoning = String::new();
        let mut rest = text.as_str();

        loop {
            let tag = if self.in_thinking { THINK_CLOSE } else { THINK_OPEN };
            match rest.find(tag) {
                Some(pos) => {
                    let before = &rest[..pos];
                    if self.in_thinking {
                        reasoning.push_str(before);
                    } else {
                        visible.push_str(before);
                    }
                    self.in_thinking = !self.in_thinking;
                    rest = &rest[pos + tag.len()..];
                }
                None => {
                    let hold = partial_tag_suffix(rest, tag);
                    let emit = &rest[..rest.len() - hold];
                    if self.in_thinking {
                        reasoning.push_str(emit);
                    } else {
                        visible.push_str(emit);
                    }
                    self.pending = rest[rest.len() - hold..].to_string();
                    break;
                }
            }
        }

        self.text_buf.push_str(&visible);
        self.reasoning_buf.push_str(&reasoning);
        (visible, reasoning)
    }

    /// Rewrite one `data:` chunk in place. Returns false when the chunk is
    /// not a recognizable completion chunk and should pass through.
    fn process_chunk(&mut self, chunk: &mut Value) -> bool {
        if !chunk.get("choices").is_some_and(Value::is_array) {
            return false;
        }

        if let Some(id) = chunk_field_str(chunk, "id") {
            self.last_id = Some(id);
        }
        if let Some(model) = chunk_field_str(chunk, "model") {
            self.last_model = Some(model);
        }
        if let Some(created) = chunk.get("created").and_then(Value::as_u64) {
            self.last_created = Some(created);
        }

        let Some(choices) = chunk.get_mut("choices").and_then(Value::as_array_mut) else {
            return false;
        };
        for choice in choices {
            let Some(delta) = choice.get_mut("delta") else {
                continue;
            };
            self.process_delta(delta);
        }
        true
    }

    fn process_delta(&mut self, delta: &mut Value) {
        // Backend-provided reasoning is accumulated as-is.
        if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str) {
            self.reasoning_buf.push_str(reasoning);
        }

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            let owned = content.to_string();
            let (visible, reasoning) = self.split_thinking(&owned);

            delta["content"] = if visible.is_empty() {
                Value::Null
            } else {
                Value::String(visible)
            };
            if !reasoning.is_empty() {
                let merged = match delta.get("reasoning_content").and_then(Value::as_str) {
                    Some(existing) => format!("{existing}{reasoning}"),
                    None => reasoning,
                };
                delta["reasoning_content"] = Value::String(merged);
            }
        }

        let Some(tool_calls) = delta.get_mut("tool_calls").and_then(Value::as_array_mut) else {
            return;
        };
        if tool_calls.is_empty() {
            return;
        }
        self.saw_structured_tool = true;

        for call in tool_calls {
            if !call.is_object() {
                continue;
            }
            if let Some(fragment) = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
            {
                self.args_buf.push_str(fragment);
            }

            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if name.is_empty() {
                if let Some(recovered) = self.recover_tool_name() {
                    debug!(name = %recovered, "repaired empty tool-call name");
                    call["function"]["name"] = Value::String(recovered.clone());
                    self.resolved_tool_name = Some(recovered);
                }
            } else {
                self.resolved_tool_name = Some(name.to_string());
            }
        }
    }

    /// Recover a missing function name from a trailing `<tool_name>` hint or
    /// from JSON-looking text accumulated so far.
    fn recover_tool_name(&self) -> Option<String> {
        if let Some(name) = &self.resolved_tool_name {
            return Some(name.clone());
        }
        if let Some(name) = extract_tag(&self.text_buf, "tool_name") {
            return Some(name.trim().to_string());
        }
        find_json_string_field(&self.args_buf, "name")
            .or_else(|| find_json_string_field(&self.text_buf, "name"))
    }

    /// At end of stream any withheld partial tag turned out to be plain
    /// text; emit it as one final chunk so no characters are lost.
    fn flush_pending(&mut self) -> Option<Value> {
        if self.pending.is_empty() {
            return None;
        }
        let held = std::mem::take(&mut self.pending);
        let delta = if self.in_thinking {
            self.reasoning_buf.push_str(&held);
            json!({ "content": null, "reasoning_content": held })
        } else {
            self.text_buf.push_str(&held);
            json!({ "content": held })
        };
        Some(json!({
            "id": self.last_id.clone().unwrap_or_else(|| "chatcmpl-synth".to_string()),
            "object": "chat.completion.chunk",
            "created": self.last_created.unwrap_or_default(),
            "model": self.last_model.clone().unwrap_or_default(),
            "choices": [{ "index": 0, "delta": delta, "finish_reason": null }]
        }))
    }

    /// End-of-stream fallback: reconstruct tool calls from the accumulated
    /// free text if no structured call was ever observed.
    fn synthesize_tool_calls(&mut self) -> Option<Value> {
        if self.saw_structured_tool {
            return None;
        }

        let text = std::mem::take(&mut self.text_buf);

        // Most specific convention first; first success wins.
        let parsers: [fn(&str) -> Option<Vec<SynthesizedCall>>; 3] = [
            parse_mcp_tool_blocks,
            parse_tool_call_blocks,
            parse_bare_json_tool,
        ];
        let calls = parsers.iter().find_map(|parser| parser(&text))?;

        let tool_calls: Vec<Value> = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                self.synth_counter += 1;
                json!({
                    "index": index,
                    "id": format!("call_{}", self.synth_counter),
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments,
                    }
                })
            })
            .collect();

        debug!(count = tool_calls.len(), "synthesized tool calls from free text");
        Some(json!({
            "id": self.last_id.clone().unwrap_or_else(|| "chatcmpl-synth".to_string()),
            "object": "chat.completion.chunk",
            "created": self.last_created.unwrap_or_default(),
            "model": self.last_model.clone().unwrap_or_default(),
            "choices": [{
                "index": 0,
                "delta": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": tool_calls,
                },
                "finish_reason": "tool_calls",
            }]
        }))
    }
}

fn chunk_field_str(chunk: &Value, field: &str) -> Option<String> {
    chunk.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Length of the longest strict prefix of `tag` that `s` ends with.
fn partial_tag_suffix(s: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(s.len());
    (1..=max).rev().find(|&k| s.ends_with(&tag[..k])).unwrap_or(0)
}

/// Contents of the first `<tag>...</tag>` pair in `s`.
fn extract_tag<'a>(s: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = s.find(&open)? + open.len();
    let end = s[start..].find(&close)? + start;
    Some(&s[start..end])
}

/// Value of `"field": "..."` in JSON-looking text, without full parsing.
fn find_json_string_field(s: &str, field: &str) -> Option<String> {
    let key = format!("\"{field}\"");
    let mut search = s;
    loop {
        let at = search.find(&key)?;
        let rest = search[at + key.len()..].trim_start();
        if let Some(rest) = rest.strip_prefix(':') {
            let rest = rest.trim_start();
            if let Some(rest) = rest.strip_prefix('"') {
                let end = rest.find('"')?;
                return Some(rest[..end].to_string());
            }
        }
        search = &search[at + key.len()..];
    }
}

#[derive(Debug, PartialEq)]
struct SynthesizedCall {
    name: String,
    /// JSON-encoded argument object, as a string
    arguments: String,
}

/// `<use_mcp_tool><server_name>s</server_name><tool_name>t</tool_name>
/// <arguments>{...}</arguments></use_mcp_tool>` convention.
fn parse_mcp_tool_blocks(text: &str) -> Option<Vec<SynthesizedCall>> {
    let mut calls = Vec::new();
    let mut rest = text;
    while let Some(block) = extract_tag(rest, "use_mcp_tool") {
        let name = extract_tag(block, "tool_name")?.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let arguments = extract_tag(block, "arguments")
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or("{}")
            .to_string();
        calls.push(SynthesizedCall { name, arguments });

        let close = "</use_mcp_tool>";
        let advance = rest.find(close)? + close.len();
        rest = &rest[advance..];
    }
    (!calls.is_empty()).then_some(calls)
}

/// `<tool_call>{"name": ..., "arguments": {...}}</tool_call>` convention.
fn parse_tool_call_blocks(text: &str) -> Option<Vec<SynthesizedCall>> {
    let mut calls = Vec::new();
    let mut rest = text;
    while let Some(block) = extract_tag(rest, "tool_call") {
        let parsed: Value = serde_json::from_str(block.trim()).ok()?;
        calls.push(call_from_value(&parsed)?);

        let close = "</tool_call>";
        let advance = rest.find(close)? + close.len();
        rest = &rest[advance..];
    }
    (!calls.is_empty()).then_some(calls)
}

/// A bare `{"name": ..., "arguments": ...}` object somewhere in the text.
fn parse_bare_json_tool(text: &str) -> Option<Vec<SynthesizedCall>> {
    let mut search = text;
    while let Some(start) = search.find('{') {
        if let Some(object) = balanced_json_object(&search[start..]) {
            if let Ok(parsed) = serde_json::from_str::<Value>(object) {
                if let Some(call) = call_from_value(&parsed) {
                    return Some(vec![call]);
                }
            }
        }
        search = &search[start + 1..];
    }
    None
}

fn call_from_value(parsed: &Value) -> Option<SynthesizedCall> {
    let name = parsed.get("name")?.as_str()?.to_string();
    let arguments = match parsed.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(SynthesizedCall { name, arguments })
}

/// The balanced `{...}` object starting at the beginning of `s`, tracking
/// string literals and escapes.
fn balanced_json_object(s: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Stream adapter applying the transformation chunk-by-chunk, without
/// buffering the whole response.
pub struct TransformStream<S> {
    inner: SseEventStream<S>,
    state: StreamParseState,
    queued: VecDeque<Bytes>,
    synthesized: bool,
}

impl<S> TransformStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: SseEventStream::new(inner),
            state: StreamParseState::default(),
            queued: VecDeque::new(),
            synthesized: false,
        }
    }

    /// Process one complete SSE event, queueing the rewritten frames.
    fn handle_event(&mut self, event: Bytes) {
        let Ok(text) = std::str::from_utf8(&event) else {
            // Not UTF-8; forward untouched.
            self.queued.push_back(event);
            return;
        };

        let mut out_lines: Vec<String> = Vec::new();
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                if !line.is_empty() {
                    out_lines.push(line.to_string());
                }
                continue;
            };

            if data.trim() == "[DONE]" {
                self.flush_lines(&mut out_lines);
                self.finish_stream();
                self.queued.push_back(Bytes::from_static(b"data: [DONE]\n\n"));
                continue;
            }

            match serde_json::from_str::<Value>(data) {
                Ok(mut chunk) => {
                    if self.state.process_chunk(&mut chunk) {
                        out_lines.push(format!("data: {chunk}"));
                    } else {
                        out_lines.push(line.to_string());
                    }
                }
                Err(e) => {
                    // A single malformed fragment must not kill the stream.
                    trace!(error = %e, "passing through unparseable chunk");
                    out_lines.push(line.to_string());
                }
            }
        }
        self.flush_lines(&mut out_lines);
    }

    fn flush_lines(&mut self, lines: &mut Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let mut frame = lines.join("\n");
        frame.push_str("\n\n");
        lines.clear();
        self.queued.push_back(Bytes::from(frame));
    }

    /// Flush withheld text and run the tool-call fallback, exactly once.
    fn finish_stream(&mut self) {
        if self.synthesized {
            return;
        }
        self.synthesized = true;
        if let Some(chunk) = self.state.flush_pending() {
            self.queued.push_back(Bytes::from(format!("data: {chunk}\n\n")));
        }
        if let Some(chunk) = self.state.synthesize_tool_calls() {
            self.queued.push_back(Bytes::from(format!("data: {chunk}\n\n")));
        }
    }
}

impl<S, E> Stream for TransformStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(frame) = this.queued.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => this.handle_event(event),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    // Stream ended without a [DONE] sentinel.
                    this.finish_stream();
                    if this.queued.is_empty() {
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
