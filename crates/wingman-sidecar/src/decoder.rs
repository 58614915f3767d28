// Prompt stream decoding
// Turns `data: <json>` lines into StreamEvents. Text passes through the markup filter.

use crate::markup::ProtocolMarkupFilter;
use serde_json::{Map, Value};
use wingman_wire::{Flexible, StreamEvent, ToolExecution, DONE_SENTINEL, EVENT_LINE_PREFIX};

const KIND_KEYS: &[&str] = &["type", "event", "kind"];
const TOOL_NAME_KEYS: &[&str] = &["toolName", "tool_name", "tool", "name"];
const LABEL_KEYS: &[&str] = &["label", "status", "message"];
const DETAILS_KEYS: &[&str] = &["details", "detail", "summary", "message"];
const INPUT_KEYS: &[&str] = &["input", "args", "arguments", "params"];
const OUTPUT_KEYS: &[&str] = &["output", "result"];
const TEXT_KEYS: &[&str] = &["text", "delta", "content"];
const ERROR_KEYS: &[&str] = &["error", "message"];

/// One decoder per stream. After the sentinel (or a `done` payload) it
/// produces nothing further.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    filter: ProtocolMarkupFilter,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: ProtocolMarkupFilter) -> Self {
        Self {
            filter,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn decode_line(&mut self, line: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = line.strip_prefix(EVENT_LINE_PREFIX) else {
            return Vec::new();
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Vec::new();
        }
        if payload == DONE_SENTINEL {
            return self.complete();
        }

        let value = match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                tracing::debug!("Skipping non-object stream payload: {}", other);
                return Vec::new();
            }
            Err(e) => {
                tracing::debug!("Skipping undecodable stream line: {}", e);
                return Vec::new();
            }
        };
        self.decode_payload(&value)
    }

    /// Transport EOF without a sentinel: releases text the filter still holds.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        text_event(self.filter.flush()).into_iter().collect()
    }

    fn complete(&mut self) -> Vec<StreamEvent> {
        let mut events = self.finish();
        events.push(StreamEvent::Completed);
        events
    }

    fn decode_payload(&mut self, payload: &Map<String, Value>) -> Vec<StreamEvent> {
        let Some(kind) = first_string(payload, KIND_KEYS) else {
            return Vec::new();
        };

        match kind.as_str() {
            "status" => first_text(payload, LABEL_KEYS)
                .map(StreamEvent::Status)
                .into_iter()
                .collect(),
            "tool_start" => tool_name(payload)
                .map(|name| StreamEvent::Status(format!("Tool started: {name}")))
                .into_iter()
                .collect(),
            "tool_complete" => decode_tool_complete(payload),
            "text" | "delta" | "content" => {
                let raw = TEXT_KEYS
                    .iter()
                    .filter_map(|key| lookup(payload, key))
                    .map(collect_text)
                    .find(|text| !text.is_empty())
                    .unwrap_or_default();
                text_event(self.filter.push(&raw)).into_iter().collect()
            }
            "error" => {
                let message = first_text(payload, ERROR_KEYS)
                    .unwrap_or_else(|| "The assistant reported an error.".to_string());
                vec![StreamEvent::Error(message)]
            }
            "done" => self.complete(),
            other => {
                tracing::trace!("Ignoring stream event kind {}", other);
                Vec::new()
            }
        }
    }
}

fn decode_tool_complete(payload: &Map<String, Value>) -> Vec<StreamEvent> {
    let name = tool_name(payload).unwrap_or_else(|| "tool".to_string());
    let success = lookup(payload, "success")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let details = first_text(payload, DETAILS_KEYS);
    let input = first_text(payload, INPUT_KEYS);
    let output = first_text(payload, OUTPUT_KEYS).or_else(|| details.clone());

    let verb = if success { "done" } else { "failed" };
    vec![
        StreamEvent::Status(format!("Tool {verb}: {name}")),
        StreamEvent::ToolExecution(ToolExecution {
            tool_name: name,
            success,
            details,
            input,
            output,
        }),
    ]
}

fn text_event(text: String) -> Option<StreamEvent> {
    (!text.is_empty()).then_some(StreamEvent::TextDelta(text))
}

/// Top-level field first, then the same field under `properties` / `data`.
fn lookup<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    payload.get(key).filter(|v| !v.is_null()).or_else(|| {
        ["properties", "data"].iter().find_map(|nest| {
            payload
                .get(*nest)
                .and_then(Value::as_object)
                .and_then(|inner| inner.get(key))
                .filter(|v| !v.is_null())
        })
    })
}

fn first_string(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

/// First key whose value renders to non-empty display text.
fn first_text(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup(payload, key))
        .filter_map(|value| Flexible::from_value(value)?.render())
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
}

/// Tool identifiers arrive as a string or as an object carrying `name`.
fn tool_name(payload: &Map<String, Value>) -> Option<String> {
    TOOL_NAME_KEYS
        .iter()
        .filter_map(|key| lookup(payload, key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Object(obj) => obj
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        })
}

/// String, `{text}` object, or an array of either, concatenated.
fn collect_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj.get("text").map(collect_text).unwrap_or_default(),
        Value::Array(items) => items.iter().map(collect_text).collect(),
        _ => String::new(),
    }
}
