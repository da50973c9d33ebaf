pub mod estimator;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FailureKind;
use crate::task::ApiType;

/// Maps an endpoint's response shape onto the fields the engine needs.
/// Dot-separated paths with integer array indices and a `*` wildcard that
/// matches the first element for which the remaining path resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FieldMapping {
    pub content_path: String,
    /// Path used instead of `content_path` while reading streaming delta
    /// chunks, which nest the text one level differently than a complete
    /// response body does (`choices.0.delta.content` vs
    /// `choices.0.message.content`).
    #[serde(default)]
    pub stream_content_path: String,
    #[serde(default)]
    pub reasoning_path: Option<String>,
    #[serde(default)]
    pub stream_reasoning_path: Option<String>,
    #[serde(default)]
    pub prompt_tokens_path: Option<String>,
    #[serde(default)]
    pub completion_tokens_path: Option<String>,
    #[serde(default)]
    pub total_tokens_path: Option<String>,
    /// Where in `request_payload` to substitute the dataset entry's prompt
    /// text. Ignored for GENERIC tasks, which send `raw_payload` verbatim.
    #[serde(rename = "prompt", default)]
    pub prompt_path: String,
    /// Where in `request_payload` to substitute the dataset entry's first
    /// image reference. Empty when the task has no multimodal template.
    #[serde(rename = "image", default)]
    pub image_path: String,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    #[serde(default = "default_stop_flag")]
    pub stop_flag: String,
    #[serde(default = "default_data_format")]
    pub data_format: String,
    #[serde(default)]
    pub end_prefix: Option<String>,
    #[serde(default)]
    pub end_field: Option<String>,
}

fn default_stream_prefix() -> String {
    "data: ".to_string()
}
fn default_stop_flag() -> String {
    "[DONE]".to_string()
}
fn default_data_format() -> String {
    "sse".to_string()
}

impl FieldMapping {
    /// Builds the mapping from a task's `field_mapping` JSON column, filling
    /// in documented per-protocol defaults for any key the task didn't set.
    /// A `custom_chat` task must supply `content_path` itself.
    pub fn from_value(api_type: ApiType, raw: &Value) -> Result<Self, crate::error::EngineError> {
        let mut mapping: FieldMapping = if raw.is_null() {
            default_mapping_for(api_type)
        } else {
            let mut parsed: PartialMapping = serde_json::from_value(raw.clone())?;
            let defaults = default_mapping_for(api_type);
            parsed.fill_defaults(defaults)
        };

        if mapping.content_path.is_empty() {
            if api_type == ApiType::CustomChat {
                return Err(crate::error::EngineError::Validation(
                    "custom_chat tasks must set field_mapping.content_path".to_string(),
                ));
            }
            mapping.content_path = default_mapping_for(api_type).content_path;
        }
        if mapping.stream_content_path.is_empty() {
            let default_stream = default_mapping_for(api_type).stream_content_path;
            mapping.stream_content_path = if default_stream.is_empty() {
                mapping.content_path.clone()
            } else {
                default_stream
            };
        }

        Ok(mapping)
    }
}

/// Deserialization target for a possibly-partial user-supplied mapping.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct PartialMapping {
    #[serde(default)]
    content_path: Option<String>,
    #[serde(default)]
    stream_content_path: Option<String>,
    #[serde(default)]
    reasoning_path: Option<String>,
    #[serde(default)]
    stream_reasoning_path: Option<String>,
    #[serde(default)]
    prompt_tokens_path: Option<String>,
    #[serde(default)]
    completion_tokens_path: Option<String>,
    #[serde(default)]
    total_tokens_path: Option<String>,
    #[serde(rename = "prompt", default)]
    prompt_path: Option<String>,
    #[serde(rename = "image", default)]
    image_path: Option<String>,
    #[serde(default)]
    stream_prefix: Option<String>,
    #[serde(default)]
    stop_flag: Option<String>,
    #[serde(default)]
    data_format: Option<String>,
    #[serde(default)]
    end_prefix: Option<String>,
    #[serde(default)]
    end_field: Option<String>,
}

impl PartialMapping {
    fn fill_defaults(self, defaults: FieldMapping) -> FieldMapping {
        FieldMapping {
            content_path: self.content_path.unwrap_or(defaults.content_path),
            stream_content_path: self
                .stream_content_path
                .unwrap_or(defaults.stream_content_path),
            reasoning_path: self.reasoning_path.or(defaults.reasoning_path),
            stream_reasoning_path: self.stream_reasoning_path.or(defaults.stream_reasoning_path),
            prompt_tokens_path: self.prompt_tokens_path.or(defaults.prompt_tokens_path),
            completion_tokens_path: self
                .completion_tokens_path
                .or(defaults.completion_tokens_path),
            total_tokens_path: self.total_tokens_path.or(defaults.total_tokens_path),
            prompt_path: self.prompt_path.unwrap_or(defaults.prompt_path),
            image_path: self.image_path.unwrap_or(defaults.image_path),
            stream_prefix: self.stream_prefix.unwrap_or(defaults.stream_prefix),
            stop_flag: self.stop_flag.unwrap_or(defaults.stop_flag),
            data_format: self.data_format.unwrap_or(defaults.data_format),
            end_prefix: self.end_prefix.or(defaults.end_prefix),
            end_field: self.end_field.or(defaults.end_field),
        }
    }
}

fn default_mapping_for(api_type: ApiType) -> FieldMapping {
    let (content_path, stream_content_path, reasoning_path, stream_reasoning_path, prompt_tokens_path, completion_tokens_path, total_tokens_path) =
        match api_type {
            ApiType::OpenaiChat => (
                "choices.0.message.content",
                "choices.0.delta.content",
                Some("choices.0.message.reasoning_content"),
                Some("choices.0.delta.reasoning_content"),
                Some("usage.prompt_tokens"),
                Some("usage.completion_tokens"),
                Some("usage.total_tokens"),
            ),
            ApiType::ClaudeChat => (
                "content.0.text",
                "delta.text",
                Some("content.0.thinking"),
                Some("delta.thinking"),
                Some("usage.input_tokens"),
                Some("usage.output_tokens"),
                None,
            ),
            ApiType::Embeddings => (
                "data.0.embedding",
                "data.0.embedding",
                None,
                None,
                Some("usage.prompt_tokens"),
                None,
                Some("usage.total_tokens"),
            ),
            ApiType::CustomChat | ApiType::Generic => ("", "", None, None, None, None, None),
        };

    let (prompt_path, image_path) = match api_type {
        ApiType::OpenaiChat | ApiType::ClaudeChat => {
            ("messages.0.content", "messages.0.content.1.image_url.url")
        }
        ApiType::Embeddings => ("input", ""),
        ApiType::CustomChat | ApiType::Generic => ("", ""),
    };

    FieldMapping {
        content_path: content_path.to_string(),
        stream_content_path: stream_content_path.to_string(),
        reasoning_path: reasoning_path.map(str::to_string),
        stream_reasoning_path: stream_reasoning_path.map(str::to_string),
        prompt_tokens_path: prompt_tokens_path.map(str::to_string),
        completion_tokens_path: completion_tokens_path.map(str::to_string),
        total_tokens_path: total_tokens_path.map(str::to_string),
        prompt_path: prompt_path.to_string(),
        image_path: image_path.to_string(),
        stream_prefix: default_stream_prefix(),
        stop_flag: default_stop_flag(),
        data_format: default_data_format(),
        end_prefix: None,
        end_field: None,
    }
}

/// Walks a dot-separated path (`choices.0.message.content`) through a JSON
/// value. A path segment of `*` matches the first array element for which
/// the rest of the path resolves to something.
pub fn navigate_json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut segments = path.split('.');
    navigate(value, &mut segments)
}

fn navigate<'a, 'b>(value: &'a Value, segments: &mut std::str::Split<'b, char>) -> Option<&'a Value> {
    let Some(segment) = segments.next() else {
        return Some(value);
    };

    if segment == "*" {
        let array = value.as_array()?;
        for item in array {
            let mut remaining = segments.clone();
            if let Some(found) = navigate(item, &mut remaining) {
                *segments = remaining;
                return Some(found);
            }
        }
        return None;
    }

    let next = if let Ok(idx) = segment.parse::<usize>() {
        value.as_array()?.get(idx)?
    } else {
        value.as_object()?.get(segment)?
    };

    navigate(next, segments)
}

/// Writes `new_value` at a dot-separated path inside `root`, creating
/// intermediate arrays/objects as needed. The mirror-image write-side of
/// [`navigate_json_path`], used to substitute a dataset entry's prompt or
/// image into a task's `request_payload` template at the mapped location.
pub fn set_json_path(root: &mut Value, path: &str, new_value: Value) {
    if path.is_empty() {
        *root = new_value;
        return;
    }
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path is non-empty");

    let mut current = root;
    for segment in segments {
        current = step_into(current, segment);
    }
    set_leaf(current, last, new_value);
}

fn step_into<'a>(value: &'a mut Value, segment: &str) -> &'a mut Value {
    if let Ok(idx) = segment.parse::<usize>() {
        if !value.is_array() {
            *value = Value::Array(Vec::new());
        }
        let array = value.as_array_mut().expect("just coerced to array");
        while array.len() <= idx {
            array.push(Value::Null);
        }
        &mut array[idx]
    } else {
        if !value.is_object() {
            *value = Value::Object(serde_json::Map::new());
        }
        value
            .as_object_mut()
            .expect("just coerced to object")
            .entry(segment)
            .or_insert(Value::Null)
    }
}

fn set_leaf(value: &mut Value, segment: &str, new_value: Value) {
    if let Ok(idx) = segment.parse::<usize>() {
        if !value.is_array() {
            *value = Value::Array(Vec::new());
        }
        let array = value.as_array_mut().expect("just coerced to array");
        while array.len() <= idx {
            array.push(Value::Null);
        }
        array[idx] = new_value;
    } else {
        if !value.is_object() {
            *value = Value::Object(serde_json::Map::new());
        }
        value
            .as_object_mut()
            .expect("just coerced to object")
            .insert(segment.to_string(), new_value);
    }
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_to_u64(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| value.as_f64().map(|f| f.round() as u64))
}

#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub content: String,
    pub reasoning: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub estimated: bool,
    pub first_token_ns: Option<u64>,
}

/// Parses a single, complete (non-streaming) JSON response body.
pub fn parse_non_streaming(body: &Value, mapping: &FieldMapping) -> Result<ParseResult, FailureKind> {
    let content = navigate_json_path(body, &mapping.content_path)
        .map(json_to_string)
        .ok_or(FailureKind::Parse)?;

    let reasoning = mapping
        .reasoning_path
        .as_deref()
        .and_then(|p| navigate_json_path(body, p))
        .map(json_to_string)
        .unwrap_or_default();

    let prompt_tokens = mapping
        .prompt_tokens_path
        .as_deref()
        .and_then(|p| navigate_json_path(body, p))
        .and_then(json_to_u64);
    let completion_tokens = mapping
        .completion_tokens_path
        .as_deref()
        .and_then(|p| navigate_json_path(body, p))
        .and_then(json_to_u64);
    let total_tokens = mapping
        .total_tokens_path
        .as_deref()
        .and_then(|p| navigate_json_path(body, p))
        .and_then(json_to_u64);

    let estimated = prompt_tokens.is_none() && completion_tokens.is_none() && total_tokens.is_none();
    let completion_tokens = completion_tokens.or_else(|| {
        if estimated {
            Some(estimator::estimate_tokens(&content))
        } else {
            None
        }
    });

    Ok(ParseResult {
        content,
        reasoning,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        estimated,
        first_token_ns: None,
    })
}

/// Incremental state machine for SSE/NDJSON streaming chat responses. Fed
/// raw byte chunks as they arrive over the wire; callers push chunks in with
/// [`StreamParser::push`] and call [`StreamParser::finish`] once the body
/// stream ends.
pub struct StreamParser<'a> {
    mapping: &'a FieldMapping,
    buffer: String,
    content: String,
    reasoning: String,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
    first_token_ns: Option<u64>,
    start: std::time::Instant,
    done: bool,
}

impl<'a> StreamParser<'a> {
    pub fn new(mapping: &'a FieldMapping, start: std::time::Instant) -> Self {
        Self {
            mapping,
            buffer: String::new(),
            content: String::new(),
            reasoning: String::new(),
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            first_token_ns: None,
            start,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds raw bytes, processing every complete line found so far.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline_idx) = self.buffer.find('\n') {
            let line = self.buffer[..newline_idx].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline_idx);
            self.process_line(&line);
            if self.done {
                break;
            }
        }
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() || self.done {
            return;
        }

        if let Some(end_prefix) = &self.mapping.end_prefix {
            if line.starts_with(end_prefix.as_str()) {
                self.done = true;
                return;
            }
        }

        let payload = if self.mapping.data_format == "ndjson" {
            line
        } else if let Some(stripped) = line.strip_prefix(self.mapping.stream_prefix.as_str()) {
            stripped
        } else {
            return;
        };

        let trimmed = payload.trim();
        if trimmed == self.mapping.stop_flag {
            self.done = true;
            return;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => return,
        };

        if let Some(end_field) = &self.mapping.end_field {
            if navigate_json_path(&value, end_field).is_some() {
                self.done = true;
            }
        }

        let delta_content = navigate_json_path(&value, &self.mapping.stream_content_path).map(json_to_string);
        let delta_reasoning = self
            .mapping
            .stream_reasoning_path
            .as_deref()
            .and_then(|p| navigate_json_path(&value, p))
            .map(json_to_string);

        let had_delta = delta_content.as_deref().is_some_and(|s| !s.is_empty())
            || delta_reasoning.as_deref().is_some_and(|s| !s.is_empty());
        if had_delta && self.first_token_ns.is_none() {
            self.first_token_ns = Some(self.start.elapsed().as_nanos() as u64);
        }
        if let Some(c) = delta_content {
            self.content.push_str(&c);
        }
        if let Some(r) = delta_reasoning {
            self.reasoning.push_str(&r);
        }

        if let Some(p) = self
            .mapping
            .prompt_tokens_path
            .as_deref()
            .and_then(|p| navigate_json_path(&value, p))
            .and_then(json_to_u64)
        {
            self.prompt_tokens = Some(p);
        }
        if let Some(c) = self
            .mapping
            .completion_tokens_path
            .as_deref()
            .and_then(|p| navigate_json_path(&value, p))
            .and_then(json_to_u64)
        {
            self.completion_tokens = Some(c);
        }
        if let Some(t) = self
            .mapping
            .total_tokens_path
            .as_deref()
            .and_then(|p| navigate_json_path(&value, p))
            .and_then(json_to_u64)
        {
            self.total_tokens = Some(t);
        }
    }

    /// Consumes the parser once the byte stream ends, returning a successful
    /// result if a terminal marker was seen, or `Err` describing the
    /// truncation otherwise. `first_token_ns`, if any, is preserved either
    /// way so the caller can still emit a `first_token` event on truncation.
    pub fn finish(mut self) -> Result<ParseResult, (FailureKind, Option<u64>)> {
        if !self.buffer.trim().is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(line.trim());
        }

        let estimated = self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && self.total_tokens.is_none();
        if estimated && !self.content.is_empty() {
            self.completion_tokens = Some(estimator::estimate_tokens(&self.content));
        }

        let result = ParseResult {
            content: self.content,
            reasoning: self.reasoning,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            estimated,
            first_token_ns: self.first_token_ns,
        };

        if self.done {
            Ok(result)
        } else {
            Err((FailureKind::StreamTruncated, result.first_token_ns))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigate_dot_path_through_object_and_array() {
        let value = serde_json::json!({"choices": [{"message": {"content": "hi"}}]});
        let found = navigate_json_path(&value, "choices.0.message.content").unwrap();
        assert_eq!(found.as_str(), Some("hi"));
    }

    #[test]
    fn navigate_wildcard_matches_first_resolving_element() {
        let value = serde_json::json!({"items": [{"kind": "a"}, {"kind": "b", "content": "found"}]});
        let found = navigate_json_path(&value, "items.*.content").unwrap();
        assert_eq!(found.as_str(), Some("found"));
    }

    #[test]
    fn navigate_missing_path_returns_none() {
        let value = serde_json::json!({"a": 1});
        assert!(navigate_json_path(&value, "b.c").is_none());
    }

    #[test]
    fn set_json_path_writes_existing_leaf() {
        let mut value = serde_json::json!({"messages": [{"content": "placeholder"}]});
        set_json_path(&mut value, "messages.0.content", serde_json::json!("hello"));
        assert_eq!(value["messages"][0]["content"], serde_json::json!("hello"));
    }

    #[test]
    fn set_json_path_creates_missing_containers() {
        let mut value = serde_json::json!({});
        set_json_path(&mut value, "messages.0.content.1.image_url.url", serde_json::json!("http://x"));
        assert_eq!(
            value["messages"][0]["content"][1]["image_url"]["url"],
            serde_json::json!("http://x")
        );
    }

    #[test]
    fn default_mapping_openai_chat_non_streaming() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "hello world"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        });
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let result = parse_non_streaming(&body, &mapping).unwrap();
        assert_eq!(result.content, "hello world");
        assert_eq!(result.completion_tokens, Some(2));
        assert!(!result.estimated);
    }

    #[test]
    fn missing_content_path_is_parse_failure() {
        let body = serde_json::json!({"unexpected": true});
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let result = parse_non_streaming(&body, &mapping);
        assert_eq!(result.unwrap_err(), FailureKind::Parse);
    }

    #[test]
    fn missing_usage_falls_back_to_estimate() {
        let body = serde_json::json!({"choices": [{"message": {"content": "hello there friend"}}]});
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let result = parse_non_streaming(&body, &mapping).unwrap();
        assert!(result.estimated);
        assert!(result.completion_tokens.unwrap() > 0);
    }

    #[test]
    fn custom_chat_requires_content_path() {
        let result = FieldMapping::from_value(ApiType::CustomChat, &Value::Null);
        assert!(result.is_err());
    }

    #[test]
    fn stream_parser_accumulates_content_and_sees_done() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let mut parser = StreamParser::new(&mapping, std::time::Instant::now());
        parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n");
        parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n");
        parser.push(b"data: [DONE]\n");
        let result = parser.finish().unwrap();
        assert_eq!(result.content, "Hello");
    }

    #[test]
    fn stream_parser_truncation_without_done_marker() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let mut parser = StreamParser::new(&mapping, std::time::Instant::now());
        parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n");
        let err = parser.finish().unwrap_err();
        assert_eq!(err.0, FailureKind::StreamTruncated);
    }

    #[test]
    fn stream_parser_records_first_token_time() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let mut parser = StreamParser::new(&mapping, std::time::Instant::now());
        assert!(parser.first_token_ns.is_none());
        parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n");
        assert!(parser.first_token_ns.is_some());
    }

    #[test]
    fn stream_parser_ignores_malformed_json_line() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let mut parser = StreamParser::new(&mapping, std::time::Instant::now());
        parser.push(b"data: not json\n");
        parser.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n");
        parser.push(b"data: [DONE]\n");
        let result = parser.finish().unwrap();
        assert_eq!(result.content, "ok");
    }

    #[test]
    fn ndjson_format_has_no_prefix() {
        let mapping_value = serde_json::json!({"content_path": "content", "data_format": "ndjson", "stop_flag": "__end__"});
        let mapping = FieldMapping::from_value(ApiType::Generic, &mapping_value).unwrap();
        let mut parser = StreamParser::new(&mapping, std::time::Instant::now());
        parser.push(b"{\"content\":\"hi\"}\n");
        parser.push(b"__end__\n");
        let result = parser.finish().unwrap();
        assert_eq!(result.content, "hi");
    }
}
