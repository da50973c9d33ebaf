use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::aggregator::RequestEvent;
use crate::dataset::{Dataset, DatasetEntry, ImageRef};
use crate::error::FailureKind;
use crate::http::HttpClient;
use crate::parser::{self, FieldMapping, StreamParser};
use crate::task::{ApiType, StreamMode};

/// Everything about a task a virtual user needs that doesn't change across
/// iterations; shared read-only across every VU in the run.
pub struct VirtualUserConfig {
    pub api_type: ApiType,
    pub stream_mode: StreamMode,
    pub target_url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub request_payload: Value,
}

pub struct VirtualUser {
    client: HttpClient,
    dataset: Arc<Dataset>,
    mapping: Arc<FieldMapping>,
    config: Arc<VirtualUserConfig>,
}

fn image_ref_to_string(image: &ImageRef) -> String {
    match image {
        ImageRef::Path(path) => path.display().to_string(),
        ImageRef::Url(url) => url.clone(),
        ImageRef::Base64(data) => data.clone(),
    }
}

/// Clones the request payload template and writes the dataset entry's
/// prompt/image into it at the task's mapped `prompt`/`image` paths
/// (`FieldMapping::prompt_path` / `image_path`, §6 of the field-mapping
/// table). A task with no image in its dataset, or no `image_path` set,
/// leaves the template's image slot untouched.
fn substitute(template: &Value, entry: &DatasetEntry, mapping: &FieldMapping) -> Value {
    let mut body = template.clone();
    if !mapping.prompt_path.is_empty() {
        if let Some(prompt) = entry.prompts.first() {
            parser::set_json_path(&mut body, &mapping.prompt_path, Value::String(prompt.clone()));
        }
    }
    if !mapping.image_path.is_empty() {
        if let Some(image) = entry.images.first() {
            parser::set_json_path(&mut body, &mapping.image_path, Value::String(image_ref_to_string(image)));
        }
    }
    body
}

fn materialize_body(config: &VirtualUserConfig, mapping: &FieldMapping, entry: &DatasetEntry) -> Value {
    if config.api_type == ApiType::Generic {
        entry.raw_payload.clone().unwrap_or(Value::Null)
    } else {
        substitute(&config.request_payload, entry, mapping)
    }
}

fn classify_send_error(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() {
        FailureKind::Connect
    } else {
        FailureKind::Connect
    }
}

fn emit(tx: &mpsc::Sender<RequestEvent>, dropped: &AtomicU64, event: RequestEvent) {
    if tx.try_send(event).is_err() {
        dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl VirtualUser {
    pub fn new(
        client: HttpClient,
        dataset: Arc<Dataset>,
        mapping: Arc<FieldMapping>,
        config: Arc<VirtualUserConfig>,
    ) -> Self {
        Self {
            client,
            dataset,
            mapping,
            config,
        }
    }

    fn build_request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .inner()
            .post(&self.config.target_url)
            .json(body);
        for (key, value) in &self.config.headers {
            builder = builder.header(key, value);
        }
        if !self.config.cookies.is_empty() {
            let cookie_header = self
                .config
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(reqwest::header::COOKIE, cookie_header);
        }
        builder
    }

    async fn send_non_streaming(&self, body: &Value, label: &str, warmup: bool) -> RequestEvent {
        let start = Instant::now();
        let response = match self.build_request(body).send().await {
            Ok(resp) => resp,
            Err(e) => return failure_event(label, start, classify_send_error(&e), warmup),
        };

        let status = response.status();
        if !status.is_success() {
            return failure_event(label, start, FailureKind::HttpStatus(status.as_u16()), warmup);
        }

        let body_bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return failure_event(label, start, classify_send_error(&e), warmup),
        };

        if self.config.api_type == ApiType::Generic {
            return RequestEvent {
                label: label.to_string(),
                elapsed_ms: start.elapsed().as_millis() as u64,
                ok: true,
                http_status: Some(status.as_u16()),
                failure_kind: None,
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                estimated: false,
                warmup,
            };
        }

        let parsed: Value = match serde_json::from_slice(&body_bytes) {
            Ok(v) => v,
            Err(_) => return failure_event(label, start, FailureKind::Parse, warmup),
        };

        match parser::parse_non_streaming(&parsed, &self.mapping) {
            Ok(result) => RequestEvent {
                label: label.to_string(),
                elapsed_ms: start.elapsed().as_millis() as u64,
                ok: true,
                http_status: Some(status.as_u16()),
                failure_kind: None,
                prompt_tokens: result.prompt_tokens,
                completion_tokens: result.completion_tokens,
                total_tokens: result.total_tokens,
                estimated: result.estimated,
                warmup,
            },
            Err(kind) => failure_event(label, start, kind, warmup),
        }
    }

    async fn send_streaming(
        &self,
        body: &Value,
        warmup: bool,
        tx: &mpsc::Sender<RequestEvent>,
        dropped: &AtomicU64,
    ) {
        let start = Instant::now();
        let response = match self.build_request(body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                emit(tx, dropped, failure_event("first_token", start, classify_send_error(&e), warmup));
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            emit(
                tx,
                dropped,
                failure_event("first_token", start, FailureKind::HttpStatus(status.as_u16()), warmup),
            );
            return;
        }

        let mut byte_stream = response.bytes_stream();
        let mut parser = StreamParser::new(&self.mapping, start);

        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => parser.push(&bytes),
                Err(e) => {
                    let kind = classify_send_error(&e);
                    emit_stream_failure(tx, dropped, start, parser.is_done(), kind, warmup);
                    return;
                }
            }
            if parser.is_done() {
                break;
            }
        }

        match parser.finish() {
            Ok(result) => {
                if let Some(first_token_ns) = result.first_token_ns {
                    emit(
                        tx,
                        dropped,
                        RequestEvent {
                            label: "first_token".to_string(),
                            elapsed_ms: first_token_ns / 1_000_000,
                            ok: true,
                            http_status: Some(status.as_u16()),
                            failure_kind: None,
                            prompt_tokens: None,
                            completion_tokens: None,
                            total_tokens: None,
                            estimated: false,
                            warmup,
                        },
                    );
                }
                emit(
                    tx,
                    dropped,
                    RequestEvent {
                        label: "completion".to_string(),
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        ok: true,
                        http_status: Some(status.as_u16()),
                        failure_kind: None,
                        prompt_tokens: result.prompt_tokens,
                        completion_tokens: result.completion_tokens,
                        total_tokens: result.total_tokens,
                        estimated: result.estimated,
                        warmup,
                    },
                );
            }
            Err((kind, first_token_ns)) => {
                if let Some(ns) = first_token_ns {
                    emit(
                        tx,
                        dropped,
                        RequestEvent {
                            label: "first_token".to_string(),
                            elapsed_ms: ns / 1_000_000,
                            ok: true,
                            http_status: Some(status.as_u16()),
                            failure_kind: None,
                            prompt_tokens: None,
                            completion_tokens: None,
                            total_tokens: None,
                            estimated: false,
                            warmup,
                        },
                    );
                }
                emit(tx, dropped, failure_event("completion", start, kind, warmup));
            }
        }
    }

    /// Runs until `cancel` fires, pulling one dataset entry per iteration
    /// and emitting events for it. Never unwinds on a request failure; the
    /// failure becomes one more `RequestEvent`.
    pub async fn run(
        self,
        cancel: CancellationToken,
        warmup_deadline: Option<Instant>,
        tx: mpsc::Sender<RequestEvent>,
        dropped: Arc<AtomicU64>,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let warmup = warmup_deadline.is_some_and(|deadline| Instant::now() < deadline);
            let entry = self.dataset.next().clone();
            let body = materialize_body(&self.config, &self.mapping, &entry);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.dispatch(&body, warmup, &tx, &dropped) => {}
            }
        }
    }

    async fn dispatch(&self, body: &Value, warmup: bool, tx: &mpsc::Sender<RequestEvent>, dropped: &AtomicU64) {
        if self.config.api_type == ApiType::Generic || self.config.stream_mode == StreamMode::NonStreaming {
            // Both GENERIC and non-streaming LLM requests complete in one
            // round trip, so they share the "request" label; "completion"
            // is reserved for the streaming case below.
            let event = self.send_non_streaming(body, "request", warmup).await;
            emit(tx, dropped, event);
        } else {
            self.send_streaming(body, warmup, tx, dropped).await;
        }
    }
}

fn failure_event(label: &str, start: Instant, kind: FailureKind, warmup: bool) -> RequestEvent {
    RequestEvent {
        label: label.to_string(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        ok: false,
        http_status: match kind {
            FailureKind::HttpStatus(code) => Some(code),
            _ => None,
        },
        failure_kind: Some(kind),
        prompt_tokens: None,
        completion_tokens: None,
        total_tokens: None,
        estimated: false,
        warmup,
    }
}

fn emit_stream_failure(
    tx: &mpsc::Sender<RequestEvent>,
    dropped: &AtomicU64,
    start: Instant,
    had_first_token: bool,
    kind: FailureKind,
    warmup: bool,
) {
    if had_first_token {
        emit(
            tx,
            dropped,
            RequestEvent {
                label: "first_token".to_string(),
                elapsed_ms: start.elapsed().as_millis() as u64,
                ok: true,
                http_status: None,
                failure_kind: None,
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                estimated: false,
                warmup,
            },
        );
    }
    emit(tx, dropped, failure_event("completion", start, kind, warmup));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prompt: &str) -> DatasetEntry {
        DatasetEntry {
            id: "1".to_string(),
            prompts: vec![prompt.to_string()],
            images: vec![],
            raw_payload: None,
        }
    }

    #[test]
    fn substitute_writes_prompt_at_mapped_path() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let template = serde_json::json!({"messages": [{"role": "user", "content": "placeholder"}]});
        let result = substitute(&template, &entry("hello there"), &mapping);
        assert_eq!(result["messages"][0]["content"], "hello there");
    }

    #[test]
    fn substitute_leaves_other_fields_untouched() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let template = serde_json::json!({"model": "gpt-4", "messages": [{"content": "x"}]});
        let result = substitute(&template, &entry("hi"), &mapping);
        assert_eq!(result["model"], "gpt-4");
    }

    #[test]
    fn substitute_writes_image_at_mapped_path() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let mut e = entry("describe this");
        e.images = vec![ImageRef::Url("http://example.com/cat.png".to_string())];
        let template = serde_json::json!({"messages": [{"content": []}]});
        let result = substitute(&template, &e, &mapping);
        assert_eq!(
            result["messages"][0]["content"][1]["image_url"]["url"],
            "http://example.com/cat.png"
        );
    }

    #[test]
    fn materialize_body_generic_uses_raw_payload_verbatim() {
        let mapping = FieldMapping::from_value(ApiType::Generic, &Value::Null).unwrap();
        let config = VirtualUserConfig {
            api_type: ApiType::Generic,
            stream_mode: StreamMode::NonStreaming,
            target_url: "http://x".to_string(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            request_payload: Value::Null,
        };
        let mut e = entry("unused");
        e.raw_payload = Some(serde_json::json!({"a": 1}));
        let body = materialize_body(&config, &mapping, &e);
        assert_eq!(body, serde_json::json!({"a": 1}));
    }

    #[test]
    fn materialize_body_llm_substitutes_template() {
        let mapping = FieldMapping::from_value(ApiType::OpenaiChat, &Value::Null).unwrap();
        let config = VirtualUserConfig {
            api_type: ApiType::OpenaiChat,
            stream_mode: StreamMode::Streaming,
            target_url: "http://x".to_string(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            request_payload: serde_json::json!({"messages": [{"content": "placeholder"}]}),
        };
        let body = materialize_body(&config, &mapping, &entry("ping"));
        assert_eq!(body["messages"][0]["content"], "ping");
    }

    #[test]
    fn failure_event_carries_http_status_for_status_failures() {
        let event = failure_event("request", Instant::now(), FailureKind::HttpStatus(503), false);
        assert_eq!(event.http_status, Some(503));
        assert!(!event.ok);
    }

    #[test]
    fn classify_timeout_error_distinct_from_connect() {
        // We can't construct a real reqwest::Error without a server, so this
        // exercises the discriminant logic indirectly through FailureKind's
        // own equality instead.
        assert_ne!(FailureKind::Timeout, FailureKind::Connect);
    }
}
