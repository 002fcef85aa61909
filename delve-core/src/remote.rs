//! Remote research API boundary.
//!
//! The engine talks to the remote service only through [`ResearchApi`]. Responses are
//! validated into tagged types here so nothing downstream handles raw payloads:
//! a `Completed` status always carries its output, an `Accepted` begin always
//! carries a handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{ConfigError, RemoteError};
use crate::types::{Source, TokenUsage};

/// Coarse state of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    InProgress,
    Completed,
    Failed,
}

impl RemoteState {
    /// Classify a remote status word. Unknown words count as still running.
    pub fn classify(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "completed" | "complete" | "succeeded" | "success" | "done" => RemoteState::Completed,
            "failed" | "failure" | "error" | "cancelled" | "canceled" | "expired" => {
                RemoteState::Failed
            }
            _ => RemoteState::InProgress,
        }
    }
}

/// A finished report as returned by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOutput {
    pub report: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RemoteOutput {
    pub fn new(report: impl Into<String>) -> Self {
        Self {
            report: report.into(),
            sources: Vec::new(),
            usage: TokenUsage::default(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }
}

/// What happened when a request was submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The service answered inline.
    Completed {
        handle: Option<String>,
        output: RemoteOutput,
    },
    /// The service accepted the request and will work on it in the background.
    Accepted { handle: String },
}

/// One status poll of a remote operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
    /// The status word exactly as reported.
    pub status: String,
    pub state: RemoteState,
    pub detail: Option<String>,
    /// Present iff `state` is `Completed`.
    pub output: Option<RemoteOutput>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
    /// New partial text produced since the last poll.
    pub partial_chunk: Option<String>,
}

impl RemoteStatus {
    pub fn in_progress(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            state: RemoteState::InProgress,
            detail: None,
            output: None,
            usage: None,
            error: None,
            partial_chunk: None,
        }
    }

    pub fn completed(output: RemoteOutput) -> Self {
        Self {
            status: "completed".to_string(),
            state: RemoteState::Completed,
            detail: None,
            usage: Some(output.usage),
            output: Some(output),
            error: None,
            partial_chunk: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            state: RemoteState::Failed,
            detail: None,
            output: None,
            usage: None,
            error: Some(message.into()),
            partial_chunk: None,
        }
    }

    pub fn with_chunk(mut self, chunk: impl Into<String>) -> Self {
        self.partial_chunk = Some(chunk.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            input_tokens,
            output_tokens,
        });
        self
    }
}

/// The remote research service.
#[async_trait]
pub trait ResearchApi: Send + Sync {
    /// Submit a query.
    async fn begin(&self, query: &str, model: &str) -> Result<BeginOutcome, RemoteError>;

    /// Poll an accepted operation.
    async fn get_status(&self, handle: &str) -> Result<RemoteStatus, RemoteError>;

    fn name(&self) -> &str {
        "remote"
    }
}

// --- Wire format ---

#[derive(Debug, Deserialize)]
struct WireOperation {
    #[serde(default)]
    id: Option<String>,
    status: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    report: Option<String>,
    #[serde(default)]
    sources: Vec<WireSource>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    partial_output: Option<String>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireSource {
    #[serde(default)]
    title: Option<String>,
    #[serde(alias = "uri")]
    url: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    relevance_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl WireOperation {
    fn usage(&self) -> Option<TokenUsage> {
        self.usage.as_ref().map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        })
    }

    /// A finished operation with no report still ends the task, with an empty report.
    fn into_output(self) -> RemoteOutput {
        let usage = self.usage().unwrap_or_default();
        let report = self.report.unwrap_or_default();
        let sources = self
            .sources
            .into_iter()
            .map(|s| Source {
                title: s.title.unwrap_or_else(|| "Unknown".to_string()),
                url: s.url,
                snippet: s.snippet.map(|text| text.chars().take(200).collect()),
                relevance_score: s.relevance_score.map(|v| v.clamp(0.0, 1.0)),
            })
            .collect();
        RemoteOutput {
            report,
            sources,
            usage,
            metadata: self.metadata,
        }
    }
}

/// Validate a polled operation into a [`RemoteStatus`].
pub fn parse_status(body: &str) -> Result<RemoteStatus, RemoteError> {
    let wire: WireOperation = serde_json::from_str(body).map_err(|e| RemoteError::ResponseParse {
        message: format!("Invalid JSON: {e}"),
    })?;
    let state = RemoteState::classify(&wire.status);
    let status = wire.status.clone();
    let detail = wire.detail.clone();
    let usage = wire.usage();
    let partial_chunk = wire.partial_output.clone().filter(|c| !c.is_empty());
    let error = wire.error.clone();

    let output = match state {
        RemoteState::Completed => Some(wire.into_output()),
        _ => None,
    };
    let error = match state {
        RemoteState::Failed => Some(error.unwrap_or_else(|| format!("remote status '{status}'"))),
        _ => error,
    };

    Ok(RemoteStatus {
        status,
        state,
        detail,
        output,
        usage,
        error,
        partial_chunk,
    })
}

/// Validate a submission response into a [`BeginOutcome`].
pub fn parse_begin(body: &str) -> Result<BeginOutcome, RemoteError> {
    let wire: WireOperation = serde_json::from_str(body).map_err(|e| RemoteError::ResponseParse {
        message: format!("Invalid JSON: {e}"),
    })?;
    match RemoteState::classify(&wire.status) {
        RemoteState::Completed => {
            let handle = wire.id.clone();
            Ok(BeginOutcome::Completed {
                handle,
                output: wire.into_output(),
            })
        }
        RemoteState::InProgress => match wire.id {
            Some(id) if !id.is_empty() => Ok(BeginOutcome::Accepted { handle: id }),
            _ => Err(RemoteError::ResponseParse {
                message: "accepted operation has no id".into(),
            }),
        },
        RemoteState::Failed => Err(RemoteError::Failed {
            message: wire
                .error
                .unwrap_or_else(|| format!("remote status '{}'", wire.status)),
        }),
    }
}

/// JSON-over-HTTP client for the research service.
pub struct HttpResearchApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpResearchApi {
    pub fn new(config: &RemoteConfig, api_key: impl Into<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RemoteError::Connection {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Build a client using the key from the configured environment variable.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, ConfigError> {
        let key = config.api_key()?;
        Self::new(config, key).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> RemoteError {
        match status.as_u16() {
            401 | 403 => RemoteError::AuthFailed {
                message: body.chars().take(200).collect(),
            },
            429 => RemoteError::RateLimited,
            code if code >= 500 => RemoteError::Unavailable {
                status: code,
                message: body.chars().take(200).collect(),
            },
            code => RemoteError::Rejected {
                status: code,
                message: body.chars().take(200).collect(),
            },
        }
    }

    async fn read(response: reqwest::Response) -> Result<String, RemoteError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| RemoteError::Connection {
            message: format!("Failed to read response body: {e}"),
        })?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl ResearchApi for HttpResearchApi {
    async fn begin(&self, query: &str, model: &str) -> Result<BeginOutcome, RemoteError> {
        let url = format!("{}/v1/research", self.base_url);
        debug!(url = %url, model, "Submitting research request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "query": query, "model": model }))
            .send()
            .await
            .map_err(|e| RemoteError::Connection {
                message: format!("Request failed: {e}"),
            })?;
        parse_begin(&Self::read(response).await?)
    }

    async fn get_status(&self, handle: &str) -> Result<RemoteStatus, RemoteError> {
        let url = format!("{}/v1/research/{}", self.base_url, handle);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| RemoteError::Connection {
                message: format!("Request failed: {e}"),
            })?;
        parse_status(&Self::read(response).await?)
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Deterministic in-process research service for tests and demos.
///
/// Begin outcomes and per-handle status responses are queued up front. When a handle's
/// queue runs dry it keeps answering `in_progress`.
pub struct ScriptedResearchApi {
    begins: Mutex<VecDeque<Result<BeginOutcome, RemoteError>>>,
    statuses: Mutex<HashMap<String, VecDeque<Result<RemoteStatus, RemoteError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    begin_calls: Mutex<usize>,
    status_delay: Duration,
}

impl Default for ScriptedResearchApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedResearchApi {
    pub fn new() -> Self {
        Self {
            begins: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            begin_calls: Mutex::new(0),
            status_delay: Duration::ZERO,
        }
    }

    /// Delay every status call, to simulate a slow service.
    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub fn queue_begin(&self, outcome: Result<BeginOutcome, RemoteError>) {
        lock(&self.begins).push_back(outcome);
    }

    /// The next `begin` returns `Accepted` with this handle.
    pub fn accept_with(&self, handle: &str) {
        self.queue_begin(Ok(BeginOutcome::Accepted {
            handle: handle.to_string(),
        }));
    }

    pub fn queue_status(&self, handle: &str, status: Result<RemoteStatus, RemoteError>) {
        lock(&self.statuses)
            .entry(handle.to_string())
            .or_default()
            .push_back(status);
    }

    pub fn begin_calls(&self) -> usize {
        *lock(&self.begin_calls)
    }

    pub fn status_calls(&self, handle: &str) -> usize {
        lock(&self.calls).get(handle).copied().unwrap_or(0)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ResearchApi for ScriptedResearchApi {
    async fn begin(&self, _query: &str, _model: &str) -> Result<BeginOutcome, RemoteError> {
        let n = {
            let mut calls = lock(&self.begin_calls);
            *calls += 1;
            *calls
        };
        lock(&self.begins)
            .pop_front()
            .unwrap_or_else(|| Ok(BeginOutcome::Accepted {
                handle: format!("op-{n}"),
            }))
    }

    async fn get_status(&self, handle: &str) -> Result<RemoteStatus, RemoteError> {
        *lock(&self.calls).entry(handle.to_string()).or_default() += 1;
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        lock(&self.statuses)
            .get_mut(handle)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(RemoteStatus::in_progress("in_progress")))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_words() {
        assert_eq!(RemoteState::classify("completed"), RemoteState::Completed);
        assert_eq!(RemoteState::classify("SUCCEEDED"), RemoteState::Completed);
        assert_eq!(RemoteState::classify("failed"), RemoteState::Failed);
        assert_eq!(RemoteState::classify("searching"), RemoteState::InProgress);
        assert_eq!(RemoteState::classify(""), RemoteState::InProgress);
    }

    #[test]
    fn test_parse_in_progress_status() {
        let status = parse_status(
            r#"{"id":"op-1","status":"reading","detail":"12 sources","partial_output":"Intro"}"#,
        )
        .unwrap();
        assert_eq!(status.state, RemoteState::InProgress);
        assert_eq!(status.status, "reading");
        assert_eq!(status.detail.as_deref(), Some("12 sources"));
        assert_eq!(status.partial_chunk.as_deref(), Some("Intro"));
        assert!(status.output.is_none());
    }

    #[test]
    fn test_parse_completed_status() {
        for body in [
            r#"{"status":"completed"}"#,
            r#"{"status":"completed","report":""}"#,
        ] {
            let status = parse_status(body).unwrap();
            assert_eq!(status.state, RemoteState::Completed);
            assert_eq!(status.output.unwrap().report, "");
        }

        let status = parse_status(
            r#"{"status":"completed","report":"Findings","usage":{"input_tokens":10,"output_tokens":20},
                "sources":[{"uri":"https://a.example","relevance_score":3.0}]}"#,
        )
        .unwrap();
        let output = status.output.unwrap();
        assert_eq!(output.report, "Findings");
        assert_eq!(output.usage.total(), 30);
        assert_eq!(output.sources[0].title, "Unknown");
        assert_eq!(output.sources[0].url, "https://a.example");
        assert_eq!(output.sources[0].relevance_score, Some(1.0));
    }

    #[test]
    fn test_parse_failed_keeps_message() {
        let status = parse_status(r#"{"status":"failed","error":"quota exhausted"}"#).unwrap();
        assert_eq!(status.state, RemoteState::Failed);
        assert_eq!(status.error.as_deref(), Some("quota exhausted"));

        let status = parse_status(r#"{"status":"expired"}"#).unwrap();
        assert_eq!(status.error.as_deref(), Some("remote status 'expired'"));
    }

    #[test]
    fn test_parse_begin_variants() {
        assert_eq!(
            parse_begin(r#"{"id":"op-9","status":"queued"}"#).unwrap(),
            BeginOutcome::Accepted {
                handle: "op-9".into()
            }
        );
        assert!(matches!(
            parse_begin(r#"{"status":"queued"}"#),
            Err(RemoteError::ResponseParse { .. })
        ));
        match parse_begin(r#"{"status":"completed","report":"done"}"#).unwrap() {
            BeginOutcome::Completed { handle, output } => {
                assert!(handle.is_none());
                assert_eq!(output.report, "done");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            parse_begin(r#"{"status":"failed","error":"bad query"}"#),
            Err(RemoteError::Failed { .. })
        ));
    }

    #[test]
    fn test_http_error_mapping() {
        let err = HttpResearchApi::map_http_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "down");
        assert!(err.is_transient());
        let err = HttpResearchApi::map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(err.is_transient());
        let err = HttpResearchApi::map_http_error(reqwest::StatusCode::BAD_REQUEST, "bad");
        assert!(!err.is_transient());
        let err = HttpResearchApi::map_http_error(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(matches!(err, RemoteError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_scripted_api_defaults_and_counts() {
        let api = ScriptedResearchApi::new();
        api.queue_status("op-1", Ok(RemoteStatus::in_progress("searching")));
        api.queue_status("op-1", Ok(RemoteStatus::completed(RemoteOutput::new("r"))));

        match api.begin("q", "m").await.unwrap() {
            BeginOutcome::Accepted { handle } => assert_eq!(handle, "op-1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(api.get_status("op-1").await.unwrap().status, "searching");
        assert_eq!(
            api.get_status("op-1").await.unwrap().state,
            RemoteState::Completed
        );
        assert_eq!(api.get_status("op-1").await.unwrap().status, "in_progress");
        assert_eq!(api.status_calls("op-1"), 3);
        assert_eq!(api.begin_calls(), 1);
    }
}
