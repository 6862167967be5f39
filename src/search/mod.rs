//! Search Function-Call Bridge (spec.md §4.12): dispatches provider tool
//! calls (`webSearch`, `getVideoSummary`, ...) to an HTTP search provider
//! and feeds the JSON result back.
//!
//! Implements [`crate::ai::FunctionCallHandler`] so the AI Orchestrator
//! only ever sees the capability trait, never this module's HTTP details —
//! tool dispatch runs in its own task and never calls back into C5
//! synchronously, satisfied here simply by never holding a reference to
//! the orchestrator at all.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::ai::FunctionCallHandler;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_RESULTS_PER_CATEGORY: usize = 5;

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    tool: &'a str,
    args: &'a Value,
}

/// Dispatches provider function calls to a single HTTP search endpoint,
/// retrying 429/5xx with exponential backoff plus jitter.
pub struct SearchBridge {
    client: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
}

impl SearchBridge {
    #[must_use]
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url, api_key }
    }

    async fn call_once(&self, tool: &str, args: &Value) -> Result<Value, SearchCallError> {
        let Some(base_url) = &self.base_url else {
            return Err(SearchCallError::NotConfigured);
        };
        let mut req = self.client.post(format!("{base_url}/tools/{tool}")).json(&SearchRequest { tool, args });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| SearchCallError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(SearchCallError::Retryable(status.as_u16()));
        }
        if !status.is_success() {
            return Err(SearchCallError::Fatal(status.as_u16()));
        }
        resp.json::<Value>().await.map_err(|e| SearchCallError::Transport(e.to_string()))
    }

    async fn call_with_retry(&self, tool: &str, args: &Value) -> Value {
        let mut attempt = 0;
        loop {
            match self.call_once(tool, args).await {
                Ok(mut value) => {
                    truncate_result_categories(&mut value);
                    return value;
                }
                Err(SearchCallError::Retryable(status)) if attempt < MAX_RETRIES => {
                    let delay = backoff_delay(attempt);
                    warn!(tool, status, attempt, ?delay, "search call retryable failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(tool, error = ?err, "search call failed");
                    return serde_json::json!({ "error": err.message() });
                }
            }
        }
    }
}

#[derive(Debug)]
enum SearchCallError {
    NotConfigured,
    Transport(String),
    Retryable(u16),
    Fatal(u16),
}

impl SearchCallError {
    fn message(&self) -> String {
        match self {
            Self::NotConfigured => "search provider not configured".into(),
            Self::Transport(e) => format!("transport error: {e}"),
            Self::Retryable(status) => format!("search provider returned {status} after retries"),
            Self::Fatal(status) => format!("search provider returned {status}"),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_BACKOFF * 2u32.pow(attempt);
    let capped = base.min(MAX_BACKOFF);
    let jitter_ms = rand::thread_rng().gen_range(0..=1000u64);
    capped + Duration::from_millis(jitter_ms)
}

fn truncate_result_categories(value: &mut Value) {
    let Value::Object(map) = value else { return };
    for (_, v) in map.iter_mut() {
        if let Value::Array(arr) = v {
            arr.truncate(MAX_RESULTS_PER_CATEGORY);
        }
    }
}

#[async_trait::async_trait]
impl FunctionCallHandler for SearchBridge {
    async fn handle(&self, _room_id: &str, name: &str, args: Value) -> Value {
        self.call_with_retry(name, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_array_categories_to_max_results() {
        let mut value = serde_json::json!({
            "web": [1, 2, 3, 4, 5, 6, 7, 8],
            "query": "hello",
        });
        truncate_result_categories(&mut value);
        assert_eq!(value["web"].as_array().unwrap().len(), MAX_RESULTS_PER_CATEGORY);
        assert_eq!(value["query"], "hello");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let d0 = backoff_delay(0);
        let d3 = backoff_delay(3);
        assert!(d0 >= BASE_BACKOFF && d0 <= BASE_BACKOFF + Duration::from_secs(1));
        assert!(d3 <= MAX_BACKOFF + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unconfigured_bridge_reports_error_without_panicking() {
        let bridge = SearchBridge::new(None, None);
        let result = bridge.handle("r1", "webSearch", serde_json::json!({"q": "rust"})).await;
        assert!(result.get("error").is_some());
    }
}
