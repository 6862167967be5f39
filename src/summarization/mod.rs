//! Summarization Service (spec.md §4.10): periodic LLM-backed condensation
//! of recent transcript entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::room::{RoomId, RoomStore, RoomStatus};
use crate::transcript::{ContextManager, TranscriptEntry, TranscriptSummary};

/// Structured LLM response shape requested by the prompt (spec.md §4.10).
#[derive(Debug, Clone, Deserialize)]
struct LlmSummaryResponse {
    summary: String,
    #[serde(default)]
    bullet_points: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    topics: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    decisions: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    action_items: Vec<String>,
}

#[derive(Debug, Serialize)]
struct LlmSummaryRequest<'a> {
    entries: Vec<LlmEntryLine<'a>>,
}

#[derive(Debug, Serialize)]
struct LlmEntryLine<'a> {
    speaker: &'a str,
    content: &'a str,
}

struct RoomTriggerState {
    entries_since_summary: usize,
    last_summary_at: DateTime<Utc>,
}

impl RoomTriggerState {
    fn new() -> Self {
        Self { entries_since_summary: 0, last_summary_at: Utc::now() }
    }
}

/// Talks to the summarization LLM over HTTP; a single call per
/// `summarize_room` invocation.
pub struct SummarizationService {
    client: reqwest::Client,
    llm_url: Option<String>,
    api_key: Option<String>,
    context: Arc<ContextManager>,
    room_store: Arc<RoomStore>,
    entry_threshold: usize,
    time_threshold: Duration,
    call_timeout: Duration,
    rooms: Mutex<HashMap<RoomId, RoomTriggerState>>,
}

impl SummarizationService {
    #[must_use]
    pub fn new(
        llm_url: Option<String>,
        api_key: Option<String>,
        context: Arc<ContextManager>,
        room_store: Arc<RoomStore>,
        entry_threshold: usize,
        time_threshold: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            llm_url,
            api_key,
            context,
            room_store,
            entry_threshold,
            time_threshold,
            call_timeout,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub async fn note_entry_appended(&self, room_id: &str) {
        let mut rooms = self.rooms.lock().await;
        rooms.entry(room_id.to_string()).or_insert_with(RoomTriggerState::new).entries_since_summary += 1;
    }

    async fn should_trigger(&self, room_id: &str) -> bool {
        let rooms = self.rooms.lock().await;
        let Some(state) = rooms.get(room_id) else { return false };
        state.entries_since_summary >= self.entry_threshold
            || (Utc::now() - state.last_summary_at).to_std().unwrap_or_default() >= self.time_threshold
    }

    /// Background ticker at 30s granularity (spec.md §4.10), driving the
    /// trigger check across every resident room.
    pub async fn run_ticker(self: Arc<Self>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            let room_ids: Vec<RoomId> = self.rooms.lock().await.keys().cloned().collect();
            for room_id in room_ids {
                if self.room_store.exists(&room_id) && self.should_trigger(&room_id).await {
                    self.summarize_room(&room_id).await;
                }
            }
        }
    }

    /// `SummarizeNow(roomId)`: forces generation regardless of triggers.
    pub async fn summarize_now(&self, room_id: &str) -> Option<TranscriptSummary> {
        self.summarize_room(room_id).await
    }

    async fn summarize_room(&self, room_id: &str) -> Option<TranscriptSummary> {
        let since = {
            let summaries = self.context.get_summaries(room_id).await;
            summaries.last().map(|s| s.coverage_end)
        };
        let since = match since {
            Some(cutoff) => Some(cutoff),
            None => self.context.last_evicted_at(room_id).await,
        };

        let entries = self.context.entries_since(room_id, since).await;
        if entries.is_empty() {
            return None;
        }

        match self.call_llm(&entries).await {
            Ok(parsed) => {
                let coverage_start = entries.first().map(|e| e.timestamp).unwrap_or_else(Utc::now);
                let coverage_end = entries.last().map(|e| e.timestamp).unwrap_or_else(Utc::now);
                let summary = TranscriptSummary {
                    id: Uuid::new_v4(),
                    room_id: room_id.to_string(),
                    timestamp: Utc::now(),
                    content: parsed.summary,
                    bullet_points: parsed.bullet_points,
                    entries_summarized: entries.len(),
                    token_count: entries.iter().map(|e| e.content.split_whitespace().count()).sum(),
                    coverage_start,
                    coverage_end,
                };
                self.context.append_summary(room_id, summary.clone()).await;

                let mut rooms = self.rooms.lock().await;
                let state = rooms.entry(room_id.to_string()).or_insert_with(RoomTriggerState::new);
                state.entries_since_summary = 0;
                state.last_summary_at = Utc::now();

                Some(summary)
            }
            Err(err) => {
                error!(room_id, error = %err, "summarization LLM call failed");
                // Counter intentionally not reset: pressure keeps building
                // until a run succeeds (spec.md §4.10).
                None
            }
        }
    }

    async fn call_llm(&self, entries: &[TranscriptEntry]) -> anyhow::Result<LlmSummaryResponse> {
        let Some(url) = &self.llm_url else {
            return Err(anyhow::anyhow!("no summary_llm_url configured"));
        };

        let body = LlmSummaryRequest {
            entries: entries.iter().map(|e| LlmEntryLine { speaker: &e.speaker, content: &e.content }).collect(),
        };

        let mut req = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = tokio::time::timeout(self.call_timeout, req.send())
            .await
            .map_err(|_| anyhow::anyhow!("summary LLM call timed out"))??;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("summary LLM returned {}", resp.status()));
        }
        Ok(resp.json::<LlmSummaryResponse>().await?)
    }

    pub async fn remove_room(&self, room_id: &str) {
        self.rooms.lock().await.remove(room_id);
    }
}

/// Unused directly but documents that an idle-sweep candidate's room must
/// still be `Active`/`Waiting`/`Full` for the ticker to bother summarizing it.
#[allow(dead_code)]
fn room_is_summarizable(status: RoomStatus) -> bool {
    status != RoomStatus::Closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::CreateRoomRequest;
    use crate::transcript::TranscriptEntryKind;

    fn make_store_and_room() -> (Arc<RoomStore>, RoomId) {
        let store = Arc::new(RoomStore::new(2, 10, 6));
        let handle = store
            .create(
                CreateRoomRequest {
                    name: "R".into(),
                    description: None,
                    max_participants: None,
                    ai_personality: None,
                    voice_settings: None,
                },
                Uuid::new_v4(),
            )
            .unwrap();
        (store, handle.id.clone())
    }

    #[tokio::test]
    async fn empty_snapshot_returns_none_without_calling_llm() {
        let (store, room_id) = make_store_and_room();
        let ctx = Arc::new(ContextManager::new(1000));
        let svc = SummarizationService::new(
            None,
            None,
            ctx,
            store,
            30,
            Duration::from_secs(600),
            Duration::from_secs(5),
        );
        let result = svc.summarize_now(&room_id).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_llm_url_is_reported_as_error_not_panic() {
        let (store, room_id) = make_store_and_room();
        let ctx = Arc::new(ContextManager::new(1000));
        ctx.append(&room_id, "Alice".into(), None, "hello".into(), TranscriptEntryKind::Ambient).await;
        let svc = SummarizationService::new(
            None,
            None,
            ctx,
            store,
            30,
            Duration::from_secs(600),
            Duration::from_secs(5),
        );
        let result = svc.summarize_now(&room_id).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn entry_threshold_trigger_fires() {
        let (store, room_id) = make_store_and_room();
        let ctx = Arc::new(ContextManager::new(1000));
        let svc = SummarizationService::new(
            None,
            None,
            ctx,
            store,
            3,
            Duration::from_secs(600),
            Duration::from_secs(5),
        );
        for _ in 0..3 {
            svc.note_entry_appended(&room_id).await;
        }
        assert!(svc.should_trigger(&room_id).await);
    }
}
