//! Context Manager (spec.md §4.9): per-room append-only transcript ring
//! plus periodic summaries, with pagination.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::room::{PeerId, RoomId};

/// Kind of a transcript entry (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptEntryKind {
    Ambient,
    Ptt,
    AiResponse,
    System,
}

/// A single append-only transcript line (spec.md §3).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub room_id: RoomId,
    pub timestamp: DateTime<Utc>,
    pub speaker: String,
    pub speaker_id: Option<PeerId>,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: TranscriptEntryKind,
}

/// A periodic LLM-generated condensation of a coverage window (spec.md §3).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSummary {
    pub id: Uuid,
    pub room_id: RoomId,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub bullet_points: Vec<String>,
    pub entries_summarized: usize,
    pub token_count: usize,
    pub coverage_start: DateTime<Utc>,
    pub coverage_end: DateTime<Utc>,
}

/// A page of `GetEntries` results (spec.md §4.9).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPage {
    pub entries: Vec<TranscriptEntry>,
    pub has_more: bool,
    pub total: usize,
}

struct RoomTranscript {
    entries: VecDeque<TranscriptEntry>,
    summaries: Vec<TranscriptSummary>,
    /// Timestamp of the most recently evicted entry, so the next summary's
    /// `coverageStart` can point past it even though the entry itself is gone.
    last_evicted_at: Option<DateTime<Utc>>,
    total_appended: usize,
}

impl RoomTranscript {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            summaries: Vec::new(),
            last_evicted_at: None,
            total_appended: 0,
        }
    }
}

/// Process-wide per-room transcript registry. One writer task per room is
/// expected to serialize `append` calls; the lock here only guards the
/// in-memory structure itself (spec.md §4.9 "single writer task per room").
pub struct ContextManager {
    rooms: DashMap<RoomId, RwLock<RoomTranscript>>,
    max_entries_per_room: usize,
}

impl ContextManager {
    #[must_use]
    pub fn new(max_entries_per_room: usize) -> Self {
        Self { rooms: DashMap::new(), max_entries_per_room }
    }

    /// `Append(entry)`. Evicts the oldest entry when the ring is full,
    /// recording its timestamp for the next summary's `coverageStart`.
    pub async fn append(
        &self,
        room_id: &str,
        speaker: String,
        speaker_id: Option<PeerId>,
        content: String,
        kind: TranscriptEntryKind,
    ) -> TranscriptEntry {
        let entry = TranscriptEntry {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            timestamp: Utc::now(),
            speaker,
            speaker_id,
            content,
            kind,
        };

        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RwLock::new(RoomTranscript::new()));
        let mut t = room.write().await;
        if t.entries.len() >= self.max_entries_per_room {
            if let Some(evicted) = t.entries.pop_front() {
                t.last_evicted_at = Some(evicted.timestamp);
            }
        }
        t.entries.push_back(entry.clone());
        t.total_appended += 1;
        entry
    }

    /// `GetEntries(roomId, limit, offset, beforeId?)`: newest-first by
    /// default; `beforeId` restricts to entries strictly older than that id.
    pub async fn get_entries(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
        before_id: Option<Uuid>,
    ) -> EntryPage {
        let Some(room) = self.rooms.get(room_id) else {
            return EntryPage { entries: Vec::new(), has_more: false, total: 0 };
        };
        let t = room.read().await;

        let newest_first: Vec<&TranscriptEntry> = t.entries.iter().rev().collect();
        let candidates: Vec<&TranscriptEntry> = if let Some(before) = before_id {
            match newest_first.iter().position(|e| e.id == before) {
                Some(idx) => newest_first[idx + 1..].to_vec(),
                None => Vec::new(),
            }
        } else {
            newest_first
        };

        let total = candidates.len();
        let page: Vec<TranscriptEntry> =
            candidates.into_iter().skip(offset).take(limit).cloned().collect();
        let has_more = offset + page.len() < total;
        EntryPage { entries: page, has_more, total }
    }

    /// `GetSummaries(roomId)`, returned in coverage order.
    pub async fn get_summaries(&self, room_id: &str) -> Vec<TranscriptSummary> {
        let Some(room) = self.rooms.get(room_id) else { return Vec::new() };
        room.read().await.summaries.clone()
    }

    pub async fn append_summary(&self, room_id: &str, summary: TranscriptSummary) {
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RwLock::new(RoomTranscript::new()));
        room.write().await.summaries.push(summary);
    }

    /// Entries appended since the last summary's `coverageEnd`, used by the
    /// Summarization Service to build its next snapshot.
    pub async fn entries_since(&self, room_id: &str, since: Option<DateTime<Utc>>) -> Vec<TranscriptEntry> {
        let Some(room) = self.rooms.get(room_id) else { return Vec::new() };
        let t = room.read().await;
        match since {
            Some(cutoff) => t.entries.iter().filter(|e| e.timestamp > cutoff).cloned().collect(),
            None => t.entries.iter().cloned().collect(),
        }
    }

    /// Count of entries appended since a given count snapshot, used for the
    /// entry-count summary trigger.
    pub async fn total_appended(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |r| r.try_read().map(|t| t.total_appended).unwrap_or(0))
    }

    /// Last evicted entry's timestamp, for `coverageStart` continuity
    /// across ring eviction.
    pub async fn last_evicted_at(&self, room_id: &str) -> Option<DateTime<Utc>> {
        self.rooms.get(room_id)?.read().await.last_evicted_at
    }

    /// Whole-room JSON snapshot for [`crate::room::ExportSink`].
    pub async fn export_snapshot(&self, room_id: &str) -> serde_json::Value {
        let Some(room) = self.rooms.get(room_id) else {
            return serde_json::json!({ "entries": [], "summaries": [] });
        };
        let t = room.read().await;
        serde_json::json!({
            "entries": t.entries.iter().collect::<Vec<_>>(),
            "summaries": t.summaries,
        })
    }

    pub fn remove_room(&self, room_id: &str) {
        self.rooms.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_paginate_newest_first() {
        let cm = ContextManager::new(10);
        for i in 0..5 {
            cm.append("r1", "Alice".into(), None, format!("msg {i}"), TranscriptEntryKind::Ambient)
                .await;
        }
        let page = cm.get_entries("r1", 2, 0, None).await;
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].content, "msg 4");
        assert_eq!(page.entries[1].content, "msg 3");
        assert!(page.has_more);
        assert_eq!(page.total, 5);
    }

    #[tokio::test]
    async fn before_id_excludes_entry_and_everything_newer() {
        let cm = ContextManager::new(10);
        let mut ids = Vec::new();
        for i in 0..4 {
            let e = cm
                .append("r1", "Alice".into(), None, format!("msg {i}"), TranscriptEntryKind::Ambient)
                .await;
            ids.push(e.id);
        }
        let page = cm.get_entries("r1", 10, 0, Some(ids[2])).await;
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].content, "msg 1");
        assert_eq!(page.entries[1].content, "msg 0");
    }

    #[tokio::test]
    async fn ring_evicts_oldest_and_records_eviction_timestamp() {
        let cm = ContextManager::new(2);
        cm.append("r1", "Alice".into(), None, "a".into(), TranscriptEntryKind::Ambient).await;
        cm.append("r1", "Alice".into(), None, "b".into(), TranscriptEntryKind::Ambient).await;
        cm.append("r1", "Alice".into(), None, "c".into(), TranscriptEntryKind::Ambient).await;

        let page = cm.get_entries("r1", 10, 0, None).await;
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].content, "c");
        assert_eq!(page.entries[1].content, "b");
        assert!(cm.last_evicted_at("r1").await.is_some());
    }
}
