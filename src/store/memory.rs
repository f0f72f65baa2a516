use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;

use super::{NewStoryLog, StoreError, StoryLogRecord, StoryStore};

/// Process-local store used when no hosted database is configured.
#[derive(Default)]
pub struct MemoryStore {
    rows: DashMap<String, StoryLogRecord>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait::async_trait]
impl StoryStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, log: NewStoryLog) -> Result<StoryLogRecord, StoreError> {
        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let record = StoryLogRecord {
            id: id.clone(),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            concept: log.concept,
            interests: log.interests,
            story_content: Value::String(log.story_content),
            listened: log.listened,
            audio_data: log.audio_data,
        };
        self.rows.insert(id, record.clone());
        Ok(record)
    }

    async fn fetch(&self, id: &str) -> Result<StoryLogRecord, StoreError> {
        self.rows
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn set_listened(&self, id: &str, listened: bool) -> Result<(), StoreError> {
        let mut row = self
            .rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.listened = listened;
        Ok(())
    }

    async fn set_audio(&self, id: &str, audio_data: &str) -> Result<(), StoreError> {
        let mut row = self
            .rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.audio_data = Some(audio_data.to_string());
        Ok(())
    }
}
