//! Story log persistence.
//!
//! Each successful generation is written once as a [`StoryLogRecord`] and may
//! be updated twice more: the `listened` flag and the cached narration. The
//! store is never on the critical path of generation; callers log and carry on
//! when it fails.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::GeneratedStory;

pub mod memory;
pub mod postgrest;

pub use self::memory::MemoryStore;
pub use self::postgrest::{PostgrestConfig, PostgrestStore};

/// Row written after a successful generation.
#[derive(Debug, Clone, Serialize)]
pub struct NewStoryLog {
    pub concept: String,
    pub interests: String,
    /// JSON-serialized [`GeneratedStory`].
    pub story_content: String,
    pub listened: bool,
    pub audio_data: Option<String>,
}

impl NewStoryLog {
    pub fn for_story(concept: &str, interest: &str, story: &GeneratedStory) -> Self {
        Self {
            concept: concept.to_string(),
            interests: interest.to_string(),
            // Serializing plain strings cannot fail.
            story_content: serde_json::to_string(story).unwrap_or_default(),
            listened: false,
            audio_data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryLogRecord {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub concept: String,
    pub interests: String,
    /// Usually a JSON string; json/jsonb columns come back as objects.
    pub story_content: Value,
    #[serde(default)]
    pub listened: bool,
    #[serde(default)]
    pub audio_data: Option<String>,
}

impl StoryLogRecord {
    /// Rehydrate the stored story.
    pub fn story(&self) -> Result<GeneratedStory, StoreError> {
        let parsed = match &self.story_content {
            Value::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| StoreError::Decode(format!("story_content of {}: {}", self.id, e)))
    }
}

fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unsupported id type: {other}"
        ))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("story {0} not found")]
    NotFound(String),
    #[error("network error: {0}")]
    Transport(String),
    #[error("store returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode store response: {0}")]
    Decode(String),
}

#[async_trait::async_trait]
pub trait StoryStore: Send + Sync {
    /// Short backend name for health output.
    fn backend(&self) -> &'static str;
    async fn insert(&self, log: NewStoryLog) -> Result<StoryLogRecord, StoreError>;
    async fn fetch(&self, id: &str) -> Result<StoryLogRecord, StoreError>;
    async fn set_listened(&self, id: &str, listened: bool) -> Result<(), StoreError>;
    async fn set_audio(&self, id: &str, audio_data: &str) -> Result<(), StoreError>;
}
