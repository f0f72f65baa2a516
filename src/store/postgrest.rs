use serde::de::DeserializeOwned;
use serde_json::json;

use super::{NewStoryLog, StoreError, StoryLogRecord, StoryStore};

pub const DEFAULT_TABLE: &str = "story_logs";

#[derive(Clone, Debug)]
pub struct PostgrestConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub api_key: String,
    pub table: String,
    pub timeout_ms: u64,
}

/// Story store backed by a hosted PostgREST endpoint (Supabase).
pub struct PostgrestStore {
    cfg: PostgrestConfig,
    client: reqwest::Client,
}

impl PostgrestStore {
    pub fn new(cfg: PostgrestConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self { cfg, client })
    }

    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.cfg.url.trim_end_matches('/'),
            self.cfg.table
        )
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.table_url())
            .header("apikey", &self.cfg.api_key)
            .bearer_auth(&self.cfg.api_key)
    }

    async fn rows<T: DeserializeOwned>(
        &self,
        rb: reqwest::RequestBuilder,
    ) -> Result<Vec<T>, StoreError> {
        let resp = rb
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn patch(&self, id: &str, body: serde_json::Value) -> Result<(), StoreError> {
        let rb = self
            .request(reqwest::Method::PATCH)
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(&body);
        let rows: Vec<serde_json::Value> = self.rows(rb).await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoryStore for PostgrestStore {
    fn backend(&self) -> &'static str {
        "postgrest"
    }

    async fn insert(&self, log: NewStoryLog) -> Result<StoryLogRecord, StoreError> {
        let rb = self
            .request(reqwest::Method::POST)
            .header("Prefer", "return=representation")
            .json(&[log]);
        let rows: Vec<StoryLogRecord> = self.rows(rb).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("insert returned no rows".into()))
    }

    async fn fetch(&self, id: &str) -> Result<StoryLogRecord, StoreError> {
        let rb = self
            .request(reqwest::Method::GET)
            .query(&[("id", format!("eq.{}", id)), ("select", "*".to_string())]);
        let rows: Vec<StoryLogRecord> = self.rows(rb).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn set_listened(&self, id: &str, listened: bool) -> Result<(), StoreError> {
        self.patch(id, json!({ "listened": listened })).await
    }

    async fn set_audio(&self, id: &str, audio_data: &str) -> Result<(), StoreError> {
        self.patch(id, json!({ "audio_data": audio_data })).await
    }
}
