use serde::Deserialize;
use serde_json::{json, Value};

use super::{GenAiError, GenerativeModel, InlineData, SafetySetting};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: String,
    pub text_model: String,
    pub image_model: String,
    pub tts_model: String,
    pub timeout_ms: u64,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            tts_model: DEFAULT_TTS_MODEL.to_string(),
            timeout_ms: 30_000,
        }
    }
}

/// `generateContent` client for the Gemini REST API.
pub struct GeminiClient {
    cfg: GeminiConfig,
    client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GenerateContentResponse {
    fn parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    fn text(&self) -> Option<String> {
        let joined: String = self
            .parts()
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if joined.trim().is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    fn inline_data(&self) -> Option<InlineData> {
        self.parts()
            .iter()
            .filter_map(|p| p.inline_data.as_ref())
            .find(|d| !d.data.is_empty())
            .cloned()
    }

    /// A prompt-level block or a safety stop on the first candidate.
    fn block_reason(&self) -> Option<String> {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.clone())
        {
            return Some(reason);
        }
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .filter(|r| *r == "SAFETY" || *r == "PROHIBITED_CONTENT")
            .map(str::to_string)
    }
}

impl GeminiClient {
    pub fn new(cfg: GeminiConfig) -> Result<Self, GenAiError> {
        let timeout = std::time::Duration::from_millis(cfg.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenAiError::Transport(e.to_string()))?;
        Ok(Self { cfg, client })
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.cfg.base_url.trim_end_matches('/'),
            model
        )
    }

    async fn generate_content(
        &self,
        model: &str,
        body: Value,
    ) -> Result<GenerateContentResponse, GenAiError> {
        let resp = self
            .client
            .post(self.endpoint(model))
            .header("x-goog-api-key", &self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(model = %model, error = ?err, "gemini network error");
                GenAiError::Transport(err.to_string())
            })?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|err| GenAiError::Transport(err.to_string()))?;
        if !status.is_success() {
            tracing::warn!(model = %model, status = status.as_u16(), "gemini returned error status");
            return Err(GenAiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|err| GenAiError::Decode(err.to_string()))
    }
}

fn user_text(text: &str) -> Value {
    json!([{ "role": "user", "parts": [{ "text": text }] }])
}

#[async_trait::async_trait]
impl GenerativeModel for GeminiClient {
    async fn generate_json(
        &self,
        prompt: &str,
        schema: &Value,
        safety: &[SafetySetting],
    ) -> Result<String, GenAiError> {
        let body = json!({
            "contents": user_text(prompt),
            "safetySettings": safety,
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": schema,
            },
        });
        let resp = self.generate_content(&self.cfg.text_model, body).await?;
        if let Some(reason) = resp.block_reason() {
            return Err(GenAiError::Blocked(reason));
        }
        resp.text().ok_or(GenAiError::Empty)
    }

    async fn generate_image(
        &self,
        prompt: &str,
        safety: &[SafetySetting],
    ) -> Result<Option<InlineData>, GenAiError> {
        let body = json!({
            "contents": user_text(prompt),
            "safetySettings": safety,
        });
        let resp = self.generate_content(&self.cfg.image_model, body).await?;
        Ok(resp.inline_data())
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, GenAiError> {
        let body = json!({ "contents": user_text(prompt) });
        let resp = self.generate_content(&self.cfg.text_model, body).await?;
        resp.text().ok_or(GenAiError::Empty)
    }

    async fn synthesize_speech(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<Option<String>, GenAiError> {
        let body = json!({
            "contents": user_text(text),
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
                },
            },
        });
        let resp = self.generate_content(&self.cfg.tts_model, body).await?;
        Ok(resp.inline_data().map(|d| d.data))
    }
}
