//! Generative model capability.
//!
//! The orchestrator only needs four things from a model: structured JSON
//! text, an image, plain text and speech. [`GenerativeModel`] names exactly
//! those; `gemini` implements them over the Gemini REST API and tests plug in
//! stubs.

use base64::Engine;
use serde::{Deserialize, Serialize};

pub mod gemini;

pub use self::gemini::{GeminiClient, GeminiConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarmCategory {
    #[serde(rename = "HARM_CATEGORY_HATE_SPEECH")]
    HateSpeech,
    #[serde(rename = "HARM_CATEGORY_SEXUALLY_EXPLICIT")]
    SexuallyExplicit,
    #[serde(rename = "HARM_CATEGORY_DANGEROUS_CONTENT")]
    DangerousContent,
    #[serde(rename = "HARM_CATEGORY_HARASSMENT")]
    Harassment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarmThreshold {
    #[serde(rename = "BLOCK_LOW_AND_ABOVE")]
    BlockLowAndAbove,
    #[serde(rename = "BLOCK_MEDIUM_AND_ABOVE")]
    BlockMediumAndAbove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmThreshold,
}

/// Safety thresholds applied to every story text and illustration call.
/// Sexual content is filtered one notch stricter than the rest.
pub const STORY_SAFETY: [SafetySetting; 4] = [
    SafetySetting {
        category: HarmCategory::HateSpeech,
        threshold: HarmThreshold::BlockMediumAndAbove,
    },
    SafetySetting {
        category: HarmCategory::SexuallyExplicit,
        threshold: HarmThreshold::BlockLowAndAbove,
    },
    SafetySetting {
        category: HarmCategory::DangerousContent,
        threshold: HarmThreshold::BlockMediumAndAbove,
    },
    SafetySetting {
        category: HarmCategory::Harassment,
        threshold: HarmThreshold::BlockMediumAndAbove,
    },
];

/// Binary payload returned inline by the model (images, audio).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    /// Base64 payload, kept encoded.
    pub data: String,
}

impl InlineData {
    pub fn from_bytes(mime_type: &str, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// `data:<mime>;base64,<payload>` with both parts taken verbatim.
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenAiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode upstream response: {0}")]
    Decode(String),
    /// The model's own safety filter refused the prompt.
    #[error("blocked by safety filter: {0}")]
    Blocked(String),
    #[error("upstream response had no usable content")]
    Empty,
}

#[async_trait::async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Generate JSON text constrained by `schema`.
    async fn generate_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        safety: &[SafetySetting],
    ) -> Result<String, GenAiError>;

    /// Generate one image. `Ok(None)` means the model answered without
    /// inline data.
    async fn generate_image(
        &self,
        prompt: &str,
        safety: &[SafetySetting],
    ) -> Result<Option<InlineData>, GenAiError>;

    /// Generate short free-form text.
    async fn generate_text(&self, prompt: &str) -> Result<String, GenAiError>;

    /// Synthesize speech. Returns base64 raw PCM (16-bit LE mono, 24 kHz).
    async fn synthesize_speech(&self, text: &str, voice: &str)
        -> Result<Option<String>, GenAiError>;
}
