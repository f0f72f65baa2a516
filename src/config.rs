use std::env;

use anyhow::{anyhow, Result};

use crate::admission::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MS};
use crate::genai::gemini::{
    DEFAULT_BASE_URL, DEFAULT_IMAGE_MODEL, DEFAULT_TEXT_MODEL, DEFAULT_TTS_MODEL,
};

pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    pub tts_model: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelConfig,
    /// Hosted story table; `None` keeps stories in process memory.
    pub store: Option<StoreConfig>,
    /// Origins accepted without a warning. Never enforced.
    pub allowed_origins: Vec<String>,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: usize,
    pub upstream_timeout_ms: u64,
    pub max_request_bytes: Option<usize>,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let model = ModelConfig {
            api_key: non_empty("GEMINI_API_KEY"),
            base_url: non_empty("GEMINI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            text_model: non_empty("FABULA_TEXT_MODEL")
                .unwrap_or_else(|| DEFAULT_TEXT_MODEL.to_string()),
            image_model: non_empty("FABULA_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            tts_model: non_empty("FABULA_TTS_MODEL")
                .unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
        };

        let store = match (non_empty("SUPABASE_URL"), non_empty("SUPABASE_ANON_KEY")) {
            (Some(url), Some(api_key)) => Some(StoreConfig { url, api_key }),
            (Some(_), None) => {
                return Err(anyhow!("SUPABASE_URL is set but SUPABASE_ANON_KEY is missing"))
            }
            _ => None,
        };

        let allowed_origins = env::var("FABULA_ALLOWED_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().trim_end_matches('/'))
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let rate_limit_window_ms =
            parse_optional_u64("FABULA_RATE_LIMIT_WINDOW_MS")?.unwrap_or(DEFAULT_WINDOW_MS);
        let rate_limit_max = parse_optional_u64("FABULA_RATE_LIMIT_MAX")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_REQUESTS);
        let upstream_timeout_ms = parse_optional_u64("FABULA_UPSTREAM_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS);
        let max_request_bytes = parse_optional_u64("FABULA_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            model,
            store,
            allowed_origins,
            rate_limit_window_ms,
            rate_limit_max,
            upstream_timeout_ms,
            max_request_bytes,
            log_file: non_empty("LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("FABULA_LOG_STDOUT")?.unwrap_or(false),
        })
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
