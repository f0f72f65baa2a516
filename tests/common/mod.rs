#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fabula::genai::{GenAiError, GenerativeModel, InlineData, SafetySetting};
use fabula::store::{MemoryStore, StoryStore};
use fabula::{app, build_state, AppConfig, AppState, ModelConfig, RotationConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, pairs: &[(&str, &str)]) {
        for (key, value) in pairs {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        self.originals
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

pub const PROMPTS: [&str; 3] = [
    "A robot watering a sunflower",
    "The robot explaining sunlight to a bee",
    "A garden full of happy plants",
];

pub fn accepted_story() -> Value {
    json!({
        "status": "accepted",
        "title": "El robot jardinero",
        "content": "Había una vez un robot que quería entender la fotosíntesis...",
        "moralOrFact": "Las plantas fabrican su alimento con la luz del sol.",
        "imagePrompts": PROMPTS,
    })
}

/// Deterministic in-process model. Each image encodes the start of its own
/// prompt so tests can check ordering.
pub struct StubModel {
    pub story: String,
    /// Image prompts containing this marker fail.
    pub fail_images_containing: Option<String>,
    pub speech: Option<String>,
    /// Artificial narration latency, to widen race windows.
    pub speech_delay: Option<std::time::Duration>,
    pub caption: Result<String, ()>,
    pub json_calls: AtomicUsize,
    pub image_calls: AtomicUsize,
    pub text_calls: AtomicUsize,
    pub speech_calls: AtomicUsize,
}

impl StubModel {
    pub fn new(story: Value) -> Self {
        Self {
            story: story.to_string(),
            fail_images_containing: None,
            speech: Some("AAABAAIA".to_string()),
            speech_delay: None,
            caption: Ok("Learn about photosynthesis through robots".to_string()),
            json_calls: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
            speech_calls: AtomicUsize::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(accepted_story())
    }

    pub fn failing_image(mut self, marker: &str) -> Self {
        self.fail_images_containing = Some(marker.to_string());
        self
    }

    pub fn upstream_calls(&self) -> usize {
        self.json_calls.load(Ordering::SeqCst)
            + self.image_calls.load(Ordering::SeqCst)
            + self.text_calls.load(Ordering::SeqCst)
            + self.speech_calls.load(Ordering::SeqCst)
    }
}

/// Data URI the stub produces for a given image prompt.
pub fn expected_image(prompt: &str) -> String {
    let first_words: String = prompt.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
    InlineData::from_bytes("image/png", first_words.as_bytes()).to_data_uri()
}

#[async_trait::async_trait]
impl GenerativeModel for StubModel {
    async fn generate_json(
        &self,
        _prompt: &str,
        _schema: &Value,
        _safety: &[SafetySetting],
    ) -> Result<String, GenAiError> {
        self.json_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.story.clone())
    }

    async fn generate_image(
        &self,
        prompt: &str,
        _safety: &[SafetySetting],
    ) -> Result<Option<InlineData>, GenAiError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_images_containing {
            if prompt.contains(marker.as_str()) {
                return Err(GenAiError::Status {
                    status: 500,
                    body: "image backend down".into(),
                });
            }
        }
        let first_words: String = prompt.split_whitespace().take(3).collect::<Vec<_>>().join(" ");
        Ok(Some(InlineData::from_bytes("image/png", first_words.as_bytes())))
    }

    async fn generate_text(&self, _prompt: &str) -> Result<String, GenAiError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.caption.clone().map_err(|_| GenAiError::Empty)
    }

    async fn synthesize_speech(
        &self,
        _text: &str,
        _voice: &str,
    ) -> Result<Option<String>, GenAiError> {
        self.speech_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.speech_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.speech.clone())
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        model: ModelConfig {
            api_key: Some("test-key".into()),
            base_url: "http://127.0.0.1:9".into(),
            text_model: "text".into(),
            image_model: "image".into(),
            tts_model: "tts".into(),
        },
        store: None,
        allowed_origins: vec!["http://localhost:5173".into()],
        rate_limit_window_ms: 60_000,
        rate_limit_max: 10,
        upstream_timeout_ms: 2_000,
        max_request_bytes: None,
        log_file: None,
        rotation: RotationConfig::default(),
        log_stdout: false,
    }
}

pub struct TestApp {
    pub base: String,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub handle: JoinHandle<()>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Serve the app on an ephemeral port with an in-memory store.
pub async fn spawn_app(config: AppConfig, model: Option<Arc<StubModel>>) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn StoryStore> = store.clone();
    let model = model.map(|m| -> Arc<dyn GenerativeModel> { m });
    let state = build_state(&config, model, dyn_store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestApp {
        base: format!("http://{}", addr),
        state,
        store,
        handle,
    }
}

pub async fn post_story(
    app: &TestApp,
    client_ip: &str,
    body: &Value,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(app.url("/api/generate-story"))
        .header("x-forwarded-for", client_ip)
        .json(body)
        .send()
        .await
        .unwrap()
}
