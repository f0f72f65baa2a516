//! Core library for Fabula. This module wires together admission control,
//! validation, story orchestration and persistence behind the HTTP handlers.

pub mod admission;
pub mod audio;
mod config;
pub mod error;
pub mod genai;
pub mod metrics;
pub mod orchestrator;
pub mod store;
pub mod telemetry;
pub mod validate;

pub use config::{AppConfig, ModelConfig, RotationConfig, StoreConfig};

use axum::extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tower_http::trace::TraceLayer;

use crate::admission::{RateLimiter, SlidingWindowLimiter};
use crate::error::StoryError;
use crate::genai::{GeminiClient, GeminiConfig, GenerativeModel};
use crate::metrics::Metrics;
use crate::orchestrator::{StoryOrchestrator, IMAGE_COUNT};
use crate::store::{MemoryStore, NewStoryLog, PostgrestConfig, PostgrestStore, StoryStore};
use crate::telemetry::{GenerationLogFields, TelemetrySink};
use crate::validate::{GenerationRequest, MAX_FIELD_CHARS};

/// A finished story. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedStory {
    pub title: String,
    pub content: String,
    pub moral_or_fact: String,
    /// `data:` URIs in prompt order, at most three.
    #[serde(default)]
    pub images: Vec<String>,
}

/// Body of a successful generation. `storyId` is present when the story was
/// persisted and can be shared as `/story/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryResponse {
    #[serde(flatten)]
    pub story: GeneratedStory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AudioResponse {
    /// Base64 raw PCM, 16-bit LE mono at 24 kHz.
    pub audio: String,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct CaptionResponse {
    pub caption: String,
}

/// Internal application state shared across handlers. Every collaborator is
/// passed in explicitly so tests can swap any of them.
#[derive(Clone)]
pub struct AppState {
    /// `None` when no generation credential is configured.
    pub orchestrator: Option<Arc<StoryOrchestrator>>,
    pub limiter: Arc<dyn RateLimiter>,
    /// Separate quota for model calls made on behalf of an existing story
    /// (narration misses and share captions).
    pub followup_limiter: Arc<dyn RateLimiter>,
    pub store: Arc<dyn StoryStore>,
    /// In-flight narrations keyed by story id.
    pub narrations: Arc<DashMap<String, Arc<OnceCell<String>>>>,
    pub allowed_origins: Arc<Vec<String>>,
    /// Maximum accepted raw request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    /// Bound on each store call made while serving a request.
    pub store_timeout: Duration,
    pub telemetry: TelemetrySink,
    pub metrics: Arc<Metrics>,
}

/// Assemble state from a parsed configuration and explicit collaborators.
pub fn build_state(
    config: &AppConfig,
    model: Option<Arc<dyn GenerativeModel>>,
    store: Arc<dyn StoryStore>,
) -> AppState {
    let upstream_timeout = Duration::from_millis(config.upstream_timeout_ms);
    let window = Duration::from_millis(config.rate_limit_window_ms);
    AppState {
        orchestrator: model.map(|m| Arc::new(StoryOrchestrator::new(m, upstream_timeout))),
        limiter: Arc::new(SlidingWindowLimiter::new(window, config.rate_limit_max)),
        followup_limiter: Arc::new(SlidingWindowLimiter::new(window, config.rate_limit_max)),
        store,
        narrations: Arc::new(DashMap::new()),
        allowed_origins: Arc::new(config.allowed_origins.clone()),
        max_request_bytes: config.max_request_bytes,
        store_timeout: upstream_timeout,
        telemetry: TelemetrySink::from_config(
            config.log_file.as_deref(),
            &config.rotation,
            config.log_stdout,
        ),
        metrics: Arc::new(Metrics::default()),
    }
}

/// Build state from environment variables. See [`AppConfig::from_env`] for
/// the variables read. Without `GEMINI_API_KEY` the service starts but
/// answers generation requests with "service not configured"; without
/// `SUPABASE_URL` stories are kept in process memory.
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;

    let credential = config.model.api_key.as_deref();
    let model: Option<Arc<dyn GenerativeModel>> = match validate::ensure_configured(credential) {
        Ok(()) => {
            let gemini = GeminiConfig {
                base_url: config.model.base_url.clone(),
                api_key: credential.unwrap_or_default().to_string(),
                text_model: config.model.text_model.clone(),
                image_model: config.model.image_model.clone(),
                tts_model: config.model.tts_model.clone(),
                timeout_ms: config.upstream_timeout_ms,
            };
            Some(Arc::new(GeminiClient::new(gemini)?))
        }
        Err(_) => {
            tracing::error!("GEMINI_API_KEY not configured; generation requests will fail");
            None
        }
    };

    let store: Arc<dyn StoryStore> = match &config.store {
        Some(sc) => Arc::new(PostgrestStore::new(PostgrestConfig {
            url: sc.url.clone(),
            api_key: sc.api_key.clone(),
            table: store::postgrest::DEFAULT_TABLE.to_string(),
            timeout_ms: config.upstream_timeout_ms,
        })?),
        None => {
            tracing::warn!("SUPABASE_URL not set; stories are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    Ok(build_state(&config, model, store))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/api/generate-story", any(generate_story_handler))
        .route("/api/share-caption", post(share_caption_handler))
        .route("/story/:id", get(shared_story_handler))
        .route("/story/:id/audio", get(story_audio_handler))
        .route("/story/:id/listened", post(listened_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn json_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, StoryError> {
    match payload {
        Ok(Json(body)) => Ok(body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            tracing::warn!("request body exceeded configured limit");
            Err(StoryError::PayloadTooLarge)
        }
        Err(rejection) => Err(StoryError::InvalidInput(format!(
            "invalid JSON body: {}",
            rejection.body_text()
        ))),
    }
}

fn log_foreign_origin(state: &AppState, headers: &HeaderMap, client: &str) {
    if state.allowed_origins.is_empty() {
        return;
    }
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        let origin = origin.trim_end_matches('/');
        if !state.allowed_origins.iter().any(|o| o == origin) {
            tracing::warn!(origin = %origin, client = %client, "request from unlisted origin");
        }
    }
}

/// Admission, validation, orchestration and persistence for one request.
async fn generate_story(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<StoryResponse, StoryError> {
    validate::ensure_write_method(method)?;

    let client = admission::client_id(headers);
    if !state.limiter.admit(&client) {
        tracing::info!(client = %client, "rate limit exceeded");
        return Err(StoryError::RateLimited);
    }
    log_foreign_origin(state, headers, &client);

    let orchestrator = state.orchestrator.as_ref().ok_or_else(|| {
        tracing::error!("generation requested but no model credential is configured");
        StoryError::Unconfigured
    })?;

    let body = json_body(payload)?;
    let request = validate::validate_request(&body)?;

    let story = orchestrator.generate(&request).await?;
    let story_id = persist_story(state, &request, &story).await;
    tracing::info!(
        client = %client,
        concept_len = request.concept.chars().count(),
        images = story.images.len(),
        story_id = ?story_id,
        "story generated"
    );
    Ok(StoryResponse { story, story_id })
}

/// Log the story. Failures are swallowed: the caller still gets its story.
async fn persist_story(
    state: &AppState,
    request: &GenerationRequest,
    story: &GeneratedStory,
) -> Option<String> {
    let log = NewStoryLog::for_story(&request.concept, &request.interest, story);
    match tokio::time::timeout(state.store_timeout, state.store.insert(log)).await {
        Ok(Ok(record)) => Some(record.id),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "failed to log story");
            Metrics::incr(&state.metrics.persistence_errors_total);
            None
        }
        Err(_) => {
            tracing::warn!("story log insert timed out");
            Metrics::incr(&state.metrics.persistence_errors_total);
            None
        }
    }
}

/// Handler for `/api/generate-story`. Accepts only POST with
/// `{concept, interest}` and answers with the generated story.
async fn generate_story_handler(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> axum::response::Response {
    let start = Instant::now();
    Metrics::incr(&state.metrics.requests_total);
    let result = generate_story(&state, &method, &headers, payload).await;
    let latency_ms = start.elapsed().as_millis();
    state.metrics.observe_latency(latency_ms as u64);

    let (outcome, status, images_returned) = match &result {
        Ok(resp) => ("ok", StatusCode::OK, resp.story.images.len()),
        Err(err) => (err.kind(), err.status(), 0),
    };
    match &result {
        Ok(resp) => {
            Metrics::incr(&state.metrics.stories_total);
            let dropped = IMAGE_COUNT.saturating_sub(resp.story.images.len()) as u64;
            state
                .metrics
                .images_dropped_total
                .fetch_add(dropped, Ordering::Relaxed);
        }
        Err(StoryError::RateLimited) => Metrics::incr(&state.metrics.rate_limited_total),
        Err(StoryError::InvalidInput(_)) | Err(StoryError::PayloadTooLarge) => {
            Metrics::incr(&state.metrics.invalid_total)
        }
        Err(StoryError::PolicyRejected(_)) => {
            Metrics::incr(&state.metrics.policy_rejections_total)
        }
        Err(StoryError::Upstream(_)) => Metrics::incr(&state.metrics.upstream_errors_total),
        Err(_) => {}
    }

    let images_requested = if result.is_ok() { IMAGE_COUNT } else { 0 };
    let telem = serde_json::json!({
        "schemaVersion": 1,
        "ts": chrono::Utc::now().to_rfc3339(),
        "outcome": outcome,
        "status": status.as_u16(),
        "latencyMs": latency_ms as u64,
        "imagesRequested": images_requested,
        "imagesReturned": images_returned,
        "storyId": result.as_ref().ok().and_then(|r| r.story_id.clone()),
    });
    state.telemetry.emit(
        &telem,
        &GenerationLogFields {
            outcome,
            status: status.as_u16(),
            latency_ms,
            images_returned,
        },
    );

    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Permalink: rehydrate a stored story by id.
async fn shared_story_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GeneratedStory>, StoryError> {
    let record = fetch_record(&state, &id).await?;
    Ok(Json(record.story()?))
}

async fn fetch_record(state: &AppState, id: &str) -> Result<store::StoryLogRecord, StoryError> {
    match tokio::time::timeout(state.store_timeout, state.store.fetch(id)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoryError::PersistenceUnavailable(format!(
            "fetch of story {} timed out",
            id
        ))),
    }
}

fn admit_followup(state: &AppState, headers: &HeaderMap) -> Result<(), StoryError> {
    let client = admission::client_id(headers);
    if state.followup_limiter.admit(&client) {
        Ok(())
    } else {
        tracing::info!(client = %client, "follow-up rate limit exceeded");
        Metrics::incr(&state.metrics.rate_limited_total);
        Err(StoryError::RateLimited)
    }
}

fn stored_audio(record: &store::StoryLogRecord) -> Option<String> {
    record.audio_data.clone().filter(|a| !a.is_empty())
}

/// Narration with read-through caching: the stored audio is served when
/// present, otherwise it is synthesized once and written back. Concurrent
/// misses for the same story share a single synthesis.
async fn story_audio_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AudioResponse>, StoryError> {
    let record = fetch_record(&state, &id).await?;
    if let Some(audio) = stored_audio(&record) {
        Metrics::incr(&state.metrics.audio_cache_hits_total);
        return Ok(Json(AudioResponse {
            audio,
            cached: true,
        }));
    }

    admit_followup(&state, &headers)?;
    let orchestrator = state.orchestrator.clone().ok_or(StoryError::Unconfigured)?;

    let cell = Arc::clone(&*state.narrations.entry(id.clone()).or_default());
    let synthesized = AtomicBool::new(false);
    let result = cell
        .get_or_try_init(|| narrate_and_cache(&state, &id, &orchestrator, &synthesized))
        .await
        .cloned();
    state
        .narrations
        .remove_if(&id, |_, current| Arc::ptr_eq(current, &cell));

    let audio = result?;
    Ok(Json(AudioResponse {
        audio,
        cached: !synthesized.load(Ordering::Relaxed),
    }))
}

/// Runs at most once per in-flight narration. Re-reads the record so a
/// request that missed just before another one finished reuses its audio.
async fn narrate_and_cache(
    state: &AppState,
    id: &str,
    orchestrator: &StoryOrchestrator,
    synthesized: &AtomicBool,
) -> Result<String, StoryError> {
    let record = fetch_record(state, id).await?;
    if let Some(audio) = stored_audio(&record) {
        return Ok(audio);
    }
    let story = record.story()?;
    let audio = orchestrator
        .synthesize_audio(&story.content)
        .await
        .ok_or(StoryError::AudioUnavailable)?;
    synthesized.store(true, Ordering::Relaxed);
    Metrics::incr(&state.metrics.audio_synthesized_total);

    match tokio::time::timeout(state.store_timeout, state.store.set_audio(id, &audio)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(story_id = %id, error = %err, "failed to cache narration");
            Metrics::incr(&state.metrics.persistence_errors_total);
        }
        Err(_) => {
            tracing::warn!(story_id = %id, "narration cache write timed out");
            Metrics::incr(&state.metrics.persistence_errors_total);
        }
    }
    Ok(audio)
}

/// Record the first playback of a story. Always 204; store trouble is logged.
async fn listened_handler(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    match tokio::time::timeout(state.store_timeout, state.store.set_listened(&id, true)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(story_id = %id, error = %err, "failed to update listen status");
            Metrics::incr(&state.metrics.persistence_errors_total);
        }
        Err(_) => {
            tracing::warn!(story_id = %id, "listen status update timed out");
            Metrics::incr(&state.metrics.persistence_errors_total);
        }
    }
    StatusCode::NO_CONTENT
}

/// One-line share message for a story. Falls back to a fixed template when
/// the model is unavailable.
async fn share_caption_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<CaptionResponse>, StoryError> {
    admit_followup(&state, &headers)?;
    let body = json_body(payload)?;
    let concept = validate::required_text(&body, "concept")?;
    let interest = validate::required_text(&body, "interest")?;
    let title: String = body
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("")
        .chars()
        .take(MAX_FIELD_CHARS)
        .collect();

    let caption = match &state.orchestrator {
        Some(o) => o.craft_share_caption(&concept, &interest, &title).await,
        None => orchestrator::share_caption_fallback(&concept, &interest),
    };
    Ok(Json(CaptionResponse { caption }))
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "storeBackend": state.store.backend(),
        "modelConfigured": state.orchestrator.is_some(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let body = state.metrics.render(
        state.telemetry.lines_total(),
        state.telemetry.write_errors_total(),
    );
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}
