use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use fabula::genai::{GeminiClient, GeminiConfig, GenAiError, GenerativeModel, STORY_SAFETY};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Seen {
    call: String,
    api_key: Option<String>,
    body: Value,
}

type Log = Arc<Mutex<Vec<Seen>>>;

async fn upstream(
    State(log): State<Log>,
    Path(call): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    log.lock().unwrap().push(Seen {
        call: call.clone(),
        api_key: headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
    let model = call.split(':').next().unwrap_or_default();
    match model {
        "story" => Json(json!({
            "candidates": [{ "content": { "parts": [
                { "text": "{\"status\":" },
                { "text": "\"accepted\"}" }
            ]}}]
        }))
        .into_response(),
        "blocked" => Json(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }))
        .into_response(),
        "picture" => Json(json!({
            "candidates": [{ "content": { "parts": [
                { "text": "Here is your illustration" },
                { "inlineData": { "mimeType": "image/png", "data": "iVBORw0KGgo=" } }
            ]}}]
        }))
        .into_response(),
        "voice" => Json(json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "audio/L16;rate=24000", "data": "AAABAA==" } }
            ]}}]
        }))
        .into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Json(json!({ "candidates": [] })).into_response()
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "model exploded").into_response(),
    }
}

async fn spawn_upstream() -> (String, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new()
        .route("/v1beta/models/:call", post(upstream))
        .with_state(log.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), log)
}

fn client(base: &str, text_model: &str, timeout_ms: u64) -> GeminiClient {
    let mut cfg = GeminiConfig::new("secret-key");
    cfg.base_url = format!("{}/", base);
    cfg.text_model = text_model.to_string();
    cfg.image_model = "picture".to_string();
    cfg.tts_model = "voice".to_string();
    cfg.timeout_ms = timeout_ms;
    GeminiClient::new(cfg).unwrap()
}

#[tokio::test]
async fn structured_call_sends_schema_and_joins_text_parts() {
    let (base, log) = spawn_upstream().await;
    let gemini = client(&base, "story", 2_000);
    let schema = json!({ "type": "OBJECT" });

    let raw = gemini
        .generate_json("tell me a story", &schema, &STORY_SAFETY)
        .await
        .unwrap();
    assert_eq!(raw, "{\"status\":\"accepted\"}");

    let seen = log.lock().unwrap()[0].clone();
    assert_eq!(seen.call, "story:generateContent");
    assert_eq!(seen.api_key.as_deref(), Some("secret-key"));
    assert_eq!(seen.body["contents"][0]["parts"][0]["text"], "tell me a story");
    assert_eq!(
        seen.body["generationConfig"]["responseMimeType"],
        "application/json"
    );
    assert_eq!(seen.body["generationConfig"]["responseSchema"], schema);
    let safety = seen.body["safetySettings"].as_array().unwrap();
    assert_eq!(safety.len(), 4);
    assert!(safety.iter().any(|s| {
        s["category"] == "HARM_CATEGORY_SEXUALLY_EXPLICIT"
            && s["threshold"] == "BLOCK_LOW_AND_ABOVE"
    }));
}

#[tokio::test]
async fn safety_block_is_reported_as_blocked() {
    let (base, _log) = spawn_upstream().await;
    let gemini = client(&base, "blocked", 2_000);
    let err = gemini
        .generate_json("something unsafe", &json!({}), &STORY_SAFETY)
        .await
        .unwrap_err();
    assert!(matches!(err, GenAiError::Blocked(ref r) if r == "SAFETY"), "{err:?}");
}

#[tokio::test]
async fn image_and_speech_return_inline_payloads() {
    let (base, log) = spawn_upstream().await;
    let gemini = client(&base, "story", 2_000);

    let image = gemini
        .generate_image("a robot", &STORY_SAFETY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(image.to_data_uri(), "data:image/png;base64,iVBORw0KGgo=");

    let audio = gemini.synthesize_speech("Había una vez", "Puck").await.unwrap();
    assert_eq!(audio.as_deref(), Some("AAABAA=="));

    let seen = log.lock().unwrap().clone();
    assert!(seen[0].body.get("generationConfig").is_none());
    assert_eq!(seen[1].call, "voice:generateContent");
    assert_eq!(
        seen[1].body["generationConfig"]["responseModalities"],
        json!(["AUDIO"])
    );
    assert_eq!(
        seen[1].body["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
            ["voiceName"],
        "Puck"
    );
}

#[tokio::test]
async fn error_status_keeps_upstream_body() {
    let (base, _log) = spawn_upstream().await;
    let gemini = client(&base, "unknown-model", 2_000);
    match gemini.generate_text("caption please").await {
        Err(GenAiError::Status { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "model exploded");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let (base, _log) = spawn_upstream().await;
    let gemini = client(&base, "slow", 100);
    let err = gemini.generate_text("hello").await.unwrap_err();
    assert!(matches!(err, GenAiError::Transport(_)), "{err:?}");
}
