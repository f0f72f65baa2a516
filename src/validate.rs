//! Request validation. Every check here runs before any upstream call.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoryError;

/// Upper bound on `concept` and `interest`, in characters.
pub const MAX_FIELD_CHARS: usize = 500;

const MISSING_FIELDS: &str = "fields \"concept\" and \"interest\" are required strings";
const FIELDS_TOO_LONG: &str = "fields are too long";

/// An accepted generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub concept: String,
    pub interest: String,
}

pub fn ensure_write_method(method: &Method) -> Result<(), StoryError> {
    if method == Method::POST {
        Ok(())
    } else {
        Err(StoryError::MethodNotAllowed)
    }
}

pub fn ensure_configured(credential: Option<&str>) -> Result<(), StoryError> {
    match credential.map(str::trim) {
        Some(key) if !key.is_empty() => Ok(()),
        _ => Err(StoryError::Unconfigured),
    }
}

/// Validate a raw JSON body into a [`GenerationRequest`].
pub fn validate_request(body: &Value) -> Result<GenerationRequest, StoryError> {
    let concept = required_text(body, "concept")?;
    let interest = required_text(body, "interest")?;
    Ok(GenerationRequest { concept, interest })
}

/// Look up a non-empty string field bounded by [`MAX_FIELD_CHARS`].
pub(crate) fn required_text(body: &Value, field: &str) -> Result<String, StoryError> {
    let value = body
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| StoryError::InvalidInput(MISSING_FIELDS.to_string()))?;
    if value.chars().count() > MAX_FIELD_CHARS {
        return Err(StoryError::InvalidInput(FIELDS_TOO_LONG.to_string()));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_invalid(body: Value) {
        match validate_request(&body) {
            Err(StoryError::InvalidInput(_)) => {}
            other => panic!("expected InvalidInput for {body}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_well_formed_request() {
        let req = validate_request(&json!({"concept": "photosynthesis", "interest": "dinosaurs"}))
            .unwrap();
        assert_eq!(req.concept, "photosynthesis");
        assert_eq!(req.interest, "dinosaurs");
    }

    #[test]
    fn rejects_missing_empty_and_non_string_fields() {
        assert_invalid(json!({"concept": "gravity"}));
        assert_invalid(json!({"interest": "football"}));
        assert_invalid(json!({"concept": "", "interest": "football"}));
        assert_invalid(json!({"concept": "   ", "interest": "football"}));
        assert_invalid(json!({"concept": "gravity", "interest": "\t\n "}));
        assert_invalid(json!({"concept": 42, "interest": "football"}));
        assert_invalid(json!({"concept": "gravity", "interest": ["a"]}));
        assert_invalid(json!("not an object"));
    }

    #[test]
    fn length_limit_counts_characters() {
        let at_limit = "ñ".repeat(MAX_FIELD_CHARS);
        assert!(validate_request(&json!({"concept": at_limit, "interest": "x"})).is_ok());
        let over = "a".repeat(MAX_FIELD_CHARS + 1);
        match validate_request(&json!({"concept": "x", "interest": over})) {
            Err(StoryError::InvalidInput(msg)) => assert_eq!(msg, FIELDS_TOO_LONG),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_post_is_a_write() {
        assert!(ensure_write_method(&Method::POST).is_ok());
        assert!(matches!(
            ensure_write_method(&Method::GET),
            Err(StoryError::MethodNotAllowed)
        ));
    }

    #[test]
    fn blank_credential_is_unconfigured() {
        assert!(ensure_configured(Some("key")).is_ok());
        assert!(matches!(ensure_configured(None), Err(StoryError::Unconfigured)));
        assert!(matches!(ensure_configured(Some("  ")), Err(StoryError::Unconfigured)));
    }
}
