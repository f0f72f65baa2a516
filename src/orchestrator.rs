//! Story orchestration: one structured text call, then three illustration
//! calls fanned out concurrently, then assembly.
//!
//! Text failures abort the request. Illustration failures are isolated per
//! slot: a slot that fails or times out is dropped and the rest are kept in
//! prompt order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::StoryError;
use crate::genai::{GenAiError, GenerativeModel, STORY_SAFETY};
use crate::validate::GenerationRequest;
use crate::GeneratedStory;

/// Number of illustrations requested per story.
pub const IMAGE_COUNT: usize = 3;

pub const IMAGE_STYLE_SUFFIX: &str =
    "Modern digital illustration, vibrant colors, child-friendly, high quality.";

pub const NARRATOR_VOICE: &str = "Puck";

const DEFAULT_REJECTION: &str = "content not allowed for safety reasons";
const MALFORMED_RESPONSE: &str = "malformed upstream response";

/// Story text as produced by the model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryDraft {
    pub title: String,
    pub content: String,
    pub moral_or_fact: String,
    #[serde(default)]
    pub image_prompts: Vec<String>,
}

/// The model's structured answer, discriminated by its `status` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StoryVerdict {
    Accepted(StoryDraft),
    Rejected {
        #[serde(default)]
        reason: String,
    },
}

impl StoryVerdict {
    pub fn parse(raw: &str) -> Result<Self, StoryError> {
        serde_json::from_str(raw.trim()).map_err(|e| {
            StoryError::Upstream(format!("{}: {}", MALFORMED_RESPONSE, e))
        })
    }
}

/// Response schema sent with the text call.
pub fn story_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "status": {
                "type": "STRING",
                "format": "enum",
                "enum": ["accepted", "rejected"],
                "description": "accepted when the story was written, rejected when the topic breaks the safety rules."
            },
            "reason": {
                "type": "STRING",
                "description": "Why the topic was rejected. Only set when status is rejected."
            },
            "title": {
                "type": "STRING",
                "description": "A creative title for the story."
            },
            "content": {
                "type": "STRING",
                "description": "The full story text, in clear paragraphs."
            },
            "moralOrFact": {
                "type": "STRING",
                "description": "A short educational takeaway or fun fact."
            },
            "imagePrompts": {
                "type": "ARRAY",
                "description": "Exactly 3 detailed visual descriptions of key moments.",
                "items": { "type": "STRING" }
            }
        },
        "required": ["status"]
    })
}

pub fn build_story_prompt(req: &GenerationRequest) -> String {
    format!(
        r#"Act as an expert teacher and a responsible, creative storyteller.

SAFETY RULES:
- Do not write about violence, weapons, explosives or dangerous activities.
- Do not write sexual content or anything unsuitable for minors.
- Do not write content that promotes hate, discrimination or harassment.
- If the requested topic breaks these rules, set "status" to "rejected", explain why in "reason" and leave every other field out.

Otherwise set "status" to "accepted" and write a story.

The goal is to explain this ACADEMIC CONCEPT: "{concept}".
Weave it into a story built around this STUDENT INTEREST: "{interest}".

Requirements:
1. The story must be exciting and use the tropes, characters or setting of the interest.
2. The explanation of the concept must be accurate and didactic, woven into the plot.
3. The tone must be inspiring and suitable for a student.
4. Write in ARGENTINE (Rioplatense) SPANISH. Use "vos" and its local conjugations. Use colloquial expressions sparingly. Keep the tone friendly, natural and suitable for children.
5. The story must be AT LEAST 500 words: an introduction (100+ words), a development that explains the concept (300+ words) and a conclusion (100+ words).
6. Produce EXACTLY {count} detailed visual descriptions (image prompts) illustrating key moments of the story.
7. Answer in JSON."#,
        concept = req.concept,
        interest = req.interest,
        count = IMAGE_COUNT,
    )
}

pub fn illustration_prompt(prompt: &str) -> String {
    format!("{}. {}", prompt.trim_end_matches('.'), IMAGE_STYLE_SUFFIX)
}

pub fn build_caption_prompt(concept: &str, interest: &str, title: &str) -> String {
    format!(
        r#"Write a short, direct message for sharing an educational story on a messaging app.

The story teaches: "{concept}"
It uses the theme: "{interest}"
The story title is: "{title}"

Requirements:
- It must clearly say which concept is taught and through which theme.
- Format: "Learn about [CONCEPT] through [THEME]".
- One concise line at most.
- No quotes, asterisks or emojis.
- Return ONLY the message text."#
    )
}

/// Deterministic caption used whenever the model cannot provide one.
pub fn share_caption_fallback(concept: &str, interest: &str) -> String {
    format!("Learn about {} through {}", concept, interest)
}

static CAPTION_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[\s"'“”*]+|[\s"'“”*]+$|\*"#).unwrap());

fn clean_caption(raw: &str) -> String {
    let first_line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    CAPTION_NOISE.replace_all(first_line, "").trim().to_string()
}

pub struct StoryOrchestrator {
    model: Arc<dyn GenerativeModel>,
    timeout: Duration,
}

impl StoryOrchestrator {
    pub fn new(model: Arc<dyn GenerativeModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn generate(&self, req: &GenerationRequest) -> Result<GeneratedStory, StoryError> {
        let prompt = build_story_prompt(req);
        let schema = story_schema();
        let raw = match tokio::time::timeout(
            self.timeout,
            self.model.generate_json(&prompt, &schema, &STORY_SAFETY),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(GenAiError::Blocked(reason))) => {
                tracing::warn!(block_reason = %reason, "story prompt blocked by model safety filter");
                return Err(StoryError::PolicyRejected(DEFAULT_REJECTION.to_string()));
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(StoryError::Upstream(format!(
                    "text generation timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        };

        let draft = match StoryVerdict::parse(&raw)? {
            StoryVerdict::Accepted(draft) => draft,
            StoryVerdict::Rejected { reason } => {
                let reason = reason.trim();
                let reason = if reason.is_empty() {
                    DEFAULT_REJECTION.to_string()
                } else {
                    reason.to_string()
                };
                tracing::warn!(
                    concept_len = req.concept.chars().count(),
                    "story rejected by content policy"
                );
                return Err(StoryError::PolicyRejected(reason));
            }
        };

        if draft.title.trim().is_empty() || draft.content.trim().is_empty() {
            return Err(StoryError::Upstream(format!(
                "{}: accepted story without title or content",
                MALFORMED_RESPONSE
            )));
        }

        if draft.image_prompts.len() != IMAGE_COUNT {
            return Err(StoryError::Upstream(format!(
                "{}: expected {} image prompts, got {}",
                MALFORMED_RESPONSE,
                IMAGE_COUNT,
                draft.image_prompts.len()
            )));
        }

        let slots = join_all(draft.image_prompts.iter().map(|p| self.illustrate(p))).await;
        let images: Vec<String> = slots.into_iter().flatten().collect();
        if images.len() < IMAGE_COUNT {
            tracing::warn!(
                returned = images.len(),
                requested = IMAGE_COUNT,
                "some illustrations were dropped"
            );
        }

        Ok(GeneratedStory {
            title: draft.title,
            content: draft.content,
            moral_or_fact: draft.moral_or_fact,
            images,
        })
    }

    /// One illustration slot. Never fails; a missing image is `None`.
    async fn illustrate(&self, prompt: &str) -> Option<String> {
        let enhanced = illustration_prompt(prompt);
        match tokio::time::timeout(
            self.timeout,
            self.model.generate_image(&enhanced, &STORY_SAFETY),
        )
        .await
        {
            Ok(Ok(Some(data))) => Some(data.to_data_uri()),
            Ok(Ok(None)) => {
                tracing::warn!("illustration response carried no inline data");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "illustration failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "illustration timed out");
                None
            }
        }
    }

    /// Narrate `text`. Any failure yields `None`.
    pub async fn synthesize_audio(&self, text: &str) -> Option<String> {
        match tokio::time::timeout(
            self.timeout,
            self.model.synthesize_speech(text, NARRATOR_VOICE),
        )
        .await
        {
            Ok(Ok(Some(audio))) if !audio.is_empty() => Some(audio),
            Ok(Ok(_)) => {
                tracing::warn!("speech response carried no audio");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "speech synthesis failed");
                None
            }
            Err(_) => {
                tracing::warn!("speech synthesis timed out");
                None
            }
        }
    }

    /// One-line share message; falls back to [`share_caption_fallback`].
    pub async fn craft_share_caption(&self, concept: &str, interest: &str, title: &str) -> String {
        let prompt = build_caption_prompt(concept, interest, title);
        let generated = match tokio::time::timeout(self.timeout, self.model.generate_text(&prompt)).await
        {
            Ok(Ok(text)) => clean_caption(&text),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "share caption generation failed");
                String::new()
            }
            Err(_) => {
                tracing::warn!("share caption generation timed out");
                String::new()
            }
        };
        if generated.is_empty() {
            share_caption_fallback(concept, interest)
        } else {
            generated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_accepted_verdict() {
        let raw = r#"{"status":"accepted","title":"T","content":"C","moralOrFact":"M","imagePrompts":["a","b","c"]}"#;
        match StoryVerdict::parse(raw).unwrap() {
            StoryVerdict::Accepted(draft) => {
                assert_eq!(draft.title, "T");
                assert_eq!(draft.image_prompts, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_rejected_verdict_without_story_fields() {
        let raw = r#"{"status":"rejected","reason":"weapons are not allowed"}"#;
        assert_eq!(
            StoryVerdict::parse(raw).unwrap(),
            StoryVerdict::Rejected {
                reason: "weapons are not allowed".into()
            }
        );
    }

    #[test]
    fn missing_discriminator_is_malformed() {
        let raw = r#"{"title":"T","content":"C","moralOrFact":"M","imagePrompts":[]}"#;
        assert!(matches!(StoryVerdict::parse(raw), Err(StoryError::Upstream(_))));
        assert!(matches!(StoryVerdict::parse("not json"), Err(StoryError::Upstream(_))));
    }

    #[test]
    fn prompt_embeds_inputs() {
        let req = GenerationRequest {
            concept: "photosynthesis".into(),
            interest: "Minecraft".into(),
        };
        let prompt = build_story_prompt(&req);
        assert!(prompt.contains("\"photosynthesis\""));
        assert!(prompt.contains("\"Minecraft\""));
        assert!(prompt.contains("EXACTLY 3"));
    }

    #[test]
    fn illustration_prompt_appends_style() {
        assert_eq!(
            illustration_prompt("A dragon reading a map."),
            "A dragon reading a map. Modern digital illustration, vibrant colors, child-friendly, high quality."
        );
    }

    #[test]
    fn caption_fallback_is_deterministic() {
        let a = share_caption_fallback("fractions", "pizza");
        let b = share_caption_fallback("fractions", "pizza");
        assert_eq!(a, b);
        assert_eq!(a, "Learn about fractions through pizza");
    }

    #[test]
    fn caption_cleanup_strips_quotes_and_asterisks() {
        assert_eq!(
            clean_caption("\"**Learn about fractions through pizza**\"\n"),
            "Learn about fractions through pizza"
        );
        assert_eq!(clean_caption("  \n  "), "");
    }
}
