//! Answer detection for handler payloads.
//!
//! A payload is definitive when it carries a non-empty string in one of the
//! [`ANSWER_FIELDS`]. The first field present wins, in declaration order.

use serde_json::Value;

/// Payload fields that terminate a run, in precedence order.
pub const ANSWER_FIELDS: [&str; 3] = ["final_answer", "answer", "summary"];

/// Result of answer detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerCheck {
    /// Definitive answer text, if any.
    pub answer: Option<String>,
    /// Field the answer was read from.
    pub field: Option<&'static str>,
    /// An answer field was present but empty or not a string.
    pub is_malformed: bool,
}

impl AnswerCheck {
    pub fn is_definitive(&self) -> bool {
        self.answer.is_some()
    }
}

/// Inspect a handler payload for a definitive answer.
///
/// # Example
/// ```
/// use skillos_core::answer::check_answer;
/// use serde_json::json;
///
/// let result = check_answer(&json!({"summary": "Three findings.", "length": 15}));
/// assert_eq!(result.answer.as_deref(), Some("Three findings."));
///
/// let result = check_answer(&json!({"matches": []}));
/// assert!(!result.is_definitive());
///
/// let result = check_answer(&json!({"answer": ""}));
/// assert!(result.is_malformed);
/// ```
pub fn check_answer(payload: &Value) -> AnswerCheck {
    let mut is_malformed = false;

    for field in ANSWER_FIELDS {
        match payload.get(field) {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                return AnswerCheck {
                    answer: Some(text.trim().to_string()),
                    field: Some(field),
                    is_malformed: false,
                };
            }
            Some(Value::Null) | None => {}
            Some(_) => is_malformed = true,
        }
    }

    AnswerCheck {
        answer: None,
        field: None,
        is_malformed,
    }
}

/// Render a successful payload as a short observation string for later
/// routing context.
pub fn render_observation(payload: &Value, max_len: usize) -> String {
    let text = match check_answer(payload).answer {
        Some(answer) => answer,
        None => match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    };
    truncate_chars(&text, max_len)
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}
