use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::models::{EvaluationResult, GradingParameters};

pub const TITLE_PLACEHOLDER: &str = "{{TITLE}}";
pub const MIN_WORDS_PLACEHOLDER: &str = "{{MIN_WORDS}}";
pub const MODE_PLACEHOLDER: &str = "{{MODE}}";
pub const SUBMISSION_PLACEHOLDER: &str = "{{SUBMISSION}}";

pub const UNPARSABLE_REMARK: &str = "Could not parse AI evaluation";
pub const PARSE_ERROR_REMARK: &str = "Parse error in AI evaluation";

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```json").expect("fence pattern is valid"));
static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1F]+").expect("control pattern is valid"));
static OBJECT_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("object pattern is valid"));

/// Fill the grading prompt template. The submission is substituted last so
/// placeholder-looking text inside a student's essay is left untouched.
pub fn render_prompt(template: &str, params: &GradingParameters, submission: &str) -> String {
    template
        .replace(TITLE_PLACEHOLDER, &params.title)
        .replace(MIN_WORDS_PLACEHOLDER, &params.min_words.to_string())
        .replace(MODE_PLACEHOLDER, params.mode.as_str())
        .replace(SUBMISSION_PLACEHOLDER, submission)
}

/// Recover `{score, remarks}` from raw model output.
///
/// Recovery runs in a fixed order: strip fences and control characters, parse
/// the whole text as JSON, then parse the widest `{...}` span. Any JSON value
/// other than an object reads as an object without fields, except `null`,
/// which yields [`PARSE_ERROR_REMARK`]. When nothing parses the result is a
/// zero score with [`UNPARSABLE_REMARK`].
pub fn parse_ai_evaluation(raw: &str) -> EvaluationResult {
    debug!(raw, "raw model output before parsing");

    let cleaned = clean_response(raw);
    debug!(cleaned = %cleaned, "cleaned model output");

    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => return evaluation_from_value(value),
        Err(err) => warn!(%err, "strict JSON parse failed, trying object span"),
    }

    let Some(span) = OBJECT_SPAN.find(&cleaned) else {
        error!(raw, "could not parse model evaluation at all");
        return EvaluationResult::new(0, UNPARSABLE_REMARK);
    };
    match serde_json::from_str::<Value>(span.as_str()) {
        Ok(value) => evaluation_from_value(value),
        Err(err) => {
            error!(%err, raw, "object span did not parse either");
            EvaluationResult::new(0, UNPARSABLE_REMARK)
        }
    }
}

fn clean_response(raw: &str) -> String {
    let without_fences = JSON_FENCE.replace_all(raw.trim(), "").replace("```", "");
    CONTROL_CHARS
        .replace_all(&without_fences, "")
        .trim()
        .to_string()
}

fn evaluation_from_value(value: Value) -> EvaluationResult {
    match value {
        Value::Object(object) => {
            EvaluationResult::new(coerce_score(object.get("score")), coerce_remarks(&object))
        }
        Value::Null => {
            error!("model evaluation is JSON null");
            EvaluationResult::new(0, PARSE_ERROR_REMARK)
        }
        other => {
            warn!(kind = json_kind(&other), "model evaluation is not a JSON object");
            EvaluationResult::new(0, "")
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce_score(value: Option<&Value>) -> i32 {
    let number = match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => {
            let text = text.trim();
            if text.is_empty() {
                0.0
            } else {
                text.parse::<f64>().unwrap_or(0.0)
            }
        }
        Some(Value::Bool(true)) => 1.0,
        _ => 0.0,
    };

    if number.is_finite() {
        number.round().clamp(0.0, 100.0) as i32
    } else {
        0
    }
}

fn coerce_remarks(object: &Map<String, Value>) -> String {
    match object.get("remarks") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) if number.as_f64() == Some(0.0) => String::new(),
        Some(other) => other.to_string(),
    }
}
