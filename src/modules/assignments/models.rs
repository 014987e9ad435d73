use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder used whenever a student's name or roll number cannot be resolved.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Grading strictness for an assignment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradingMode {
    #[default]
    Strict,
    Loose,
}

impl GradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradingMode::Strict => "strict",
            GradingMode::Loose => "loose",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(GradingMode::Strict),
            "loose" => Some(GradingMode::Loose),
            _ => None,
        }
    }
}

impl fmt::Display for GradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assignment settings applied to every file of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct GradingParameters {
    pub title: String,
    pub min_words: u32,
    pub mode: GradingMode,
}

/// One uploaded file, held in memory for the duration of a batch.
#[derive(Clone, Debug)]
pub struct SubmissionFile {
    pub original_name: String,
    pub content: Vec<u8>,
}

impl SubmissionFile {
    pub fn new(original_name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            original_name: original_name.into(),
            content,
        }
    }
}

/// Best-effort student identity; fields stay `None` until something resolves them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IdentityGuess {
    pub name: Option<String>,
    pub roll: Option<String>,
}

impl IdentityGuess {
    pub fn is_complete(&self) -> bool {
        self.name.is_some() && self.roll.is_some()
    }

    /// Resolve both fields, substituting [`UNKNOWN_IDENTITY`] for anything missing.
    pub fn resolve(self) -> (String, String) {
        (
            self.name.unwrap_or_else(|| UNKNOWN_IDENTITY.to_string()),
            self.roll.unwrap_or_else(|| UNKNOWN_IDENTITY.to_string()),
        )
    }
}

/// Score and remark for a single submission. The score is always within 0..=100.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub score: i32,
    pub remarks: String,
}

impl EvaluationResult {
    pub fn new(score: i32, remarks: impl Into<String>) -> Self {
        Self {
            score: score.clamp(0, 100),
            remarks: remarks.into(),
        }
    }
}

/// Where a file sat in its upload: the batch start time and its index within
/// the batch. Exports sort by this so concurrent grading keeps upload order.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct UploadPosition {
    pub batch_started_at: DateTime<Utc>,
    pub index: u32,
}

/// Everything the storage collaborator persists for a graded submission.
#[derive(Clone, Debug, PartialEq)]
pub struct GradedSubmission {
    pub position: UploadPosition,
    pub original_name: String,
    pub student_name: String,
    pub roll_number: String,
    pub raw_text: String,
    pub evaluation: EvaluationResult,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredRecord {
    pub original_name: String,
    pub student_name: String,
    pub roll_number: String,
    pub score: i32,
    pub remarks: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRecord {
    pub original_name: String,
    pub error: String,
}

/// Per-file outcome of a batch, in the order the files were uploaded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessedRecord {
    Scored(ScoredRecord),
    Failed(FailedRecord),
}

impl ProcessedRecord {
    pub fn failed(original_name: impl Into<String>, error: impl Into<String>) -> Self {
        ProcessedRecord::Failed(FailedRecord {
            original_name: original_name.into(),
            error: error.into(),
        })
    }

    pub fn original_name(&self) -> &str {
        match self {
            ProcessedRecord::Scored(record) => &record.original_name,
            ProcessedRecord::Failed(record) => &record.original_name,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProcessedRecord::Failed(_))
    }
}

impl From<&GradedSubmission> for ProcessedRecord {
    fn from(submission: &GradedSubmission) -> Self {
        ProcessedRecord::Scored(ScoredRecord {
            original_name: submission.original_name.clone(),
            student_name: submission.student_name.clone(),
            roll_number: submission.roll_number.clone(),
            score: submission.evaluation.score,
            remarks: submission.evaluation.remarks.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_mode_parses_case_insensitively() {
        assert_eq!(GradingMode::parse(" Loose "), Some(GradingMode::Loose));
        assert_eq!(GradingMode::parse("STRICT"), Some(GradingMode::Strict));
        assert_eq!(GradingMode::parse("lenient"), None);
    }

    #[test]
    fn evaluation_result_clamps_score() {
        assert_eq!(EvaluationResult::new(140, "x").score, 100);
        assert_eq!(EvaluationResult::new(-3, "x").score, 0);
    }

    #[test]
    fn identity_resolves_missing_fields_to_unknown() {
        let guess = IdentityGuess {
            name: Some("Asha".to_string()),
            roll: None,
        };
        assert_eq!(
            guess.resolve(),
            ("Asha".to_string(), UNKNOWN_IDENTITY.to_string())
        );
    }

    #[test]
    fn processed_records_serialize_with_camel_case_keys() {
        let failed = ProcessedRecord::failed("a.pdf", "broken");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["originalName"], "a.pdf");
        assert_eq!(value["error"], "broken");

        let scored = ProcessedRecord::Scored(ScoredRecord {
            original_name: "b.pdf".to_string(),
            student_name: "Ravi".to_string(),
            roll_number: "12".to_string(),
            score: 71,
            remarks: "ok".to_string(),
        });
        let value = serde_json::to_value(&scored).unwrap();
        assert_eq!(value["studentName"], "Ravi");
        assert_eq!(value["rollNumber"], "12");
        assert!(value.get("error").is_none());
    }
}
