use std::borrow::Cow;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    models::{GradedSubmission, GradingMode, GradingParameters},
    pipeline::SubmissionStore,
};

#[derive(sqlx::FromRow, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRow {
    pub id: Uuid,
    pub title: String,
    pub min_words: i32,
    pub mode: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssignmentRow {
    fn grading_parameters(&self) -> Result<GradingParameters> {
        let mode = GradingMode::parse(&self.mode)
            .ok_or_else(|| anyhow!("assignment {} has unknown mode `{}`", self.id, self.mode))?;
        Ok(GradingParameters {
            title: self.title.clone(),
            min_words: u32::try_from(self.min_words).unwrap_or(0),
            mode,
        })
    }
}

#[derive(sqlx::FromRow, Clone, Debug)]
pub struct ExportRow {
    pub student_name: Option<String>,
    pub roll_number: Option<String>,
    pub score: Option<i32>,
    pub remarks: Option<String>,
}

/// Validated input for creating an assignment.
#[derive(Clone, Debug)]
pub struct NewAssignment {
    pub title: String,
    pub min_words: u32,
    pub mode: GradingMode,
    pub description: Option<String>,
}

/// Partial update; `None` leaves the column as it is.
#[derive(Clone, Debug, Default)]
pub struct AssignmentChanges {
    pub title: Option<String>,
    pub min_words: Option<u32>,
    pub mode: Option<GradingMode>,
    pub description: Option<String>,
}

const ASSIGNMENT_COLUMNS: &str =
    "id, title, min_words, mode, description, created_at, updated_at";

/// Postgres-backed assignment and submission storage.
#[derive(Clone)]
pub struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_assignment(&self, input: &NewAssignment) -> Result<AssignmentRow> {
        sqlx::query_as::<_, AssignmentRow>(&format!(
            "INSERT INTO assignments (id, title, min_words, mode, description)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {ASSIGNMENT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&input.title)
        .bind(to_db_words(input.min_words))
        .bind(input.mode.as_str())
        .bind(&input.description)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert assignment")
    }

    pub async fn list_assignments(&self) -> Result<Vec<AssignmentRow>> {
        sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("failed to list assignments")
    }

    pub async fn fetch_assignment(&self, id: Uuid) -> Result<Option<AssignmentRow>> {
        sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load assignment {id}"))
    }

    pub async fn update_assignment(
        &self,
        id: Uuid,
        changes: &AssignmentChanges,
    ) -> Result<Option<AssignmentRow>> {
        sqlx::query_as::<_, AssignmentRow>(&format!(
            "UPDATE assignments SET
                title = COALESCE($2, title),
                min_words = COALESCE($3, min_words),
                mode = COALESCE($4, mode),
                description = COALESCE($5, description),
                updated_at = NOW()
             WHERE id = $1
             RETURNING {ASSIGNMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(&changes.title)
        .bind(changes.min_words.map(to_db_words))
        .bind(changes.mode.map(|mode| mode.as_str()))
        .bind(&changes.description)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to update assignment {id}"))
    }

    /// Deletes the assignment; submissions go with it through the foreign key.
    pub async fn delete_assignment(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assignments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete assignment {id}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fetch_export_rows(&self, assignment_id: Uuid) -> Result<Vec<ExportRow>> {
        sqlx::query_as::<_, ExportRow>(
            "SELECT student_name, roll_number, score, remarks
             FROM submissions
             WHERE assignment_id = $1
             ORDER BY batch_started_at, upload_index, created_at, id",
        )
        .bind(assignment_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load submissions for assignment {assignment_id}"))
    }
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    async fn grading_parameters(&self, assignment_id: Uuid) -> Result<Option<GradingParameters>> {
        self.fetch_assignment(assignment_id)
            .await?
            .map(|row| row.grading_parameters())
            .transpose()
    }

    async fn save_submission(
        &self,
        assignment_id: Uuid,
        submission: &GradedSubmission,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO submissions
                (id, assignment_id, original_filename, student_name, roll_number, raw_text,
                 score, remarks, batch_started_at, upload_index)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(Uuid::new_v4())
        .bind(assignment_id)
        .bind(db_text(&submission.original_name))
        .bind(db_text(&submission.student_name))
        .bind(db_text(&submission.roll_number))
        .bind(db_text(&submission.raw_text))
        .bind(submission.evaluation.score)
        .bind(db_text(&submission.evaluation.remarks))
        .bind(submission.position.batch_started_at)
        .bind(to_db_index(submission.position.index))
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to save submission `{}` for assignment {assignment_id}",
                submission.original_name
            )
        })?;
        Ok(())
    }
}

fn to_db_words(min_words: u32) -> i32 {
    i32::try_from(min_words).unwrap_or(i32::MAX)
}

fn to_db_index(index: u32) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}

/// Postgres `TEXT` rejects NUL; model remarks can carry one through a `\u0000` escape.
fn db_text(value: &str) -> Cow<'_, str> {
    if value.contains('\0') {
        Cow::Owned(value.replace('\0', ""))
    } else {
        Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(mode: &str, min_words: i32) -> AssignmentRow {
        AssignmentRow {
            id: Uuid::new_v4(),
            title: "Photosynthesis".to_string(),
            min_words,
            mode: mode.to_string(),
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn row_converts_to_grading_parameters() {
        let params = row("loose", 250).grading_parameters().unwrap();
        assert_eq!(
            params,
            GradingParameters {
                title: "Photosynthesis".to_string(),
                min_words: 250,
                mode: GradingMode::Loose,
            }
        );
    }

    #[test]
    fn unknown_mode_is_an_error() {
        assert!(row("lenient", 10).grading_parameters().is_err());
    }

    #[test]
    fn assignment_rows_serialize_with_camel_case_keys() {
        let value = serde_json::to_value(row("strict", 5)).unwrap();
        assert_eq!(value["minWords"], 5);
        assert_eq!(value["mode"], "strict");
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn oversized_word_counts_saturate() {
        assert_eq!(to_db_words(u32::MAX), i32::MAX);
        assert_eq!(to_db_words(300), 300);
        assert_eq!(to_db_index(u32::MAX), i32::MAX);
        assert_eq!(to_db_index(3), 3);
    }

    #[test]
    fn nul_characters_are_dropped_before_binding() {
        assert_eq!(db_text("Asha\0 Rao"), "Asha Rao");
        assert!(matches!(db_text("clean"), Cow::Borrowed("clean")));

        let remarks = crate::modules::assignments::evaluation::parse_ai_evaluation(
            r#"{"score": 50, "remarks": "ok\u0000"}"#,
        )
        .remarks;
        assert_eq!(db_text(&remarks), "ok");
    }
}
