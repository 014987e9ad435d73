use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::Response,
    routing::{get, post, put},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

mod admin;
pub mod evaluation;
pub mod export;
pub mod heuristic;
pub mod identity;
pub mod models;
pub mod pipeline;
pub mod store;

use crate::{
    AppState,
    web::{
        ApiError, FileFieldConfig, attachment, collect_upload_form, internal_error, json_error,
    },
};
use models::{GradingMode, ProcessedRecord, SubmissionFile};
use pipeline::GradingError;
use store::{AssignmentChanges, AssignmentRow, NewAssignment};

const UPLOAD_FIELD: &str = "files";
const ALLOWED_EXTENSIONS: &[&str] = &["pdf"];
const NOT_FOUND_MESSAGE: &str = "Assignment not found";
const DELETED_MESSAGE: &str = "Assignment deleted successfully";

pub fn router(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/assignments",
            get(list_assignments).post(create_assignment),
        )
        .route(
            "/assignments/:id",
            get(get_assignment)
                .put(update_assignment)
                .delete(delete_assignment),
        )
        .route(
            "/assignments/:id/upload",
            post(upload_submissions).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/assignments/:id/download", get(download_marks))
        .route("/api/settings/grader", get(admin::get_settings))
        .route("/api/settings/grader/models", put(admin::save_models))
        .route("/api/settings/grader/prompts", put(admin::save_prompts))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAssignmentRequest {
    title: String,
    min_words: i64,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UpdateAssignmentRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    min_words: Option<i64>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Serialize)]
struct DeleteResponse {
    message: &'static str,
    id: Uuid,
}

#[derive(Serialize)]
struct UploadResponse {
    processed: Vec<ProcessedRecord>,
}

impl CreateAssignmentRequest {
    fn validate(self) -> Result<NewAssignment, ApiError> {
        Ok(NewAssignment {
            title: validate_title(&self.title)?,
            min_words: validate_min_words(self.min_words)?,
            mode: self
                .mode
                .as_deref()
                .map(validate_mode)
                .transpose()?
                .unwrap_or_default(),
            description: self.description,
        })
    }
}

impl UpdateAssignmentRequest {
    fn validate(self) -> Result<AssignmentChanges, ApiError> {
        Ok(AssignmentChanges {
            title: self.title.as_deref().map(validate_title).transpose()?,
            min_words: self.min_words.map(validate_min_words).transpose()?,
            mode: self.mode.as_deref().map(validate_mode).transpose()?,
            description: self.description,
        })
    }
}

fn validate_title(title: &str) -> Result<String, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "Title must not be empty"));
    }
    Ok(title.to_string())
}

fn validate_min_words(min_words: i64) -> Result<u32, ApiError> {
    u32::try_from(min_words).map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "minWords must be a non-negative whole number",
        )
    })
}

fn validate_mode(mode: &str) -> Result<GradingMode, ApiError> {
    GradingMode::parse(mode).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown mode `{mode}`, expected `strict` or `loose`"),
        )
    })
}

fn assignment_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    path.map(|Path(id)| id)
        .map_err(|rejection| json_error(StatusCode::BAD_REQUEST, rejection.body_text()))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| json_error(StatusCode::BAD_REQUEST, rejection.body_text()))
}

fn not_found() -> ApiError {
    json_error(StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE)
}

async fn list_assignments(
    State(state): State<AppState>,
) -> Result<Json<Vec<AssignmentRow>>, ApiError> {
    state
        .store()
        .list_assignments()
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn create_assignment(
    State(state): State<AppState>,
    payload: Result<Json<CreateAssignmentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AssignmentRow>), ApiError> {
    let input = json_body(payload)?.validate()?;
    let row = state
        .store()
        .create_assignment(&input)
        .await
        .map_err(internal_error)?;

    info!(assignment_id = %row.id, title = %row.title, "assignment created");
    Ok((StatusCode::CREATED, Json(row)))
}

async fn get_assignment(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<AssignmentRow>, ApiError> {
    let id = assignment_id(path)?;
    state
        .store()
        .fetch_assignment(id)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(not_found)
}

async fn update_assignment(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<UpdateAssignmentRequest>, JsonRejection>,
) -> Result<Json<AssignmentRow>, ApiError> {
    let id = assignment_id(path)?;
    let changes = json_body(payload)?.validate()?;
    state
        .store()
        .update_assignment(id, &changes)
        .await
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(not_found)
}

async fn delete_assignment(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let id = assignment_id(path)?;
    let deleted = state
        .store()
        .delete_assignment(id)
        .await
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found());
    }

    info!(assignment_id = %id, "assignment deleted with its submissions");
    Ok(Json(DeleteResponse {
        message: DELETED_MESSAGE,
        id,
    }))
}

async fn upload_submissions(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let id = assignment_id(path)?;

    let field = FileFieldConfig::new(UPLOAD_FIELD, ALLOWED_EXTENSIONS, state.config().max_files);
    let upload = collect_upload_form(multipart, &[field])
        .await
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.message()))?;
    let files: Vec<SubmissionFile> = upload
        .into_files_for(UPLOAD_FIELD)
        .map(|file| SubmissionFile::new(file.original_name, file.content))
        .collect();

    let evaluator = state.evaluator().await;
    let cancel = CancellationToken::new();
    // Dropping the handler (client went away) stops the batch from starting more files.
    let guard = cancel.clone().drop_guard();
    let batch =
        tokio::spawn(async move { evaluator.evaluate_assignment(id, files, cancel).await });

    let outcome = batch.await.map_err(|err| internal_error(err.into()))?;
    let _ = guard.disarm();

    match outcome {
        Ok(processed) => Ok(Json(UploadResponse { processed })),
        Err(GradingError::AssignmentNotFound(missing)) => {
            warn!(assignment_id = %missing, "upload for unknown assignment");
            Err(not_found())
        }
        Err(GradingError::Storage(err)) => Err(internal_error(err)),
    }
}

async fn download_marks(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let id = assignment_id(path)?;
    let store = state.store();

    if store
        .fetch_assignment(id)
        .await
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found());
    }

    let rows = store.fetch_export_rows(id).await.map_err(internal_error)?;
    let csv = export::render_marks_csv(&rows).map_err(internal_error)?;
    let filename = export::marks_filename(id, Utc::now().timestamp_millis());

    info!(assignment_id = %id, rows = rows.len(), "marks exported");
    attachment(csv, &filename, mime::TEXT_CSV_UTF_8.as_ref())
}
