use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use tracing::{error, info};

use crate::{
    AppState,
    config::{
        GraderModels, GraderPrompts, GraderSettings, update_grader_models, update_grader_prompts,
    },
    llm::parse_model_provider,
    web::{ApiError, internal_error, json_error},
};

pub async fn get_settings(State(state): State<AppState>) -> Json<GraderSettings> {
    Json(state.grader_settings().await)
}

pub async fn save_models(
    State(state): State<AppState>,
    payload: Result<Json<GraderModels>, JsonRejection>,
) -> Result<Json<GraderSettings>, ApiError> {
    let Json(form) =
        payload.map_err(|rejection| json_error(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    let payload = validate_models(form)?;

    update_grader_models(state.pool_ref(), &payload)
        .await
        .map_err(internal_error)?;

    if let Err(err) = state.reload_settings().await {
        error!(?err, "failed to reload grader settings after model update");
    }

    info!(model = %payload.evaluation_model, "evaluation model updated");
    Ok(Json(state.grader_settings().await))
}

pub async fn save_prompts(
    State(state): State<AppState>,
    payload: Result<Json<GraderPrompts>, JsonRejection>,
) -> Result<Json<GraderSettings>, ApiError> {
    let Json(form) =
        payload.map_err(|rejection| json_error(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    let payload = GraderPrompts {
        evaluation_template: form.evaluation_template.trim().to_string(),
    };
    payload
        .validate()
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    update_grader_prompts(state.pool_ref(), &payload)
        .await
        .map_err(internal_error)?;

    if let Err(err) = state.reload_settings().await {
        error!(?err, "failed to reload grader settings after prompt update");
    }

    info!("evaluation prompt template updated");
    Ok(Json(state.grader_settings().await))
}

fn validate_models(form: GraderModels) -> Result<GraderModels, ApiError> {
    let model = form.evaluation_model.trim();
    if model.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "evaluation_model must not be empty",
        ));
    }
    parse_model_provider(model).map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    Ok(GraderModels {
        evaluation_model: model.to_string(),
    })
}
