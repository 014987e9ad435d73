use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::web::{ApiError, json_error};

/// Serve an in-memory buffer with a standard attachment disposition.
pub fn attachment(bytes: Vec<u8>, filename: &str, content_type: &str) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(content_type)
        .map_err(|_| json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid content type."))?;
    headers.insert(header::CONTENT_TYPE, content_type);

    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|_| json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid download header."))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    Ok((headers, bytes).into_response())
}
