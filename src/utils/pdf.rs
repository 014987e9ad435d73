use async_trait::async_trait;
use thiserror::Error;
use tokio::task;

/// Raised when an uploaded buffer cannot be read as a PDF.
#[derive(Debug, Error)]
#[error("failed to extract PDF text: {message}")]
pub struct ExtractionError {
    message: String,
}

impl ExtractionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Turns an uploaded document into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, content: Vec<u8>) -> Result<String, ExtractionError>;
}

/// `pdf-extract` backed extractor. Parsing runs on the blocking pool; a panic
/// inside the PDF library is reported as an [`ExtractionError`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PdfTextExtractor;

#[async_trait]
impl TextExtractor for PdfTextExtractor {
    async fn extract(&self, content: Vec<u8>) -> Result<String, ExtractionError> {
        let text = task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&content))
            .await
            .map_err(|err| ExtractionError::new(format!("PDF parser aborted: {err}")))?
            .map_err(|err| ExtractionError::new(err.to_string()))?;

        Ok(normalize_text(&text))
    }
}

/// Trim and drop NUL characters, which Postgres refuses in `TEXT` columns.
fn normalize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}
