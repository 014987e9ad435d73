use std::collections::HashMap;

use axum::extract::Multipart;

/// Result type used by the shared upload helpers.
pub type UploadResult<T> = Result<T, UploadError>;

/// Error returned when validating or reading uploaded files.
#[derive(Debug)]
pub struct UploadError {
    message: String,
}

impl UploadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UploadError {}

/// Configuration describing the expectations for a single multipart file field.
#[derive(Debug, Clone, Copy)]
pub struct FileFieldConfig<'a> {
    pub field_name: &'a str,
    pub allowed_extensions: &'a [&'a str],
    pub max_files: usize,
    pub min_files: usize,
}

impl<'a> FileFieldConfig<'a> {
    pub fn new(field_name: &'a str, allowed_extensions: &'a [&'a str], max_files: usize) -> Self {
        Self {
            field_name,
            allowed_extensions,
            max_files,
            min_files: if max_files == 0 { 0 } else { 1 },
        }
    }

    fn allows(&self, file_name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        let extension = extension_of(file_name);
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    }
}

/// A file read fully into memory. Nothing is written to disk.
#[derive(Debug, Clone)]
pub struct BufferedFile {
    pub field_name: String,
    pub original_name: String,
    pub content: Vec<u8>,
}

/// Aggregated output of the shared upload processor, in arrival order.
#[derive(Debug, Default)]
pub struct UploadOutcome {
    pub files: Vec<BufferedFile>,
}

impl UploadOutcome {
    pub fn into_files_for(self, field_name: &str) -> impl Iterator<Item = BufferedFile> + '_ {
        self.files
            .into_iter()
            .filter(move |file| file.field_name == field_name)
    }
}

/// Reads multipart form data into memory, validating each file field against its
/// configuration. Non-file fields are ignored.
pub async fn collect_upload_form(
    mut multipart: Multipart,
    field_configs: &[FileFieldConfig<'_>],
) -> UploadResult<UploadOutcome> {
    let mut field_states = HashMap::new();
    for config in field_configs {
        if config.max_files == 0 {
            return Err(UploadError::new(format!(
                "max_files for field `{}` must be greater than 0",
                config.field_name
            )));
        }
        if config.min_files > config.max_files {
            return Err(UploadError::new(format!(
                "min_files for field `{}` cannot exceed max_files",
                config.field_name
            )));
        }
        field_states.insert(
            config.field_name.to_string(),
            FieldState {
                config: *config,
                count: 0,
            },
        );
    }

    let mut files: Vec<BufferedFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| UploadError::new(format!("failed to parse upload form: {err}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };

        let Some(state) = field_states.get_mut(field_name.as_str()) else {
            return Err(UploadError::new(format!(
                "unsupported file field: `{field_name}`"
            )));
        };

        if state.count >= state.config.max_files {
            return Err(UploadError::new(format!(
                "too many files for field `{}` (at most {})",
                state.config.field_name, state.config.max_files
            )));
        }

        if !state.config.allows(&file_name) {
            return Err(UploadError::new(format!(
                "file `{file_name}` is not an accepted type; allowed: {}",
                state.config.allowed_extensions.join(", ")
            )));
        }

        let content = field
            .bytes()
            .await
            .map_err(|err| UploadError::new(format!("failed to read `{file_name}`: {err}")))?;

        files.push(BufferedFile {
            field_name: state.config.field_name.to_string(),
            original_name: file_name,
            content: content.to_vec(),
        });
        state.count += 1;
    }

    for state in field_states.values() {
        if state.count < state.config.min_files {
            return Err(UploadError::new(if state.count == 0 {
                "No files uploaded".to_string()
            } else {
                format!(
                    "field `{}` requires at least {} files",
                    state.config.field_name, state.config.min_files
                )
            }));
        }
    }

    Ok(UploadOutcome { files })
}

#[derive(Clone, Copy, Debug)]
struct FieldState<'a> {
    config: FileFieldConfig<'a>,
    count: usize,
}

/// Lower-cased text after the final dot, empty when there is none.
fn extension_of(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default()
}
