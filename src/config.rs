use std::env;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use crate::modules::assignments::evaluation::{
    MIN_WORDS_PLACEHOLDER, MODE_PLACEHOLDER, SUBMISSION_PLACEHOLDER, TITLE_PLACEHOLDER,
};

const MODULE_GRADER: &str = "grader";

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_MAX_FILES: usize = 50;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_MAX_UPLOAD_MB: usize = 100;
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

const DEFAULT_EVALUATION_TEMPLATE: &str = r#"You are an academic grader evaluating a student assignment.

Assignment title: "{{TITLE}}"
Minimum word count: {{MIN_WORDS}}
Grading mode: {{MODE}}

Rules:
- In strict mode, heavily penalize off-topic or irrelevant content and submissions below the minimum word count.
- In loose mode, be lenient on length and style but still reward relevance to the title.
- Judge relevance to the title, depth of content, structure (introduction, body, conclusion) and clarity.

Return only a JSON object with exactly these keys and no other text:
{"score": <integer from 0 to 100>, "remarks": "<one or two sentences of feedback>"}

Student submission:
"""
{{SUBMISSION}}
""""#;

/// Process-level settings read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub database_url: String,
    pub port: u16,
    pub max_files: usize,
    pub concurrency: usize,
    pub max_upload_bytes: usize,
    pub default_model: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL env var is missing")?;

        let gemini_model = env::var("GEMINI_MODEL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());

        Ok(Self {
            database_url,
            port: parse_env("PORT", DEFAULT_PORT)?,
            max_files: parse_env("GRADER_MAX_FILES", DEFAULT_MAX_FILES)?.max(1),
            concurrency: parse_env("GRADER_CONCURRENCY", DEFAULT_CONCURRENCY)?.max(1),
            max_upload_bytes: parse_env("GRADER_MAX_UPLOAD_MB", DEFAULT_MAX_UPLOAD_MB)?
                * 1024
                * 1024,
            default_model: format!("gemini/{gemini_model}"),
        })
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid value for {name}: {err}")),
        _ => Ok(default),
    }
}

/// Runtime-editable grader settings stored in `module_configs`.
#[derive(Clone, Debug, Serialize)]
pub struct GraderSettings {
    pub models: GraderModels,
    pub prompts: GraderPrompts,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraderModels {
    pub evaluation_model: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraderPrompts {
    pub evaluation_template: String,
}

impl Default for GraderPrompts {
    fn default() -> Self {
        Self {
            evaluation_template: DEFAULT_EVALUATION_TEMPLATE.to_string(),
        }
    }
}

impl GraderPrompts {
    /// Every prompt must carry the title, word minimum, mode and submission.
    pub fn validate(&self) -> Result<()> {
        if self.evaluation_template.trim().is_empty() {
            bail!("evaluation template must not be empty");
        }
        for placeholder in [
            TITLE_PLACEHOLDER,
            MIN_WORDS_PLACEHOLDER,
            MODE_PLACEHOLDER,
            SUBMISSION_PLACEHOLDER,
        ] {
            if !self.evaluation_template.contains(placeholder) {
                bail!("evaluation template must contain {placeholder}");
            }
        }
        Ok(())
    }
}

impl GraderSettings {
    pub async fn ensure_defaults(pool: &PgPool, default_model: &str) -> Result<()> {
        let models = serde_json::to_value(GraderModels {
            evaluation_model: default_model.to_string(),
        })?;
        let prompts = serde_json::to_value(GraderPrompts::default())?;

        sqlx::query(
            "INSERT INTO module_configs (module_name, models, prompts) VALUES ($1, $2, $3)
             ON CONFLICT (module_name) DO NOTHING",
        )
        .bind(MODULE_GRADER)
        .bind(&models)
        .bind(&prompts)
        .execute(pool)
        .await
        .context("failed to seed grader settings")?;

        Ok(())
    }

    pub async fn load(pool: &PgPool) -> Result<Self> {
        let row = sqlx::query_as::<_, ModuleConfigRow>(
            "SELECT models, prompts FROM module_configs WHERE module_name = $1",
        )
        .bind(MODULE_GRADER)
        .fetch_optional(pool)
        .await
        .context("failed to load grader configuration from database")?
        .ok_or_else(|| anyhow!("grader configuration row is missing"))?;

        parse_grader_settings(row.models, row.prompts)
    }
}

#[derive(sqlx::FromRow)]
struct ModuleConfigRow {
    models: Value,
    prompts: Value,
}

fn parse_grader_settings(models: Value, prompts: Value) -> Result<GraderSettings> {
    let models: GraderModels = serde_json::from_value(models)
        .map_err(|err| anyhow!("failed to parse grader models: {err}"))?;
    let prompts: GraderPrompts = serde_json::from_value(prompts)
        .map_err(|err| anyhow!("failed to parse grader prompts: {err}"))?;
    Ok(GraderSettings { models, prompts })
}

pub async fn update_grader_models(pool: &PgPool, models: &GraderModels) -> Result<()> {
    let payload = serde_json::to_value(models)
        .map_err(|err| anyhow!("failed to serialize models payload: {err}"))?;
    let result = sqlx::query(
        "UPDATE module_configs SET models = $2, updated_at = NOW() WHERE module_name = $1",
    )
    .bind(MODULE_GRADER)
    .bind(payload)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(anyhow!("module configuration not found for {MODULE_GRADER}"));
    }
    Ok(())
}

pub async fn update_grader_prompts(pool: &PgPool, prompts: &GraderPrompts) -> Result<()> {
    let payload = serde_json::to_value(prompts)
        .map_err(|err| anyhow!("failed to serialize prompts payload: {err}"))?;
    let result = sqlx::query(
        "UPDATE module_configs SET prompts = $2, updated_at = NOW() WHERE module_name = $1",
    )
    .bind(MODULE_GRADER)
    .bind(payload)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(anyhow!("module configuration not found for {MODULE_GRADER}"));
    }
    Ok(())
}
