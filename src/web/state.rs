use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    config::{GraderSettings, ServerConfig},
    llm::LlmClient,
    modules::assignments::{
        heuristic::HeuristicScorer,
        pipeline::{LlmEvaluationModel, SubmissionEvaluator},
        store::PgSubmissionStore,
    },
    utils::pdf::{PdfTextExtractor, TextExtractor},
};

#[derive(Clone)]
pub struct AppState {
    pool: PgPool,
    settings: Arc<RwLock<GraderSettings>>,
    llm: LlmClient,
    extractor: Arc<dyn TextExtractor>,
    config: Arc<ServerConfig>,
}

impl AppState {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let llm_client = LlmClient::from_env().unwrap_or_else(|err| {
            warn!(?err, "failed to initialize LLM client, model evaluation disabled");
            LlmClient::disabled()
        });

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        GraderSettings::ensure_defaults(&pool, &config.default_model)
            .await
            .context("failed to seed default grader settings")?;
        let settings = GraderSettings::load(&pool)
            .await
            .context("failed to load grader settings")?;

        if llm_client.is_configured_for(&settings.models.evaluation_model) {
            info!(model = %settings.models.evaluation_model, "model evaluation enabled");
        } else {
            warn!(
                model = %settings.models.evaluation_model,
                "no API key for the evaluation model, heuristic scoring will be used"
            );
        }

        Ok(Self {
            pool,
            settings: Arc::new(RwLock::new(settings)),
            llm: llm_client,
            extractor: Arc::new(PdfTextExtractor),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> PgSubmissionStore {
        PgSubmissionStore::new(self.pool.clone())
    }

    pub fn pool_ref(&self) -> &PgPool {
        &self.pool
    }

    pub async fn grader_settings(&self) -> GraderSettings {
        self.settings.read().await.clone()
    }

    /// Build an evaluator from the settings current at call time, so a batch is
    /// unaffected by settings saved while it runs.
    pub async fn evaluator(&self) -> SubmissionEvaluator {
        let settings = self.grader_settings().await;
        SubmissionEvaluator::new(
            self.extractor.clone(),
            Arc::new(LlmEvaluationModel::new(
                self.llm.clone(),
                settings.models.evaluation_model,
            )),
            Arc::new(HeuristicScorer),
            Arc::new(self.store()),
            settings.prompts.evaluation_template,
        )
        .with_concurrency(self.config.concurrency)
    }

    pub async fn reload_settings(&self) -> Result<()> {
        let latest = GraderSettings::load(&self.pool)
            .await
            .context("failed to reload grader settings")?;
        let mut guard = self.settings.write().await;
        *guard = latest;
        Ok(())
    }
}
