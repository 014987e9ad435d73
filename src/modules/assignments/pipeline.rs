use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, future, stream};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    evaluation::{parse_ai_evaluation, render_prompt},
    heuristic::FallbackScorer,
    identity::resolve_identity,
    models::{
        GradedSubmission, GradingParameters, ProcessedRecord, SubmissionFile, UploadPosition,
    },
};
use crate::{
    llm::{ChatMessage, LlmClient, LlmRequest, MessageRole},
    utils::pdf::TextExtractor,
};

const SYSTEM_INSTRUCTION: &str =
    "You grade student assignments. Reply with a single JSON object and nothing else.";

/// Errors that abort a whole batch. Per-file problems never surface here.
#[derive(Debug, Error)]
pub enum GradingError {
    #[error("assignment {0} not found")]
    AssignmentNotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Sends a grading prompt to an external model.
#[async_trait]
pub trait EvaluationModel: Send + Sync {
    /// Raw model text, or `None` when the model is unavailable for any reason.
    async fn evaluate(&self, prompt: &str) -> Option<String>;
}

/// Persistence surface the pipeline depends on.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn grading_parameters(&self, assignment_id: Uuid) -> Result<Option<GradingParameters>>;

    async fn save_submission(&self, assignment_id: Uuid, submission: &GradedSubmission)
    -> Result<()>;
}

/// [`EvaluationModel`] backed by the shared LLM client. Without a credential
/// for the configured provider it never touches the network.
pub struct LlmEvaluationModel {
    llm: LlmClient,
    model: String,
}

impl LlmEvaluationModel {
    pub fn new(llm: LlmClient, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EvaluationModel for LlmEvaluationModel {
    async fn evaluate(&self, prompt: &str) -> Option<String> {
        if !self.llm.is_configured_for(&self.model) {
            debug!(model = %self.model, "no credential for evaluation model, skipping call");
            return None;
        }

        let request = LlmRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::new(MessageRole::System, SYSTEM_INSTRUCTION),
                ChatMessage::new(MessageRole::User, prompt),
            ],
        );

        match self.llm.execute(request).await {
            Ok(response) => {
                debug!(
                    provider = %response.provider,
                    model = %response.model,
                    prompt_tokens = response.token_usage.prompt_tokens,
                    response_tokens = response.token_usage.response_tokens,
                    total_tokens = response.token_usage.total_tokens,
                    "model evaluation received"
                );
                Some(response.text)
            }
            Err(err) => {
                warn!(?err, model = %self.model, "model evaluation failed");
                None
            }
        }
    }
}

/// Drives extraction, identity resolution, scoring and persistence for a batch
/// of uploaded submissions.
#[derive(Clone)]
pub struct SubmissionEvaluator {
    extractor: Arc<dyn TextExtractor>,
    model: Arc<dyn EvaluationModel>,
    scorer: Arc<dyn FallbackScorer>,
    store: Arc<dyn SubmissionStore>,
    prompt_template: Arc<str>,
    concurrency: usize,
}

impl SubmissionEvaluator {
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        model: Arc<dyn EvaluationModel>,
        scorer: Arc<dyn FallbackScorer>,
        store: Arc<dyn SubmissionStore>,
        prompt_template: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            extractor,
            model,
            scorer,
            store,
            prompt_template: prompt_template.into(),
            concurrency: 1,
        }
    }

    /// Number of files evaluated at once. Output order is unaffected.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Look up the assignment's grading parameters and evaluate every file.
    pub async fn evaluate_assignment(
        &self,
        assignment_id: Uuid,
        files: Vec<SubmissionFile>,
        cancel: CancellationToken,
    ) -> Result<Vec<ProcessedRecord>, GradingError> {
        let params = self
            .store
            .grading_parameters(assignment_id)
            .await?
            .ok_or(GradingError::AssignmentNotFound(assignment_id))?;

        Ok(self
            .evaluate_batch(assignment_id, &params, files, cancel)
            .await)
    }

    /// Evaluate each file independently, returning one record per started file
    /// in upload order. Once `cancel` fires no further files are started.
    pub async fn evaluate_batch(
        &self,
        assignment_id: Uuid,
        params: &GradingParameters,
        files: Vec<SubmissionFile>,
        cancel: CancellationToken,
    ) -> Vec<ProcessedRecord> {
        let total = files.len();
        info!(
            %assignment_id,
            files = total,
            mode = %params.mode,
            concurrency = self.concurrency,
            "starting submission batch"
        );

        let batch_started_at = Utc::now();
        let records: Vec<ProcessedRecord> = stream::iter(files.into_iter().zip(0u32..))
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|(file, index)| {
                let position = UploadPosition {
                    batch_started_at,
                    index,
                };
                self.process_file(assignment_id, params, position, file)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let failed: Vec<&str> = records
            .iter()
            .filter(|record| record.is_error())
            .map(ProcessedRecord::original_name)
            .collect();
        if !failed.is_empty() {
            warn!(%assignment_id, files = ?failed, "some submissions could not be graded");
        }
        if records.len() < total {
            warn!(
                %assignment_id,
                processed = records.len(),
                skipped = total - records.len(),
                "submission batch cancelled"
            );
        }
        info!(
            %assignment_id,
            processed = records.len(),
            failed = failed.len(),
            "submission batch finished"
        );

        records
    }

    async fn process_file(
        &self,
        assignment_id: Uuid,
        params: &GradingParameters,
        position: UploadPosition,
        file: SubmissionFile,
    ) -> ProcessedRecord {
        let SubmissionFile {
            original_name,
            content,
        } = file;

        let raw_text = match self.extractor.extract(content).await {
            Ok(text) => text,
            Err(err) => {
                error!(%err, %assignment_id, file = %original_name, "failed to extract submission text");
                return ProcessedRecord::failed(original_name, err.to_string());
            }
        };

        let (student_name, roll_number) = resolve_identity(&original_name, &raw_text).resolve();

        let prompt = render_prompt(&self.prompt_template, params, &raw_text);
        let evaluation = match self.model.evaluate(&prompt).await {
            Some(text) if !text.trim().is_empty() => parse_ai_evaluation(&text),
            _ => {
                warn!(%assignment_id, file = %original_name, "model unavailable, using heuristic score");
                self.scorer.score(&raw_text, params)
            }
        };

        let submission = GradedSubmission {
            position,
            original_name,
            student_name,
            roll_number,
            raw_text,
            evaluation,
        };

        if let Err(err) = self.store.save_submission(assignment_id, &submission).await {
            error!(?err, %assignment_id, file = %submission.original_name, "failed to save submission");
            return ProcessedRecord::failed(submission.original_name, err.to_string());
        }

        ProcessedRecord::from(&submission)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use anyhow::anyhow;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        modules::assignments::{
            evaluation::UNPARSABLE_REMARK,
            heuristic::{HeuristicScorer, heuristic_evaluate},
            models::{GradingMode, UNKNOWN_IDENTITY},
        },
        utils::pdf::ExtractionError,
    };

    /// Treats the uploaded bytes as UTF-8 text; `%PDF-BROKEN` fails extraction.
    struct FakeExtractor;

    #[async_trait]
    impl TextExtractor for FakeExtractor {
        async fn extract(&self, content: Vec<u8>) -> Result<String, ExtractionError> {
            let text = String::from_utf8(content).map_err(|err| ExtractionError::new(err.to_string()))?;
            if text.starts_with("%PDF-BROKEN") {
                return Err(ExtractionError::new("invalid PDF header"));
            }
            Ok(text.trim().to_string())
        }
    }

    struct FixedModel {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl FixedModel {
        fn replying(reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EvaluationModel for FixedModel {
        async fn evaluate(&self, _prompt: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    struct CapturingModel {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EvaluationModel for CapturingModel {
        async fn evaluate(&self, prompt: &str) -> Option<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Some(r#"{"score": 64, "remarks": "Solid"}"#.to_string())
        }
    }

    /// Holds back the reply for `first` until the reply for `second` was sent,
    /// so the second upload finishes grading before the first.
    struct OutOfOrderModel {
        second_done: Notify,
    }

    #[async_trait]
    impl EvaluationModel for OutOfOrderModel {
        async fn evaluate(&self, prompt: &str) -> Option<String> {
            if prompt.ends_with("first") {
                self.second_done.notified().await;
                Some(r#"{"score": 10, "remarks": "first"}"#.to_string())
            } else {
                self.second_done.notify_one();
                Some(r#"{"score": 20, "remarks": "second"}"#.to_string())
            }
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        assignments: HashMap<Uuid, GradingParameters>,
        saved: Mutex<Vec<(Uuid, GradedSubmission)>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl SubmissionStore for MemoryStore {
        async fn grading_parameters(
            &self,
            assignment_id: Uuid,
        ) -> Result<Option<GradingParameters>> {
            Ok(self.assignments.get(&assignment_id).cloned())
        }

        async fn save_submission(
            &self,
            assignment_id: Uuid,
            submission: &GradedSubmission,
        ) -> Result<()> {
            if self.fail_for.as_deref() == Some(submission.original_name.as_str()) {
                return Err(anyhow!("database unavailable"));
            }
            self.saved
                .lock()
                .unwrap()
                .push((assignment_id, submission.clone()));
            Ok(())
        }
    }

    fn params() -> GradingParameters {
        GradingParameters {
            title: "Renewable Energy".to_string(),
            min_words: 5,
            mode: GradingMode::Strict,
        }
    }

    fn file(name: &str, body: &str) -> SubmissionFile {
        SubmissionFile::new(name, body.as_bytes().to_vec())
    }

    fn evaluator(model: Arc<dyn EvaluationModel>, store: Arc<MemoryStore>) -> SubmissionEvaluator {
        SubmissionEvaluator::new(
            Arc::new(FakeExtractor),
            model,
            Arc::new(HeuristicScorer),
            store,
            "{{TITLE}}|{{MIN_WORDS}}|{{MODE}}|{{SUBMISSION}}",
        )
    }

    fn scored(record: &ProcessedRecord) -> &crate::modules::assignments::models::ScoredRecord {
        match record {
            ProcessedRecord::Scored(record) => record,
            ProcessedRecord::Failed(record) => panic!("unexpected failure: {}", record.error),
        }
    }

    #[tokio::test]
    async fn failed_extraction_does_not_abort_the_batch() {
        let store = Arc::new(MemoryStore::default());
        let evaluator = evaluator(FixedModel::replying(None), store.clone()).with_concurrency(3);
        let files = vec![
            file("1_anna.pdf", "Renewable energy essay. It is good. Very good."),
            file("2_ben.pdf", "%PDF-BROKEN"),
            file("3_cara.pdf", "Another renewable energy essay in conclusion."),
        ];

        let records = evaluator
            .evaluate_batch(Uuid::new_v4(), &params(), files, CancellationToken::new())
            .await;

        assert_eq!(records.len(), 3);
        assert_eq!(scored(&records[0]).student_name, "anna");
        assert!(records[1].is_error());
        assert_eq!(records[1].original_name(), "2_ben.pdf");
        assert_eq!(scored(&records[2]).student_name, "cara");
        assert_eq!(store.saved.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unavailable_model_matches_heuristic_scores() {
        let store = Arc::new(MemoryStore::default());
        let model = FixedModel::replying(None);
        let evaluator = evaluator(model.clone(), store);
        let bodies = [
            "Introduction: renewable energy matters. Solar and wind. In conclusion, invest.",
            "short",
            "",
        ];
        let files = bodies
            .iter()
            .enumerate()
            .map(|(idx, body)| file(&format!("{idx}_student.pdf"), body))
            .collect();

        let records = evaluator
            .evaluate_batch(Uuid::new_v4(), &params(), files, CancellationToken::new())
            .await;

        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        for (record, body) in records.iter().zip(bodies) {
            let expected = heuristic_evaluate(body, "Renewable Energy", 5, GradingMode::Strict);
            let record = scored(record);
            assert_eq!(record.score, expected.score);
            assert_eq!(record.remarks, expected.remarks);
        }
    }

    #[tokio::test]
    async fn blank_model_reply_falls_back_to_heuristic() {
        let store = Arc::new(MemoryStore::default());
        let evaluator = evaluator(FixedModel::replying(Some("  \n")), store);
        let body = "Renewable energy. Short essay. Done now.";

        let records = evaluator
            .evaluate_batch(Uuid::new_v4(), &params(), vec![file("x.pdf", body)], CancellationToken::new())
            .await;

        let expected = heuristic_evaluate(body, "Renewable Energy", 5, GradingMode::Strict);
        assert_eq!(scored(&records[0]).score, expected.score);
    }

    #[tokio::test]
    async fn model_reply_is_parsed_and_persisted() {
        let store = Arc::new(MemoryStore::default());
        let model = FixedModel::replying(Some("```json\n{\"score\": 91, \"remarks\": \"Great\"}\n```"));
        let evaluator = evaluator(model, store.clone());
        let assignment_id = Uuid::new_v4();

        let records = evaluator
            .evaluate_batch(
                assignment_id,
                &params(),
                vec![file("essay.pdf", "Name: Dev Patel\nRoll: 31\nBody")],
                CancellationToken::new(),
            )
            .await;

        let record = scored(&records[0]);
        assert_eq!(record.score, 91);
        assert_eq!(record.remarks, "Great");
        assert_eq!(record.student_name, "essay");
        assert_eq!(record.roll_number, "31");

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved[0].0, assignment_id);
        assert_eq!(saved[0].1.raw_text, "Name: Dev Patel\nRoll: 31\nBody");
    }

    #[tokio::test]
    async fn saved_submissions_keep_upload_positions_when_finishing_out_of_order() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(OutOfOrderModel {
            second_done: Notify::new(),
        });
        let evaluator = evaluator(model, store.clone()).with_concurrency(2);

        let records = evaluator
            .evaluate_batch(
                Uuid::new_v4(),
                &params(),
                vec![file("a.pdf", "first"), file("b.pdf", "second")],
                CancellationToken::new(),
            )
            .await;

        assert_eq!(records[0].original_name(), "a.pdf");
        assert_eq!(records[1].original_name(), "b.pdf");

        let saved = store.saved.lock().unwrap();
        let save_order: Vec<&str> = saved.iter().map(|(_, s)| s.original_name.as_str()).collect();
        assert_eq!(save_order, ["b.pdf", "a.pdf"]);

        let mut by_position: Vec<&GradedSubmission> = saved.iter().map(|(_, s)| s).collect();
        by_position.sort_by_key(|submission| submission.position);
        assert_eq!(by_position[0].original_name, "a.pdf");
        assert_eq!(by_position[0].position.index, 0);
        assert_eq!(by_position[1].original_name, "b.pdf");
        assert_eq!(by_position[1].position.index, 1);
        assert_eq!(
            by_position[0].position.batch_started_at,
            by_position[1].position.batch_started_at
        );
    }

    #[tokio::test]
    async fn unparsable_model_reply_is_not_rescored_heuristically() {
        let store = Arc::new(MemoryStore::default());
        let evaluator = evaluator(FixedModel::replying(Some("I cannot grade this")), store);

        let records = evaluator
            .evaluate_batch(
                Uuid::new_v4(),
                &params(),
                vec![file("a.pdf", "Renewable energy intro text")],
                CancellationToken::new(),
            )
            .await;

        let record = scored(&records[0]);
        assert_eq!(record.score, 0);
        assert_eq!(record.remarks, UNPARSABLE_REMARK);
    }

    #[tokio::test]
    async fn unresolved_identity_defaults_to_unknown() {
        let store = Arc::new(MemoryStore::default());
        let evaluator = evaluator(FixedModel::replying(None), store);

        let records = evaluator
            .evaluate_batch(Uuid::new_v4(), &params(), vec![file(".pdf", "")], CancellationToken::new())
            .await;

        let record = scored(&records[0]);
        assert_eq!(record.student_name, UNKNOWN_IDENTITY);
        assert_eq!(record.roll_number, UNKNOWN_IDENTITY);
    }

    #[tokio::test]
    async fn prompt_embeds_parameters_and_text() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(CapturingModel {
            prompts: Mutex::new(Vec::new()),
        });
        let evaluator = evaluator(model.clone(), store);

        evaluator
            .evaluate_batch(Uuid::new_v4(), &params(), vec![file("a.pdf", " essay body ")], CancellationToken::new())
            .await;

        assert_eq!(
            model.prompts.lock().unwrap().as_slice(),
            ["Renewable Energy|5|strict|essay body".to_string()]
        );
    }

    #[tokio::test]
    async fn save_failure_becomes_a_file_error() {
        let store = Arc::new(MemoryStore {
            fail_for: Some("b.pdf".to_string()),
            ..MemoryStore::default()
        });
        let evaluator = evaluator(FixedModel::replying(None), store.clone());

        let records = evaluator
            .evaluate_batch(
                Uuid::new_v4(),
                &params(),
                vec![file("a.pdf", "one"), file("b.pdf", "two")],
                CancellationToken::new(),
            )
            .await;

        assert!(!records[0].is_error());
        assert_eq!(
            records[1],
            ProcessedRecord::failed("b.pdf", "database unavailable")
        );
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_batch_starts_no_files() {
        let store = Arc::new(MemoryStore::default());
        let model = FixedModel::replying(None);
        let evaluator = evaluator(model.clone(), store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let records = evaluator
            .evaluate_batch(Uuid::new_v4(), &params(), vec![file("a.pdf", "one")], cancel)
            .await;

        assert!(records.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_assignment_is_fatal() {
        let store = Arc::new(MemoryStore::default());
        let evaluator = evaluator(FixedModel::replying(None), store);
        let id = Uuid::new_v4();

        let err = evaluator
            .evaluate_assignment(id, vec![file("a.pdf", "one")], CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GradingError::AssignmentNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn known_assignment_uses_stored_parameters() {
        let id = Uuid::new_v4();
        let mut assignments = HashMap::new();
        assignments.insert(
            id,
            GradingParameters {
                title: "Ocean Currents".to_string(),
                min_words: 0,
                mode: GradingMode::Loose,
            },
        );
        let store = Arc::new(MemoryStore {
            assignments,
            ..MemoryStore::default()
        });
        let evaluator = evaluator(FixedModel::replying(None), store);

        let records = evaluator
            .evaluate_assignment(id, vec![file("a.pdf", "ocean currents")], CancellationToken::new())
            .await
            .unwrap();

        let expected = heuristic_evaluate("ocean currents", "Ocean Currents", 0, GradingMode::Loose);
        assert_eq!(scored(&records[0]).score, expected.score);
    }
}
