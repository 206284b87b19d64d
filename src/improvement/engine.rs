//! Bounded generate → validate → retry loop.
//!
//! One session owns its attempt history and runs strictly sequentially: the
//! prompt for attempt k+1 is only composed once attempt k has been validated.
//! Patterns observed during a session are buffered and written to the
//! `PatternStore` when the session reaches a terminal state.

use super::classifier::{classify, ErrorCategory};
use super::patterns::{ErrorPattern, PatternOutcome, PatternStore};
use super::prompt::{select_strategy, FailureContext, PriorError, PromptComposer};
use super::validator::{CandidateValidator, FunctionSignature, ValidationResult};
use crate::llm::{CodeGenerator, GeneratedCode, GenerationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// At least 1
    pub max_attempts: u32,
    pub generation_timeout: Duration,
    pub expected_signature: FunctionSignature,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            generation_timeout: Duration::from_secs(120),
            expected_signature: FunctionSignature {
                name: "predict".to_string(),
                params: vec!["price_data".to_string()],
            },
        }
    }
}

/// What starts a session
#[derive(Debug, Clone)]
pub struct ImprovementRequest {
    pub context: FailureContext,
    /// Category to look up learned guidance for on the first attempt
    pub suspected_category: Option<ErrorCategory>,
}

impl ImprovementRequest {
    pub fn new(context: FailureContext) -> Self {
        Self {
            context,
            suspected_category: None,
        }
    }

    pub fn with_suspected_category(mut self, category: ErrorCategory) -> Self {
        self.suspected_category = Some(category);
        self
    }
}

/// One generate+validate iteration. Never changed after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementAttempt {
    pub attempt_number: u32,
    pub generated_code: String,
    pub validation_result: ValidationResult,
    pub focus_strategy: String,
    /// Classification of the failure; None when the candidate was valid
    pub category: Option<ErrorCategory>,
    pub description: Option<String>,
    #[serde(default)]
    pub changes_made: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    /// The last attempt holds the validated candidate
    Success { attempts: Vec<ImprovementAttempt> },
    Exhausted { attempts: Vec<ImprovementAttempt> },
    GenerationFailed {
        attempt_number: u32,
        error: GenerationError,
        attempts: Vec<ImprovementAttempt>,
    },
    Cancelled { attempts: Vec<ImprovementAttempt> },
}

impl EngineOutcome {
    pub fn attempts(&self) -> &[ImprovementAttempt] {
        match self {
            EngineOutcome::Success { attempts }
            | EngineOutcome::Exhausted { attempts }
            | EngineOutcome::GenerationFailed { attempts, .. }
            | EngineOutcome::Cancelled { attempts } => attempts,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            EngineOutcome::Success { .. } => "success",
            EngineOutcome::Exhausted { .. } => "exhausted",
            EngineOutcome::GenerationFailed { .. } => "generation_failed",
            EngineOutcome::Cancelled { .. } => "cancelled",
        }
    }

    /// The validated attempt, only for `Success`
    pub fn winner(&self) -> Option<&ImprovementAttempt> {
        match self {
            EngineOutcome::Success { attempts } => attempts.last(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcome: EngineOutcome,
}

pub struct ImprovementEngine {
    generator: Arc<dyn CodeGenerator>,
    validator: Arc<dyn CandidateValidator>,
    patterns: Arc<PatternStore>,
    composer: PromptComposer,
    config: EngineConfig,
}

impl ImprovementEngine {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        validator: Arc<dyn CandidateValidator>,
        patterns: Arc<PatternStore>,
        composer: PromptComposer,
        mut config: EngineConfig,
    ) -> Self {
        if config.max_attempts == 0 {
            tracing::warn!("max_attempts of 0 raised to 1");
            config.max_attempts = 1;
        }

        Self {
            generator,
            validator,
            patterns,
            composer,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    /// Run one session to a terminal state
    ///
    /// Cancellation is checked before each generation; an in-flight LLM call
    /// is allowed to finish.
    pub async fn run(&self, request: &ImprovementRequest, cancel: &CancellationToken) -> SessionReport {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let max_attempts = self.config.max_attempts;

        let mut attempts: Vec<ImprovementAttempt> = Vec::new();
        let mut prior_errors: Vec<PriorError> = Vec::new();
        let mut pending: Vec<ErrorPattern> = Vec::new();
        let mut attempt_number: u32 = 1;

        tracing::info!(
            session_id = %session_id,
            max_attempts,
            generator = self.generator.name(),
            reason = %request.context.reason,
            "Improvement session started"
        );

        let outcome = loop {
            if cancel.is_cancelled() {
                tracing::warn!(session_id = %session_id, attempt = attempt_number, "Session cancelled");
                break EngineOutcome::Cancelled { attempts };
            }

            let last_category = prior_errors.last().map(|p| p.category);
            let best_known = last_category
                .or(request.suspected_category)
                .and_then(|c| self.patterns.best_strategy_for(c));
            let strategy = select_strategy(last_category, best_known.as_deref());
            let prompt = self.composer.compose(
                attempt_number,
                &request.context,
                &prior_errors,
                best_known.as_deref(),
            );

            tracing::info!(
                session_id = %session_id,
                attempt = attempt_number,
                strategy = %strategy,
                prompt_chars = prompt.len(),
                "Generating candidate"
            );

            let generated = match self.generate(&prompt).await {
                Ok(generated) => generated,
                Err(error) => {
                    tracing::error!(
                        session_id = %session_id,
                        attempt = attempt_number,
                        "Generation failed: {}",
                        error
                    );
                    break EngineOutcome::GenerationFailed {
                        attempt_number,
                        error,
                        attempts,
                    };
                }
            };

            let validation = self
                .validator
                .validate(&generated.code, &self.config.expected_signature)
                .await;

            if validation.is_valid() {
                tracing::info!(session_id = %session_id, attempt = attempt_number, "Candidate validated");
                // A first-try success has nothing to teach
                if let Some(recovered_from) = last_category {
                    pending.push(ErrorPattern::new(
                        recovered_from,
                        strategy.clone(),
                        PatternOutcome::Success,
                    ));
                }
                attempts.push(new_attempt(attempt_number, generated, validation, strategy, None));
                break EngineOutcome::Success { attempts };
            }

            let category = classify(validation.error_summary());
            tracing::warn!(
                session_id = %session_id,
                attempt = attempt_number,
                category = %category,
                "Candidate rejected: {}",
                validation.error_summary().lines().next().unwrap_or("")
            );

            pending.push(ErrorPattern::new(category, strategy.clone(), PatternOutcome::Failure));
            prior_errors.push(PriorError {
                attempt_number,
                category,
                error_summary: validation.error_summary().to_string(),
            });
            attempts.push(new_attempt(
                attempt_number,
                generated,
                validation,
                strategy,
                Some(category),
            ));

            if attempt_number >= max_attempts {
                tracing::warn!(
                    session_id = %session_id,
                    attempts = attempts.len(),
                    "No valid improvement found after {} attempts",
                    max_attempts
                );
                break EngineOutcome::Exhausted { attempts };
            }
            attempt_number += 1;
        };

        for pattern in pending {
            self.patterns.record(pattern);
        }

        SessionReport {
            session_id,
            started_at,
            outcome,
        }
    }

    async fn generate(&self, prompt: &str) -> Result<GeneratedCode, GenerationError> {
        let timeout = self.config.generation_timeout;
        match tokio::time::timeout(timeout, self.generator.generate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(timeout)),
        }
    }
}

fn new_attempt(
    attempt_number: u32,
    generated: GeneratedCode,
    validation_result: ValidationResult,
    focus_strategy: String,
    category: Option<ErrorCategory>,
) -> ImprovementAttempt {
    ImprovementAttempt {
        attempt_number,
        generated_code: generated.code,
        validation_result,
        focus_strategy,
        category,
        description: generated.description,
        changes_made: generated.changes_made,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::improvement::prompt::FailureContext;
    use crate::improvement::validator::{CheckKind, CheckResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays scripted responses and keeps every prompt it was given
    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<GeneratedCode, GenerationError>>>,
        prompts: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<GeneratedCode, GenerationError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CodeGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<GeneratedCode, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GenerationError::Request("script exhausted".to_string())))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Accepts code containing "VALID"; otherwise fails with the code as summary
    struct MarkerValidator;

    #[async_trait]
    impl CandidateValidator for MarkerValidator {
        async fn validate(&self, code: &str, _expected: &FunctionSignature) -> ValidationResult {
            if code.contains("VALID") {
                ValidationResult::from_checks(
                    CheckKind::ORDER.iter().map(|&k| CheckResult::passed(k, "ok")).collect(),
                )
            } else {
                ValidationResult::from_checks(vec![
                    CheckResult::failed(CheckKind::Syntax, code.to_string()),
                    CheckResult::not_run(CheckKind::Signature, "source does not parse"),
                    CheckResult::not_run(CheckKind::ImportSafety, "source does not parse"),
                    CheckResult::not_run(CheckKind::SandboxedExecution, "source does not parse"),
                ])
            }
        }
    }

    fn code(text: &str) -> Result<GeneratedCode, GenerationError> {
        Ok(GeneratedCode::from_code(text))
    }

    fn engine(generator: Arc<ScriptedGenerator>, patterns: Arc<PatternStore>) -> ImprovementEngine {
        let config = EngineConfig::default();
        let composer = PromptComposer::new(config.expected_signature.clone(), vec!["math".to_string()]);
        ImprovementEngine::new(generator, Arc::new(MarkerValidator), patterns, composer, config)
    }

    fn request() -> ImprovementRequest {
        ImprovementRequest::new(FailureContext::manual(
            "wrong prediction",
            "def predict(price_data):\n    return 'up'\n".to_string(),
        ))
    }

    fn store(dir: &TempDir) -> Arc<PatternStore> {
        Arc::new(PatternStore::open(dir.path().join("patterns.jsonl")))
    }

    #[tokio::test]
    async fn test_first_try_success_records_nothing() {
        let dir = TempDir::new().unwrap();
        let patterns = store(&dir);
        let generator = Arc::new(ScriptedGenerator::new(vec![code("VALID")]));

        let report = engine(generator, patterns.clone())
            .run(&request(), &CancellationToken::new())
            .await;

        assert_eq!(report.outcome.status(), "success");
        assert_eq!(report.outcome.attempts().len(), 1);
        assert!(patterns.is_empty());
    }

    #[tokio::test]
    async fn test_recovery_records_failures_and_success() {
        let dir = TempDir::new().unwrap();
        let patterns = store(&dir);
        let generator = Arc::new(ScriptedGenerator::new(vec![
            code("IndentationError: unexpected indent"),
            code("VALID"),
        ]));

        let report = engine(generator.clone(), patterns.clone())
            .run(&request(), &CancellationToken::new())
            .await;

        let winner = report.outcome.winner().unwrap();
        assert_eq!(winner.attempt_number, 2);
        assert_eq!(winner.focus_strategy, "enforce_four_space_blocks");
        assert_eq!(report.outcome.attempts()[0].category, Some(ErrorCategory::Indentation));

        let stats = patterns.statistics(ErrorCategory::Indentation);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.best_strategy.as_deref(), Some("enforce_four_space_blocks"));

        let prompts = generator.prompts();
        assert!(prompts[1].contains("IndentationError: unexpected indent"));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded_and_sequential() {
        let dir = TempDir::new().unwrap();
        let generator = Arc::new(ScriptedGenerator::new(
            (1..=10).map(|i| code(&format!("SyntaxError: invalid syntax #{}", i))).collect(),
        ));

        let report = engine(generator.clone(), store(&dir))
            .run(&request(), &CancellationToken::new())
            .await;

        assert_eq!(report.outcome.status(), "exhausted");
        let numbers: Vec<u32> = report
            .outcome
            .attempts()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(generator.prompts().len(), DEFAULT_MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_prompts_grow_monotonically() {
        let dir = TempDir::new().unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![
            code("SyntaxError: first"),
            code("IndentationError: second"),
            code("no module named third"),
            code("VALID"),
        ]));

        engine(generator.clone(), store(&dir))
            .run(&request(), &CancellationToken::new())
            .await;

        let prompts = generator.prompts();
        let errors = ["SyntaxError: first", "IndentationError: second", "no module named third"];
        for (k, prompt) in prompts.iter().enumerate() {
            for (j, error) in errors.iter().enumerate() {
                assert_eq!(prompt.contains(error), j < k, "prompt {} / error {}", k + 1, j + 1);
            }
        }
    }

    #[tokio::test]
    async fn test_generation_failure_on_first_attempt_records_nothing() {
        let dir = TempDir::new().unwrap();
        let patterns = store(&dir);
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(GenerationError::Timeout(
            Duration::from_secs(120),
        ))]));

        let report = engine(generator, patterns.clone())
            .run(&request(), &CancellationToken::new())
            .await;

        match report.outcome {
            EngineOutcome::GenerationFailed {
                attempt_number,
                error,
                attempts,
            } => {
                assert_eq!(attempt_number, 1);
                assert!(matches!(error, GenerationError::Timeout(_)));
                assert!(attempts.is_empty());
            }
            other => panic!("expected GenerationFailed, got {:?}", other),
        }
        assert!(patterns.is_empty());
    }

    #[tokio::test]
    async fn test_generation_failure_later_keeps_earlier_failures() {
        let dir = TempDir::new().unwrap();
        let patterns = store(&dir);
        let generator = Arc::new(ScriptedGenerator::new(vec![
            code("SyntaxError: invalid syntax"),
            Err(GenerationError::RateLimited("slow down".to_string())),
        ]));

        let report = engine(generator, patterns.clone())
            .run(&request(), &CancellationToken::new())
            .await;

        assert_eq!(report.outcome.status(), "generation_failed");
        assert_eq!(report.outcome.attempts().len(), 1);
        assert_eq!(patterns.len(), 1);
    }

    #[tokio::test]
    async fn test_generator_timeout_is_enforced() {
        let dir = TempDir::new().unwrap();
        let mut generator = ScriptedGenerator::new(vec![code("VALID")]);
        generator.delay = Some(Duration::from_secs(5));

        let config = EngineConfig {
            generation_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let composer = PromptComposer::new(config.expected_signature.clone(), vec![]);
        let engine = ImprovementEngine::new(
            Arc::new(generator),
            Arc::new(MarkerValidator),
            store(&dir),
            composer,
            config,
        );

        let report = engine.run(&request(), &CancellationToken::new()).await;
        assert!(matches!(
            report.outcome,
            EngineOutcome::GenerationFailed {
                error: GenerationError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let generator = Arc::new(ScriptedGenerator::new(vec![code("VALID")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine(generator.clone(), store(&dir)).run(&request(), &cancel).await;

        assert_eq!(report.outcome, EngineOutcome::Cancelled { attempts: vec![] });
        assert!(generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_learned_strategy_guides_next_session() {
        let dir = TempDir::new().unwrap();
        let patterns = store(&dir);
        patterns.record(ErrorPattern::new(
            ErrorCategory::RuntimeError,
            "guard_edge_cases",
            PatternOutcome::Success,
        ));
        let generator = Arc::new(ScriptedGenerator::new(vec![code("VALID")]));

        let request = request().with_suspected_category(ErrorCategory::RuntimeError);
        let report = engine(generator.clone(), patterns)
            .run(&request, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome.winner().unwrap().focus_strategy, "guard_edge_cases");
        assert!(generator.prompts()[0].contains("PROVEN STRATEGY"));
    }
}
