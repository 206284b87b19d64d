// Self-correction loop: analyze failures, classify errors, learn which guidance
// fixes them, and keep asking the LLM for a predictor until one passes validation.

pub mod analysis;
pub mod classifier;
pub mod engine;
pub mod log;
pub mod patterns;
pub mod prompt;
pub mod python;
pub mod validator;

pub use analysis::{
    analysis_prompt, parse_analysis, AnalysisLog, AnalysisSummary, FailureAnalysis, FailureAnalyzer,
};
pub use classifier::{classify, ErrorCategory};
pub use engine::{
    EngineConfig, EngineOutcome, ImprovementAttempt, ImprovementEngine, ImprovementRequest,
    SessionReport,
};
pub use log::{ImprovementLog, SessionLogEntry};
pub use patterns::{ErrorPattern, PatternOutcome, PatternStatistics, PatternStore};
pub use prompt::{FailureContext, PriorError, PromptComposer};
pub use python::{ExecutionOutcome, PythonError, PythonRuntime};
pub use validator::{
    CandidateValidator, CheckKind, CheckResult, CodeValidator, FunctionSignature, ValidationResult,
};
