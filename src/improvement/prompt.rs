//! Correction prompts. Everything here is a pure function of its arguments.

use super::analysis::FailureAnalysis;
use super::classifier::ErrorCategory;
use super::validator::FunctionSignature;
use crate::indicators::MarketIndicators;
use crate::models::{Direction, Evaluation, PredictionRecord};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use uuid::Uuid;

/// Strategy used for a first attempt when nothing has been learned yet
pub const BASELINE_STRATEGY: &str = "baseline";

/// Default correction strategy for each category
pub fn default_strategy(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Indentation => "enforce_four_space_blocks",
        ErrorCategory::Syntax => "rewrite_minimal_syntax",
        ErrorCategory::MissingSignature => "restore_entry_point",
        ErrorCategory::ImportError => "stdlib_math_only",
        ErrorCategory::RuntimeError => "guard_edge_cases",
        ErrorCategory::Unknown => "generic_correction",
    }
}

pub fn strategy_guidance(strategy: &str) -> String {
    let text = match strategy {
        BASELINE_STRATEGY => {
            "Improve the prediction logic for the failure above while keeping the module small and readable."
        }
        "enforce_four_space_blocks" => {
            "Re-indent the whole module with exactly four spaces per level. No tabs. Every block opened by a colon must have an indented body."
        }
        "rewrite_minimal_syntax" => {
            "Rewrite the module using only simple statements: plain assignments, if/else, for loops and return. Close every bracket and string."
        }
        "restore_entry_point" => {
            "Define the entry point at module top level with exactly the expected name and parameters. Do not rename it or nest it in a class."
        }
        "stdlib_math_only" => {
            "Remove every import except the allowed standard-library modules. Compute all indicators by hand with plain arithmetic."
        }
        "guard_edge_cases" => {
            "Guard against short or empty input, zero volumes and division by zero. Always fall back to returning a valid label."
        }
        "generic_correction" => {
            "Read every previous error carefully and fix all of them in one pass."
        }
        other => {
            return format!(
                "Apply the '{}' correction approach that worked for this kind of failure before.",
                other
            )
        }
    };
    text.to_string()
}

/// Strategy for an attempt: the learned best if any, else the default for the
/// previous attempt's category, else the baseline.
pub fn select_strategy(last_category: Option<ErrorCategory>, best_known: Option<&str>) -> String {
    match (best_known, last_category) {
        (Some(best), _) => best.to_string(),
        (None, Some(category)) => default_strategy(category).to_string(),
        (None, None) => BASELINE_STRATEGY.to_string(),
    }
}

/// Why a session was started, and what the live code looked like at the time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub reason: String,
    pub prediction_id: Option<Uuid>,
    pub predicted: Option<Direction>,
    pub actual: Option<Direction>,
    pub price_at_prediction: Option<f64>,
    pub realized_price: Option<f64>,
    pub price_change_pct: Option<f64>,
    pub indicators: Option<MarketIndicators>,
    pub live_code: String,
    #[serde(default)]
    pub analysis: Option<FailureAnalysis>,
}

impl FailureContext {
    /// A wrong prediction that has been evaluated
    pub fn from_evaluation(
        prediction: &PredictionRecord,
        evaluation: &Evaluation,
        indicators: Option<MarketIndicators>,
        live_code: String,
    ) -> Self {
        Self {
            reason: format!(
                "predicted {} but the price moved {} ({:+.2}%) over {}h",
                prediction.direction,
                evaluation.actual_direction,
                evaluation.price_change_pct,
                prediction.horizon_hours
            ),
            prediction_id: Some(prediction.id),
            predicted: Some(prediction.direction),
            actual: Some(evaluation.actual_direction),
            price_at_prediction: Some(prediction.price_at_prediction),
            realized_price: Some(evaluation.realized_price),
            price_change_pct: Some(evaluation.price_change_pct),
            indicators,
            live_code,
            analysis: None,
        }
    }

    /// An improvement requested without an evaluated prediction
    pub fn manual(reason: impl Into<String>, live_code: String) -> Self {
        Self {
            reason: reason.into(),
            prediction_id: None,
            predicted: None,
            actual: None,
            price_at_prediction: None,
            realized_price: None,
            price_change_pct: None,
            indicators: None,
            live_code,
            analysis: None,
        }
    }

    pub fn with_analysis(mut self, analysis: FailureAnalysis) -> Self {
        self.analysis = Some(analysis);
        self
    }
}

/// Reason, prices and indicators of a failure as bullet lines
pub(crate) fn write_failure_details(prompt: &mut String, context: &FailureContext) {
    let _ = writeln!(prompt, "- Reason: {}", context.reason);
    if let Some(id) = context.prediction_id {
        let _ = writeln!(prompt, "- Prediction: {}", id);
    }
    if let (Some(predicted), Some(actual)) = (context.predicted, context.actual) {
        let _ = writeln!(prompt, "- Predicted: {} | Actual: {}", predicted, actual);
    }
    if let (Some(before), Some(after)) = (context.price_at_prediction, context.realized_price) {
        let _ = writeln!(
            prompt,
            "- Price: ${:.2} -> ${:.2} ({:+.2}%)",
            before,
            after,
            context.price_change_pct.unwrap_or(0.0)
        );
    }
    if let Some(indicators) = &context.indicators {
        prompt.push_str("\n### Market indicators at prediction time\n");
        let _ = writeln!(prompt, "{}", indicators);
    }
}

/// A failed attempt as the next prompt sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorError {
    pub attempt_number: u32,
    pub category: ErrorCategory,
    pub error_summary: String,
}

/// Builds correction prompts for a fixed entry point contract
#[derive(Debug, Clone)]
pub struct PromptComposer {
    signature: FunctionSignature,
    allowed_imports: Vec<String>,
}

impl PromptComposer {
    pub fn new(signature: FunctionSignature, allowed_imports: Vec<String>) -> Self {
        Self {
            signature,
            allowed_imports,
        }
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// Prompt for `attempt_number`
    ///
    /// `prior_errors` must hold every failed attempt of this session, oldest
    /// first. `best_known_strategy` is stated as guidance whenever present.
    pub fn compose(
        &self,
        attempt_number: u32,
        context: &FailureContext,
        prior_errors: &[PriorError],
        best_known_strategy: Option<&str>,
    ) -> String {
        let mut prompt = String::new();
        let focus = select_strategy(prior_errors.last().map(|p| p.category), best_known_strategy);

        let _ = writeln!(
            prompt,
            "You are improving a Bitcoin price direction predictor. This is correction attempt {}.\n",
            attempt_number
        );

        prompt.push_str("## FAILURE CONTEXT\n");
        write_failure_details(&mut prompt, context);

        if let Some(analysis) = &context.analysis {
            prompt.push_str("\n## FAILURE ANALYSIS\n");
            let _ = writeln!(
                prompt,
                "- Why it failed: {} (confidence {:.2})",
                analysis.failure_reason, analysis.confidence_score
            );
            if !analysis.market_context.is_empty() {
                let _ = writeln!(prompt, "- Market: {}", analysis.market_context);
            }
            for (signal, note) in &analysis.indicator_notes {
                let _ = writeln!(prompt, "- {}: {}", signal, note);
            }
            for modification in &analysis.suggested_modifications {
                let _ = writeln!(prompt, "- Suggested: {}", modification);
            }
        }

        prompt.push_str("\n## CONTRACT\n");
        let _ = writeln!(
            prompt,
            "- Define `def {}:` at module top level",
            self.signature
        );
        prompt.push_str(
            "- `price_data` is a list of daily dicts with keys date, open, high, low, close, volume (oldest first)\n",
        );
        prompt.push_str("- Return exactly \"up\" or \"down\"\n");
        let _ = writeln!(
            prompt,
            "- Allowed imports: {}. No file, network, process or eval access.",
            self.allowed_imports.join(", ")
        );

        prompt.push_str("\n## CURRENT LIVE CODE\n```python\n");
        prompt.push_str(context.live_code.trim_end());
        prompt.push_str("\n```\n");

        if !prior_errors.is_empty() {
            let _ = writeln!(prompt, "\n## PREVIOUS ATTEMPTS ({})", prior_errors.len());
            prompt.push_str("Each of these was rejected. Do not repeat any of these mistakes.\n");
            for prior in prior_errors {
                let _ = writeln!(
                    prompt,
                    "\n### Attempt {} ({})",
                    prior.attempt_number, prior.category
                );
                for line in prior.error_summary.lines() {
                    let _ = writeln!(prompt, "    {}", line);
                }
            }
        }

        prompt.push_str("\n## CORRECTION FOCUS\n");
        let _ = writeln!(prompt, "[{}] {}", focus, strategy_guidance(&focus));

        if let Some(best) = best_known_strategy {
            prompt.push_str("\n## PROVEN STRATEGY\n");
            let _ = writeln!(
                prompt,
                "'{}' has the best success record for this kind of failure. Follow it.",
                best
            );
        }

        prompt.push_str(
            r#"
## RESPONSE FORMAT
Respond with JSON only:
{
  "improved_code": "<complete python module>",
  "improvement_description": "<one sentence>",
  "changes_made": ["<change>", "..."]
}
"#,
        );

        prompt
    }
}
