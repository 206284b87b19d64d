//! Failure analysis: before any code is generated, the LLM is asked why the
//! live predictor got a call wrong. The verdict goes into the correction
//! prompt and is kept in `analyses.jsonl`.

use super::prompt::{write_failure_details, FailureContext};
use crate::journal::{append_line, read_lines};
use crate::llm::{strip_fences, GenerationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub analysis_id: Uuid,
    pub prediction_id: Option<Uuid>,
    pub failure_reason: String,
    pub market_context: String,
    #[serde(default)]
    pub improvement_opportunities: Vec<String>,
    /// Verdict per signal family (moving_averages, momentum, volume, ...)
    #[serde(default)]
    pub indicator_notes: BTreeMap<String, String>,
    #[serde(default)]
    pub suggested_modifications: Vec<String>,
    /// 0.0-1.0
    pub confidence_score: f64,
    pub analyzer: String,
    pub analyzed_at: DateTime<Utc>,
}

/// Anything that can explain a failed prediction
#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    async fn analyze(&self, context: &FailureContext) -> Result<FailureAnalysis, GenerationError>;

    fn name(&self) -> &str;
}

/// Prompt asking for a diagnosis only, no code
pub fn analysis_prompt(context: &FailureContext) -> String {
    let mut prompt = String::from(
        "You are reviewing a Bitcoin price direction predictor that made a wrong call. \
Diagnose the failure; do not write code.\n\n",
    );

    prompt.push_str("## FAILED PREDICTION\n");
    write_failure_details(&mut prompt, context);

    prompt.push_str("\n## CURRENT LIVE CODE\n```python\n");
    prompt.push_str(context.live_code.trim_end());
    prompt.push_str("\n```\n");

    prompt.push_str(
        r#"
## WHAT TO LOOK AT
- Why the call was wrong: market conditions, indicator limits or logic flaws
- Which signals misled the predictor (moving averages, momentum, volume, signal weighting)
- Concrete code changes that would have helped, with thresholds where relevant

## RESPONSE FORMAT
Respond with JSON only:
{
  "failure_reason": "<1-2 sentences>",
  "market_context": "<market conditions over the prediction window>",
  "improvement_opportunities": ["<area>", "..."],
  "indicator_notes": {
    "moving_averages": "<verdict>",
    "momentum": "<verdict>",
    "volume": "<verdict>",
    "signal_weighting": "<verdict>"
  },
  "suggested_modifications": ["<specific change>", "..."],
  "confidence_score": 0.0
}
"#,
    );

    prompt
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    failure_reason: String,
    #[serde(default)]
    market_context: String,
    #[serde(default)]
    improvement_opportunities: Vec<String>,
    #[serde(default, alias = "technical_indicators_analysis")]
    indicator_notes: BTreeMap<String, String>,
    #[serde(default)]
    suggested_modifications: Vec<String>,
    #[serde(default)]
    confidence_score: f64,
}

/// Parse an analysis completion for `context`
pub fn parse_analysis(
    text: &str,
    context: &FailureContext,
    analyzer: &str,
) -> Result<FailureAnalysis, GenerationError> {
    let unfenced = strip_fences(text);
    let response = serde_json::from_str::<AnalysisResponse>(unfenced).or_else(|first| {
        match (text.find('{'), text.rfind('}')) {
            (Some(open), Some(close)) if open < close => {
                serde_json::from_str::<AnalysisResponse>(&text[open..=close])
            }
            _ => Err(first),
        }
    });
    let response = response.map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        GenerationError::Malformed(format!("analysis is not valid JSON: {} (text: {})", e, preview))
    })?;

    if response.failure_reason.trim().is_empty() {
        return Err(GenerationError::Malformed(
            "analysis has no failure_reason".to_string(),
        ));
    }

    let confidence_score = if response.confidence_score.is_finite() {
        response.confidence_score.clamp(0.0, 1.0)
    } else {
        0.0
    };

    Ok(FailureAnalysis {
        analysis_id: Uuid::new_v4(),
        prediction_id: context.prediction_id,
        failure_reason: response.failure_reason.trim().to_string(),
        market_context: response.market_context.trim().to_string(),
        improvement_opportunities: response.improvement_opportunities,
        indicator_notes: response.indicator_notes,
        suggested_modifications: response.suggested_modifications,
        confidence_score,
        analyzer: analyzer.to_string(),
        analyzed_at: Utc::now(),
    })
}

/// Append-only history of analyses
#[derive(Debug, Clone)]
pub struct AnalysisLog {
    path: PathBuf,
}

impl AnalysisLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, analysis: &FailureAnalysis) -> std::io::Result<()> {
        append_line(&self.path, analysis)
    }

    pub fn entries(&self) -> std::io::Result<Vec<FailureAnalysis>> {
        read_lines(&self.path)
    }

    /// The last `limit` analyses, oldest first
    pub fn recent(&self, limit: usize) -> std::io::Result<Vec<FailureAnalysis>> {
        let mut entries = self.entries()?;
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        Ok(entries)
    }

    /// Most recent analysis of `prediction_id`
    pub fn for_prediction(&self, prediction_id: Uuid) -> std::io::Result<Option<FailureAnalysis>> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|a| a.prediction_id == Some(prediction_id)))
    }
}

/// What a batch of analyses keeps pointing at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisSummary {
    pub total: usize,
    pub average_confidence: f64,
    /// Most frequent first
    pub common_opportunities: Vec<(String, usize)>,
    pub common_modifications: Vec<(String, usize)>,
}

impl AnalysisSummary {
    pub fn from_analyses(analyses: &[FailureAnalysis]) -> Self {
        if analyses.is_empty() {
            return Self::default();
        }

        let total_confidence: f64 = analyses.iter().map(|a| a.confidence_score).sum();
        Self {
            total: analyses.len(),
            average_confidence: total_confidence / analyses.len() as f64,
            common_opportunities: ranked(analyses.iter().flat_map(|a| &a.improvement_opportunities)),
            common_modifications: ranked(analyses.iter().flat_map(|a| &a.suggested_modifications)),
        }
    }
}

fn ranked<'a>(items: impl Iterator<Item = &'a String>) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in items {
        *counts.entry(item.as_str()).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(item, count)| (item.to_string(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}
