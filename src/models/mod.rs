// CheekAI Data Models
// Request/response shapes for detection, batching and calibration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============ Chunking Options ============

/// Explicit chunk sizes. `None` (or 0) defers to the sensitivity profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingOptions {
    #[serde(default)]
    pub chunk_size_tokens: Option<usize>,
    #[serde(default)]
    pub overlap_tokens: Option<usize>,
}

// ============ Detection Request ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectRequest {
    pub text: String,
    pub language: Option<String>,
    pub genre: Option<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default = "default_true")]
    pub use_perplexity: bool,
    #[serde(default = "default_true")]
    pub use_stylometry: bool,
    #[serde(default)]
    pub chunking: ChunkingOptions,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: String,
    /// Fail the request when explicitly requested providers all fail.
    #[serde(default)]
    pub strict_judgment: bool,
}

impl DetectRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: None,
            genre: None,
            providers: Vec::new(),
            use_perplexity: true,
            use_stylometry: true,
            chunking: ChunkingOptions::default(),
            sensitivity: default_sensitivity(),
            strict_judgment: false,
        }
    }
}

// ============ Signal Types ============

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SignalStylometry {
    pub ttr: f64,
    pub avg_sentence_len: f64,
    pub function_word_ratio: Option<f64>,
    pub repeat_ratio: Option<f64>,
    pub punctuation_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalPerplexity {
    pub ppl: Option<f64>,
    pub z: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalLlmJudgment {
    pub prob: Option<f64>,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSignals {
    pub llm_judgment: SignalLlmJudgment,
    pub perplexity: SignalPerplexity,
    pub stylometry: SignalStylometry,
}

// ============ Segment ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentOffsets {
    /// UTF-8 byte offset (0-based) into the normalized text.
    pub start: usize,
    /// UTF-8 byte offset (0-based, end-exclusive) into the normalized text.
    pub end: usize,
}

impl SegmentOffsets {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub chunk_id: usize,
    pub language: String,
    pub offsets: SegmentOffsets,
    pub ai_probability: f64,
    pub confidence: f64,
    pub signals: SegmentSignals,
    pub explanations: Vec<String>,
}

// ============ Aggregation ============

/// Ordered by severity: `Pass < Review < Flag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    Pass,
    Review,
    Flag,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pass => "pass",
            Decision::Review => "review",
            Decision::Flag => "flag",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationThresholds {
    #[serde(default = "default_low")]
    pub low: f64,
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
    #[serde(default = "default_very_high")]
    pub very_high: f64,
}

impl Default for AggregationThresholds {
    fn default() -> Self {
        Self {
            low: default_low(),
            medium: default_medium(),
            high: default_high(),
            very_high: default_very_high(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResponse {
    pub overall_probability: f64,
    pub overall_confidence: f64,
    pub method: String,
    pub thresholds: AggregationThresholds,
    pub rubric_version: String,
    pub decision: Decision,
    pub buffer_margin: f64,
    pub stylometry_probability: Option<f64>,
    pub quality_score_normalized: Option<f64>,
    pub block_weights: Option<HashMap<String, f64>>,
    pub dimension_scores: Option<HashMap<String, i32>>,
}

// ============ Cost & Preprocess Summary ============

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessSummary {
    pub language: String,
    pub chunks: usize,
    #[serde(default)]
    pub redacted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderBreakdown {
    pub requested: usize,
    pub success: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub tokens: usize,
    pub latency_ms: u64,
    pub provider_breakdown: ProviderBreakdown,
    /// `llm` when the planner produced the segments, otherwise `local`.
    pub segmentation_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_latency_ms: Option<u64>,
}

// ============ Detection Response ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectResponse {
    pub aggregation: AggregationResponse,
    pub segments: Vec<Segment>,
    pub preprocess_summary: PreprocessSummary,
    pub cost: CostBreakdown,
    pub version: String,
    pub request_id: String,
}

// ============ Batch Detection ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemRequest {
    pub id: String,
    #[serde(flatten)]
    pub request: DetectRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResponse {
    pub id: String,
    pub aggregation: AggregationResponse,
    pub segments: Vec<Segment>,
    pub preprocess_summary: PreprocessSummary,
    pub cost: CostBreakdown,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub count: usize,
    pub fail_count: usize,
    pub avg_probability: f64,
    pub p95_probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDetectRequest {
    pub items: Vec<BatchItemRequest>,
    #[serde(default = "default_parallel")]
    pub parallel: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDetectResponse {
    pub items: Vec<BatchItemResponse>,
    pub summary: BatchSummary,
}

// ============ Calibration ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrateItem {
    pub prob: f64,
    pub label: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrateRequest {
    pub items: Vec<CalibrateItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrateResponse {
    pub ok: bool,
    pub version: String,
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
}

// ============ Default Value Functions ============

fn default_true() -> bool { true }
fn default_sensitivity() -> String { "medium".to_string() }
fn default_parallel() -> Option<usize> { Some(4) }
fn default_low() -> f64 { 0.65 }
fn default_medium() -> f64 { 0.75 }
fn default_high() -> f64 { 0.85 }
fn default_very_high() -> f64 { 0.90 }
