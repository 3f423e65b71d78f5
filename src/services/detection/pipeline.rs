// Detection Pipeline
// normalize -> blocks -> (LLM plan | local chunker) -> flat resplit ->
// LLM judgment -> contrast sharpening -> aggregation -> calibration

use crate::models::{
    AggregationResponse, BatchDetectRequest, BatchDetectResponse, BatchItemRequest, BatchItemResponse,
    BatchSummary, CostBreakdown, DetectRequest, DetectResponse, PreprocessSummary, ProviderBreakdown, Segment,
};
use crate::services::config_store::{AppConfig, LlmConfig};
use crate::services::providers::{
    default_judge, parse_providers, ChatBackend, CredentialSource, ProviderClient, ProviderKind, ProviderSpec,
};
use crate::services::text_processor::{build_paragraph_blocks, estimate_tokens, normalize_punctuation};
use super::aggregation::{aggregate_segments, contrast_sharpen_segments, derive_decision, std_dev};
use super::calibration::CalibrationStore;
use super::llm_analyzer::{run_llm_judgment, JudgmentStats};
use super::planner::plan_segments;
use super::segment_builder::{build_segments_aligned, split_segments_by_length, ScoringOptions};
use super::sensitivity::{resolve_profile, ChunkProfile, DetectionSensitivity};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const API_VERSION: &str = "v0.1.0";
pub const DEFAULT_LANGUAGE: &str = "zh-CN";

const FLAT_MIN_SEGMENTS: usize = 6;
const FLAT_STD: f64 = 0.06;
const FLAT_RESPLIT_MIN_TOKENS: usize = 180;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("judgment unavailable: {0}")]
    JudgmentUnavailable(String),
}

/// Uncalibrated pipeline result.
#[derive(Debug, Clone)]
pub struct DetectOutcome {
    pub aggregation: AggregationResponse,
    pub segments: Vec<Segment>,
    pub preprocess_summary: PreprocessSummary,
    pub cost: CostBreakdown,
    pub judgment: Option<JudgmentStats>,
}

/// High-sensitivity profile for re-chunking a flat LLM segmentation at half
/// the current target (at least 180 tokens).
fn flat_resplit_profile(chunk_tokens: usize) -> ChunkProfile {
    let target = FLAT_RESPLIT_MIN_TOKENS.max(chunk_tokens / 2);
    resolve_profile(DetectionSensitivity::High, Some(target), None)
}

/// Detection entry point holding the LLM collaborators and calibration state.
pub struct Detector {
    backend: Arc<dyn ChatBackend>,
    credentials: Arc<dyn CredentialSource>,
    calibration: Arc<CalibrationStore>,
    llm: LlmConfig,
    default_judge: Option<ProviderSpec>,
    batch_parallel: usize,
}

impl Detector {
    pub fn new(backend: Arc<dyn ChatBackend>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            backend,
            credentials,
            calibration: Arc::new(CalibrationStore::default()),
            llm: LlmConfig::default(),
            default_judge: None,
            batch_parallel: 4,
        }
    }

    /// HTTP-backed detector using the config's LLM settings.
    pub fn from_config(config: &AppConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self::new(Arc::new(ProviderClient::from_config(config)), credentials)
            .with_llm_config(config.llm.clone())
            .with_default_judge(default_judge(config))
            .with_batch_parallel(config.detection.batch_parallel)
    }

    pub fn with_calibration(mut self, calibration: Arc<CalibrationStore>) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_llm_config(mut self, llm: LlmConfig) -> Self {
        self.llm = llm;
        self
    }

    /// Judge used when a request names no providers. Unset means GLM with
    /// `llm.judgmentModel`.
    pub fn with_default_judge(mut self, judge: ProviderSpec) -> Self {
        self.default_judge = Some(judge);
        self
    }

    pub fn with_batch_parallel(mut self, parallel: usize) -> Self {
        self.batch_parallel = parallel.max(1);
        self
    }

    pub fn calibration(&self) -> &Arc<CalibrationStore> {
        &self.calibration
    }

    /// Explicit specs, or the default judge when its provider has a key.
    fn judgment_providers(&self, requested: &[String]) -> Vec<ProviderSpec> {
        if !requested.is_empty() {
            return parse_providers(requested);
        }
        let judge = self.default_judge.clone().unwrap_or_else(|| ProviderSpec {
            kind: ProviderKind::Glm,
            model: self.llm.judgment_model.clone(),
        });
        if self.credentials.api_key(judge.kind).is_some() {
            vec![judge]
        } else {
            Vec::new()
        }
    }

    /// Run the full pipeline without applying calibration.
    pub async fn detect_core(&self, req: &DetectRequest) -> Result<DetectOutcome, DetectError> {
        let started = Instant::now();
        let normalized = normalize_punctuation(&req.text);
        if normalized.is_empty() {
            return Err(DetectError::InvalidInput("text is empty".to_string()));
        }

        let language = req
            .language
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string();
        let sensitivity = DetectionSensitivity::from_str(&req.sensitivity);
        let opts = ScoringOptions {
            use_perplexity: req.use_perplexity,
            use_stylometry: req.use_stylometry,
        };
        let providers = self.judgment_providers(&req.providers);

        let blocks = build_paragraph_blocks(&normalized);
        let profile = resolve_profile(sensitivity, req.chunking.chunk_size_tokens, req.chunking.overlap_tokens);
        info!(
            "[PIPELINE] profile chunk={} overlap={} blocks={} sensitivity={} len={}",
            profile.chunk_tokens,
            profile.overlap_tokens,
            blocks.len(),
            sensitivity.as_str(),
            normalized.len()
        );

        let planned = plan_segments(
            self.backend.as_ref(),
            self.credentials.as_ref(),
            &self.llm,
            &normalized,
            &language,
            &blocks,
            profile.chunk_tokens,
            opts,
        )
        .await;
        let llm_segmented = planned.is_some();
        let planner_latency_ms = planned.as_ref().map(|p| p.latency_ms);

        let mut segments = match planned {
            Some(plan) => split_segments_by_length(&plan.segments, &normalized, &language, profile.chunk_tokens, opts),
            None => build_segments_aligned(
                &normalized,
                &language,
                &blocks,
                profile.chunk_tokens,
                profile.overlap_tokens,
                opts,
            ),
        };

        if llm_segmented && sensitivity != DetectionSensitivity::High {
            let std0 = std_dev(&segments.iter().map(|s| s.ai_probability).collect::<Vec<_>>());
            if segments.len() < FLAT_MIN_SEGMENTS || std0 < FLAT_STD {
                let alt_profile = flat_resplit_profile(profile.chunk_tokens);
                let alt = build_segments_aligned(
                    &normalized,
                    &language,
                    &blocks,
                    alt_profile.chunk_tokens,
                    alt_profile.overlap_tokens,
                    opts,
                );
                let std1 = std_dev(&alt.iter().map(|s| s.ai_probability).collect::<Vec<_>>());
                if std1 >= (std0 * 1.2).max(FLAT_STD) {
                    info!(
                        "[PIPELINE] Flat segmentation resplit chunk={} std0={:.4} std1={:.4}",
                        alt_profile.chunk_tokens, std0, std1
                    );
                    segments = alt;
                }
            }
        }
        let segmentation_source = if llm_segmented { "llm" } else { "local" };
        info!("[PIPELINE] segments={} source={}", segments.len(), segmentation_source);

        let judgment = if providers.is_empty() {
            None
        } else {
            let stats = run_llm_judgment(
                self.backend.as_ref(),
                self.credentials.as_ref(),
                &self.llm,
                &mut segments,
                &providers,
            )
            .await;
            if stats.success == 0 && req.strict_judgment && !req.providers.is_empty() {
                error!("[PIPELINE] Requested judgment providers all failed");
                return Err(DetectError::JudgmentUnavailable(stats.errors.join("; ")));
            }
            Some(stats)
        };

        contrast_sharpen_segments(&mut segments, sensitivity);
        let aggregation = aggregate_segments(&segments, &normalized);

        let cost = CostBreakdown {
            tokens: estimate_tokens(&normalized),
            latency_ms: started.elapsed().as_millis() as u64,
            provider_breakdown: ProviderBreakdown {
                requested: providers.len(),
                success: judgment.as_ref().map_or(0, |s| s.success),
            },
            segmentation_source: segmentation_source.to_string(),
            llm_latency_ms: match (planner_latency_ms, judgment.as_ref()) {
                (None, None) => None,
                (plan, stats) => Some(plan.unwrap_or(0) + stats.map_or(0, |s| s.latency_ms)),
            },
        };

        Ok(DetectOutcome {
            aggregation,
            preprocess_summary: PreprocessSummary {
                language,
                chunks: segments.len(),
                redacted: 0,
            },
            segments,
            cost,
            judgment,
        })
    }

    /// Apply the current calibration to the overall and per-segment
    /// probabilities, then re-derive the decision.
    fn calibrate(&self, outcome: &mut DetectOutcome) {
        let params = self.calibration.current_params();
        let agg = &mut outcome.aggregation;
        agg.overall_probability = params.apply(agg.overall_probability);
        agg.decision = derive_decision(agg.overall_probability, &agg.thresholds, agg.buffer_margin);
        for seg in &mut outcome.segments {
            seg.ai_probability = params.apply(seg.ai_probability);
        }
    }

    pub async fn detect(&self, req: &DetectRequest) -> Result<DetectResponse, DetectError> {
        let mut outcome = self.detect_core(req).await?;
        self.calibrate(&mut outcome);
        Ok(DetectResponse {
            aggregation: outcome.aggregation,
            segments: outcome.segments,
            preprocess_summary: outcome.preprocess_summary,
            cost: outcome.cost,
            version: API_VERSION.to_string(),
            request_id: Uuid::new_v4().to_string(),
        })
    }

    async fn detect_item(&self, item: BatchItemRequest) -> Result<BatchItemResponse, DetectError> {
        let mut outcome = self.detect_core(&item.request).await?;
        self.calibrate(&mut outcome);
        Ok(BatchItemResponse {
            id: item.id,
            aggregation: outcome.aggregation,
            segments: outcome.segments,
            preprocess_summary: outcome.preprocess_summary,
            cost: outcome.cost,
            version: API_VERSION.to_string(),
        })
    }

    /// Detect many items concurrently; failed items are counted, not returned.
    pub async fn detect_batch(self: &Arc<Self>, req: BatchDetectRequest) -> Result<BatchDetectResponse, DetectError> {
        if req.items.is_empty() {
            return Err(DetectError::InvalidInput("batch requires at least one item".to_string()));
        }
        let count = req.items.len();
        let parallel = req.parallel.unwrap_or(self.batch_parallel).max(1);
        info!("[BATCH] items={} parallel={}", count, parallel);

        let semaphore = Arc::new(Semaphore::new(parallel));
        let mut tasks = JoinSet::new();
        for (idx, item) in req.items.into_iter().enumerate() {
            let detector = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let id = item.id.clone();
                (idx, id, detector.detect_item(item).await)
            });
        }

        let mut slots: Vec<Option<BatchItemResponse>> = (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, _, Ok(resp))) => slots[idx] = Some(resp),
                Ok((_, id, Err(e))) => warn!("[BATCH] item {} failed: {}", id, e),
                Err(e) => error!("[BATCH] item task aborted: {}", e),
            }
        }

        let items: Vec<BatchItemResponse> = slots.into_iter().flatten().collect();
        let summary = summarize_batch(count, &items);
        info!(
            "[BATCH] done count={} fail={} avg={:.4} p95={:.4}",
            summary.count, summary.fail_count, summary.avg_probability, summary.p95_probability
        );
        Ok(BatchDetectResponse { items, summary })
    }
}

/// Mean and nearest-rank p95 over the surviving items.
fn summarize_batch(count: usize, items: &[BatchItemResponse]) -> BatchSummary {
    let mut probs: Vec<f64> = items.iter().map(|it| it.aggregation.overall_probability).collect();
    probs.sort_by(|a, b| a.total_cmp(b));
    let (avg, p95) = if probs.is_empty() {
        (0.0, 0.0)
    } else {
        let idx = ((0.95 * (probs.len() - 1) as f64).round() as usize).min(probs.len() - 1);
        (probs.iter().sum::<f64>() / probs.len() as f64, probs[idx])
    };
    BatchSummary {
        count,
        fail_count: count - items.len(),
        avg_probability: avg,
        p95_probability: p95,
    }
}
