// LLM Judgment
// Sends per-segment features to each requested provider, validates the
// returned probabilities, and fuses them with the local scores using a
// variance-adaptive weight.

use crate::models::Segment;
use crate::services::config_store::LlmConfig;
use crate::services::providers::{
    complete_with_timeout, extract_json_span, ChatBackend, ChatCompletion, ChatResult, CredentialSource,
    ProviderSpec,
};
use super::scorer::{PROB_CEIL, PROB_FLOOR};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

const SYSTEM_PROMPT: &str = "You are an independent classifier. Re-evaluate AI probability for each segment using the features. \
IGNORE baseline_prob except as a loose hint; you may move far away from it. \
Probabilities should reflect differences between segments (avoid giving the same value to all). \
Return ONLY JSON: {\"segments\":[{\"chunk_id\":<int>,\"ai_probability\":<0-1 float>}]} \
with no markdown, no code fences, no reasoning text.";

/// Population variance below this marks a response as degenerate.
const CONSTANT_VARIANCE: f64 = 1e-4;
/// With re-spreading on, LLM probabilities flatter than this are re-ranked.
const FLAT_JUDGMENT_VARIANCE: f64 = 0.02;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgmentStats {
    pub calls: usize,
    pub success: usize,
    pub latency_ms: u64,
    pub errors: Vec<String>,
    /// Fusion weight actually applied, if any provider succeeded.
    pub weight: Option<f64>,
}

pub(crate) fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

fn build_payload(segments: &[Segment]) -> Value {
    let items: Vec<Value> = segments
        .iter()
        .map(|s| {
            json!({
                "chunk_id": s.chunk_id,
                "ttr": s.signals.stylometry.ttr,
                "avg_sentence_len": s.signals.stylometry.avg_sentence_len,
                "repeat_ratio": s.signals.stylometry.repeat_ratio,
                "baseline_prob": (s.ai_probability * 10_000.0).round() / 10_000.0,
            })
        })
        .collect();
    json!({ "segments": items })
}

fn parse_json_lenient(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .or_else(|| extract_json_span(trimmed).and_then(|s| serde_json::from_str(s).ok()))
}

/// Content first (direct, then embedded span), then the reasoning text.
fn parse_judgment(result: &ChatResult) -> Option<Value> {
    parse_json_lenient(&result.content).or_else(|| {
        result
            .reasoning
            .as_deref()
            .and_then(extract_json_span)
            .and_then(|s| serde_json::from_str(s).ok())
    })
}

fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract `(chunk_id, probability)` pairs, rejecting constant responses.
pub fn extract_probabilities(payload: &Value) -> Result<Vec<(usize, f64)>, &'static str> {
    extract_probabilities_with(payload, false)
}

fn extract_probabilities_with(payload: &Value, allow_constant: bool) -> Result<Vec<(usize, f64)>, &'static str> {
    let updates = match payload {
        Value::Object(map) => map.get("segments").and_then(Value::as_array),
        Value::Array(items) => Some(items),
        _ => None,
    }
    .ok_or("response_missing_segments")?;

    let all_probs: Vec<f64> = updates
        .iter()
        .filter(|item| !item.is_null())
        .map(|item| number(item.get("ai_probability")).unwrap_or(0.5))
        .collect();
    if !allow_constant && all_probs.len() > 1 && population_variance(&all_probs) < CONSTANT_VARIANCE {
        return Err("llm_probs_constant");
    }

    Ok(updates
        .iter()
        .filter_map(|item| {
            let chunk_id = number(item.get("chunk_id"))?;
            if chunk_id < 0.0 || chunk_id.fract() != 0.0 {
                return None;
            }
            let prob = number(item.get("ai_probability")).unwrap_or(0.5);
            Some((chunk_id as usize, prob.clamp(0.0, 1.0)))
        })
        .collect())
}

/// Replace LLM probabilities with `0.10 + 0.80 * rank / (n - 1)`, ranking
/// segments by average sentence length (ties keep chunk order).
pub fn spread_flat_probs_by_length(segments: &mut [Segment]) {
    let n = segments.len();
    if n <= 1 {
        return;
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        segments[a]
            .signals
            .stylometry
            .avg_sentence_len
            .total_cmp(&segments[b].signals.stylometry.avg_sentence_len)
    });
    for (rank, idx) in order.into_iter().enumerate() {
        let seg = &mut segments[idx];
        seg.signals.llm_judgment.prob = Some(0.10 + 0.80 * rank as f64 / (n - 1) as f64);
        seg.explanations.push("llmFlatRespreadByLength".to_string());
    }
}

/// Variance-adaptive LLM weight, clamped to [0.20, 0.55].
pub fn fusion_weight(llm_probs: &[f64], local_probs: &[f64]) -> f64 {
    let var_llm = if llm_probs.len() > 1 { population_variance(llm_probs) } else { 0.0 };
    let var_local = if local_probs.len() > 1 { population_variance(local_probs) } else { 0.0 };
    (0.30 + 0.25 * (var_llm / (var_llm + var_local).max(1e-9))).clamp(0.20, 0.55)
}

/// Blend LLM probabilities into segments that received one.
pub fn fuse_llm_probabilities(segments: &mut [Segment]) -> Option<f64> {
    let (llm_probs, local_probs): (Vec<f64>, Vec<f64>) = segments
        .iter()
        .filter_map(|s| s.signals.llm_judgment.prob.map(|p| (p, s.ai_probability)))
        .unzip();
    if llm_probs.is_empty() {
        return None;
    }

    let w = fusion_weight(&llm_probs, &local_probs);
    for seg in segments.iter_mut() {
        let Some(lp) = seg.signals.llm_judgment.prob else {
            continue;
        };
        let fused = seg.ai_probability * (1.0 - w) + lp * w;
        seg.ai_probability = fused.clamp(PROB_FLOOR, PROB_CEIL);
        seg.explanations.push(format!("llmAdaptiveFusion(w={:.2})", w));
    }
    Some(w)
}

/// Ask each provider for per-segment probabilities and fuse the survivors.
///
/// Never fails: every problem is recorded in `JudgmentStats::errors` and the
/// segments keep their local probabilities.
pub async fn run_llm_judgment(
    backend: &dyn ChatBackend,
    credentials: &dyn CredentialSource,
    llm: &LlmConfig,
    segments: &mut [Segment],
    providers: &[ProviderSpec],
) -> JudgmentStats {
    let mut stats = JudgmentStats::default();
    if providers.is_empty() || segments.is_empty() {
        return stats;
    }

    let user_prompt = build_payload(segments).to_string();
    let timeout = Duration::from_secs(llm.timeout_secs);
    // chunk_id -> (sum, count) across successful providers
    let mut collected: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
    let mut models: Vec<String> = Vec::new();

    for spec in providers {
        stats.calls += 1;
        let Some(api_key) = credentials.api_key(spec.kind) else {
            warn!("[LLM_JUDGE] No API key for {}", spec.kind.name());
            stats.errors.push(format!("{}: missing_api_key", spec.label()));
            continue;
        };

        let request = ChatCompletion {
            provider: spec.kind,
            model: spec.model.clone(),
            api_key,
            system: SYSTEM_PROMPT.to_string(),
            user: user_prompt.clone(),
            max_tokens: llm.judgment_max_tokens,
            enable_reasoning: false,
            reasoning_effort: "high".to_string(),
        };

        let result = match complete_with_timeout(backend, &request, timeout).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[LLM_JUDGE] {} call failed: {}", spec.label(), e);
                stats.errors.push(format!("{}: {}", spec.label(), e));
                continue;
            }
        };
        stats.latency_ms += result.latency_ms;

        let Some(payload) = parse_judgment(&result) else {
            stats.errors.push(format!("{}: parse_failed", spec.label()));
            continue;
        };
        let probs = match extract_probabilities_with(&payload, llm.respread_flat_judgment) {
            Ok(p) => p,
            Err(reason) => {
                stats.errors.push(format!("{}: {}", spec.label(), reason));
                continue;
            }
        };

        stats.success += 1;
        models.push(spec.model.clone());
        for (chunk_id, prob) in probs {
            let entry = collected.entry(chunk_id).or_insert((0.0, 0));
            entry.0 += prob;
            entry.1 += 1;
        }
    }

    if stats.success == 0 {
        error!("[LLM_JUDGE] All judgment calls failed: {}", stats.errors.join("; "));
        return stats;
    }

    for seg in segments.iter_mut() {
        if let Some((sum, count)) = collected.get(&seg.chunk_id) {
            seg.signals.llm_judgment.prob = Some(sum / *count as f64);
            seg.signals.llm_judgment.models = models.clone();
        }
    }

    if llm.respread_flat_judgment {
        let llm_probs: Vec<f64> = segments.iter().filter_map(|s| s.signals.llm_judgment.prob).collect();
        if !llm_probs.is_empty() && population_variance(&llm_probs) < FLAT_JUDGMENT_VARIANCE {
            warn!(
                "[LLM_JUDGE] Flat judgment (var={:.5}), re-spreading by sentence length",
                population_variance(&llm_probs)
            );
            spread_flat_probs_by_length(segments);
        }
    }

    stats.weight = fuse_llm_probabilities(segments);
    info!(
        "[LLM_JUDGE] calls={} success={} latency_ms={} weight={:?}",
        stats.calls, stats.success, stats.latency_ms, stats.weight
    );
    stats
}
