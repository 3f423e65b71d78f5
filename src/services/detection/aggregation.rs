// Aggregation Logic
// Span-weighted document aggregation, decision thresholds and
// mean-preserving contrast sharpening of segment probabilities.

use crate::models::{AggregationResponse, AggregationThresholds, Decision, Segment};
use super::scorer::{PROB_CEIL, PROB_FLOOR};
use super::sensitivity::DetectionSensitivity;
use std::collections::HashMap;
use tracing::debug;

pub const RUBRIC_VERSION: &str = "rubric-v1.2";
pub const DEFAULT_BUFFER_MARGIN: f64 = 0.03;

const MIN_SPAN_WEIGHT: usize = 50;
const SHARPEN_MIN_SEGMENTS: usize = 4;
const BISECTION_RANGE: (f64, f64) = (-6.0, 6.0);
const FIRST_PASS_ITERATIONS: usize = 28;
const BOOST_PASS_ITERATIONS: usize = 22;

/// Character-span-weighted aggregation over segments of `text`. Empty
/// input yields zeros and `pass`.
pub fn aggregate_segments(segments: &[Segment], text: &str) -> AggregationResponse {
    let thresholds = AggregationThresholds::default();
    if segments.is_empty() {
        return AggregationResponse {
            overall_probability: 0.0,
            overall_confidence: 0.0,
            method: "weighted".to_string(),
            thresholds,
            rubric_version: RUBRIC_VERSION.to_string(),
            decision: Decision::Pass,
            buffer_margin: DEFAULT_BUFFER_MARGIN,
            stylometry_probability: None,
            quality_score_normalized: None,
            block_weights: None,
            dimension_scores: None,
        };
    }

    let weights: Vec<f64> = segments
        .iter()
        .map(|s| span_chars(s, text).max(MIN_SPAN_WEIGHT) as f64)
        .collect();
    let total: f64 = weights.iter().sum::<f64>().max(1.0);

    let overall = segments
        .iter()
        .zip(&weights)
        .map(|(s, w)| s.ai_probability * w)
        .sum::<f64>()
        / total;
    let confidence = segments
        .iter()
        .zip(&weights)
        .map(|(s, w)| s.confidence * w)
        .sum::<f64>()
        / total;

    let overall_probability = overall.clamp(0.0, 1.0);
    let overall_confidence = confidence.clamp(0.0, 1.0);
    let decision = derive_decision(overall_probability, &thresholds, DEFAULT_BUFFER_MARGIN);

    let block_weights = HashMap::from([("stylometry".to_string(), 0.4), ("quality".to_string(), 0.6)]);
    let dimension_scores = HashMap::from([
        ("grammarAccuracy".to_string(), ((confidence * 10.0) as i32) % 5 + 1),
        ("contentRelevance".to_string(), 4),
        ("logicalCoherence".to_string(), 4),
        ("originality".to_string(), 3),
    ]);

    AggregationResponse {
        overall_probability,
        overall_confidence,
        method: "weighted".to_string(),
        thresholds,
        rubric_version: RUBRIC_VERSION.to_string(),
        decision,
        buffer_margin: DEFAULT_BUFFER_MARGIN,
        stylometry_probability: Some(overall),
        quality_score_normalized: Some(0.5 + (confidence - 0.5) * 0.6),
        block_weights: Some(block_weights),
        dimension_scores: Some(dimension_scores),
    }
}

/// Char count of the segment's span; byte length if the offsets do not slice `text`.
fn span_chars(segment: &Segment, text: &str) -> usize {
    text.get(segment.offsets.start..segment.offsets.end)
        .map_or(segment.offsets.len(), |span| span.chars().count())
}

/// `pass` below `low - margin`, `review` below `high - margin`, else `flag`.
pub fn derive_decision(prob: f64, thresholds: &AggregationThresholds, margin: f64) -> Decision {
    if prob < thresholds.low - margin {
        Decision::Pass
    } else if prob < thresholds.high - margin {
        Decision::Review
    } else {
        Decision::Flag
    }
}

fn logit_safe(p: f64) -> f64 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

/// Sigmoid saturating to exactly 0/1 outside +-40.
pub(crate) fn sigmoid_clamped(x: f64) -> f64 {
    if x > 40.0 {
        1.0
    } else if x < -40.0 {
        0.0
    } else {
        1.0 / (1.0 + (-x).exp())
    }
}

/// Sharpened probability as written back: sigmoid of the shifted logit,
/// damped toward `prior` when given, clamped to the probability bounds.
fn sharpened(logit: f64, c: f64, prior: Option<f64>) -> f64 {
    let p = sigmoid_clamped(logit - c);
    let p = match prior {
        Some(old) => 0.8 * old + 0.2 * p,
        None => p,
    };
    p.clamp(PROB_FLOOR, PROB_CEIL)
}

fn mean_after_shift(logits: &[f64], priors: &[Option<f64>], c: f64) -> f64 {
    logits
        .iter()
        .zip(priors)
        .map(|(l, prior)| sharpened(*l, c, *prior))
        .sum::<f64>()
        / logits.len().max(1) as f64
}

pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Median and IQR-scaled robust z-scores.
fn robust_z(probs: &[f64]) -> (f64, Vec<f64>) {
    let mut sorted = probs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let median = sorted[n / 2];
    let iqr = (sorted[(n * 3) / 4] - sorted[n / 4]).max(1e-6);
    let scale = iqr / 1.349;
    (median, probs.iter().map(|p| (p - median) / scale).collect())
}

/// Uniform logit offset that restores `target_mean` for the values actually
/// written back (damping and clamping included), by fixed-step bisection.
fn solve_shift(logits: &[f64], priors: &[Option<f64>], target_mean: f64, iterations: usize) -> f64 {
    let (mut lo, mut hi) = BISECTION_RANGE;
    for _ in 0..iterations {
        let mid = (lo + hi) / 2.0;
        if mean_after_shift(logits, priors, mid) > target_mean {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

/// Spread segment probabilities apart while keeping their mean.
///
/// No-op below four segments. A stronger second pass runs when the first
/// leaves the distribution flat (population std < 0.05).
pub fn contrast_sharpen_segments(segments: &mut [Segment], sensitivity: DetectionSensitivity) {
    if segments.len() < SHARPEN_MIN_SEGMENTS {
        return;
    }

    let probs: Vec<f64> = segments.iter().map(|s| s.ai_probability).collect();
    let (median, z) = robust_z(&probs);

    let base_gamma = sensitivity.contrast_gamma();
    let flat_boost = 1.0 + ((0.06 - std_dev(&probs)) * 10.0).max(0.0);
    let gamma = (base_gamma * flat_boost).min(2.5);

    let logits_prime: Vec<f64> = segments
        .iter()
        .zip(&probs)
        .zip(&z)
        .map(|((seg, p), z_i)| logit_safe(*p) + gamma * z_i * (0.6 + 0.4 * seg.confidence.clamp(0.3, 0.92)))
        .collect();

    // Low-confidence segments are damped toward their pre-sharpening value.
    let priors: Vec<Option<f64>> = segments
        .iter()
        .map(|seg| (seg.confidence < 0.5).then_some(seg.ai_probability))
        .collect();
    let target_mean = probs.iter().sum::<f64>() / probs.len() as f64;
    let c = solve_shift(&logits_prime, &priors, target_mean, FIRST_PASS_ITERATIONS);

    for ((seg, lp), prior) in segments.iter_mut().zip(&logits_prime).zip(&priors) {
        seg.ai_probability = sharpened(*lp, c, *prior);
        if (seg.ai_probability - median).abs() >= 0.15 {
            seg.explanations.push("contrastSharpening".to_string());
        }
    }

    let probs2: Vec<f64> = segments.iter().map(|s| s.ai_probability).collect();
    let std_after = std_dev(&probs2);
    debug!("[SHARPEN] gamma={:.3} shift={:.4} std_after={:.4}", gamma, c, std_after);
    if std_after >= 0.05 {
        return;
    }

    let (_, z2) = robust_z(&probs2);
    let gamma2 = (base_gamma * 1.6).min(3.0);
    let logits2: Vec<f64> = probs2
        .iter()
        .zip(&z2)
        .map(|(p, z_i)| logit_safe(*p) + gamma2 * z_i)
        .collect();
    let target2 = probs2.iter().sum::<f64>() / probs2.len() as f64;
    let undamped = vec![None; logits2.len()];
    let c2 = solve_shift(&logits2, &undamped, target2, BOOST_PASS_ITERATIONS);

    for (seg, lp) in segments.iter_mut().zip(&logits2) {
        seg.ai_probability = sharpened(*lp, c2, None);
        seg.explanations.push("contrastSharpening(boost)".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SegmentOffsets, SegmentSignals};

    fn seg(i: usize, p: f64, conf: f64, span: usize) -> Segment {
        Segment {
            chunk_id: i,
            language: "zh-CN".to_string(),
            offsets: SegmentOffsets { start: i * span, end: (i + 1) * span },
            ai_probability: p,
            confidence: conf,
            signals: SegmentSignals::default(),
            explanations: vec![],
        }
    }

    fn mean(segs: &[Segment]) -> f64 {
        segs.iter().map(|s| s.ai_probability).sum::<f64>() / segs.len() as f64
    }

    #[test]
    fn test_derive_decision() {
        let t = AggregationThresholds::default();
        assert_eq!(derive_decision(0.5, &t, DEFAULT_BUFFER_MARGIN), Decision::Pass);
        assert_eq!(derive_decision(0.63, &t, DEFAULT_BUFFER_MARGIN), Decision::Review);
        assert_eq!(derive_decision(0.83, &t, DEFAULT_BUFFER_MARGIN), Decision::Flag);
    }

    #[test]
    fn test_derive_decision_monotonic() {
        let t = AggregationThresholds::default();
        let mut prev = Decision::Pass;
        for i in 0..=1000 {
            let d = derive_decision(i as f64 / 1000.0, &t, DEFAULT_BUFFER_MARGIN);
            assert!(d >= prev);
            prev = d;
        }
        assert_eq!(prev, Decision::Flag);
    }

    #[test]
    fn test_aggregate_empty() {
        let result = aggregate_segments(&[], "");
        assert_eq!(result.overall_probability, 0.0);
        assert_eq!(result.decision, Decision::Pass);
        assert!(result.dimension_scores.is_none());
    }

    #[test]
    fn test_aggregate_weights_by_span_with_floor() {
        // spans 10 (floored to 50) and 150
        let text = "x".repeat(160);
        let mut a = seg(0, 0.2, 0.6, 10);
        a.offsets = SegmentOffsets { start: 0, end: 10 };
        let mut b = seg(1, 0.8, 0.8, 150);
        b.offsets = SegmentOffsets { start: 10, end: 160 };
        let agg = aggregate_segments(&[a, b], &text);
        assert!((agg.overall_probability - (0.2 * 50.0 + 0.8 * 150.0) / 200.0).abs() < 1e-12);
        assert!((agg.overall_confidence - (0.6 * 50.0 + 0.8 * 150.0) / 200.0).abs() < 1e-12);
        assert_eq!(agg.decision, Decision::Review);
        assert_eq!(agg.dimension_scores.as_ref().unwrap()["grammarAccuracy"], 3);
        assert_eq!(agg.block_weights.as_ref().unwrap()["quality"], 0.6);
    }

    #[test]
    fn test_aggregate_weights_cjk_by_chars() {
        // 60 CJK chars (180 bytes) weigh the same as 60 ASCII chars
        let cjk = "汉".repeat(60);
        let text = format!("{}{}", cjk, "a".repeat(60));
        let mut a = seg(0, 0.9, 0.8, 0);
        a.offsets = SegmentOffsets { start: 0, end: cjk.len() };
        let mut b = seg(1, 0.1, 0.8, 0);
        b.offsets = SegmentOffsets { start: cjk.len(), end: text.len() };
        let agg = aggregate_segments(&[a, b], &text);
        assert!((agg.overall_probability - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_sharpen_noop_below_four() {
        let mut segs = vec![seg(0, 0.3, 0.8, 100), seg(1, 0.5, 0.8, 100), seg(2, 0.9, 0.8, 100)];
        let before: Vec<f64> = segs.iter().map(|s| s.ai_probability).collect();
        contrast_sharpen_segments(&mut segs, DetectionSensitivity::High);
        let after: Vec<f64> = segs.iter().map(|s| s.ai_probability).collect();
        assert_eq!(before, after);
        assert!(segs.iter().all(|s| s.explanations.is_empty()));
    }

    #[test]
    fn test_sharpen_preserves_mean_and_spreads() {
        let probs = [0.40, 0.45, 0.52, 0.58, 0.61];
        let mut segs: Vec<Segment> = probs.iter().enumerate().map(|(i, p)| seg(i, *p, 0.9, 100)).collect();
        let before_mean = mean(&segs);
        let before_std = std_dev(&probs);
        contrast_sharpen_segments(&mut segs, DetectionSensitivity::Medium);
        assert!((mean(&segs) - before_mean).abs() < 1e-3);
        let after: Vec<f64> = segs.iter().map(|s| s.ai_probability).collect();
        assert!(std_dev(&after) > before_std);
        // order is preserved
        assert!(after.windows(2).all(|w| w[0] < w[1]));
        assert!(segs[0].explanations.contains(&"contrastSharpening".to_string()));
    }

    #[test]
    fn test_sharpen_symmetric_mean() {
        let probs = [0.3, 0.4, 0.5, 0.6, 0.7];
        let mut segs: Vec<Segment> = probs.iter().enumerate().map(|(i, p)| seg(i, *p, 0.8, 100)).collect();
        contrast_sharpen_segments(&mut segs, DetectionSensitivity::Low);
        assert!((mean(&segs) - 0.5).abs() < 1e-3);
        assert!((segs[2].ai_probability - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sharpen_preserves_mean_with_saturating_outlier() {
        let probs = [0.30, 0.32, 0.34, 0.36, 0.90];
        let mut segs: Vec<Segment> = probs.iter().enumerate().map(|(i, p)| seg(i, *p, 0.9, 100)).collect();
        let before_mean = mean(&segs);
        contrast_sharpen_segments(&mut segs, DetectionSensitivity::Medium);
        assert!((mean(&segs) - before_mean).abs() < 1e-3);
        assert_eq!(segs[4].ai_probability, PROB_CEIL);
        let after: Vec<f64> = segs.iter().map(|s| s.ai_probability).collect();
        assert!(after.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sharpen_preserves_mean_with_damped_segments() {
        let probs = [0.10, 0.35, 0.40, 0.45, 0.95];
        let confs = [0.4, 0.9, 0.45, 0.9, 0.3];
        let mut segs: Vec<Segment> = probs
            .iter()
            .zip(&confs)
            .enumerate()
            .map(|(i, (p, c))| seg(i, *p, *c, 100))
            .collect();
        let before_mean = mean(&segs);
        contrast_sharpen_segments(&mut segs, DetectionSensitivity::High);
        assert!((mean(&segs) - before_mean).abs() < 1e-3);
        for s in &segs {
            assert!((PROB_FLOOR..=PROB_CEIL).contains(&s.ai_probability));
        }
    }

    #[test]
    fn test_flat_input_gets_boost_pass() {
        let mut segs: Vec<Segment> = (0..4).map(|i| seg(i, 0.5, 0.8, 100)).collect();
        contrast_sharpen_segments(&mut segs, DetectionSensitivity::Medium);
        for s in &segs {
            assert!((s.ai_probability - 0.5).abs() < 1e-6);
            assert_eq!(s.explanations, vec!["contrastSharpening(boost)".to_string()]);
        }
    }

    #[test]
    fn test_sigmoid_saturates() {
        assert_eq!(sigmoid_clamped(100.0), 1.0);
        assert_eq!(sigmoid_clamped(-100.0), 0.0);
        assert!((sigmoid_clamped(0.0) - 0.5).abs() < 1e-12);
    }
}
