// Segment Scorer
// Rule-ordered heuristic: anchors pick the regime, additive bands adjust, then clamp.

use crate::services::text_processor::tokenize;
use std::collections::HashMap;

pub const PROB_FLOOR: f64 = 0.02;
pub const PROB_CEIL: f64 = 0.98;

/// Inputs the rules look at. Missing signals read as 0 except `ppl`,
/// whose absence disables the perplexity rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInput {
    pub ttr: f64,
    pub avg_sentence_len: f64,
    pub repeat_ratio: f64,
    pub ngram_repeat_rate: f64,
    pub ppl: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Floor(f64),
    Ceiling(f64),
}

impl Bound {
    fn apply(self, score: f64) -> f64 {
        match self {
            Bound::Floor(v) => score.max(v),
            Bound::Ceiling(v) => score.min(v),
        }
    }
}

pub struct AnchorRule {
    pub name: &'static str,
    pub check: fn(&ScoreInput) -> Option<(Bound, &'static str)>,
}

pub struct AdjustmentRule {
    pub name: &'static str,
    pub check: fn(&ScoreInput) -> Option<(f64, &'static str)>,
}

fn strong_template(m: &ScoreInput) -> Option<(Bound, &'static str)> {
    let low_ppl = m.ppl.is_some_and(|p| p < 90.0);
    if m.ttr < 0.55 && low_ppl && (m.repeat_ratio > 0.18 || m.ngram_repeat_rate > 0.12) {
        let lift = (0.12 * ((0.55 - m.ttr) / 0.05).max(0.0)).min(0.18);
        return Some((
            Bound::Floor(0.72 + lift),
            "anchor: low ttr + low ppl + high repeat/ngram -> raise",
        ));
    }
    None
}

fn strong_human(m: &ScoreInput) -> Option<(Bound, &'static str)> {
    let high_ppl = m.ppl.map_or(true, |p| p >= 180.0);
    if m.ttr >= 0.72 && high_ppl && m.repeat_ratio <= 0.15 && m.avg_sentence_len >= 28.0 {
        return Some((Bound::Ceiling(0.38), "anchor: human-like signals -> cap 0.38"));
    }
    None
}

fn moderate_template(m: &ScoreInput) -> Option<(Bound, &'static str)> {
    if m.ttr < 0.62 || m.repeat_ratio > 0.18 || m.ngram_repeat_rate > 0.10 {
        return Some((Bound::Floor(0.60), "anchor: moderate template signals -> floor 0.60"));
    }
    None
}

fn moderate_human(m: &ScoreInput) -> Option<(Bound, &'static str)> {
    if m.ttr > 0.78 && m.avg_sentence_len > 35.0 && m.repeat_ratio < 0.12 {
        return Some((Bound::Ceiling(0.40), "anchor: moderate human signals -> cap 0.40"));
    }
    None
}

fn ttr_band(m: &ScoreInput) -> Option<(f64, &'static str)> {
    if m.ttr < 0.58 {
        Some((0.18, "low lexical diversity -> +0.18"))
    } else if m.ttr > 0.80 {
        Some((-0.16, "very high lexical diversity -> -0.16"))
    } else if m.ttr > 0.75 {
        Some((-0.10, "high lexical diversity -> -0.10"))
    } else {
        None
    }
}

fn repeat_band(m: &ScoreInput) -> Option<(f64, &'static str)> {
    if m.repeat_ratio > 0.30 {
        Some((0.16, "high unigram repeat -> +0.16"))
    } else if m.repeat_ratio > 0.20 {
        Some((0.10, "elevated unigram repeat -> +0.10"))
    } else {
        None
    }
}

fn ngram_band(m: &ScoreInput) -> Option<(f64, &'static str)> {
    if m.ngram_repeat_rate > 0.20 {
        Some((0.18, "high 3-gram repeat -> +0.18"))
    } else if m.ngram_repeat_rate > 0.12 {
        Some((0.10, "elevated 3-gram repeat -> +0.10"))
    } else {
        None
    }
}

fn sentence_length_band(m: &ScoreInput) -> Option<(f64, &'static str)> {
    if m.avg_sentence_len > 140.0 {
        Some((0.06, "very long sentences -> +0.06"))
    } else if m.avg_sentence_len > 100.0 {
        Some((0.03, "long sentences -> +0.03"))
    } else if m.avg_sentence_len < 40.0 {
        Some((-0.03, "short sentences -> -0.03"))
    } else {
        None
    }
}

fn perplexity_band(m: &ScoreInput) -> Option<(f64, &'static str)> {
    let ppl = m.ppl?;
    if ppl < 70.0 {
        Some((0.18, "very low perplexity -> +0.18"))
    } else if ppl < 90.0 {
        Some((0.12, "low perplexity -> +0.12"))
    } else if ppl > 220.0 {
        Some((-0.12, "very high perplexity -> -0.12"))
    } else if ppl > 180.0 {
        Some((-0.08, "high perplexity -> -0.08"))
    } else {
        None
    }
}

/// Anchors, applied in order before any adjustment.
pub const ANCHOR_RULES: &[AnchorRule] = &[
    AnchorRule { name: "strong_template", check: strong_template },
    AnchorRule { name: "strong_human", check: strong_human },
    AnchorRule { name: "moderate_template", check: moderate_template },
    AnchorRule { name: "moderate_human", check: moderate_human },
];

/// Additive bands, applied in order after the anchors.
pub const ADJUSTMENT_RULES: &[AdjustmentRule] = &[
    AdjustmentRule { name: "ttr", check: ttr_band },
    AdjustmentRule { name: "repeat_ratio", check: repeat_band },
    AdjustmentRule { name: "ngram_repeat", check: ngram_band },
    AdjustmentRule { name: "avg_sentence_len", check: sentence_length_band },
    AdjustmentRule { name: "perplexity", check: perplexity_band },
];

/// Score one segment. Returns (probability, explanations).
pub fn score_segment(input: &ScoreInput) -> (f64, Vec<String>) {
    let mut score = 0.5;
    let mut explanations = Vec::new();

    for rule in ANCHOR_RULES {
        if let Some((bound, why)) = (rule.check)(input) {
            score = bound.apply(score);
            explanations.push(why.to_string());
        }
    }

    for rule in ADJUSTMENT_RULES {
        if let Some((delta, why)) = (rule.check)(input) {
            score += delta;
            explanations.push(why.to_string());
        }
    }

    (score.clamp(PROB_FLOOR, PROB_CEIL), explanations)
}

/// Length-based confidence: `min(0.95, 0.55 + min(0.35, chars/1800))`.
pub fn segment_confidence(text: &str) -> f64 {
    let len = text.chars().count() as f64;
    (0.55 + (len / 1800.0).min(0.35)).min(0.95)
}

/// Synthetic perplexity: unigram-entropy pseudo-perplexity blended 50/50 with
/// a diversity/length heuristic, clamped to [20, 300].
pub fn estimate_perplexity(text: &str) -> f64 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 120.0;
    }

    let mut freq: HashMap<&str, usize> = HashMap::new();
    for t in &tokens {
        *freq.entry(*t).or_insert(0) += 1;
    }

    let total = tokens.len() as f64;
    let entropy = -freq
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            p * (p + 1e-12).ln()
        })
        .sum::<f64>();

    let ppl_uni = entropy.exp();
    let ppl_scaled = 20.0 + ((ppl_uni - 1.0) * 22.5).min(280.0);
    let diversity = freq.len() as f64 / total;
    let base_old = 120.0 - diversity * 60.0 + (text.chars().count() as f64) / 500.0;
    let val = (0.5 * ppl_scaled + 0.5 * base_old).clamp(20.0, 300.0);
    (val * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(ttr: f64, avg: f64, rep: f64, ngram: f64, ppl: Option<f64>) -> ScoreInput {
        ScoreInput {
            ttr,
            avg_sentence_len: avg,
            repeat_ratio: rep,
            ngram_repeat_rate: ngram,
            ppl,
        }
    }

    #[test]
    fn test_rule_order_is_fixed() {
        let anchors: Vec<&str> = ANCHOR_RULES.iter().map(|r| r.name).collect();
        assert_eq!(
            anchors,
            vec!["strong_template", "strong_human", "moderate_template", "moderate_human"]
        );
        assert_eq!(ADJUSTMENT_RULES.first().map(|r| r.name), Some("ttr"));
        assert_eq!(ADJUSTMENT_RULES.last().map(|r| r.name), Some("perplexity"));
    }

    #[test]
    fn test_strong_template_anchor_lifts_and_saturates() {
        // ttr 0.40: lift = min(0.18, 0.12 * 3) = 0.18 -> floor 0.90, then +0.18 +0.16 +0.18 +0.18
        let (p, expl) = score_segment(&input(0.40, 60.0, 0.35, 0.25, Some(60.0)));
        assert_eq!(p, PROB_CEIL);
        assert!(expl[0].starts_with("anchor: low ttr"));
    }

    #[test]
    fn test_strong_human_anchor_caps() {
        // ceiling 0.38, then ttr>0.80 -> -0.16, ppl>220 -> -0.12
        let (p, expl) = score_segment(&input(0.85, 50.0, 0.05, 0.0, Some(250.0)));
        assert!((p - (0.38 - 0.16 - 0.12)).abs() < 1e-9);
        assert!(expl.iter().any(|e| e.contains("cap 0.38")));
        assert!(expl.iter().any(|e| e.contains("cap 0.40")));
    }

    #[test]
    fn test_neutral_input_keeps_half() {
        let (p, expl) = score_segment(&input(0.70, 60.0, 0.10, 0.05, Some(120.0)));
        assert!((p - 0.5).abs() < 1e-12);
        assert!(expl.is_empty());
    }

    #[test]
    fn test_without_stylometry_floor_applies() {
        // ttr 0 triggers the moderate-template floor and the low-diversity band
        let (p, _) = score_segment(&input(0.0, 300.0, 0.0, 0.0, None));
        assert!((p - (0.60 + 0.18 + 0.06)).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_grows_with_length() {
        assert!((segment_confidence("") - 0.55).abs() < 1e-12);
        let long = "字".repeat(5000);
        assert!((segment_confidence(&long) - 0.90).abs() < 1e-12);
        assert!(segment_confidence("短文本") < segment_confidence(&"字".repeat(900)));
    }

    #[test]
    fn test_perplexity_bounds() {
        assert_eq!(estimate_perplexity(""), 120.0);
        let p = estimate_perplexity("这是一个测试句子，用来估计困惑度。");
        assert!((20.0..=300.0).contains(&p));
    }
}
