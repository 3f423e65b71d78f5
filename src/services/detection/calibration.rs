// Calibration
// Versioned logistic recalibration (A * logit(p) + B) fit from labeled feedback,
// plus static rubric metadata.

use crate::models::{AggregationThresholds, CalibrateItem, CalibrateResponse};
use super::aggregation::{sigmoid_clamped, RUBRIC_VERSION};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
}

impl CalibrationParams {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0 };

    pub fn apply(&self, prob: f64) -> f64 {
        let clipped = prob.clamp(1e-6, 1.0 - 1e-6);
        let logit = (clipped / (1.0 - clipped)).ln();
        sigmoid_clamped(self.a * logit + self.b).clamp(0.0, 1.0)
    }

    /// Fit from labeled samples; identity when either class is missing.
    pub fn fit(items: &[CalibrateItem]) -> Self {
        let positives: Vec<f64> = items.iter().filter(|it| it.label == 1).map(|it| it.prob).collect();
        let negatives: Vec<f64> = items.iter().filter(|it| it.label == 0).map(|it| it.prob).collect();
        if positives.is_empty() || negatives.is_empty() {
            return Self::IDENTITY;
        }
        let mean_pos = positives.iter().sum::<f64>() / positives.len() as f64;
        let mean_neg = negatives.iter().sum::<f64>() / negatives.len() as f64;
        Self {
            a: ((mean_pos - mean_neg).abs() * 6.0).clamp(0.5, 3.0),
            b: ((positives.len() as f64 + 1.0) / (negatives.len() as f64 + 1.0)).ln(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationEntry {
    #[serde(flatten)]
    pub params: CalibrationParams,
    pub samples: usize,
    /// RFC 3339 timestamp of the last fit.
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationInfo {
    pub current: String,
    pub by_version: HashMap<String, CalibrationEntry>,
}

struct CalibrationState {
    current: String,
    by_version: HashMap<String, CalibrationEntry>,
}

/// Versioned calibration shared by all detections in a process.
///
/// Readers take the current version's parameters; `set_calibration`
/// overwrites the entry for the current version only.
pub struct CalibrationStore {
    state: RwLock<CalibrationState>,
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(RUBRIC_VERSION)
    }
}

impl CalibrationStore {
    /// Identity calibration registered under `version`.
    pub fn new(version: &str) -> Self {
        let entry = CalibrationEntry {
            params: CalibrationParams::IDENTITY,
            samples: 0,
            updated_at: Utc::now().to_rfc3339(),
        };
        Self {
            state: RwLock::new(CalibrationState {
                current: version.to_string(),
                by_version: HashMap::from([(version.to_string(), entry)]),
            }),
        }
    }

    pub fn current_params(&self) -> CalibrationParams {
        match self.state.read() {
            Ok(state) => state
                .by_version
                .get(&state.current)
                .map(|e| e.params)
                .unwrap_or(CalibrationParams::IDENTITY),
            Err(_) => {
                warn!("[CALIBRATION] Lock poisoned, using identity");
                CalibrationParams::IDENTITY
            }
        }
    }

    pub fn apply_calibration(&self, prob: f64) -> f64 {
        self.current_params().apply(prob)
    }

    /// Refit the current version from labeled samples.
    pub fn set_calibration(&self, items: &[CalibrateItem]) -> CalibrateResponse {
        let params = CalibrationParams::fit(items);
        let mut state = match self.state.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let version = state.current.clone();
        state.by_version.insert(
            version.clone(),
            CalibrationEntry {
                params,
                samples: items.len(),
                updated_at: Utc::now().to_rfc3339(),
            },
        );
        info!(
            "[CALIBRATION] version={} samples={} A={:.4} B={:.4}",
            version,
            items.len(),
            params.a,
            params.b
        );
        CalibrateResponse {
            ok: true,
            version,
            a: params.a,
            b: params.b,
        }
    }

    /// Point readers at another version, creating an identity entry if new.
    pub fn set_current_version(&self, version: &str) {
        let mut state = match self.state.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .by_version
            .entry(version.to_string())
            .or_insert_with(|| CalibrationEntry {
                params: CalibrationParams::IDENTITY,
                samples: 0,
                updated_at: Utc::now().to_rfc3339(),
            });
        state.current = version.to_string();
    }

    pub fn calibration_info(&self) -> CalibrationInfo {
        let state = match self.state.read() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        CalibrationInfo {
            current: state.current.clone(),
            by_version: state.by_version.clone(),
        }
    }
}

// ============ Rubric metadata ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricInfo {
    pub version: String,
    pub base_weights: HashMap<String, f64>,
    pub quality_weights: HashMap<String, f64>,
    pub block_weights: HashMap<String, f64>,
    pub thresholds: AggregationThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricChange {
    pub version: String,
    pub changes: Vec<String>,
}

fn weights(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn rubric_info() -> RubricInfo {
    RubricInfo {
        version: RUBRIC_VERSION.to_string(),
        base_weights: weights(&[
            ("ppl", 0.32),
            ("ttr", 0.22),
            ("repeatRatio", 0.10),
            ("avgSentenceLen", 0.10),
            ("punctuationRatio", 0.03),
        ]),
        quality_weights: weights(&[
            ("grammarAccuracy", 0.25),
            ("contentRelevance", 0.2),
            ("logicalCoherence", 0.15),
            ("emotionalExpression", 0.1),
            ("terminologyProfessionalism", 0.1),
            ("originality", 0.1),
            ("readability", 0.1),
        ]),
        block_weights: weights(&[("stylometry", 0.4), ("quality", 0.6)]),
        thresholds: AggregationThresholds::default(),
    }
}

pub fn rubric_changelog() -> Vec<RubricChange> {
    vec![RubricChange {
        version: RUBRIC_VERSION.to_string(),
        changes: vec![
            "Introduce dual-block aggregation (stylometry + quality)".to_string(),
            "Add n-gram repeat anchors".to_string(),
            "Auto high-sensitivity re-segmentation when deviation is low".to_string(),
            "Contrast sharpening keeps global mean stable".to_string(),
        ],
    }]
}
