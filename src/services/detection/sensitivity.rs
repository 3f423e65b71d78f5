// Sensitivity utilities
// Sensitivity selects the chunk profile and the contrast sharpening strength.

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl DetectionSensitivity {
    pub fn from_str(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Base (chunk, overlap) token targets.
    fn base_profile(&self) -> ChunkProfile {
        match self {
            Self::Low => ChunkProfile { chunk_tokens: 800, overlap_tokens: 80 },
            Self::Medium => ChunkProfile { chunk_tokens: 550, overlap_tokens: 60 },
            Self::High => ChunkProfile { chunk_tokens: 360, overlap_tokens: 40 },
        }
    }

    /// Hard ceiling on chunk size regardless of overrides.
    fn chunk_ceiling(&self) -> usize {
        match self {
            Self::Low => 900,
            _ => 600,
        }
    }

    /// Base gamma for contrast sharpening.
    pub fn contrast_gamma(&self) -> f64 {
        match self {
            Self::Low => 1.10,
            Self::Medium => 1.45,
            Self::High => 1.75,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkProfile {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
}

pub const MIN_CHUNK_TOKENS: usize = 120;

/// Resolve chunk/overlap sizes for a sensitivity level.
///
/// Zero or missing overrides fall back to the sensitivity base. `high` never
/// relaxes above its base target.
pub fn resolve_profile(
    sensitivity: DetectionSensitivity,
    chunk_tokens: Option<usize>,
    overlap_tokens: Option<usize>,
) -> ChunkProfile {
    let base = sensitivity.base_profile();
    let mut chunk = chunk_tokens
        .filter(|v| *v > 0)
        .unwrap_or(base.chunk_tokens)
        .max(MIN_CHUNK_TOKENS);
    let overlap = overlap_tokens.filter(|v| *v > 0).unwrap_or(base.overlap_tokens);

    if sensitivity == DetectionSensitivity::High {
        chunk = chunk.min(base.chunk_tokens);
    }
    chunk = chunk.min(sensitivity.chunk_ceiling());

    ChunkProfile {
        chunk_tokens: chunk,
        overlap_tokens: overlap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_defaults_to_medium() {
        assert_eq!(DetectionSensitivity::from_str(" HIGH "), DetectionSensitivity::High);
        assert_eq!(DetectionSensitivity::from_str("low"), DetectionSensitivity::Low);
        assert_eq!(DetectionSensitivity::from_str("whatever"), DetectionSensitivity::Medium);
    }

    #[test]
    fn test_base_profiles() {
        let p = resolve_profile(DetectionSensitivity::Medium, None, None);
        assert_eq!((p.chunk_tokens, p.overlap_tokens), (550, 60));
        let p = resolve_profile(DetectionSensitivity::Low, Some(0), Some(0));
        assert_eq!((p.chunk_tokens, p.overlap_tokens), (800, 80));
    }

    #[test]
    fn test_high_never_exceeds_base() {
        let p = resolve_profile(DetectionSensitivity::High, Some(10_000), None);
        assert_eq!(p.chunk_tokens, 360);
        for v in [1usize, 200, 359, 361, 600, 5000] {
            assert!(resolve_profile(DetectionSensitivity::High, Some(v), None).chunk_tokens <= 360);
        }
    }

    #[test]
    fn test_floor_and_ceiling() {
        assert_eq!(resolve_profile(DetectionSensitivity::Medium, Some(10), None).chunk_tokens, 120);
        assert_eq!(resolve_profile(DetectionSensitivity::Medium, Some(5000), None).chunk_tokens, 600);
        assert_eq!(resolve_profile(DetectionSensitivity::Low, Some(5000), None).chunk_tokens, 900);
    }
}
