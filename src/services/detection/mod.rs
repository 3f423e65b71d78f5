// Detection Module
// AI text detection core logic organized into specialized submodules:
// - sensitivity: chunk profiles and sharpening strength
// - scorer: anchor/adjustment rule cascade over stylometry and perplexity
// - segment_builder: builds scored segments from text blocks
// - planner: LLM segmentation plan with strict validation
// - llm_analyzer: LLM judgment and variance-adaptive fusion
// - aggregation: contrast sharpening, aggregation and decisions
// - calibration: versioned logistic recalibration and rubric metadata
// - node_mapping: segment/structure alignment QA
// - pipeline: the end-to-end detector

pub mod sensitivity;
pub mod scorer;
pub mod segment_builder;
pub mod planner;
pub mod llm_analyzer;
pub mod aggregation;
pub mod calibration;
pub mod node_mapping;
pub mod pipeline;

// Re-export commonly used functions
pub use sensitivity::{resolve_profile, ChunkProfile, DetectionSensitivity};
pub use scorer::{estimate_perplexity, score_segment};
pub use segment_builder::{
    build_segments_aligned,
    build_segments_per_block,
    make_segment,
    split_segments_by_length,
    ScoringOptions,
};
pub use planner::{plan_segments, validate_segment_plan, PlanError};
pub use llm_analyzer::{run_llm_judgment, JudgmentStats};
pub use aggregation::{aggregate_segments, contrast_sharpen_segments, derive_decision, RUBRIC_VERSION};
pub use calibration::{rubric_changelog, rubric_info, CalibrationParams, CalibrationStore};
pub use node_mapping::{map_segments_to_nodes, preprocess_document, PreprocessOptions, PreprocessedDocument};
pub use pipeline::{DetectError, DetectOutcome, Detector, API_VERSION};
