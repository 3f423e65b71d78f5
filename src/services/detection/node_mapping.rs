// Node Mapping
// Segment <-> structured node coverage mapping and the before/after
// alignment comparison used for document preprocessing QA.

use crate::models::{PreprocessSummary, Segment};
use crate::services::structure::{
    build_paragraph_blocks_from_nodes, build_structured_nodes, format_summary, formatted_text,
    FormatSummary, NodeBlockOptions, NodeType, StructuredNode,
};
use crate::services::text_processor::normalize_punctuation;
use super::segment_builder::{build_segments_aligned, build_segments_per_block, ScoringOptions};
use super::sensitivity::{resolve_profile, DetectionSensitivity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

const MIN_COVERAGE: f64 = 0.2;
const CLEAN_COVERAGE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHit {
    pub node_index: usize,
    /// Overlapping span in bytes.
    pub overlap: usize,
    /// `overlap / node span`, rounded to 4 places.
    pub coverage_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHit {
    pub chunk_id: usize,
    pub overlap: usize,
    pub coverage_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentNodeMapping {
    /// Per chunk, hits ranked by (coverage desc, overlap desc).
    pub segment_node_map: BTreeMap<usize, Vec<NodeHit>>,
    pub node_chunk_map: BTreeMap<usize, Vec<ChunkHit>>,
    pub unmapped_chunks: Vec<usize>,
    pub unmapped_nodes: Vec<usize>,
    pub primary_node_for_chunk: BTreeMap<usize, usize>,
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Map every segment onto the structured nodes it covers.
pub fn map_segments_to_nodes(segments: &[Segment], nodes: &[StructuredNode]) -> SegmentNodeMapping {
    let mut mapping = SegmentNodeMapping::default();

    for seg in segments {
        let (s_start, s_end) = (seg.offsets.start, seg.offsets.end);
        let mut hits: Vec<NodeHit> = Vec::new();

        for (idx, node) in nodes.iter().enumerate() {
            let overlap = s_end
                .min(node.end_offset)
                .saturating_sub(s_start.max(node.start_offset));
            if overlap == 0 {
                continue;
            }
            let span = node.end_offset.saturating_sub(node.start_offset).max(1);
            let coverage = overlap as f64 / span as f64;
            if coverage < MIN_COVERAGE {
                continue;
            }
            let hit = NodeHit {
                node_index: idx,
                overlap,
                coverage_ratio: round4(coverage),
            };
            mapping.node_chunk_map.entry(idx).or_default().push(ChunkHit {
                chunk_id: seg.chunk_id,
                overlap,
                coverage_ratio: hit.coverage_ratio,
            });
            hits.push(hit);
        }

        if hits.is_empty() {
            mapping.unmapped_chunks.push(seg.chunk_id);
            continue;
        }

        hits.sort_by(|a, b| {
            b.coverage_ratio
                .total_cmp(&a.coverage_ratio)
                .then(b.overlap.cmp(&a.overlap))
        });
        let primary = hits
            .iter()
            .find(|h| nodes[h.node_index].node_type.is_body())
            .unwrap_or(&hits[0])
            .node_index;
        mapping.primary_node_for_chunk.insert(seg.chunk_id, primary);
        mapping.segment_node_map.insert(seg.chunk_id, hits);
    }

    mapping.unmapped_nodes = (0..nodes.len())
        .filter(|idx| !mapping.node_chunk_map.contains_key(idx))
        .collect();
    mapping
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub chunk_id: usize,
    pub hits: Vec<NodeHit>,
}

/// Chunks that straddle several nodes or only partially cover their best node.
pub fn find_mismatches(mapping: &SegmentNodeMapping) -> Vec<Mismatch> {
    mapping
        .segment_node_map
        .iter()
        .filter(|(_, hits)| {
            hits.len() >= 2 || hits.first().map_or(false, |h| h.coverage_ratio < CLEAN_COVERAGE)
        })
        .map(|(chunk_id, hits)| Mismatch {
            chunk_id: *chunk_id,
            hits: hits.clone(),
        })
        .collect()
}

/// Every mapped heading shares at least one chunk with a body node.
pub fn heading_body_association_ok(mapping: &SegmentNodeMapping, nodes: &[StructuredNode]) -> bool {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.node_type == NodeType::Heading)
        .all(|(idx, _)| {
            let Some(chunks) = mapping.node_chunk_map.get(&idx) else {
                return true;
            };
            chunks.iter().any(|c| {
                mapping
                    .segment_node_map
                    .get(&c.chunk_id)
                    .map_or(false, |hits| hits.iter().any(|h| nodes[h.node_index].node_type.is_body()))
            })
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentReport {
    pub segment_count: usize,
    pub node_count: usize,
    pub mismatches: Vec<Mismatch>,
    pub unmapped_chunks: Vec<usize>,
    pub unmapped_nodes: Vec<usize>,
    pub heading_body_association_ok: bool,
}

impl AlignmentReport {
    fn new(segments: &[Segment], nodes: &[StructuredNode], mapping: &SegmentNodeMapping) -> Self {
        Self {
            segment_count: segments.len(),
            node_count: nodes.len(),
            mismatches: find_mismatches(mapping),
            unmapped_chunks: mapping.unmapped_chunks.clone(),
            unmapped_nodes: mapping.unmapped_nodes.clone(),
            heading_body_association_ok: heading_body_association_ok(mapping, nodes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentComparison {
    pub before: AlignmentReport,
    pub after: AlignmentReport,
}

#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    pub normalize_punctuation: bool,
    /// Reported language; `zh-CN` when unset.
    pub language: Option<String>,
    pub chunk_size_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            normalize_punctuation: true,
            language: None,
            chunk_size_tokens: None,
            overlap_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessedDocument {
    pub normalized_text: String,
    pub structured_nodes: Vec<StructuredNode>,
    pub formatted_text: String,
    pub format_summary: FormatSummary,
    pub segments: Vec<Segment>,
    pub preprocess_summary: PreprocessSummary,
    pub mapping: SegmentNodeMapping,
    pub comparison: AlignmentComparison,
}

/// Outline a document and compare chunker segmentation ("before") against
/// node-aligned one-per-block segmentation ("after").
pub fn preprocess_document(text: &str, opts: &PreprocessOptions) -> PreprocessedDocument {
    let normalized = if opts.normalize_punctuation {
        normalize_punctuation(text)
    } else {
        text.to_string()
    };
    let language = opts
        .language
        .clone()
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| "zh-CN".to_string());
    let nodes = build_structured_nodes(&normalized);
    let profile = resolve_profile(DetectionSensitivity::Medium, opts.chunk_size_tokens, opts.overlap_tokens);
    let scoring = ScoringOptions::default();

    let before_blocks = build_paragraph_blocks_from_nodes(
        &normalized,
        &nodes,
        &NodeBlockOptions {
            merge_min_chars: 200,
            hard_align: false,
            include_heading: true,
            attach_heading_to_body: false,
        },
    );
    let before_segments = build_segments_aligned(
        &normalized,
        &language,
        &before_blocks,
        profile.chunk_tokens,
        profile.overlap_tokens,
        scoring,
    );

    let after_blocks = build_paragraph_blocks_from_nodes(
        &normalized,
        &nodes,
        &NodeBlockOptions {
            merge_min_chars: 100,
            hard_align: true,
            include_heading: true,
            attach_heading_to_body: true,
        },
    );
    let after_segments = build_segments_per_block(&normalized, &language, &after_blocks, scoring);

    let before_mapping = map_segments_to_nodes(&before_segments, &nodes);
    let after_mapping = map_segments_to_nodes(&after_segments, &nodes);
    let comparison = AlignmentComparison {
        before: AlignmentReport::new(&before_segments, &nodes, &before_mapping),
        after: AlignmentReport::new(&after_segments, &nodes, &after_mapping),
    };

    info!(
        "[PREPROCESS] nodes={} before_segments={} after_segments={} mismatches_before={} mismatches_after={}",
        nodes.len(),
        before_segments.len(),
        after_segments.len(),
        comparison.before.mismatches.len(),
        comparison.after.mismatches.len()
    );

    PreprocessedDocument {
        formatted_text: formatted_text(&nodes),
        format_summary: format_summary(&nodes),
        preprocess_summary: PreprocessSummary {
            language,
            chunks: after_segments.len(),
            redacted: 0,
        },
        normalized_text: normalized,
        structured_nodes: nodes,
        segments: after_segments,
        mapping: after_mapping,
        comparison,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::detection::segment_builder::make_segment;

    fn node(node_type: NodeType, start: usize, end: usize) -> StructuredNode {
        StructuredNode {
            node_type,
            text: String::new(),
            start_offset: start,
            end_offset: end,
            section_path: String::new(),
            level: None,
            meta_count: None,
        }
    }

    fn seg(chunk_id: usize, start: usize, end: usize) -> Segment {
        let text = "x".repeat(end - start);
        make_segment(chunk_id, "en", start, end, &text, ScoringOptions::default())
    }

    #[test]
    fn test_coverage_threshold_and_primary() {
        let nodes = vec![
            node(NodeType::Heading, 0, 10),
            node(NodeType::Paragraph, 11, 111),
            node(NodeType::Paragraph, 112, 212),
        ];
        // Covers the heading fully, the first paragraph fully and 10% of the second.
        let segments = vec![seg(0, 0, 122)];
        let mapping = map_segments_to_nodes(&segments, &nodes);

        let hits = &mapping.segment_node_map[&0];
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.node_index != 2));
        // Heading and paragraph tie at 1.0; the paragraph wins on overlap and as body.
        assert_eq!(hits[0].node_index, 1);
        assert_eq!(mapping.primary_node_for_chunk[&0], 1);
        assert_eq!(mapping.unmapped_nodes, vec![2]);
        assert!(heading_body_association_ok(&mapping, &nodes));
        assert_eq!(find_mismatches(&mapping).len(), 1);
    }

    #[test]
    fn test_unmapped_and_partial_coverage() {
        let nodes = vec![node(NodeType::Paragraph, 0, 100)];
        let segments = vec![seg(0, 0, 50), seg(1, 200, 210)];
        let mapping = map_segments_to_nodes(&segments, &nodes);
        assert_eq!(mapping.unmapped_chunks, vec![1]);
        let mismatches = find_mismatches(&mapping);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].hits[0].coverage_ratio, 0.5);
    }

    #[test]
    fn test_heading_alone_breaks_association() {
        let nodes = vec![node(NodeType::Heading, 0, 10), node(NodeType::Paragraph, 11, 200)];
        let segments = vec![seg(0, 0, 10), seg(1, 11, 200)];
        let mapping = map_segments_to_nodes(&segments, &nodes);
        assert!(!heading_body_association_ok(&mapping, &nodes));
        assert!(find_mismatches(&mapping).is_empty());
    }

    #[test]
    fn test_preprocess_document() {
        let text = "第一章 绪论\n本研究探讨了人工智能在教育领域中的广泛应用，并且系统地分析了其潜在的积极影响与可能存在的风险。\n\n第二章 方法\n我们在两年时间里收集了三所学校的教学数据，并使用多种统计方法对这些数据进行了仔细的分析与验证。";
        let doc = preprocess_document(text, &PreprocessOptions::default());

        assert_eq!(doc.format_summary.headings, 2);
        assert_eq!(doc.format_summary.paragraphs, 2);
        assert_eq!(doc.preprocess_summary.language, "zh-CN");
        assert_eq!(doc.preprocess_summary.chunks, doc.segments.len());
        assert_eq!(doc.comparison.after.segment_count, doc.segments.len());
        assert_eq!(doc.comparison.after.node_count, 4);
        // Attached headings keep every heading next to its body.
        assert!(doc.comparison.after.heading_body_association_ok);
        assert!(doc.mapping.unmapped_chunks.is_empty());
        assert!(doc.formatted_text.contains("## 第二章 方法"));
    }
}
