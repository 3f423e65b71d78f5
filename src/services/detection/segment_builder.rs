// Segment Builder
// Builds scored detection segments from text blocks:
// - one segment per block (structural alignment)
// - token-accumulating chunker with proportional in-block split points
// - length-based re-splitting of oversized segments at sentence boundaries

use crate::models::{
    Segment, SegmentOffsets, SegmentSignals, SignalLlmJudgment, SignalPerplexity, SignalStylometry,
};
use crate::services::text_processor::{compute_stylometry, estimate_tokens, split_sentences, TextBlock};
use super::scorer::{estimate_perplexity, score_segment, segment_confidence, ScoreInput};
use tracing::debug;

/// Which signal families feed the scorer.
#[derive(Debug, Clone, Copy)]
pub struct ScoringOptions {
    pub use_perplexity: bool,
    pub use_stylometry: bool,
}

impl Default for ScoringOptions {
    fn default() -> Self {
        Self {
            use_perplexity: true,
            use_stylometry: true,
        }
    }
}

/// Create a scored segment for `text`, which spans `[start, end)` of the normalized text.
pub fn make_segment(
    chunk_id: usize,
    language: &str,
    start: usize,
    end: usize,
    text: &str,
    opts: ScoringOptions,
) -> Segment {
    let (stylometry, ngram_repeat_rate) = if opts.use_stylometry {
        let metrics = compute_stylometry(text);
        (
            SignalStylometry {
                ttr: metrics.ttr,
                avg_sentence_len: metrics.avg_sentence_len,
                function_word_ratio: metrics.function_word_ratio,
                repeat_ratio: metrics.repeat_ratio,
                punctuation_ratio: metrics.punctuation_ratio,
            },
            metrics.ngram_repeat_rate.unwrap_or(0.0),
        )
    } else {
        (
            SignalStylometry {
                avg_sentence_len: text.chars().count() as f64,
                ..SignalStylometry::default()
            },
            0.0,
        )
    };

    let ppl = opts.use_perplexity.then(|| estimate_perplexity(text));

    let (ai_probability, explanations) = score_segment(&ScoreInput {
        ttr: stylometry.ttr,
        avg_sentence_len: stylometry.avg_sentence_len,
        repeat_ratio: stylometry.repeat_ratio.unwrap_or(0.0),
        ngram_repeat_rate,
        ppl,
    });

    Segment {
        chunk_id,
        language: language.to_string(),
        offsets: SegmentOffsets { start, end },
        ai_probability,
        confidence: segment_confidence(text),
        signals: SegmentSignals {
            llm_judgment: SignalLlmJudgment::default(),
            perplexity: SignalPerplexity { ppl, z: None },
            stylometry,
        },
        explanations,
    }
}

/// Blocks eligible for detection; all blocks when none are flagged.
fn detect_blocks(blocks: &[TextBlock]) -> Vec<&TextBlock> {
    let flagged: Vec<&TextBlock> = blocks.iter().filter(|b| b.need_detect).collect();
    if flagged.is_empty() {
        blocks.iter().collect()
    } else {
        flagged
    }
}

/// Smallest char boundary at or after `idx`.
fn ceil_char_boundary(text: &str, idx: usize) -> usize {
    let mut i = idx.min(text.len());
    while !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// One segment per detectable block.
pub fn build_segments_per_block(
    text: &str,
    language: &str,
    blocks: &[TextBlock],
    opts: ScoringOptions,
) -> Vec<Segment> {
    detect_blocks(blocks)
        .into_iter()
        .enumerate()
        .map(|(idx, block)| {
            make_segment(idx, language, block.start, block.end, &text[block.start..block.end], opts)
        })
        .collect()
}

/// Token-accumulating chunker.
///
/// Accumulates block tokens until the target would be met, then cuts inside
/// the current block at a point proportional to its chars-per-token ratio.
/// Always yields at least one segment. `overlap_tokens` is accepted with the
/// profile but segments never overlap: the proportional cut is the seam.
pub fn build_segments_aligned(
    text: &str,
    language: &str,
    blocks: &[TextBlock],
    chunk_tokens: usize,
    overlap_tokens: usize,
    opts: ScoringOptions,
) -> Vec<Segment> {
    debug!("[SEGMENT] chunker target={} overlap={}", chunk_tokens, overlap_tokens);
    let mut segments: Vec<Segment> = Vec::new();
    let mut acc_tokens = 0usize;
    let mut current_start: Option<usize> = None;
    let mut current_end: Option<usize> = None;

    for block in detect_blocks(blocks) {
        let mut block_tokens = estimate_tokens(&text[block.start..block.end]);
        debug!(
            "[SEGMENT] block idx={} tokens={} span={}..{}",
            block.index, block_tokens, block.start, block.end
        );
        let mut cursor = block.start;
        let start = *current_start.get_or_insert(cursor);
        let mut seg_start = start;

        while chunk_tokens > 0 && acc_tokens + block_tokens >= chunk_tokens && cursor < block.end {
            let need_tokens = chunk_tokens.saturating_sub(acc_tokens).max(1);
            let remaining = block.end - cursor;
            let chars_per_token = (remaining as f64 / block_tokens.max(1) as f64).max(1.0);
            let split = ((chars_per_token * need_tokens as f64).round() as usize).clamp(1, remaining);
            let end = ceil_char_boundary(text, cursor + split);

            segments.push(make_segment(
                segments.len(),
                language,
                seg_start,
                end,
                &text[seg_start..end],
                opts,
            ));
            seg_start = end;
            cursor = end;
            block_tokens = estimate_tokens(&text[cursor..block.end]);
            acc_tokens = 0;
        }

        current_start = Some(seg_start);
        current_end = Some(block.end);
        acc_tokens += block_tokens;
    }

    if let (Some(start), Some(end)) = (current_start, current_end) {
        if end > start {
            segments.push(make_segment(segments.len(), language, start, end, &text[start..end], opts));
        }
    }

    if segments.is_empty() {
        segments.push(make_segment(0, language, 0, text.len(), text, opts));
    }
    segments
}

/// Re-split segments whose token estimate exceeds 1.5x target at sentence boundaries.
///
/// Segments within the hard limit are rebuilt as-is so chunk ids stay contiguous.
pub fn split_segments_by_length(
    segments: &[Segment],
    text: &str,
    language: &str,
    target_tokens: usize,
    opts: ScoringOptions,
) -> Vec<Segment> {
    let target = target_tokens.max(180);
    let soft_limit = (target as f64 * 1.1) as usize;
    let hard_limit = (target as f64 * 1.5) as usize;
    let mut rebuilt: Vec<Segment> = Vec::new();

    for seg in segments {
        let SegmentOffsets { start, end } = seg.offsets;
        let seg_text = &text[start..end];
        if estimate_tokens(seg_text) <= hard_limit {
            rebuilt.push(make_segment(rebuilt.len(), language, start, end, seg_text, opts));
            continue;
        }

        let mut sentences: Vec<String> = split_sentences(seg_text).into_iter().map(|s| s.text).collect();
        if sentences.is_empty() {
            sentences.push(seg_text.to_string());
        }

        let mut cursor = 0usize;
        let mut current_start = start;
        let mut current_tokens = 0usize;
        let mut buf_end = start;
        for sent in &sentences {
            // Forward search keeps repeated sentences on successive occurrences.
            let idx = seg_text[cursor..].find(sent.as_str()).map(|i| cursor + i).unwrap_or(cursor);
            let sent_start = start + idx;
            let sent_end = (sent_start + sent.len()).min(end);
            let sent_tokens = estimate_tokens(sent);

            let over_soft = current_tokens >= target && current_tokens + sent_tokens > soft_limit;
            let over_hard = current_tokens + sent_tokens > hard_limit;
            if (over_soft || over_hard) && buf_end > current_start {
                // Cut at the next sentence start so inter-sentence whitespace is kept.
                rebuilt.push(make_segment(
                    rebuilt.len(),
                    language,
                    current_start,
                    sent_start,
                    &text[current_start..sent_start],
                    opts,
                ));
                current_start = sent_start;
                current_tokens = 0;
            }
            current_tokens += sent_tokens;
            buf_end = sent_end;
            cursor = (idx + sent.len()).min(seg_text.len());
        }

        // Trailing whitespace after the last sentence stays with the final piece.
        let tail_end = end.max(buf_end);
        if tail_end > current_start {
            rebuilt.push(make_segment(
                rebuilt.len(),
                language,
                current_start,
                tail_end,
                &text[current_start..tail_end],
                opts,
            ));
        }
    }
    rebuilt
}
