// LLM Segmentation Planner
// Asks an LLM how to merge adjacent body paragraphs into segments.
// Any failure (no key, transport, unparseable or invalid plan) yields None
// and the caller falls back to the local chunker.

use crate::models::Segment;
use crate::services::config_store::LlmConfig;
use crate::services::providers::{
    complete_with_timeout, extract_json_span, ChatBackend, ChatCompletion, CredentialSource, ProviderKind,
};
use crate::services::text_processor::{estimate_tokens, BlockLabel, TextBlock};
use super::segment_builder::{make_segment, ScoringOptions};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

const PREVIEW_MAX_CHARS: usize = 240;

const SYSTEM_PROMPT: &str = "You are a segmentation planner. Given a list of BODY paragraphs, \
decide how to merge adjacent items. Return JSON only, ignore all non-body content.";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("response is not JSON")]
    Unparseable,
    #[error("missing `segments` array")]
    MissingSegments,
    #[error("entry {0} has a non-integer paragraph index")]
    InvalidIndex(usize),
    #[error("paragraph_start {start} does not match expected {expected}")]
    OutOfOrder { start: usize, expected: usize },
    #[error("paragraph_end {end} is before paragraph_start {start}")]
    EndBeforeStart { start: usize, end: usize },
    #[error("paragraph_end {end} exceeds last body index {max}")]
    OutOfRange { end: usize, max: usize },
    #[error("plan covers {covered} of {total} body paragraphs")]
    IncompleteCoverage { covered: usize, total: usize },
}

/// Inclusive run of body-paragraph indices merged into one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRun {
    pub first: usize,
    pub last: usize,
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

/// One prompt line per block: `[i] label=.. len=<tokens> text=<compact preview>`.
fn summarize_block(block: &TextBlock, order: usize) -> String {
    let raw = block.text.trim();
    let compact = whitespace_re().replace_all(raw, " ");
    let mut snippet: String = compact.chars().take(PREVIEW_MAX_CHARS).collect();
    if compact.chars().count() > PREVIEW_MAX_CHARS {
        snippet.push_str("...");
    }
    let label = match block.label {
        BlockLabel::Body => "body",
        BlockLabel::Heading => "heading",
        BlockLabel::ListItem => "list_item",
    };
    format!("[{}] label={} len={} text={}", order, label, estimate_tokens(raw), snippet)
}

pub fn build_user_prompt(body_blocks: &[&TextBlock], chunk_tokens: usize) -> String {
    let target = chunk_tokens.max(180);
    let hard = (target as f64 * 1.25) as usize;
    let rules = [
        "Only consider paragraphs with label=body; drop every other label.".to_string(),
        "Keep the original order. You may merge adjacent items, but never reorder or skip any body paragraph."
            .to_string(),
        "Cover every body paragraph exactly once.".to_string(),
        format!("Treat 'len' as tokens. Target ~{} tokens per segment.", target),
        format!("Hard limit: if a merge would exceed ~{} tokens, START A NEW SEGMENT.", hard),
        "Prefer 1-3 body paragraphs per segment; never exceed 6.".to_string(),
        r#"Return JSON only: {"segments":[{"chunk_id":0,"paragraph_start":0,"paragraph_end":2}]}; chunk_id starts at 0 and increases by 1."#
            .to_string(),
    ];

    let rule_lines: Vec<String> = rules.iter().map(|r| format!("- {}", r)).collect();
    let block_lines: Vec<String> = body_blocks
        .iter()
        .enumerate()
        .map(|(i, b)| summarize_block(b, i))
        .collect();

    format!(
        "Below are {} BODY paragraphs, indexed from 0.\n{}\n\nParagraph list:\n{}",
        body_blocks.len(),
        rule_lines.join("\n"),
        block_lines.join("\n")
    )
}

/// Parse plan content: direct JSON first, then the first `{...}` span.
pub fn parse_plan_content(content: &str) -> Result<Value, PlanError> {
    let trimmed = content.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }
    extract_json_span(trimmed)
        .and_then(|span| serde_json::from_str::<Value>(span).ok())
        .ok_or(PlanError::Unparseable)
}

fn as_index(v: Option<&Value>) -> Option<usize> {
    match v? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Validate a plan against `body_count` body paragraphs.
///
/// Entries must start exactly where the previous one ended, stay in range,
/// and together cover every body paragraph.
pub fn validate_segment_plan(payload: &Value, body_count: usize) -> Result<Vec<PlannedRun>, PlanError> {
    let entries = payload
        .get("segments")
        .and_then(Value::as_array)
        .ok_or(PlanError::MissingSegments)?;

    let mut expected = 0usize;
    let mut runs = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let start = as_index(entry.get("paragraph_start")).ok_or(PlanError::InvalidIndex(i))?;
        let end = as_index(entry.get("paragraph_end")).ok_or(PlanError::InvalidIndex(i))?;

        if start != expected {
            return Err(PlanError::OutOfOrder { start, expected });
        }
        if end < start {
            return Err(PlanError::EndBeforeStart { start, end });
        }
        if end >= body_count {
            return Err(PlanError::OutOfRange {
                end,
                max: body_count.saturating_sub(1),
            });
        }
        runs.push(PlannedRun { first: start, last: end });
        expected = end + 1;
    }

    if expected != body_count {
        return Err(PlanError::IncompleteCoverage {
            covered: expected,
            total: body_count,
        });
    }
    Ok(runs)
}

/// Successful plan plus the provider latency it cost.
pub struct PlanOutcome {
    pub segments: Vec<Segment>,
    pub latency_ms: u64,
}

/// Plan segments with the LLM. `None` means "use the local chunker".
pub async fn plan_segments(
    backend: &dyn ChatBackend,
    credentials: &dyn CredentialSource,
    llm: &LlmConfig,
    text: &str,
    language: &str,
    blocks: &[TextBlock],
    chunk_tokens: usize,
    opts: ScoringOptions,
) -> Option<PlanOutcome> {
    let api_key = credentials.api_key(ProviderKind::Glm)?;
    let body_blocks: Vec<&TextBlock> = blocks.iter().filter(|b| b.label == BlockLabel::Body).collect();
    if body_blocks.len() <= 1 {
        return None;
    }
    info!(
        "[PLANNER] blocks_total={} body_blocks={} non_body={}",
        blocks.len(),
        body_blocks.len(),
        blocks.len() - body_blocks.len()
    );

    let request = ChatCompletion {
        provider: ProviderKind::Glm,
        model: llm.planner_model.clone(),
        api_key,
        system: SYSTEM_PROMPT.to_string(),
        user: build_user_prompt(&body_blocks, chunk_tokens),
        max_tokens: llm.planner_max_tokens,
        enable_reasoning: true,
        reasoning_effort: "high".to_string(),
    };

    let started = Instant::now();
    let result = match complete_with_timeout(backend, &request, Duration::from_secs(llm.timeout_secs)).await {
        Ok(r) => r,
        Err(e) => {
            warn!("[PLANNER] Planner call failed, using local chunker: {}", e);
            return None;
        }
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let runs = match parse_plan_content(&result.content)
        .and_then(|payload| validate_segment_plan(&payload, body_blocks.len()))
    {
        Ok(runs) => runs,
        Err(e) => {
            let preview: String = result.content.chars().take(200).collect();
            error!("[PLANNER] Rejected plan ({}), preview={}", e, preview);
            return None;
        }
    };

    let segments: Vec<Segment> = runs
        .iter()
        .enumerate()
        .map(|(i, run)| {
            let start = body_blocks[run.first].start;
            let end = body_blocks[run.last].end;
            make_segment(i, language, start, end, &text[start..end], opts)
        })
        .collect();

    info!(
        "[PLANNER] Plan accepted: segments={} paragraphs={} latency_ms={}",
        segments.len(),
        body_blocks.len(),
        latency_ms
    );
    Some(PlanOutcome { segments, latency_ms })
}
