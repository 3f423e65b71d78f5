// Document Structure
// Line-level outline (headings, paragraphs, list items) and node-driven paragraph blocks

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::text_processor::{build_paragraph_blocks, BlockLabel, TextBlock};

const TERMINAL_PUNCT: &[char] = &['。', '！', '？', '.', '!', '?'];
const HEADING_META_KEYWORDS: &[&str] = &["副标题", "Subheading", "Subtitle", "编号", "No.", "NO.", "序号"];
const SHORT_HEADING_CHARS: usize = 30;
const META_MAX_CHARS: usize = 40;

fn chapter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^第[0-9一二三四五六七八九十百千]+[章节部分]").expect("chapter regex"))
}

fn english_chapter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:Chapter|CHAPTER)\s+\d+\b").expect("english chapter regex"))
}

fn numbered_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[IVXLCM]+\.|\d+(?:\.\d+)*[.,、])\s*\S+").expect("numbered heading regex"))
}

fn numbered_list_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+[.)]\s+\S").expect("numbered list regex"))
}

fn meta_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}[-/年]\d{1,2}(?:[-/月]\d{1,2})?").expect("meta date regex"))
}

fn meta_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{2,}$").expect("meta code regex"))
}

fn level_re() -> &'static [(Regex, u8); 4] {
    static RE: OnceLock<[(Regex, u8); 4]> = OnceLock::new();
    RE.get_or_init(|| {
        [
            (Regex::new(r"^第[一二三四五六七八九十百千]+章").expect("level regex"), 1),
            (Regex::new(r"^第[一二三四五六七八九十百千]+节").expect("level regex"), 2),
            (Regex::new(r"^\d+\.\d+\.").expect("level regex"), 3),
            (Regex::new(r"^\d+\.\s*\S+").expect("level regex"), 1),
        ]
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Heading,
    Paragraph,
    ListItem,
}

impl NodeType {
    pub fn is_body(self) -> bool {
        matches!(self, NodeType::Paragraph | NodeType::ListItem)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredNode {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub section_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSummary {
    pub headings: usize,
    pub paragraphs: usize,
    pub list_items: usize,
}

fn ends_with_terminal(line: &str) -> bool {
    line.ends_with(TERMINAL_PUNCT)
}

fn is_bullet_line(line: &str) -> bool {
    line.starts_with(['-', '•', '*'])
}

fn is_numbered_list_line(line: &str) -> bool {
    numbered_list_re().is_match(line)
        && (line.chars().count() > SHORT_HEADING_CHARS || ends_with_terminal(line))
}

fn is_heading_line(line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    if line.starts_with('#') || line.ends_with([':', '：']) {
        return true;
    }
    if chapter_re().is_match(line) || english_chapter_re().is_match(line) {
        return true;
    }
    // Sentence-like numbered items are list entries, not headings.
    if numbered_heading_re().is_match(line) && !is_numbered_list_line(line) {
        return true;
    }
    if is_bullet_line(line) || is_numbered_list_line(line) {
        return false;
    }
    line.chars().count() <= SHORT_HEADING_CHARS && !ends_with_terminal(line)
}

fn is_list_line(line: &str) -> bool {
    is_bullet_line(line) || is_numbered_list_line(line)
}

fn is_heading_meta_line(line: &str) -> bool {
    if line.is_empty() || line.chars().count() > META_MAX_CHARS {
        return false;
    }
    line.ends_with([':', '：'])
        || HEADING_META_KEYWORDS.iter().any(|k| line.contains(k))
        || meta_date_re().is_match(line)
        || meta_code_re().is_match(line)
}

fn heading_level(line: &str) -> Option<u8> {
    if line.starts_with("###") {
        return Some(3);
    }
    if line.starts_with("##") {
        return Some(2);
    }
    if line.starts_with('#') {
        return Some(1);
    }
    level_re()
        .iter()
        .find(|(re, _)| re.is_match(line))
        .map(|(_, level)| *level)
}

/// Trimmed line with its byte span in the source text.
struct Line<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

fn trimmed_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut cursor = 0usize;
    for raw in text.split('\n') {
        let lead = raw.len() - raw.trim_start().len();
        let trimmed = raw.trim();
        let start = cursor + lead;
        lines.push(Line {
            text: trimmed,
            start,
            end: start + trimmed.len(),
        });
        cursor += raw.len() + 1;
    }
    lines
}

/// Classify every non-blank line into structured nodes.
///
/// A heading absorbs the short meta lines (subtitle, date, code) that
/// directly follow it; its span then covers them too.
pub fn build_structured_nodes(text: &str) -> Vec<StructuredNode> {
    let lines = trimmed_lines(text);
    let mut nodes = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = &lines[i];
        if line.text.is_empty() {
            i += 1;
            continue;
        }

        if is_heading_line(line.text) {
            let mut end = line.end;
            let mut j = i + 1;
            while j < lines.len() && is_heading_meta_line(lines[j].text) {
                end = lines[j].end;
                j += 1;
            }
            nodes.push(StructuredNode {
                node_type: NodeType::Heading,
                text: text[line.start..end].to_string(),
                start_offset: line.start,
                end_offset: end,
                section_path: format!("H:{}", line.text),
                level: heading_level(line.text),
                meta_count: Some(j - i - 1),
            });
            i = j;
            continue;
        }

        let node_type = if is_list_line(line.text) {
            NodeType::ListItem
        } else {
            NodeType::Paragraph
        };
        nodes.push(StructuredNode {
            node_type,
            text: line.text.to_string(),
            start_offset: line.start,
            end_offset: line.end,
            section_path: String::new(),
            level: None,
            meta_count: None,
        });
        i += 1;
    }

    nodes
}

/// Render nodes as a lightweight markdown outline.
pub fn formatted_text(nodes: &[StructuredNode]) -> String {
    let mut out: Vec<String> = Vec::new();
    for node in nodes {
        match node.node_type {
            NodeType::Heading => {
                out.push(format!("## {}", node.text));
                out.push(String::new());
            }
            NodeType::ListItem => {
                out.push(format!("• {}", node.text.trim_start_matches(['-', '•']).trim()));
            }
            NodeType::Paragraph => {
                out.push(node.text.clone());
                out.push(String::new());
            }
        }
    }
    out.join("\n").trim().to_string()
}

pub fn format_summary(nodes: &[StructuredNode]) -> FormatSummary {
    let mut summary = FormatSummary::default();
    for node in nodes {
        match node.node_type {
            NodeType::Heading => summary.headings += 1,
            NodeType::Paragraph => summary.paragraphs += 1,
            NodeType::ListItem => summary.list_items += 1,
        }
    }
    summary
}

#[derive(Debug, Clone, Copy)]
pub struct NodeBlockOptions {
    /// Body runs shorter than this (in chars) fold into the previous body block.
    pub merge_min_chars: usize,
    /// Enables the short-body merge above.
    pub hard_align: bool,
    /// Emit headings as their own `need_detect=false` blocks.
    pub include_heading: bool,
    /// Prefix each heading onto the following body block.
    pub attach_heading_to_body: bool,
}

impl Default for NodeBlockOptions {
    fn default() -> Self {
        Self {
            merge_min_chars: 200,
            hard_align: true,
            include_heading: false,
            attach_heading_to_body: false,
        }
    }
}

/// Build detection blocks from structured nodes.
///
/// Block text is always the source slice `text[start..end]`. Merging only
/// extends the immediately preceding block, so blocks stay ordered and
/// non-overlapping. Falls back to blank-line blocks when no node yields one.
pub fn build_paragraph_blocks_from_nodes(
    text: &str,
    nodes: &[StructuredNode],
    opts: &NodeBlockOptions,
) -> Vec<TextBlock> {
    let mut blocks: Vec<TextBlock> = Vec::new();
    let mut pending_heading: Option<usize> = None;

    for node in nodes {
        let start = node.start_offset.min(text.len());
        let end = node.end_offset.clamp(start, text.len());

        if node.node_type == NodeType::Heading {
            if opts.include_heading && !opts.attach_heading_to_body {
                blocks.push(TextBlock {
                    index: blocks.len(),
                    label: BlockLabel::Heading,
                    need_detect: false,
                    merge_with_prev: false,
                    start,
                    end,
                    text: text[start..end].to_string(),
                });
            }
            if opts.attach_heading_to_body {
                pending_heading = Some(pending_heading.unwrap_or(start));
            }
            continue;
        }

        let block_start = pending_heading.take().map_or(start, |h| h.min(start));
        let label = if node.node_type == NodeType::ListItem {
            BlockLabel::ListItem
        } else {
            BlockLabel::Body
        };

        if opts.hard_align {
            if let Some(last) = blocks.last_mut().filter(|b| b.need_detect) {
                if text[last.start..end].chars().count() < opts.merge_min_chars {
                    last.end = end;
                    last.text = text[last.start..end].to_string();
                    last.merge_with_prev = true;
                    continue;
                }
            }
        }

        blocks.push(TextBlock {
            index: blocks.len(),
            label,
            need_detect: true,
            merge_with_prev: false,
            start: block_start,
            end,
            text: text[block_start..end].to_string(),
        });
    }

    if blocks.is_empty() {
        return build_paragraph_blocks(text);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "第一章 绪论\n2024年5月\n本研究探讨了人工智能在教育领域的应用，并分析了其潜在影响。\n- 第一点说明\n- 第二点说明\nChapter 2 Method\nWe collected data from three schools over two years and analysed it carefully.";

    #[test]
    fn test_build_structured_nodes() {
        let nodes = build_structured_nodes(DOC);
        let types: Vec<NodeType> = nodes.iter().map(|n| n.node_type).collect();
        assert_eq!(
            types,
            vec![
                NodeType::Heading,
                NodeType::Paragraph,
                NodeType::ListItem,
                NodeType::ListItem,
                NodeType::Heading,
                NodeType::Paragraph,
            ]
        );

        let chapter = &nodes[0];
        assert_eq!(chapter.meta_count, Some(1));
        assert_eq!(chapter.level, Some(1));
        assert_eq!(chapter.text, "第一章 绪论\n2024年5月");
        assert_eq!(chapter.section_path, "H:第一章 绪论");

        for node in &nodes {
            assert_eq!(&DOC[node.start_offset..node.end_offset], node.text);
        }
    }

    #[test]
    fn test_offsets_skip_indentation() {
        let text = "  indented paragraph that is long enough to be a body line.";
        let nodes = build_structured_nodes(text);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].start_offset, 2);
        assert_eq!(nodes[0].node_type, NodeType::Paragraph);
    }

    #[test]
    fn test_numbered_lines() {
        let nodes = build_structured_nodes("1. 引言\n2) This numbered line is a complete sentence in a list.");
        assert_eq!(nodes[0].node_type, NodeType::Heading);
        assert_eq!(nodes[0].level, Some(1));
        assert_eq!(nodes[1].node_type, NodeType::ListItem);
    }

    #[test]
    fn test_formatted_text_and_summary() {
        let nodes = build_structured_nodes(DOC);
        let summary = format_summary(&nodes);
        assert_eq!(summary, FormatSummary { headings: 2, paragraphs: 2, list_items: 2 });

        let outline = formatted_text(&nodes);
        assert!(outline.starts_with("## 第一章 绪论"));
        assert!(outline.contains("• 第一点说明"));
    }

    #[test]
    fn test_blocks_from_nodes_with_headings() {
        let nodes = build_structured_nodes(DOC);
        let opts = NodeBlockOptions {
            merge_min_chars: 0,
            hard_align: true,
            include_heading: true,
            attach_heading_to_body: false,
        };
        let blocks = build_paragraph_blocks_from_nodes(DOC, &nodes, &opts);
        assert_eq!(blocks.len(), 6);
        assert_eq!(blocks[0].label, BlockLabel::Heading);
        assert!(!blocks[0].need_detect);
        assert_eq!(blocks[2].label, BlockLabel::ListItem);
        for pair in blocks.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn test_blocks_attach_heading_and_merge() {
        let nodes = build_structured_nodes(DOC);
        let opts = NodeBlockOptions {
            merge_min_chars: 100,
            hard_align: true,
            include_heading: true,
            attach_heading_to_body: true,
        };
        let blocks = build_paragraph_blocks_from_nodes(DOC, &nodes, &opts);
        assert!(blocks.iter().all(|b| b.need_detect));
        assert_eq!(blocks[0].start, 0);
        assert!(blocks[0].text.starts_with("第一章 绪论"));
        // Short list items fold into the preceding body block.
        assert!(blocks.iter().any(|b| b.merge_with_prev));
        for b in &blocks {
            assert_eq!(&DOC[b.start..b.end], b.text);
        }
    }

    #[test]
    fn test_blocks_fallback_when_only_headings() {
        let text = "标题一\n标题二";
        let nodes = build_structured_nodes(text);
        assert!(nodes.iter().all(|n| n.node_type == NodeType::Heading));
        let blocks = build_paragraph_blocks_from_nodes(text, &nodes, &NodeBlockOptions::default());
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].need_detect);
    }
}
