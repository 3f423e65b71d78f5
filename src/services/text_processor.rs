// Text Processing Service
// Normalization, token estimation, sentence splitting, paragraph blocks and stylometry

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Closed-class Chinese function words used for the function-word ratio.
const FUNCTION_WORDS: &[&str] = &[
    "的", "之", "一", "是", "了", "在", "有", "和", "与", "这", "对", "也", "为", "而", "并且", "小", "大",
];

const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?'];
// Single quotes double as apostrophes, so only double quotes gate splitting.
const QUOTE_CHARS: &[char] = &['"', '\u{201c}', '\u{201d}'];

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+|[\u{4e00}-\u{9fff}]").expect("token regex"))
}

fn wide_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\u{3000}\u{00A0}]").expect("wide space regex"))
}

fn horizontal_ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t\x0C\x0B]+").expect("horizontal whitespace regex"))
}

fn punctuation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[，。！？.!?]").expect("punctuation regex"))
}

/// Normalize punctuation and whitespace in text (Chinese/English)
pub fn normalize_punctuation(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    // Smart quotes and em dash
    let s = text
        .replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'")
        .replace('\u{2014}', "-");

    // Ideographic space and non-breaking space
    let s = wide_space_re().replace_all(&s, " ");

    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = horizontal_ws_re().replace_all(&s, " ");

    s.split('\n')
        .map(|ln| ln.trim())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Tokenize into ASCII word runs and individual CJK ideographs
pub fn tokenize(text: &str) -> Vec<&str> {
    token_re().find_iter(text).map(|m| m.as_str()).collect()
}

/// Estimate token count (Chinese chars + English words), never below 1
pub fn estimate_tokens(text: &str) -> usize {
    token_re().find_iter(text).count().max(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceOffset {
    pub text: String,
    /// UTF-8 byte offset of the trimmed sentence.
    pub start: usize,
    pub end: usize,
}

fn is_decimal_point(chars: &[(usize, char)], i: usize) -> bool {
    chars[i].1 == '.'
        && i > 0
        && i + 1 < chars.len()
        && chars[i - 1].1.is_ascii_digit()
        && chars[i + 1].1.is_ascii_digit()
}

fn push_trimmed(text: &str, start: usize, end: usize, out: &mut Vec<SentenceOffset>) {
    let raw = &text[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = raw.len() - raw.trim_start().len();
    let s = start + lead;
    out.push(SentenceOffset {
        text: trimmed.to_string(),
        start: s,
        end: s + trimmed.len(),
    });
}

/// Split text into sentences on CJK and ASCII terminal punctuation.
///
/// Does not require whitespace after the terminator, never splits inside
/// quotes or on a decimal point, and keeps runs like `?!` together.
pub fn split_sentences(text: &str) -> Vec<SentenceOffset> {
    let mut sentences = Vec::new();
    if text.is_empty() {
        return sentences;
    }

    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut seg_start = 0usize;
    let mut in_quote = false;
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i].1;
        if QUOTE_CHARS.contains(&ch) {
            in_quote = !in_quote;
        }

        if SENTENCE_TERMINATORS.contains(&ch) && !in_quote && !is_decimal_point(&chars, i) {
            let mut j = i + 1;
            while j < chars.len() && SENTENCE_TERMINATORS.contains(&chars[j].1) {
                j += 1;
            }
            let end = chars.get(j).map(|(b, _)| *b).unwrap_or(text.len());
            push_trimmed(text, seg_start, end, &mut sentences);
            seg_start = end;
            i = j;
            continue;
        }
        i += 1;
    }

    push_trimmed(text, seg_start, text.len(), &mut sentences);
    sentences
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockLabel {
    Body,
    Heading,
    ListItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    pub index: usize,
    pub label: BlockLabel,
    pub need_detect: bool,
    pub merge_with_prev: bool,
    /// UTF-8 byte offset (0-based) into the normalized text.
    pub start: usize,
    /// UTF-8 byte offset (end-exclusive) into the normalized text.
    pub end: usize,
    pub text: String,
}

impl TextBlock {
    pub fn body(index: usize, start: usize, end: usize, text: String) -> Self {
        Self {
            index,
            label: BlockLabel::Body,
            need_detect: true,
            merge_with_prev: false,
            start,
            end,
            text,
        }
    }
}

/// Build paragraph blocks from plain text.
///
/// Consecutive non-blank lines form one block; blank lines close it. Each
/// block runs up to the start of the next one, so the blocks tile the text.
pub fn build_paragraph_blocks(text: &str) -> Vec<TextBlock> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut starts: Vec<usize> = Vec::new();
    let mut cursor = 0usize;
    let mut in_block = false;
    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        if !blank && !in_block {
            starts.push(cursor);
        }
        in_block = !blank;
        cursor += line.len();
    }

    if starts.is_empty() {
        return vec![TextBlock::body(0, 0, text.len(), text.to_string())];
    }

    starts
        .iter()
        .enumerate()
        .map(|(idx, &s)| {
            let start = if idx == 0 { 0 } else { s };
            let end = starts.get(idx + 1).copied().unwrap_or(text.len());
            TextBlock::body(idx, start, end, text[start..end].to_string())
        })
        .collect()
}

/// Compute stylometry metrics for text
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StylometryMetrics {
    pub ttr: f64, // Type-Token Ratio
    pub avg_sentence_len: f64,
    pub function_word_ratio: Option<f64>,
    pub repeat_ratio: Option<f64>,
    pub ngram_repeat_rate: Option<f64>,
    pub punctuation_ratio: Option<f64>,
}

pub fn compute_stylometry(text: &str) -> StylometryMetrics {
    let words = tokenize(text);
    let total_words = words.len();

    if total_words == 0 {
        return StylometryMetrics {
            avg_sentence_len: text.chars().count() as f64,
            ..StylometryMetrics::default()
        };
    }

    let unique_words: HashSet<&str> = words.iter().copied().collect();
    let ttr = unique_words.len() as f64 / total_words as f64;

    // Average sentence length in chars
    let sentences = split_sentences(text);
    let avg_sentence_len = if sentences.is_empty() {
        text.chars().count() as f64
    } else {
        sentences.iter().map(|s| s.text.chars().count()).sum::<usize>() as f64 / sentences.len() as f64
    };

    let function_ratio =
        words.iter().filter(|t| FUNCTION_WORDS.contains(*t)).count() as f64 / total_words as f64;

    let punct_count = punctuation_re().find_iter(text).count();
    let char_len = text.chars().count().max(1) as f64;
    let punctuation_ratio = punct_count as f64 / char_len;

    // Fraction of vocabulary items that occur >= 3 times
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for t in &words {
        *freq.entry(*t).or_insert(0) += 1;
    }
    let repeats = freq.values().filter(|&&v| v >= 3).count() as f64 / freq.len().max(1) as f64;

    StylometryMetrics {
        ttr,
        avg_sentence_len,
        function_word_ratio: Some(function_ratio),
        repeat_ratio: Some(repeats),
        ngram_repeat_rate: Some(ngram_repeat_rate(&words, 3)),
        punctuation_ratio: Some(punctuation_ratio),
    }
}

/// Share of n-gram occurrences that repeat an earlier n-gram.
fn ngram_repeat_rate(tokens: &[&str], n: usize) -> f64 {
    if n == 0 || tokens.len() < n + 1 {
        return 0.0;
    }
    let mut counts: HashMap<&[&str], usize> = HashMap::new();
    let mut total = 0usize;
    for window in tokens.windows(n) {
        *counts.entry(window).or_insert(0) += 1;
        total += 1;
    }
    let repeats = counts.values().filter(|&&c| c >= 2).map(|&c| c - 1).sum::<usize>();
    repeats as f64 / total.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_punctuation() {
        let input = "Hello\u{201c}World\u{201d}";
        assert_eq!(normalize_punctuation(input), "Hello\"World\"");
    }

    #[test]
    fn test_normalize_whitespace_and_newlines() {
        let input = "  a\u{3000}\u{00A0}b\t\tc  \r\nsecond line   \r\rthird\u{2014}x  ";
        assert_eq!(normalize_punctuation(input), "a b c\nsecond line\n\nthird-x");
        assert_eq!(normalize_punctuation(""), "");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("Hello World"), 2);
        assert_eq!(estimate_tokens("你好世界"), 4);
        assert_eq!(estimate_tokens("Hello 你好"), 3);
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("，。"), 1);
    }

    #[test]
    fn test_split_sentences_cjk_without_spaces() {
        let text = "这是第一句。这是第二句！这是第三句？";
        let sentences = split_sentences(text);
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[1].text, "这是第二句！");
        assert_eq!(&text[sentences[2].start..sentences[2].end], "这是第三句？");
    }

    #[test]
    fn test_split_sentences_keeps_decimals_and_quotes() {
        let text = "Pi is 3.14 today. He said \"stop. now\" and left?! Tail";
        let sentences = split_sentences(text);
        let texts: Vec<&str> = sentences.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Pi is 3.14 today.", "He said \"stop. now\" and left?!", "Tail"]
        );
    }

    #[test]
    fn test_build_paragraph_blocks_tiles_text() {
        let text = "First paragraph.\nstill first.\n\nSecond paragraph.\n\n\nThird.";
        let blocks = build_paragraph_blocks(text);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].start, 0);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(blocks.last().map(|b| b.end), Some(text.len()));
        for b in &blocks {
            assert_eq!(b.text, &text[b.start..b.end]);
        }
        assert!(blocks[1].text.starts_with("Second"));
    }

    #[test]
    fn test_build_paragraph_blocks_single_line() {
        let text = "这是第一句。这是第二句！这是第三句？";
        let blocks = build_paragraph_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!((blocks[0].start, blocks[0].end), (0, text.len()));
        assert!(build_paragraph_blocks("").is_empty());
    }

    #[test]
    fn test_stylometry_repetition() {
        let text = "the cat sat. the cat sat. the cat sat.";
        let m = compute_stylometry(text);
        assert!((m.ttr - 3.0 / 9.0).abs() < 1e-9);
        assert_eq!(m.repeat_ratio, Some(1.0));
        // 7 trigrams, 3 distinct: (3-1)+(2-1)+(2-1) repeats
        assert!((m.ngram_repeat_rate.unwrap_or_default() - 4.0 / 7.0).abs() < 1e-9);
        assert!((m.avg_sentence_len - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_stylometry_function_words() {
        let m = compute_stylometry("我的书是新的");
        assert!((m.function_word_ratio.unwrap_or_default() - 3.0 / 6.0).abs() < 1e-9);
    }
}
