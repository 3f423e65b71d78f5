use anyhow::{Context, Result};
use cheekai_detect::models::DetectRequest;
use cheekai_detect::services::config_store::{AppConfig, ConfigStore};
use cheekai_detect::services::detection::{preprocess_document, Detector, PreprocessOptions};
use cheekai_detect::services::document_reader::{guess_language, read_document};
use cheekai_detect::services::providers::EnvCredentials;
use cheekai_detect::services::text_processor::normalize_punctuation;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const USAGE: &str = "Usage:\n  cheekai-detect <path.txt|.docx|.pdf> [--sensitivity <low|medium|high>] [--provider <name[:model]>]... [--language <code>] [--strict] [--preprocess] [--out <json_path>]\n\nNotes:\n  - Without --provider, the config's defaultProvider (glm if unset) judges, only when its API key is present.\n  - --preprocess prints the document outline and alignment comparison instead of detecting.";

fn preview(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace('\n', " ")
}

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_arg_values(args: &[String], key: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == key)
        .map(|w| w[1].clone())
        .collect()
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn load_config(store: Option<&ConfigStore>) -> AppConfig {
    match store.map(|s| s.load()) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
        None => AppConfig::default(),
    }
}

fn write_json<T: serde::Serialize>(out_path: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(out_path, json).with_context(|| format!("write {} failed", out_path))?;
    println!();
    println!("Wrote JSON: {}", out_path);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || has_flag(&args, "--help") {
        eprintln!("{}", USAGE);
        return Ok(());
    }
    cheekai_detect::init_logging();

    let path = args[1].clone();
    let out_path = parse_arg_value(&args, "--out");
    let store = ConfigStore::open_default();
    let config = load_config(store.as_ref());

    let raw = read_document(Path::new(&path)).with_context(|| format!("read {} failed", path))?;
    let language = parse_arg_value(&args, "--language")
        .unwrap_or_else(|| guess_language(&normalize_punctuation(&raw)).to_string());

    println!("File: {}", path);
    println!("Extracted: {} chars ({} bytes)", raw.chars().count(), raw.len());
    println!("Language: {}", language);

    if has_flag(&args, "--preprocess") {
        let doc = preprocess_document(
            &raw,
            &PreprocessOptions {
                language: Some(language),
                chunk_size_tokens: config.detection.chunk_size_tokens,
                overlap_tokens: config.detection.overlap_tokens,
                ..PreprocessOptions::default()
            },
        );
        let s = &doc.format_summary;
        println!("Outline: headings={} paragraphs={} list_items={}", s.headings, s.paragraphs, s.list_items);
        for (label, report) in [("before", &doc.comparison.before), ("after", &doc.comparison.after)] {
            println!(
                "[{}] segments={} nodes={} mismatches={} unmapped_chunks={} unmapped_nodes={} heading_body_ok={}",
                label,
                report.segment_count,
                report.node_count,
                report.mismatches.len(),
                report.unmapped_chunks.len(),
                report.unmapped_nodes.len(),
                report.heading_body_association_ok
            );
        }
        if let Some(out_path) = out_path {
            write_json(&out_path, &doc)?;
        }
        return Ok(());
    }

    let mut request = DetectRequest::new(raw);
    request.language = Some(language);
    request.providers = parse_arg_values(&args, "--provider");
    request.sensitivity = parse_arg_value(&args, "--sensitivity").unwrap_or_else(|| config.detection.sensitivity.clone());
    request.use_perplexity = config.detection.use_perplexity;
    request.use_stylometry = config.detection.use_stylometry;
    request.chunking.chunk_size_tokens = config.detection.chunk_size_tokens;
    request.chunking.overlap_tokens = config.detection.overlap_tokens;
    request.strict_judgment = has_flag(&args, "--strict") || config.detection.strict_judgment;

    println!("Sensitivity: {}", request.sensitivity);
    println!(
        "Providers: {}",
        if request.providers.is_empty() {
            "(auto)".to_string()
        } else {
            request.providers.join(", ")
        }
    );
    println!();

    let detector = Detector::from_config(&config, Arc::new(EnvCredentials::new(store)));
    let resp = detector.detect(&request).await?;

    let agg = &resp.aggregation;
    println!(
        "Overall: probability={:.4} confidence={:.4} decision={}",
        agg.overall_probability, agg.overall_confidence, agg.decision
    );
    println!(
        "Cost: tokens={} latency_ms={} segmentation={} judges={}/{}",
        resp.cost.tokens,
        resp.cost.latency_ms,
        resp.cost.segmentation_source,
        resp.cost.provider_breakdown.success,
        resp.cost.provider_breakdown.requested
    );
    println!();
    // Offsets refer to the normalized text.
    let normalized = normalize_punctuation(&request.text);
    println!("Segments: {}", resp.segments.len());
    for seg in &resp.segments {
        let text = normalized.get(seg.offsets.start..seg.offsets.end).unwrap_or("");
        println!(
            "[C{:04}] bytes=[{},{}] p={:.3} conf={:.2}  {}",
            seg.chunk_id,
            seg.offsets.start,
            seg.offsets.end,
            seg.ai_probability,
            seg.confidence,
            preview(text, 100)
        );
    }

    if let Some(out_path) = out_path {
        write_json(&out_path, &resp)?;
    }
    Ok(())
}

