//! Filing decisions via the reasoning model.
//!
//! The prompt carries the extracted text, the recalled precedents, and the
//! category vocabulary, and demands a strict JSON answer. Malformed answers
//! get one re-ask with a sterner instruction; if that also fails to parse,
//! the engine falls back to a deterministic decision (category `Unsorted`,
//! filename derived from the original name and the current date) so a
//! chatty model can never stall the pipeline. Transport failures are NOT
//! absorbed — a fallback made while the model service is down would misfile
//! documents silently.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::ollama::{GenerateOptions, LlmClient, OllamaError};
use crate::pipeline::parser::{parse_decision_response, RawDecision};

/// How much document text goes into the prompt.
const MAX_PROMPT_TEXT_CHARS: usize = 6000;

const DECIDE_SYSTEM_PROMPT: &str = "\
You are a meticulous filing clerk. Given a document's text, prior filing \
decisions, and the available categories, decide how to file it. Respond \
with ONLY a JSON object: {\"summary\": \"one sentence\", \"filename\": \
\"YYYY-MM-DD_Descriptive_Name.pdf\", \"category\": \"one of the listed \
categories\", \"confidence\": 0.0-1.0}. The date is the document's own \
date when visible, otherwise today's.";

const RETRY_SYSTEM_PROMPT: &str = "\
Your previous answer was not parseable. Respond with EXACTLY one JSON \
object and nothing else: no code fences, no prose, no explanation. Schema: \
{\"summary\": string, \"filename\": string, \"category\": string, \
\"confidence\": number}.";

/// Category used when the model's answer cannot be salvaged.
pub const FALLBACK_CATEGORY: &str = "Unsorted";

#[derive(Debug, thiserror::Error)]
pub enum DecideError {
    /// The model service itself failed (connection, timeout, server error).
    #[error("Reasoning service failed: {0}")]
    Service(#[from] OllamaError),
}

/// How the decision was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    /// Parsed from the model's answer.
    Parsed,
    /// Deterministic fallback after unparseable answers.
    Fallback,
}

/// A complete, sanitized filing decision.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub filename: String,
    pub category: String,
    pub summary: String,
    pub confidence: f32,
    pub origin: DecisionOrigin,
}

/// Drives the reasoning model to a filing decision.
pub struct DecisionEngine {
    client: std::sync::Arc<dyn LlmClient>,
}

impl DecisionEngine {
    pub fn new(client: std::sync::Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    /// Decide how to file a document. At most two model calls.
    pub fn decide(
        &self,
        model: &str,
        document_text: &str,
        precedents: &str,
        categories: &[String],
        original_name: &str,
    ) -> Result<Decision, DecideError> {
        let prompt = build_prompt(document_text, precedents, categories);
        let options = GenerateOptions::default();

        let first = self
            .client
            .generate(model, &prompt, DECIDE_SYSTEM_PROMPT, &options)?;
        match parse_decision_response(&first) {
            Ok(raw) => return Ok(sanitize_decision(raw, original_name, categories)),
            Err(e) => {
                tracing::warn!(error = %e, "Decision response unparseable — re-asking");
            }
        }

        let second = self
            .client
            .generate(model, &prompt, RETRY_SYSTEM_PROMPT, &options)?;
        match parse_decision_response(&second) {
            Ok(raw) => Ok(sanitize_decision(raw, original_name, categories)),
            Err(e) => {
                tracing::warn!(error = %e, "Re-ask also unparseable — using fallback decision");
                Ok(fallback_decision(original_name))
            }
        }
    }
}

fn build_prompt(document_text: &str, precedents: &str, categories: &[String]) -> String {
    let text = truncate_chars(document_text, MAX_PROMPT_TEXT_CHARS);
    format!(
        "## Document text\n{text}\n\n\
         ## Prior filing decisions for similar documents\n{precedents}\n\n\
         ## Available categories\n{}\n\n\
         File this document.",
        categories.join(", ")
    )
}

/// Deterministic decision of last resort.
///
/// Keeps the original name recognizable and stamps the processing date so
/// repeated fallbacks for the same inbox name cannot collide in `Unsorted`.
pub fn fallback_decision(original_name: &str) -> Decision {
    let (stem, ext) = split_name(original_name);
    let date = chrono::Local::now().format("%Y-%m-%d_%H%M%S");
    let filename = match ext {
        Some(ext) => format!("{date}_{}.{ext}", sanitize_component(stem)),
        None => format!("{date}_{}", sanitize_component(stem)),
    };
    Decision {
        filename,
        category: FALLBACK_CATEGORY.to_string(),
        summary: format!("Unclassified document ({original_name})"),
        confidence: 0.0,
        origin: DecisionOrigin::Fallback,
    }
}

/// Turn a parsed `RawDecision` into a safe, complete `Decision`.
///
/// The category must come from the configured vocabulary; anything the
/// model invents lands in `Unsorted` rather than growing the archive tree.
fn sanitize_decision(raw: RawDecision, original_name: &str, categories: &[String]) -> Decision {
    let (_, original_ext) = split_name(original_name);

    let category = raw
        .category
        .as_deref()
        .map(sanitize_component)
        .and_then(|c| {
            categories
                .iter()
                .find(|known| known.eq_ignore_ascii_case(&c))
                .cloned()
        })
        .unwrap_or_else(|| FALLBACK_CATEGORY.to_string());

    let filename = match raw.filename.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        Some(name) => {
            let (stem, ext) = split_name(name);
            let stem = sanitize_component(stem);
            if stem.is_empty() {
                // A fully-stripped stem would leave a hidden ".ext" name.
                fallback_decision(original_name).filename
            } else {
                // The archive keeps the source format; a model-invented
                // extension must not change it.
                match original_ext.or(ext) {
                    Some(ext) => format!("{stem}.{}", sanitize_component(ext)),
                    None => stem,
                }
            }
        }
        None => fallback_decision(original_name).filename,
    };

    Decision {
        filename,
        category,
        summary: raw.summary.unwrap_or_default().trim().to_string(),
        confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        origin: DecisionOrigin::Parsed,
    }
}

/// Reduce a name to one safe path component.
///
/// Path separators, traversal dots, and control characters go; interior
/// whitespace becomes underscores.
pub fn sanitize_component(input: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r#"[/\\:*?"<>|\x00-\x1f]"#).unwrap());
    let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s+").unwrap());

    let cleaned = invalid.replace_all(input.trim(), "");
    let cleaned = whitespace.replace_all(&cleaned, "_");
    cleaned.trim_matches('.').trim_matches('_').to_string()
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ollama::MockLlmClient;
    use std::sync::Arc;

    const CATEGORIES: &[&str] = &["Invoices", "Taxes", "Medical"];

    fn categories() -> Vec<String> {
        CATEGORIES.iter().map(|s| s.to_string()).collect()
    }

    fn decide_with(client: MockLlmClient) -> Decision {
        let client = Arc::new(client);
        let engine = DecisionEngine::new(Arc::clone(&client) as _);
        engine
            .decide(
                "reasoning-model",
                "Invoice No 42, March 2025",
                "No prior filing decisions available.",
                &categories(),
                "scan march.pdf",
            )
            .unwrap()
    }

    #[test]
    fn clean_response_is_parsed() {
        let decision = decide_with(MockLlmClient::new(
            r#"{"summary": "March invoice", "filename": "2025-03-01_Invoice_42.pdf", "category": "Invoices", "confidence": 0.92}"#,
        ));
        assert_eq!(decision.origin, DecisionOrigin::Parsed);
        assert_eq!(decision.filename, "2025-03-01_Invoice_42.pdf");
        assert_eq!(decision.category, "Invoices");
        assert!((decision.confidence - 0.92).abs() < 1e-6);
    }

    #[test]
    fn fenced_response_is_parsed() {
        let decision = decide_with(MockLlmClient::new(
            "Here you go:\n```json\n{\"filename\": \"2025-03-01_Invoice.pdf\", \"category\": \"Invoices\"}\n```",
        ));
        assert_eq!(decision.origin, DecisionOrigin::Parsed);
        assert_eq!(decision.category, "Invoices");
    }

    #[test]
    fn reask_recovers_from_first_garbage_answer() {
        let client = MockLlmClient::new("unused")
            .push_response(Ok("I think this is an invoice.".to_string()))
            .push_response(Ok(
                r#"{"filename": "2025-03-01_Invoice.pdf", "category": "Invoices"}"#.to_string(),
            ));
        let mock = Arc::new(client);
        let engine = DecisionEngine::new(Arc::clone(&mock) as _);
        let decision = engine
            .decide("m", "text", "none", &categories(), "scan.pdf")
            .unwrap();

        assert_eq!(decision.origin, DecisionOrigin::Parsed);
        assert_eq!(mock.generate_calls(), 2);
    }

    #[test]
    fn double_garbage_falls_back_deterministically() {
        let client = MockLlmClient::new("still not json");
        let mock = Arc::new(client);
        let engine = DecisionEngine::new(Arc::clone(&mock) as _);
        let decision = engine
            .decide("m", "text", "none", &categories(), "scan march.pdf")
            .unwrap();

        assert_eq!(decision.origin, DecisionOrigin::Fallback);
        assert_eq!(decision.category, FALLBACK_CATEGORY);
        assert!(decision.filename.contains("scan_march"));
        assert!(decision.filename.ends_with(".pdf"));
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(mock.generate_calls(), 2);
    }

    #[test]
    fn transport_failure_is_not_absorbed() {
        let client = MockLlmClient::new("").push_response(Err(
            crate::ollama::OllamaError::Connection("http://localhost:11434".to_string()),
        ));
        let engine = DecisionEngine::new(Arc::new(client) as _);
        let err = engine
            .decide("m", "text", "none", &categories(), "scan.pdf")
            .unwrap_err();
        assert!(matches!(err, DecideError::Service(_)));
    }

    #[test]
    fn model_cannot_change_the_file_extension() {
        let decision = decide_with(MockLlmClient::new(
            r#"{"filename": "2025-03-01_Invoice.exe", "category": "Invoices"}"#,
        ));
        assert!(decision.filename.ends_with(".pdf"));
    }

    #[test]
    fn path_traversal_in_category_is_neutralized() {
        let decision = decide_with(MockLlmClient::new(
            r#"{"filename": "a.pdf", "category": "../../etc"}"#,
        ));
        assert_eq!(decision.category, FALLBACK_CATEGORY);
    }

    #[test]
    fn invented_category_lands_in_unsorted() {
        let decision = decide_with(MockLlmClient::new(
            r#"{"filename": "a.pdf", "category": "Receipts"}"#,
        ));
        assert_eq!(decision.category, FALLBACK_CATEGORY);
    }

    #[test]
    fn category_casing_is_clamped_to_the_vocabulary() {
        let decision = decide_with(MockLlmClient::new(
            r#"{"filename": "a.pdf", "category": "invoices"}"#,
        ));
        assert_eq!(decision.category, "Invoices");
    }

    #[test]
    fn filename_that_sanitizes_to_nothing_gets_a_fallback_name() {
        let decision = decide_with(MockLlmClient::new(
            r#"{"filename": "???.pdf", "category": "Invoices"}"#,
        ));
        assert!(!decision.filename.starts_with('.'), "{}", decision.filename);
        assert!(decision.filename.ends_with(".pdf"));
        assert!(decision.filename.contains("scan_march"));
    }

    #[test]
    fn sanitize_component_examples() {
        assert_eq!(sanitize_component("Invoices"), "Invoices");
        assert_eq!(sanitize_component("  Tax  2024  "), "Tax_2024");
        assert_eq!(sanitize_component("a/b\\c:d"), "abcd");
        assert_eq!(sanitize_component("..."), "");
    }

    #[test]
    fn fallback_filename_keeps_stem_and_extension() {
        let decision = fallback_decision("Lohnabrechnung März.pdf");
        assert!(decision.filename.contains("Lohnabrechnung_März"));
        assert!(decision.filename.ends_with(".pdf"));
        assert_eq!(decision.origin, DecisionOrigin::Fallback);
    }

    #[test]
    fn prompt_contains_text_precedents_and_categories() {
        let prompt = build_prompt("DOC TEXT", "- precedent line", &categories());
        assert!(prompt.contains("DOC TEXT"));
        assert!(prompt.contains("precedent line"));
        assert!(prompt.contains("Invoices, Taxes, Medical"));
    }
}
