//! Parsing of reasoning-model responses into raw filing decisions.
//!
//! Models wrap their JSON in code fences, lead-in prose, or both. The parser
//! strips those wrappers, locates the outermost JSON object, and
//! deserializes leniently — unknown fields are ignored, missing optional
//! fields default.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("No JSON object found in response")]
    NoJson,

    #[error("Response JSON is invalid: {0}")]
    InvalidJson(String),

    #[error("Response is missing required fields: {0}")]
    MissingFields(String),
}

/// The reasoning model's answer, as-written (unsanitized).
#[derive(Debug, Clone, Deserialize)]
pub struct RawDecision {
    pub summary: Option<String>,
    pub filename: Option<String>,
    pub category: Option<String>,
    pub confidence: Option<f32>,
}

/// Parse a model response into a `RawDecision`.
pub fn parse_decision_response(response: &str) -> Result<RawDecision, ParseError> {
    let json_str = extract_json(response)?;
    let raw: RawDecision =
        serde_json::from_str(&json_str).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    // A decision with neither filename nor category is not actionable.
    if raw.filename.as_deref().map_or(true, str::is_empty)
        && raw.category.as_deref().map_or(true, str::is_empty)
    {
        return Err(ParseError::MissingFields("filename, category".to_string()));
    }
    Ok(raw)
}

/// Pull the JSON payload out of a possibly-wrapped response.
///
/// Tries a ```json fence first, then any ``` fence, then falls back to the
/// outermost `{...}` span.
fn extract_json(response: &str) -> Result<String, ParseError> {
    if let Some(fenced) = extract_fenced(response, "```json") {
        return Ok(fenced);
    }
    if let Some(fenced) = extract_fenced(response, "```") {
        if fenced.trim_start().starts_with('{') {
            return Ok(fenced);
        }
    }

    let start = response.find('{').ok_or(ParseError::NoJson)?;
    let end = response.rfind('}').ok_or(ParseError::NoJson)?;
    if end < start {
        return Err(ParseError::NoJson);
    }
    Ok(response[start..=end].to_string())
}

fn extract_fenced(response: &str, opener: &str) -> Option<String> {
    let start = response.find(opener)? + opener.len();
    let end = response[start..].find("```")?;
    Some(response[start..start + end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let raw = parse_decision_response(
            r#"{"summary": "March invoice", "filename": "2025-03-01_Invoice.pdf", "category": "Invoices", "confidence": 0.9}"#,
        )
        .unwrap();
        assert_eq!(raw.filename.as_deref(), Some("2025-03-01_Invoice.pdf"));
        assert_eq!(raw.category.as_deref(), Some("Invoices"));
        assert_eq!(raw.confidence, Some(0.9));
    }

    #[test]
    fn parses_json_fence_with_prose() {
        let response = r#"Here is my filing decision:

```json
{"summary": "Tax assessment 2024", "filename": "2024-11-02_Tax_Assessment.pdf", "category": "Taxes"}
```

Let me know if you need anything else."#;
        let raw = parse_decision_response(response).unwrap();
        assert_eq!(raw.category.as_deref(), Some("Taxes"));
        assert_eq!(raw.confidence, None);
    }

    #[test]
    fn parses_anonymous_fence() {
        let response = "```\n{\"filename\": \"a.pdf\", \"category\": \"Medical\"}\n```";
        let raw = parse_decision_response(response).unwrap();
        assert_eq!(raw.category.as_deref(), Some("Medical"));
    }

    #[test]
    fn parses_embedded_object_without_fence() {
        let response = "Sure! {\"filename\": \"b.pdf\", \"category\": \"Contracts\"} Done.";
        let raw = parse_decision_response(response).unwrap();
        assert_eq!(raw.filename.as_deref(), Some("b.pdf"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = parse_decision_response(
            r#"{"filename": "c.pdf", "category": "Taxes", "reasoning": "because...", "tags": [1,2]}"#,
        )
        .unwrap();
        assert_eq!(raw.category.as_deref(), Some("Taxes"));
    }

    #[test]
    fn prose_only_response_is_no_json() {
        let err = parse_decision_response("I cannot decide where to file this.").unwrap_err();
        assert!(matches!(err, ParseError::NoJson));
    }

    #[test]
    fn malformed_json_is_invalid() {
        let err = parse_decision_response("{\"filename\": \"a.pdf\",}").unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    #[test]
    fn empty_decision_is_missing_fields() {
        let err = parse_decision_response(r#"{"summary": "something"}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingFields(_)));

        let err =
            parse_decision_response(r#"{"filename": "", "category": ""}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingFields(_)));
    }

    #[test]
    fn category_alone_is_actionable() {
        let raw = parse_decision_response(r#"{"category": "Insurance"}"#).unwrap();
        assert_eq!(raw.category.as_deref(), Some("Insurance"));
        assert!(raw.filename.is_none());
    }
}
