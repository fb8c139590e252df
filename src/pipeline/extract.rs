//! Vision extraction — page images to markdown text.
//!
//! Each rendered page goes to the vision model as a base64 PNG; the page
//! outputs are concatenated in order. Accelerator OOM is surfaced as its own
//! error variant so the runner can do its one release-reclaim-retry cycle;
//! every other failure aborts the job.

use base64::Engine as _;

use crate::ollama::{GenerateOptions, LlmClient, OllamaError};
use crate::pipeline::render::{PageRenderer, RenderError};

const VISION_SYSTEM_PROMPT: &str = "\
You are a document transcription engine. Extract ALL visible text from the \
provided page image as structured Markdown. Preserve headings, tables, and \
lists. Do not summarize, translate, or comment — transcribe.";

const VISION_USER_PROMPT: &str = "\
Transcribe this page to Markdown. Preserve tables with Markdown table syntax \
and headings with # syntax. Output only the transcription.";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Failed to read document: {0}")]
    Read(#[from] std::io::Error),

    #[error(transparent)]
    Render(#[from] RenderError),

    /// Accelerator memory exhausted mid-extraction. Retryable once.
    #[error("Vision model ran out of memory on page {page}")]
    OutOfMemory { page: usize },

    #[error("Vision model failed on page {page}: {source}")]
    Vision {
        page: usize,
        #[source]
        source: OllamaError,
    },

    #[error("Document has no pages")]
    EmptyDocument,
}

/// Extracted text for one document.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: usize,
}

/// Full-document text extraction.
pub trait VisionExtractor: Send + Sync {
    /// Extract all pages of `pdf_bytes` using `model`.
    fn extract(&self, pdf_bytes: &[u8], model: &str) -> Result<ExtractedText, ExtractError>;
}

/// Production extractor: PDFium rendering + Ollama vision inference.
pub struct OllamaVisionExtractor {
    client: std::sync::Arc<dyn LlmClient>,
    renderer: Box<dyn PageRenderer>,
}

impl OllamaVisionExtractor {
    pub fn new(client: std::sync::Arc<dyn LlmClient>, renderer: Box<dyn PageRenderer>) -> Self {
        Self { client, renderer }
    }

    fn extract_page(&self, png: &[u8], page: usize, model: &str) -> Result<String, ExtractError> {
        let image = base64::engine::general_purpose::STANDARD.encode(png);
        let options = GenerateOptions {
            images: vec![image],
            ..Default::default()
        };

        self.client
            .generate(model, VISION_USER_PROMPT, VISION_SYSTEM_PROMPT, &options)
            .map_err(|e| {
                if e.is_out_of_memory() {
                    ExtractError::OutOfMemory { page }
                } else {
                    ExtractError::Vision { page, source: e }
                }
            })
    }
}

impl VisionExtractor for OllamaVisionExtractor {
    fn extract(&self, pdf_bytes: &[u8], model: &str) -> Result<ExtractedText, ExtractError> {
        let page_count = self.renderer.page_count(pdf_bytes)?;
        if page_count == 0 {
            return Err(ExtractError::EmptyDocument);
        }

        let start = std::time::Instant::now();
        let mut text = String::new();
        for index in 0..page_count {
            let rendered = self.renderer.render_page(pdf_bytes, index)?;
            let page_text = self.extract_page(&rendered.png, index, model)?;
            if index > 0 {
                text.push_str("\n\n");
            }
            text.push_str(page_text.trim());
            tracing::debug!(page = index, chars = page_text.len(), "Page extracted");
        }

        tracing::info!(
            pages = page_count,
            chars = text.len(),
            elapsed_ms = %start.elapsed().as_millis(),
            "Vision extraction complete"
        );
        Ok(ExtractedText { text, page_count })
    }
}

/// Scripted extractor for tests.
pub struct MockVisionExtractor {
    results: std::sync::Mutex<std::collections::VecDeque<Result<ExtractedText, ExtractError>>>,
    fallback_text: String,
}

impl MockVisionExtractor {
    pub fn new(text: &str) -> Self {
        Self {
            results: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fallback_text: text.to_string(),
        }
    }

    /// Queue a one-shot result (consumed before the fallback is used).
    pub fn push_result(self, result: Result<ExtractedText, ExtractError>) -> Self {
        self.results.lock().unwrap().push_back(result);
        self
    }
}

impl VisionExtractor for MockVisionExtractor {
    fn extract(&self, _pdf_bytes: &[u8], _model: &str) -> Result<ExtractedText, ExtractError> {
        if let Some(scripted) = self.results.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(ExtractedText {
            text: self.fallback_text.clone(),
            page_count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ollama::{MockLlmClient, MockRequest};
    use crate::pipeline::render::MockPageRenderer;
    use std::sync::Arc;

    #[test]
    fn extracts_every_page_in_order() {
        let client = Arc::new(
            MockLlmClient::new("")
                .push_response(Ok("Page one text".to_string()))
                .push_response(Ok("Page two text".to_string())),
        );
        let extractor =
            OllamaVisionExtractor::new(Arc::clone(&client) as _, Box::new(MockPageRenderer::new(2)));

        let result = extractor.extract(b"%PDF", "vision-model").unwrap();
        assert_eq!(result.page_count, 2);
        assert_eq!(result.text, "Page one text\n\nPage two text");

        // One image per generate call.
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| matches!(
            r,
            MockRequest::Generate { image_count: 1, .. }
        )));
    }

    #[test]
    fn oom_is_surfaced_as_retryable_variant() {
        let client = Arc::new(MockLlmClient::new("").push_response(Err(
            crate::ollama::OllamaError::OutOfMemory("cuda out of memory".to_string()),
        )));
        let extractor = OllamaVisionExtractor::new(client, Box::new(MockPageRenderer::new(1)));

        let err = extractor.extract(b"%PDF", "vision-model").unwrap_err();
        assert!(matches!(err, ExtractError::OutOfMemory { page: 0 }));
    }

    #[test]
    fn transport_error_is_not_oom() {
        let client = Arc::new(MockLlmClient::new("").push_response(Err(
            crate::ollama::OllamaError::Connection("http://localhost:11434".to_string()),
        )));
        let extractor = OllamaVisionExtractor::new(client, Box::new(MockPageRenderer::new(1)));

        let err = extractor.extract(b"%PDF", "vision-model").unwrap_err();
        assert!(matches!(err, ExtractError::Vision { page: 0, .. }));
    }

    #[test]
    fn empty_document_is_rejected() {
        let client = Arc::new(MockLlmClient::new("text"));
        let extractor = OllamaVisionExtractor::new(client, Box::new(MockPageRenderer::new(0)));

        let err = extractor.extract(b"%PDF", "vision-model").unwrap_err();
        assert!(matches!(err, ExtractError::EmptyDocument));
    }

    #[test]
    fn mock_extractor_scripts_then_falls_back() {
        let extractor = MockVisionExtractor::new("fallback text")
            .push_result(Err(ExtractError::OutOfMemory { page: 0 }));

        assert!(extractor.extract(b"", "m").is_err());
        assert_eq!(extractor.extract(b"", "m").unwrap().text, "fallback text");
    }
}
