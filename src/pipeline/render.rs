//! PDF page rendering via Google PDFium.
//!
//! Pages are rendered to PNG for the vision model at 300 DPI, clamped so the
//! long edge never exceeds the pixel cap. For any sane page size the
//! effective resolution stays in the 250–300 DPI band the vision model was
//! tuned for; only absurdly large pages drop below that, traded off against
//! memory.
//!
//! `PdfiumRenderer` is stateless (`Send + Sync`). The upstream `Pdfium`
//! handle is `!Send`, so each call binds the library anew; the OS caches the
//! underlying `dlopen`, which makes repeat binds near-free.

use std::io::Cursor;

use image::ImageFormat;
use pdfium_render::prelude::*;

/// Target rendering resolution for vision extraction.
pub const TARGET_DPI: u32 = 300;

/// Long-edge cap for rendered pages. An A4 page at 300 DPI is ~3508 px on
/// the long edge, which fits; larger formats get scaled down.
const MAX_EDGE_PX: u32 = 3600;

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("PDFium library unavailable: {0}")]
    LibraryUnavailable(String),

    #[error("PDF is password-protected")]
    Encrypted,

    #[error("Failed to open PDF: {0}")]
    InvalidDocument(String),

    #[error("Failed to render page {page}: {reason}")]
    Page { page: usize, reason: String },

    #[error("PNG encoding failed on page {page}: {reason}")]
    Encoding { page: usize, reason: String },
}

/// One rendered page, ready for the vision model.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// Zero-based page index.
    pub index: usize,
    pub png: Vec<u8>,
    pub width_px: u32,
    pub height_px: u32,
}

/// Renders document pages to PNG.
pub trait PageRenderer: Send + Sync {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, RenderError>;
    fn render_page(&self, pdf_bytes: &[u8], index: usize) -> Result<RenderedPage, RenderError>;
}

// ═══════════════════════════════════════════════════════════
// PDFium implementation
// ═══════════════════════════════════════════════════════════

pub struct PdfiumRenderer;

impl PdfiumRenderer {
    /// Verify the PDFium library is loadable before any job depends on it.
    pub fn new() -> Result<Self, RenderError> {
        let _ = bind_pdfium()?;
        Ok(Self)
    }
}

/// Bind the PDFium dynamic library.
///
/// Discovery order: `PDFIUM_DYNAMIC_LIB_PATH`, then alongside the running
/// executable, then the system library search path.
fn bind_pdfium() -> Result<Pdfium, RenderError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| {
            RenderError::LibraryUnavailable(format!("cannot load {path}: {e}"))
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let lib_path =
                Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
            if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                return Ok(Pdfium::new(bindings));
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| {
        RenderError::LibraryUnavailable(format!(
            "PDFium not found. Set PDFIUM_DYNAMIC_LIB_PATH or install it system-wide: {e}"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

fn map_open_error(e: PdfiumError) -> RenderError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        RenderError::Encrypted
    } else {
        RenderError::InvalidDocument(msg)
    }
}

/// Pixel dimensions for a page at the target DPI, capped on the long edge.
///
/// Returns `(width_px, height_px, effective_dpi)`; aspect ratio is preserved
/// when capping.
fn page_pixel_size(width_points: f32, height_points: f32) -> (u32, u32, u32) {
    let scale = TARGET_DPI as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let long_edge = raw_w.max(raw_h);
    if long_edge <= MAX_EDGE_PX as f32 {
        return (raw_w as u32, raw_h as u32, TARGET_DPI);
    }

    let ratio = MAX_EDGE_PX as f32 / long_edge;
    let w = ((raw_w * ratio) as u32).clamp(1, MAX_EDGE_PX);
    let h = ((raw_h * ratio) as u32).clamp(1, MAX_EDGE_PX);
    let effective_dpi = ((TARGET_DPI as f32) * ratio) as u32;
    (w, h, effective_dpi)
}

impl PageRenderer for PdfiumRenderer {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, RenderError> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(map_open_error)?;
        Ok(document.pages().len() as usize)
    }

    fn render_page(&self, pdf_bytes: &[u8], index: usize) -> Result<RenderedPage, RenderError> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(map_open_error)?;
        let pages = document.pages();

        let page_index = u16::try_from(index).map_err(|_| RenderError::Page {
            page: index,
            reason: "page index exceeds u16".to_string(),
        })?;
        let page = pages.get(page_index).map_err(|_| RenderError::Page {
            page: index,
            reason: format!("out of range (document has {} pages)", pages.len()),
        })?;

        let (width_px, height_px, effective_dpi) =
            page_pixel_size(page.width().value, page.height().value);
        if effective_dpi < TARGET_DPI {
            tracing::warn!(
                page = index,
                effective_dpi,
                "Oversized page scaled below target resolution"
            );
        }

        let config = PdfRenderConfig::new()
            .set_target_width(width_px as i32)
            .set_maximum_height(height_px as i32);
        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| RenderError::Page {
                page: index,
                reason: e.to_string(),
            })?;

        let mut cursor = Cursor::new(Vec::new());
        bitmap
            .as_image()
            .write_to(&mut cursor, ImageFormat::Png)
            .map_err(|e| RenderError::Encoding {
                page: index,
                reason: e.to_string(),
            })?;
        let png = cursor.into_inner();

        tracing::debug!(
            page = index,
            width = width_px,
            height = height_px,
            png_bytes = png.len(),
            "Rendered page"
        );

        Ok(RenderedPage {
            index,
            png,
            width_px,
            height_px,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Mock
// ═══════════════════════════════════════════════════════════

/// Renderer stub returning a 1×1 PNG per page, for tests without PDFium.
pub struct MockPageRenderer {
    page_count: usize,
}

impl MockPageRenderer {
    pub fn new(page_count: usize) -> Self {
        Self { page_count }
    }
}

impl PageRenderer for MockPageRenderer {
    fn page_count(&self, _pdf_bytes: &[u8]) -> Result<usize, RenderError> {
        Ok(self.page_count)
    }

    fn render_page(&self, _pdf_bytes: &[u8], index: usize) -> Result<RenderedPage, RenderError> {
        if index >= self.page_count {
            return Err(RenderError::Page {
                page: index,
                reason: format!("out of range (mock has {} pages)", self.page_count),
            });
        }
        Ok(RenderedPage {
            index,
            png: tiny_png(),
            width_px: 1,
            height_px: 1,
        })
    }
}

/// Minimal valid 1×1 white-pixel PNG (8-bit RGB).
pub fn tiny_png() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, // signature
        0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52, // IHDR
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, // 1x1
        0x08, 0x02, 0x00, 0x00, 0x00, // 8-bit RGB
        0x90, 0x77, 0x53, 0xDE, // IHDR CRC
        0x00, 0x00, 0x00, 0x0C, 0x49, 0x44, 0x41, 0x54, // IDAT
        0x78, 0x9C, 0x63, 0xF8, 0xFF, 0xFF, 0x3F, 0x00, // zlib: filter 0 + white px
        0x05, 0xFE, 0x02, 0xFE, // zlib adler32
        0x0D, 0xEF, 0x46, 0xB8, // IDAT CRC
        0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, // IEND
        0xAE, 0x42, 0x60, 0x82, // IEND CRC
    ]
}
