//! PDF content extraction: page text, word boxes and page images via pdfium.
//!
//! The pipeline talks to a [`ContentExtractor`] so tests can hand it canned
//! pages. [`PdfiumExtractor`] is the production implementation; like all
//! pdfium work it runs inside `spawn_blocking` because the C library is
//! synchronous and CPU-bound.
//!
//! pdfium reports character boxes in PDF user space (origin bottom-left).
//! Everything leaving this module uses a top-left origin so `y0 < y1` reads
//! top to bottom, which is what the spatial preprocessor sorts by.

use crate::config::PageSelection;
use crate::error::Pdf2JsonError;
use crate::model::{BoundingBox, Word};
use crate::pipeline::encode;
use crate::pipeline::input::ensure_pdf_bytes;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// What to pull out of the PDF. Text is always extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractRequest {
    pub pages: PageSelection,
    pub words: bool,
    pub images: bool,
    pub dpi: u32,
    pub max_rendered_pixels: u32,
    pub password: Option<String>,
}

impl Default for ExtractRequest {
    fn default() -> Self {
        Self {
            pages: PageSelection::First,
            words: false,
            images: false,
            dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
        }
    }
}

/// A rendered page, PNG-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageContent {
    /// 0-indexed.
    pub index: usize,
    /// Page size in points.
    pub width: f32,
    pub height: f32,
    pub text: String,
    /// Empty unless words were requested.
    pub words: Vec<Word>,
    pub image: Option<PageImage>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdfContent {
    /// Pages in the whole document, not just the extracted ones.
    pub page_count: usize,
    pub pages: Vec<PageContent>,
}

impl PdfContent {
    /// Text of all extracted pages, separated by blank lines.
    pub fn text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn words(&self) -> Vec<Word> {
        self.pages.iter().flat_map(|p| p.words.iter().cloned()).collect()
    }

    pub fn images(&self) -> impl Iterator<Item = &PageImage> {
        self.pages.iter().filter_map(|p| p.image.as_ref())
    }
}

/// Source of page content for the pipeline.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, path: &Path, request: &ExtractRequest) -> Result<PdfContent, Pdf2JsonError>;
}

/// pdfium-backed extractor. The library is bound through `pdfium-auto`,
/// which downloads or unpacks it on first use.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfiumExtractor;

#[async_trait]
impl ContentExtractor for PdfiumExtractor {
    async fn extract(&self, path: &Path, request: &ExtractRequest) -> Result<PdfContent, Pdf2JsonError> {
        let path = path.to_path_buf();
        let request = request.clone();
        tokio::task::spawn_blocking(move || extract_blocking(&path, &request))
            .await
            .map_err(|e| Pdf2JsonError::Internal(format!("Extraction task panicked: {}", e)))?
    }
}

fn extract_blocking(pdf_path: &Path, request: &ExtractRequest) -> Result<PdfContent, Pdf2JsonError> {
    let mut magic = Vec::with_capacity(4);
    std::fs::File::open(pdf_path)
        .and_then(|f| f.take(4).read_to_end(&mut magic))
        .map_err(|e| Pdf2JsonError::storage(pdf_path, e))?;
    ensure_pdf_bytes(&magic, pdf_path)?;

    let pdfium =
        pdfium_auto::bind_pdfium_silent().map_err(|e| Pdf2JsonError::PdfiumBindingFailed(e.to_string()))?;

    let password = request.password.as_deref();
    let document = pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        let detail = if err_str.to_lowercase().contains("password") {
            if password.is_some() {
                "wrong password".to_string()
            } else {
                "document is encrypted and needs a password".to_string()
            }
        } else {
            err_str
        };
        Pdf2JsonError::UnreadablePdf {
            path: pdf_path.to_path_buf(),
            detail,
        }
    })?;

    let pages = document.pages();
    let page_count = pages.len() as usize;
    let indices = request.pages.to_indices(page_count);
    info!(
        "PDF loaded: {} pages, extracting {} (words={}, images={})",
        page_count,
        indices.len(),
        request.words,
        request.images
    );

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(request.dpi as f32 / 72.0)
        .set_maximum_width(request.max_rendered_pixels as i32)
        .set_maximum_height(request.max_rendered_pixels as i32);

    let page_error = |idx: usize, e: PdfiumError| Pdf2JsonError::UnreadablePdf {
        path: pdf_path.to_path_buf(),
        detail: format!("page {}: {:?}", idx + 1, e),
    };

    let mut out = Vec::with_capacity(indices.len());
    for idx in indices {
        let page = pages.get(idx as u16).map_err(|e| page_error(idx, e))?;
        let width = page.width().value;
        let height = page.height().value;
        let text_page = page.text().map_err(|e| page_error(idx, e))?;
        let text = text_page.all();

        let words = if request.words {
            let glyphs: Vec<Glyph> = text_page
                .chars()
                .iter()
                .filter_map(|c| {
                    let bounds = c.loose_bounds().ok()?;
                    let ch = c.unicode_string()?.chars().next()?;
                    Some(Glyph {
                        ch,
                        bbox: BoundingBox::new(
                            bounds.left().value,
                            height - bounds.top().value,
                            bounds.right().value,
                            height - bounds.bottom().value,
                        ),
                    })
                })
                .collect();
            group_words(&glyphs, idx)
        } else {
            Vec::new()
        };

        let image = if request.images {
            match page.render_with_config(&render_config) {
                Ok(bitmap) => {
                    let img = bitmap.as_image();
                    let png = encode::png_bytes(&img).map_err(|e| {
                        Pdf2JsonError::Internal(format!("PNG encoding of page {} failed: {}", idx + 1, e))
                    })?;
                    debug!("Rendered page {} → {}x{} px", idx + 1, img.width(), img.height());
                    Some(PageImage {
                        png,
                        width: img.width(),
                        height: img.height(),
                    })
                }
                Err(e) => {
                    warn!("Page {}: rendering failed, continuing without image: {:?}", idx + 1, e);
                    None
                }
            }
        } else {
            None
        };

        debug!("Page {}: {} chars, {} words", idx + 1, text.len(), words.len());
        out.push(PageContent {
            index: idx,
            width,
            height,
            text,
            words,
            image,
        });
    }

    Ok(PdfContent {
        page_count,
        pages: out,
    })
}

/// One character with its box, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Glyph {
    pub ch: char,
    pub bbox: BoundingBox,
}

/// Join consecutive glyphs into words.
///
/// A word ends at whitespace, when the next glyph starts on a different
/// baseline, or when the horizontal gap exceeds a third of the glyph height.
pub(crate) fn group_words(glyphs: &[Glyph], page: usize) -> Vec<Word> {
    let mut words = Vec::new();
    let mut text = String::new();
    let mut bbox: Option<BoundingBox> = None;

    let mut flush = |text: &mut String, bbox: &mut Option<BoundingBox>| {
        if let Some(b) = bbox.take() {
            if !text.is_empty() {
                words.push(Word {
                    text: std::mem::take(text),
                    bbox: b,
                    page,
                });
            }
        }
        text.clear();
    };

    for g in glyphs {
        if g.ch.is_whitespace() || g.ch.is_control() {
            flush(&mut text, &mut bbox);
            continue;
        }
        if let Some(current) = bbox {
            let line_height = current.height().max(g.bbox.height()).max(1.0);
            let new_line = (g.bbox.center_y() - current.center_y()).abs() > line_height / 2.0;
            let gap = g.bbox.x0 - current.x1;
            if new_line || gap > line_height / 3.0 || gap < -line_height {
                flush(&mut text, &mut bbox);
            }
        }
        text.push(g.ch);
        bbox = Some(match bbox {
            Some(b) => b.union(&g.bbox),
            None => g.bbox,
        });
    }
    flush(&mut text, &mut bbox);
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyphs(s: &str, x: f32, y: f32) -> Vec<Glyph> {
        s.chars()
            .enumerate()
            .map(|(i, ch)| Glyph {
                ch,
                bbox: BoundingBox::new(x + i as f32 * 6.0, y, x + i as f32 * 6.0 + 5.5, y + 10.0),
            })
            .collect()
    }

    #[test]
    fn spaces_split_words() {
        let words = group_words(&glyphs("Name: Jane", 10.0, 50.0), 0);
        let texts: Vec<_> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, ["Name:", "Jane"]);
        assert_eq!(words[0].bbox.x0, 10.0);
        assert_eq!(words[0].bbox.y0, 50.0);
        assert_eq!(words[1].page, 0);
    }

    #[test]
    fn line_change_splits_words() {
        let mut g = glyphs("Date", 10.0, 50.0);
        g.extend(glyphs("Total", 34.0, 80.0));
        let words = group_words(&g, 2);
        assert_eq!(words.len(), 2);
        assert_eq!(words[1].text, "Total");
        assert_eq!(words[1].page, 2);
    }

    #[test]
    fn wide_gap_splits_words() {
        let mut g = glyphs("ID", 10.0, 50.0);
        g.extend(glyphs("42", 200.0, 50.0));
        assert_eq!(group_words(&g, 0).len(), 2);
    }

    #[test]
    fn empty_input_gives_no_words() {
        assert!(group_words(&[], 0).is_empty());
    }

    #[test]
    fn content_text_joins_pages() {
        let page = |index: usize, text: &str| PageContent {
            index,
            width: 612.0,
            height: 792.0,
            text: text.to_string(),
            words: vec![],
            image: None,
        };
        let content = PdfContent {
            page_count: 3,
            pages: vec![page(0, "first\n"), page(2, "third")],
        };
        assert_eq!(content.text(), "first\n\nthird");
        assert_eq!(content.images().count(), 0);
    }
}
