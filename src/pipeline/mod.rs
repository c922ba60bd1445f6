//! Building blocks the orchestrator strings together for each stage.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ content ──▶ spatial ──▶ encode ──▶ llm ──▶ postprocess
//! (URL/path) (pdfium)   (layout)   (base64)   (API)   (JSON salvage)
//! ```
//!
//! 1. [`input`]  : resolve a path, URL or upload to a file with a `%PDF` header
//! 2. [`content`]: page text, word boxes and page images; pdfium runs in
//!    `spawn_blocking`
//! 3. [`spatial`]: deterministic line and column clustering of word boxes
//!    for the spatial and hybrid modes
//! 4. [`encode`] : PNG and base64 wrapping of page images for vision prompts
//! 5. [`llm`]    : the completion client: retry, backoff, usage records and
//!    one JSON repair follow-up; the only network I/O
//! 6. [`postprocess`]: recover a JSON value from fenced or truncated replies
//! 7. [`merge`]  : fold page-by-page extraction answers into one result

pub mod content;
pub mod encode;
pub mod input;
pub mod llm;
pub mod merge;
pub mod postprocess;
pub mod spatial;
