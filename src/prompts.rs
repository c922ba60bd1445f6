//! Prompts for the three pipeline stages.
//!
//! Prompt wording sits behind [`PromptPolicy`] so deployments can replace it
//! without touching orchestration, retry or parsing. [`DefaultPrompts`] is
//! the built-in policy. Each stage prompt names the JSON shape the stage
//! parser accepts:
//!
//! | Stage | Top-level keys the parser reads |
//! |-------|---------------------------------|
//! | classification | `classification` (or `structure`) |
//! | field identification | `form_fields` (or `fields`), `tables` |
//! | extraction | `extracted_data` (or `form_data`), `table_data` |

use crate::model::{ExtractionMode, FeedbackEntry, FieldSet, Stage, Structure};
use serde_json::Value;

/// Characters of document text shown to the classifier.
pub const CLASSIFICATION_SAMPLE_CHARS: usize = 2000;

/// Feedback and prior result for a refinement run.
#[derive(Debug, Clone, Copy)]
pub struct Refinement<'a> {
    /// Result stored before this run, if any.
    pub prior: Option<&'a Value>,
    /// Earlier feedback for the same stage, oldest first.
    pub history: &'a [FeedbackEntry],
    pub feedback: &'a str,
}

/// Everything a policy may draw on when writing a stage prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub stage: Stage,
    pub mode: ExtractionMode,
    /// Document text prepared for `mode`: plain text, the spatial layout, or
    /// empty when only page images are sent.
    pub text: &'a str,
    pub page_count: usize,
    pub structure: Option<&'a Structure>,
    pub fields: Option<&'a FieldSet>,
    pub refinement: Option<Refinement<'a>>,
}

/// Replaceable prompt construction.
pub trait PromptPolicy: Send + Sync {
    fn system(&self, stage: Stage, mode: ExtractionMode) -> String;
    fn user(&self, ctx: &PromptContext<'_>) -> String;
}

/// Built-in prompts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPrompts;

impl PromptPolicy for DefaultPrompts {
    fn system(&self, stage: Stage, mode: ExtractionMode) -> String {
        let role = match stage {
            Stage::Classification => "You classify the layout of business documents.",
            Stage::FieldIdentification => {
                "You are a document structure specialist. You identify form field labels and table column headers, never their values."
            }
            Stage::Extraction => {
                "You are a precise data extraction specialist. You copy values exactly as written and never infer missing data."
            }
        };
        let input = match mode {
            ExtractionMode::Text => "",
            ExtractionMode::Spatial => SPATIAL_NOTE,
            ExtractionMode::Vision => VISION_NOTE,
            ExtractionMode::Hybrid => HYBRID_NOTE,
        };
        let input = if stage == Stage::Classification { "" } else { input };
        format!("{role}{input}\n\nYou MUST respond with valid JSON only. No markdown fences, no additional text.")
    }

    fn user(&self, ctx: &PromptContext<'_>) -> String {
        let mut prompt = match ctx.stage {
            Stage::Classification => classification_prompt(ctx),
            Stage::FieldIdentification => field_identification_prompt(ctx),
            Stage::Extraction => extraction_prompt(ctx),
        };
        if let Some(refinement) = &ctx.refinement {
            prompt.push_str("\n\n");
            prompt.push_str(&feedback_context(refinement));
        }
        prompt
    }
}

const SPATIAL_NOTE: &str = "\n\nThe document text is laid out by position: each line is one visual row, \
tab characters separate horizontally distant blocks, and [EMPTY] marks a label with no value next to it.";

const VISION_NOTE: &str = "\n\nThe document is provided as page images. Read labels and values from the visual layout.";

const HYBRID_NOTE: &str = "\n\nThe document is provided both as page images and as position-aware text \
(tab characters separate distant blocks, [EMPTY] marks a label with no value). \
Use the images to resolve layout and the text for exact spelling.";

fn document_section(ctx: &PromptContext<'_>) -> String {
    if ctx.text.trim().is_empty() {
        "Document: see the attached page image(s).".to_string()
    } else {
        format!("Document text:\n\"\"\"\n{}\n\"\"\"", ctx.text.trim_end())
    }
}

fn classification_prompt(ctx: &PromptContext<'_>) -> String {
    let sample: String = ctx.text.chars().take(CLASSIFICATION_SAMPLE_CHARS).collect();
    let blocks = ctx.text.lines().filter(|l| !l.trim().is_empty()).count();
    format!(
        r#"Analyze this PDF and classify its structure.

Document info:
- Pages: {pages}
- Total text length: {len} characters
- Text lines: {blocks}

Sample text content:
"""
{sample}
"""

Classify the document as one of:
1. "form": form fields with labels and values (applications, invoices, profiles)
2. "table": tabular data with rows and columns
3. "mixed": both form elements and tables

Also identify the main regions and give a confidence score.

Respond in this format:
{{
  "classification": "form|table|mixed",
  "confidence": 0.85,
  "reasoning": "Brief explanation of the classification",
  "regions": [
    {{"type": "form|table", "description": "What this region holds", "estimated_bounds": "top|middle|bottom"}}
  ]
}}"#,
        pages = ctx.page_count,
        len = ctx.text.chars().count(),
        blocks = blocks,
        sample = sample.trim_end(),
    )
}

fn field_identification_prompt(ctx: &PromptContext<'_>) -> String {
    let label = ctx.structure.map(Structure::label).unwrap_or("unknown");
    format!(
        r#"Identify the FORM FIELDS and TABLE HEADERS of this document. The document was classified as "{label}".

{document}

Rules:
1. form_fields holds individual field LABELS only, such as "Employee Name" or "Birth Date".
2. Never put values such as "John Doe" or "12/26/2001" in a field name.
3. Table column headers go ONLY in the tables section, never in form_fields.
4. Include fields that have no value. Do not miss any label.
5. Ignore section titles, page headers, footers and table row data.

Respond in this format:
{{
  "form_fields": [
    {{"field_name": "Employee Name", "data_type": "text|number|date|currency|boolean"}},
    {{"field_name": "Birth Date", "data_type": "date"}}
  ],
  "tables": [
    {{"table_name": "Rate Information", "headers": ["RateCode", "Description", "Rate", "Effective Dates"]}}
  ]
}}"#,
        label = label,
        document = document_section(ctx),
    )
}

fn extraction_prompt(ctx: &PromptContext<'_>) -> String {
    format!(
        r#"Extract the actual values for the validated document structure below.

{document}

{structure}

Form fields:
- Copy each value exactly as it appears (dates, numbers, capitalization).
- Use null when a field is empty or not found. Keep 0.00 distinct from empty.
- Use the field names exactly as listed.

Tables:
- Extract ALL rows, keyed by the listed column headers.
- Use null for empty cells.

Respond in this format:
{{
  "extracted_data": {{
    "Field Name": "exact value or null"
  }},
  "table_data": [
    {{
      "table_name": "Table Name",
      "headers": ["Column1", "Column2"],
      "rows": [{{"Column1": "value", "Column2": null}}]
    }}
  ]
}}"#,
        document = document_section(ctx),
        structure = field_structure(ctx.fields),
    )
}

/// List the fields and table headers stage 3 must fill.
pub fn field_structure(fields: Option<&FieldSet>) -> String {
    let Some(fields) = fields else {
        return "FORM FIELDS TO EXTRACT: none identified".to_string();
    };
    let mut out = String::from("FORM FIELDS TO EXTRACT:");
    if fields.is_empty() {
        out.push_str(" none");
    }
    for f in &fields.fields {
        out.push_str(&format!("\n- {} ({})", f.name, f.field_type));
    }
    let tables = fields.table_headers();
    if !tables.is_empty() {
        out.push_str("\n\nTABLES TO EXTRACT:");
        for (name, headers) in tables {
            out.push_str(&format!("\n- {}: {}", name, headers.join(" | ")));
        }
    }
    out
}

/// Render the refinement block appended to a stage prompt.
pub fn feedback_context(refinement: &Refinement<'_>) -> String {
    let mut out = String::new();
    if let Some(prior) = refinement.prior {
        let rendered = serde_json::to_string_pretty(prior).unwrap_or_else(|_| prior.to_string());
        out.push_str("PREVIOUS RESULT:\n");
        out.push_str(&rendered);
        out.push_str("\n\n");
    }
    if !refinement.history.is_empty() {
        out.push_str("PREVIOUS FEEDBACK HISTORY:\n");
        for entry in refinement.history {
            out.push_str(&format!("--- Iteration {} Feedback ---\n{}\n", entry.iteration, entry.feedback.trim()));
        }
        out.push('\n');
    }
    out.push_str("CURRENT FEEDBACK:\n");
    out.push_str(refinement.feedback.trim());
    out.push_str(
        "\n\nApply the feedback exactly: add what it says is missing, remove what it says is wrong, \
         and keep everything else from the previous result. Return the complete corrected JSON.",
    );
    out
}
