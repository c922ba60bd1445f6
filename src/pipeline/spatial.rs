//! Spatial preprocessing: word boxes → lines, clusters, labels and tables.
//!
//! Raw PDF text loses the layout that tells a reader which value belongs to
//! which label. This module rebuilds it from word coordinates:
//!
//! ```text
//! words ──▶ lines ──▶ clusters ──▶ label / value ──▶ "Label:\tvalue" text
//!  (y0 within tolerance)  (gap > k × mean gap splits)
//! ```
//!
//! Everything here is pure and deterministic: the same words and the same
//! [`SpatialConfig`] always give the same output. Words from different pages
//! never share a line.

use crate::config::SpatialConfig;
use crate::model::{BoundingBox, Word};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Placeholder for a label with no value next to or below it.
pub const EMPTY_MARKER: &str = "[EMPTY]";

/// Separator between clusters on one formatted line.
const CLUSTER_SEPARATOR: &str = "    ";

const FIELD_KEYWORDS: &[&str] = &[
    "name", "id", "number", "no", "code", "date", "time", "status", "type", "group", "class",
    "category", "dept", "department", "title", "position", "employee", "emp", "staff", "person",
    "user", "customer", "client", "address", "phone", "email", "ssn", "tax", "salary", "rate",
    "amount", "total", "sum", "balance", "payment", "account", "reference", "ref",
];

const COMMON_FIELDS: &[&str] = &[
    "gender", "marital", "hire", "term", "supervisor", "division", "location",
];

const FIELD_ENDINGS: &[&str] = &[
    ":", "#", "no", "id", "code", "name", "date", "type", "status", "group", "title",
];

/// One word cluster with its layout classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBoundary {
    /// 1-based, in reading order.
    pub id: u32,
    pub text: String,
    /// 1-based line number across all pages.
    pub line: usize,
    /// 1-based cluster number within the line.
    pub cluster: usize,
    pub page: usize,
    pub bbox: BoundingBox,
    pub is_likely_field: bool,
    pub confidence: f32,
    /// A label that is the last cluster on its line, so nothing follows it.
    pub is_empty_field: bool,
}

/// A block of regularly spaced rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRegion {
    pub page: usize,
    pub bbox: BoundingBox,
    /// Words of the first row.
    pub headers: Vec<String>,
    pub row_count: usize,
    pub column_count: usize,
}

// ── Lines and clusters ───────────────────────────────────────────────────

/// Group words into lines, top to bottom, each sorted left to right.
pub fn group_lines<'a>(words: &'a [Word], config: &SpatialConfig) -> Vec<Vec<&'a Word>> {
    let mut sorted: Vec<&Word> = words.iter().collect();
    sorted.sort_by(|a, b| {
        a.page
            .cmp(&b.page)
            .then(a.bbox.y0.total_cmp(&b.bbox.y0))
            .then(a.bbox.x0.total_cmp(&b.bbox.x0))
    });

    let mut lines: Vec<Vec<&Word>> = Vec::new();
    let mut current: Vec<&Word> = Vec::new();
    let mut line_y = 0.0f32;
    let mut line_page = 0usize;

    for word in sorted {
        let same_line = !current.is_empty()
            && word.page == line_page
            && (word.bbox.y0 - line_y).abs() <= config.y_tolerance;
        if !same_line && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            line_y = word.bbox.y0;
            line_page = word.page;
        }
        current.push(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }

    for line in &mut lines {
        line.sort_by(|a, b| a.bbox.x0.total_cmp(&b.bbox.x0));
    }
    lines
}

/// Split a line wherever a gap exceeds `gap_multiplier` × the mean gap.
pub fn cluster_line<'a>(line: &[&'a Word], config: &SpatialConfig) -> Vec<Vec<&'a Word>> {
    if line.len() <= 1 {
        return vec![line.to_vec()];
    }
    let gaps: Vec<f32> = line.windows(2).map(|w| w[1].bbox.x0 - w[0].bbox.x1).collect();
    let mean = gaps.iter().sum::<f32>() / gaps.len() as f32;
    let threshold = mean * config.gap_multiplier;

    let mut clusters = Vec::new();
    let mut current = vec![line[0]];
    for (word, gap) in line[1..].iter().zip(gaps) {
        if gap <= threshold {
            current.push(*word);
        } else {
            clusters.push(std::mem::replace(&mut current, vec![*word]));
        }
    }
    clusters.push(current);
    clusters
}

fn cluster_text(cluster: &[&Word]) -> String {
    cluster.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ")
}

fn cluster_bbox(cluster: &[&Word]) -> BoundingBox {
    BoundingBox::enclosing(cluster.iter().map(|w| &w.bbox)).unwrap_or_default()
}

fn cluster_center_x(cluster: &[&Word]) -> f32 {
    if cluster.is_empty() {
        return 0.0;
    }
    cluster.iter().map(|w| w.bbox.center_x()).sum::<f32>() / cluster.len() as f32
}

// ── Label heuristics ─────────────────────────────────────────────────────

static RE_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}/\d{1,2}/\d{4}").unwrap());
static RE_PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3}-\d{3}-\d{4}").unwrap());
static RE_SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3}-\d{2}-\d{4}").unwrap());

fn is_all_upper(s: &str) -> bool {
    s.chars().any(char::is_alphabetic) && s.chars().filter(|c| c.is_alphabetic()).all(char::is_uppercase)
}

/// True for text that is clearly a value: numbers, dates, money, codes.
pub fn is_obvious_value(text: &str) -> bool {
    let text = text.trim();
    let mut chars = text.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_alphabetic() {
            return true;
        }
    }

    let digits: String = text.chars().filter(|c| !matches!(c, '.' | ',' | '-' | '/')).collect();
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if text.starts_with('$') || text.ends_with('%') {
        return true;
    }
    if RE_DATE.is_match(text) || RE_PHONE.is_match(text) || RE_SSN.is_match(text) {
        return true;
    }
    let lower = text.to_lowercase();
    is_all_upper(text)
        && text.chars().count() <= 6
        && !FIELD_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// True when a cluster reads like a field label rather than a value.
pub fn is_field_label(cluster: &[&Word]) -> bool {
    if cluster.is_empty() {
        return false;
    }
    let original = cluster_text(cluster);
    if is_obvious_value(&original) {
        return false;
    }
    let lower = original.to_lowercase();

    if FIELD_KEYWORDS.iter().chain(COMMON_FIELDS).any(|k| lower.contains(k)) {
        return true;
    }
    if FIELD_ENDINGS.iter().any(|e| lower.ends_with(e)) {
        return true;
    }
    if cluster.len() >= 2 {
        let title_case = cluster
            .iter()
            .filter(|w| w.text.chars().next().is_some_and(char::is_uppercase) && !is_all_upper(&w.text))
            .count();
        if title_case as f32 >= cluster.len() as f32 * 0.7 {
            return true;
        }
    }
    false
}

/// Label flags for a line's clusters.
///
/// A cluster right after a colon-terminated label is that label's value even
/// when it looks like a label itself ("Name: Caroline Jones"), unless it also
/// ends with a colon.
fn labels_in_context(clusters: &[Vec<&Word>]) -> Vec<bool> {
    let ends_with_colon = |c: &[&Word]| c.last().is_some_and(|w| w.text.ends_with(':'));
    clusters
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let after_colon_label = i > 0 && ends_with_colon(&clusters[i - 1]);
            is_field_label(c) && !(after_colon_label && !ends_with_colon(c))
        })
        .collect()
}

fn label_text(cluster: &[&Word]) -> String {
    let text = cluster_text(cluster);
    text.trim_end_matches(':').trim_end().to_string()
}

// ── Outputs ──────────────────────────────────────────────────────────────

/// Every cluster on every line, classified as label or content.
pub fn cluster(words: &[Word], config: &SpatialConfig) -> Vec<FieldBoundary> {
    let mut out = Vec::new();
    let mut id = 0u32;
    for (line_idx, line) in group_lines(words, config).iter().enumerate() {
        let clusters = cluster_line(line, config);
        let labels = labels_in_context(&clusters);
        let last = clusters.len().saturating_sub(1);
        for (cluster_idx, c) in clusters.iter().enumerate() {
            let Some(first) = c.first() else { continue };
            id += 1;
            let is_field = labels[cluster_idx];
            out.push(FieldBoundary {
                id,
                text: cluster_text(c),
                line: line_idx + 1,
                cluster: cluster_idx + 1,
                page: first.page,
                bbox: cluster_bbox(c),
                is_likely_field: is_field,
                confidence: if is_field { 0.8 } else { 0.6 },
                is_empty_field: is_field && cluster_idx == last,
            });
        }
    }
    out
}

/// Render words as layout-aware text for a prompt.
///
/// Labels become `Label:\tvalue`, taking the value from the next cluster on
/// the same line or, when the line holds only labels, from the x-aligned
/// cluster on the line below (which is then consumed). Labels without a value
/// get [`EMPTY_MARKER`]. Clusters are joined with four spaces.
pub fn format_for_prompt(words: &[Word], config: &SpatialConfig) -> String {
    let lines = group_lines(words, config);
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;
    let mut last_page = None;

    while i < lines.len() {
        let page = lines[i].first().map(|w| w.page);
        if last_page.is_some() && page != last_page {
            out.push(String::new());
        }
        last_page = page;

        let clusters = cluster_line(&lines[i], config);
        let next = lines
            .get(i + 1)
            .filter(|n| n.first().map(|w| w.page) == page)
            .map(|n| cluster_line(n, config));

        let labels_only = labels_in_context(&clusters).iter().all(|l| *l);
        match next {
            Some(value_clusters)
                if labels_only && is_value_line(&clusters, &value_clusters, config) =>
            {
                out.push(format_label_line(&clusters, &value_clusters, config));
                i += 2;
            }
            _ => {
                let formatted = format_inline(&clusters);
                if !formatted.trim().is_empty() {
                    out.push(formatted);
                }
                i += 1;
            }
        }
    }
    out.join("\n")
}

/// A following line holds values when it has no labels and at least one of
/// its clusters sits under a label.
fn is_value_line(labels: &[Vec<&Word>], values: &[Vec<&Word>], config: &SpatialConfig) -> bool {
    if labels_in_context(values).iter().any(|l| *l) {
        return false;
    }
    labels.iter().flatten().any(|l| {
        values
            .iter()
            .flatten()
            .any(|v| (l.bbox.center_x() - v.bbox.center_x()).abs() <= config.value_x_tolerance)
    })
}

fn format_label_line(labels: &[Vec<&Word>], values: &[Vec<&Word>], config: &SpatialConfig) -> String {
    labels
        .iter()
        .map(|label| {
            let cx = cluster_center_x(label);
            let best = values
                .iter()
                .map(|v| (v, (cluster_center_x(v) - cx).abs()))
                .filter(|(_, d)| *d <= config.cluster_match_tolerance)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(v, _)| cluster_text(v));
            format!("{}:\t{}", label_text(label), best.as_deref().unwrap_or(EMPTY_MARKER))
        })
        .collect::<Vec<_>>()
        .join(CLUSTER_SEPARATOR)
}

fn format_inline(clusters: &[Vec<&Word>]) -> String {
    let labels = labels_in_context(clusters);
    let mut parts = Vec::new();
    let mut i = 0;
    while i < clusters.len() {
        let c = &clusters[i];
        if labels[i] {
            match clusters.get(i + 1).filter(|_| !labels[i + 1]) {
                Some(value) => {
                    parts.push(format!("{}:\t{}", label_text(c), cluster_text(value)));
                    i += 2;
                }
                None => {
                    parts.push(format!("{}:\t{}", label_text(c), EMPTY_MARKER));
                    i += 1;
                }
            }
        } else {
            parts.push(cluster_text(c));
            i += 1;
        }
    }
    parts.join(CLUSTER_SEPARATOR)
}

/// Find runs of regularly spaced rows that look like a table.
pub fn table_regions(words: &[Word], config: &SpatialConfig) -> Vec<TableRegion> {
    let candidates: Vec<Vec<&Word>> = group_lines(words, config)
        .into_iter()
        .filter(|line| line.len() >= config.table_min_words && has_regular_spacing(line, config))
        .collect();

    let mut regions = Vec::new();
    let mut current: Vec<Vec<&Word>> = Vec::new();
    for line in candidates {
        let continues = current.last().is_some_and(|prev| {
            let prev_bottom = prev.iter().map(|w| w.bbox.y1).fold(f32::MIN, f32::max);
            let top = line.iter().map(|w| w.bbox.y0).fold(f32::MAX, f32::min);
            prev[0].page == line[0].page && top - prev_bottom <= config.table_row_gap
        });
        if !continues && !current.is_empty() {
            push_region(&mut regions, std::mem::take(&mut current), config);
        }
        current.push(line);
    }
    push_region(&mut regions, current, config);
    regions
}

fn has_regular_spacing(line: &[&Word], config: &SpatialConfig) -> bool {
    if line.len() < 3 {
        return false;
    }
    let steps: Vec<f32> = line.windows(2).map(|w| w[1].bbox.x0 - w[0].bbox.x0).collect();
    let mean = steps.iter().sum::<f32>() / steps.len() as f32;
    steps.iter().all(|s| (s - mean).abs() <= config.table_spacing_tolerance)
}

fn push_region(regions: &mut Vec<TableRegion>, rows: Vec<Vec<&Word>>, config: &SpatialConfig) {
    if rows.len() < config.table_min_rows.max(1) {
        return;
    }
    let Some(bbox) = BoundingBox::enclosing(rows.iter().flatten().map(|w| &w.bbox)) else {
        return;
    };
    let headers: Vec<String> = rows[0].iter().map(|w| w.text.clone()).collect();
    regions.push(TableRegion {
        page: rows[0][0].page,
        bbox,
        column_count: headers.len(),
        headers,
        row_count: rows.len(),
    });
}
