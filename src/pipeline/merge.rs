//! Combine page-by-page extraction results into one document result.
//!
//! Stage 3 can run once per page when a document is too long for one prompt.
//! The page answers are folded together here:
//!
//! * a single-valued field keeps the first non-empty value in page order. A
//!   later page with a different value is a conflict, and the longer value wins
//! * tables with the same `table_name` accumulate rows across pages; an
//!   unnamed table is matched by its position on the page
//! * header changes and rows of uneven width in a multi-page table are
//!   reported as anomalies
//!
//! Nothing is dropped silently: every conflict and anomaly ends up in the
//! [`MergeReport`] stored next to the merged result.

use crate::model::ExtractedData;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

const TABLE_KEY: &str = "table_data";

/// One page's stage 3 answer. `page` is 1-indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtraction {
    pub page: usize,
    pub data: ExtractedData,
}

/// How each page contributed, and what did not fit together.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeReport {
    pub pages: Vec<PageOutcome>,
    /// Page each non-empty field value was taken from.
    #[serde(default)]
    pub field_sources: BTreeMap<String, usize>,
    #[serde(default)]
    pub field_conflicts: Vec<FieldConflict>,
    #[serde(default)]
    pub table_anomalies: Vec<TableAnomaly>,
}

impl MergeReport {
    pub fn failed_pages(&self) -> impl Iterator<Item = &PageOutcome> {
        self.pages.iter().filter(|p| p.error.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOutcome {
    pub page: usize,
    /// Non-empty field values on the page.
    pub fields: usize,
    pub table_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A field that came back with different values on different pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    /// Every distinct value seen, with the page it came from.
    pub values: Vec<PageValue>,
    /// Page whose value was kept.
    pub chosen_page: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageValue {
    pub page: usize,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableAnomaly {
    pub table: String,
    pub issue: String,
}

/// A table being assembled from several pages.
struct TableAccumulator {
    name: String,
    headers: Value,
    rows: Vec<Value>,
    source_pages: Vec<usize>,
}

/// Fold page results into one [`ExtractedData`].
///
/// `failures` are pages whose extraction failed; they only show up in the report.
pub fn merge_pages(mut pages: Vec<PageExtraction>, failures: Vec<(usize, String)>) -> (ExtractedData, MergeReport) {
    pages.sort_by_key(|p| p.page);

    let mut fields = Map::new();
    let mut report = MergeReport::default();
    let mut conflicts: BTreeMap<String, FieldConflict> = BTreeMap::new();
    let mut tables: Vec<TableAccumulator> = Vec::new();

    for PageExtraction { page, data } in &pages {
        let mut outcome = PageOutcome {
            page: *page,
            fields: 0,
            table_rows: 0,
            error: None,
        };
        for (name, value) in data.iter() {
            if name == TABLE_KEY {
                outcome.table_rows += collect_tables(value, *page, &mut tables, &mut report.table_anomalies);
                continue;
            }
            if is_empty(value) {
                fields.entry(name.to_string()).or_insert(Value::Null);
                continue;
            }
            outcome.fields += 1;
            let current = fields.get(name).filter(|v| !v.is_null()).cloned();
            let Some(existing) = current else {
                fields.insert(name.to_string(), value.clone());
                report.field_sources.insert(name.to_string(), *page);
                continue;
            };
            if &existing == value {
                continue;
            }
            let source = report.field_sources.get(name).copied().unwrap_or(*page);
            let conflict = conflicts.entry(name.to_string()).or_insert_with(|| FieldConflict {
                field: name.to_string(),
                values: vec![PageValue {
                    page: source,
                    value: existing.clone(),
                }],
                chosen_page: source,
            });
            if !conflict.values.iter().any(|v| &v.value == value) {
                conflict.values.push(PageValue {
                    page: *page,
                    value: value.clone(),
                });
            }
            if display_len(value) > display_len(&existing) {
                fields.insert(name.to_string(), value.clone());
                report.field_sources.insert(name.to_string(), *page);
                conflict.chosen_page = *page;
            }
        }
        report.pages.push(outcome);
    }

    for (page, error) in failures {
        report.pages.push(PageOutcome {
            page,
            fields: 0,
            table_rows: 0,
            error: Some(error),
        });
    }
    report.pages.sort_by_key(|p| p.page);
    report.field_conflicts = conflicts.into_values().collect();

    for table in &tables {
        if table.source_pages.len() > 1 {
            let widths: BTreeSet<usize> = table
                .rows
                .iter()
                .filter_map(|r| r.as_object().map(Map::len))
                .collect();
            if widths.len() > 1 {
                report.table_anomalies.push(TableAnomaly {
                    table: table.name.clone(),
                    issue: format!("rows have uneven column counts across pages: {widths:?}"),
                });
            }
        }
    }
    if !tables.is_empty() {
        let merged: Vec<Value> = tables
            .into_iter()
            .map(|t| {
                json!({
                    "table_name": t.name,
                    "headers": t.headers,
                    "rows": t.rows,
                    "source_pages": t.source_pages,
                })
            })
            .collect();
        fields.insert(TABLE_KEY.to_string(), Value::Array(merged));
    }

    (ExtractedData::from_map(fields), report)
}

/// Add the tables of one page; returns the number of rows added.
fn collect_tables(
    value: &Value,
    page: usize,
    tables: &mut Vec<TableAccumulator>,
    anomalies: &mut Vec<TableAnomaly>,
) -> usize {
    let page_tables: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![value],
        _ => return 0,
    };

    let mut added = 0;
    for (position, table) in page_tables.into_iter().enumerate() {
        let Some(obj) = table.as_object() else {
            continue;
        };
        let name = obj
            .get("table_name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Table {}", position + 1));
        let headers = obj.get("headers").cloned().unwrap_or(Value::Array(Vec::new()));
        let rows: Vec<Value> = obj
            .get("rows")
            .or_else(|| obj.get("data"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let index = match tables.iter().position(|t| t.name == name) {
            Some(i) => i,
            None => {
                tables.push(TableAccumulator {
                    name: name.clone(),
                    headers: headers.clone(),
                    rows: Vec::new(),
                    source_pages: Vec::new(),
                });
                tables.len() - 1
            }
        };
        let acc = &mut tables[index];
        if !is_empty(&headers) && is_empty(&acc.headers) {
            acc.headers = headers;
        } else if !is_empty(&headers) && headers != acc.headers {
            anomalies.push(TableAnomaly {
                table: name,
                issue: format!("page {page} lists different headers"),
            });
        }
        added += rows.len();
        acc.rows.extend(rows);
        if !acc.source_pages.contains(&page) {
            acc.source_pages.push(page);
        }
    }
    added
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn display_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}
