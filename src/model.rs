//! Domain types: documents, pipeline state, and the typed stage results.
//!
//! The model answers every stage with loosely shaped JSON. Each stage result
//! type here owns a `from_value` constructor that validates the expected shape
//! right after parsing, so the rest of the crate never handles untyped maps.
//! A shape mismatch is reported as a plain `String` reason and turned into
//! [`crate::error::Pdf2JsonError::AiResponseUnparseable`] by the orchestrator.

use crate::error::Pdf2JsonError;
use crate::pipeline::merge::MergeReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ── Stages ───────────────────────────────────────────────────────────────

/// One of the three pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classification,
    FieldIdentification,
    Extraction,
}

impl Stage {
    pub const ALL: [Stage; 3] = [
        Stage::Classification,
        Stage::FieldIdentification,
        Stage::Extraction,
    ];

    /// 1-based stage number as used by the HTTP API and CLI.
    pub fn number(self) -> u8 {
        match self {
            Stage::Classification => 1,
            Stage::FieldIdentification => 2,
            Stage::Extraction => 3,
        }
    }

    pub fn from_number(n: u8) -> Result<Self, Pdf2JsonError> {
        match n {
            1 => Ok(Stage::Classification),
            2 => Ok(Stage::FieldIdentification),
            3 => Ok(Stage::Extraction),
            other => Err(Pdf2JsonError::InvalidStage(other)),
        }
    }

    /// The stage whose result this stage consumes.
    pub fn prerequisite(self) -> Option<Stage> {
        match self {
            Stage::Classification => None,
            Stage::FieldIdentification => Some(Stage::Classification),
            Stage::Extraction => Some(Stage::FieldIdentification),
        }
    }

    /// Task name recorded in usage logs.
    pub fn task_name(self) -> &'static str {
        match self {
            Stage::Classification => "classification",
            Stage::FieldIdentification => "field_identification",
            Stage::Extraction => "data_extraction",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Classification => "classification",
            Stage::FieldIdentification => "field identification",
            Stage::Extraction => "extraction",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single stage for a single document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed { error: String },
}

/// Strategy for building the stage 2/3 prompt input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Raw page text in reading order.
    #[default]
    Text,
    /// Spatially formatted "Label:\tvalue" text built from word coordinates.
    Spatial,
    /// Page images only.
    Vision,
    /// Spatial text plus page images.
    Hybrid,
}

impl ExtractionMode {
    pub fn uses_words(self) -> bool {
        matches!(self, ExtractionMode::Spatial | ExtractionMode::Hybrid)
    }

    pub fn uses_images(self) -> bool {
        matches!(self, ExtractionMode::Vision | ExtractionMode::Hybrid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMode::Text => "text",
            ExtractionMode::Spatial => "spatial",
            ExtractionMode::Vision => "vision",
            ExtractionMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMode {
    type Err = Pdf2JsonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "original" => Ok(ExtractionMode::Text),
            "spatial" => Ok(ExtractionMode::Spatial),
            "vision" => Ok(ExtractionMode::Vision),
            "hybrid" => Ok(ExtractionMode::Hybrid),
            other => Err(Pdf2JsonError::InvalidRequest(format!(
                "unknown extraction mode '{other}' (expected text, spatial, vision or hybrid)"
            ))),
        }
    }
}

// ── Geometry ─────────────────────────────────────────────────────────────

/// Axis-aligned box in PDF points with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn center_x(&self) -> f32 {
        (self.x0 + self.x1) / 2.0
    }

    pub fn center_y(&self) -> f32 {
        (self.y0 + self.y1) / 2.0
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Smallest box containing every box in `boxes`.
    pub fn enclosing<'a>(mut boxes: impl Iterator<Item = &'a BoundingBox>) -> Option<BoundingBox> {
        let first = *boxes.next()?;
        Some(boxes.fold(first, |acc, b| acc.union(b)))
    }

    pub fn is_valid(&self) -> bool {
        [self.x0, self.y0, self.x1, self.y1].iter().all(|v| v.is_finite())
            && self.x1 >= self.x0
            && self.y1 >= self.y0
    }

    /// Accept `{x0,y0,x1,y1}` objects and `[x0,y0,x1,y1]` arrays.
    fn from_json(value: &Value) -> Option<BoundingBox> {
        let nums: Vec<f32> = match value {
            Value::Array(items) => items.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect(),
            Value::Object(map) => ["x0", "y0", "x1", "y1"]
                .iter()
                .filter_map(|k| map.get(*k).and_then(Value::as_f64))
                .map(|v| v as f32)
                .collect(),
            _ => return None,
        };
        if nums.len() != 4 {
            return None;
        }
        let bbox = BoundingBox::new(nums[0], nums[1], nums[2], nums[3]);
        bbox.is_valid().then_some(bbox)
    }
}

/// A single word on a page with its bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub bbox: BoundingBox,
    /// 0-indexed page number.
    pub page: usize,
}

// ── Documents ────────────────────────────────────────────────────────────

/// An uploaded PDF. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub storage_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

// ── Stage 1: Structure ───────────────────────────────────────────────────

/// Classification of the document layout, kept exactly as the model returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Structure(Map<String, Value>);

impl Structure {
    const LABEL_KEYS: [&'static str; 2] = ["structure", "classification"];

    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!("expected a JSON object, got {}", json_kind(&value)));
        };
        let has_label = Self::LABEL_KEYS
            .iter()
            .any(|k| map.get(*k).and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty()));
        if !has_label {
            return Err("missing string field \"structure\" or \"classification\"".into());
        }
        Ok(Structure(map))
    }

    /// The layout label, e.g. "form", "table" or "mixed".
    pub fn label(&self) -> &str {
        Self::LABEL_KEYS
            .iter()
            .find_map(|k| self.0.get(*k).and_then(Value::as_str))
            .unwrap_or("unknown")
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

// ── Stage 2: FieldSet ────────────────────────────────────────────────────

/// One identified field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Stable identifier used for region edits.
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<BoundingBox>,
    pub mode: ExtractionMode,
    /// Whatever else the model said about the field (confidence, value…).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ordered field descriptors produced by stage 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSet {
    pub fields: Vec<FieldDescriptor>,
    pub mode: ExtractionMode,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FieldSet {
    const LIST_KEYS: [&'static str; 2] = ["fields", "form_fields"];
    const NAME_KEYS: [&'static str; 3] = ["name", "label", "field_name"];
    const TYPE_KEYS: [&'static str; 2] = ["type", "data_type"];
    const REGION_KEYS: [&'static str; 3] = ["region", "bbox", "bounding_box"];

    /// Validate a stage 2 response and assign ids to fields that lack one.
    pub fn from_value(value: Value, mode: ExtractionMode) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err(format!("expected a JSON object, got {}", json_kind(&value)));
        };
        // Table-only documents answer with column headers under "tables" and no field list.
        let items = match Self::LIST_KEYS.iter().find(|k| map.get(**k).is_some_and(Value::is_array)) {
            Some(key) => match map.remove(*key) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            None if map.get("tables").is_some_and(Value::is_array) => Vec::new(),
            None => return Err("missing array field \"fields\"".into()),
        };
        map.remove("mode");

        let mut fields = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            fields.push(Self::parse_field(item, index, mode)?);
        }
        assign_unique_ids(&mut fields);

        Ok(FieldSet {
            fields,
            mode,
            extra: map,
        })
    }

    fn parse_field(item: Value, index: usize, mode: ExtractionMode) -> Result<FieldDescriptor, String> {
        let mut obj = match item {
            Value::String(name) if !name.trim().is_empty() => {
                let mut m = Map::new();
                m.insert("name".into(), Value::String(name));
                m
            }
            Value::Object(obj) => obj,
            other => {
                return Err(format!(
                    "field #{index}: expected an object or a name, got {}",
                    json_kind(&other)
                ))
            }
        };

        let name = take_first_string(&mut obj, &Self::NAME_KEYS)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| format!("field #{index}: missing \"name\""))?;
        let field_type = take_first_string(&mut obj, &Self::TYPE_KEYS).unwrap_or_else(|| "text".into());
        let region = Self::REGION_KEYS
            .iter()
            .find_map(|k| obj.remove(*k))
            .and_then(|v| BoundingBox::from_json(&v));
        let field_mode = obj
            .remove("mode")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(mode);
        // 0 marks "unassigned"; real ids start at 1.
        let id = obj
            .remove("id")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);

        Ok(FieldDescriptor {
            id,
            name: name.trim().to_string(),
            field_type,
            region,
            mode: field_mode,
            extra: obj,
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn field(&self, id: u32) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_mut(&mut self, id: u32) -> Option<&mut FieldDescriptor> {
        self.fields.iter_mut().find(|f| f.id == id)
    }

    /// Column headers of every table the model reported, as `(table name, headers)`.
    pub fn table_headers(&self) -> Vec<(String, Vec<String>)> {
        let Some(Value::Array(tables)) = self.extra.get("tables") else {
            return Vec::new();
        };
        tables
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                let name = ["table_name", "name", "description"]
                    .iter()
                    .find_map(|k| t.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Table {}", i + 1));
                let headers: Vec<String> = t
                    .get("headers")?
                    .as_array()?
                    .iter()
                    .filter_map(|h| match h {
                        Value::String(s) => Some(s.clone()),
                        other => other.get("name").and_then(Value::as_str).map(str::to_string),
                    })
                    .collect();
                Some((name, headers))
            })
            .collect()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Keep explicit unique ids, renumber zero and duplicate ids after the maximum.
///
/// When the ids run too close to `u32::MAX` to append after the maximum, every
/// field is renumbered `1..=n` in order.
fn assign_unique_ids(fields: &mut [FieldDescriptor]) {
    let max = fields.iter().map(|f| f.id).max().unwrap_or(0);
    let room = u32::try_from(fields.len())
        .ok()
        .and_then(|n| max.checked_add(n));
    if room.is_none() {
        for (field, id) in fields.iter_mut().zip(1..) {
            field.id = id;
        }
        return;
    }

    let mut seen = HashSet::new();
    let mut next = max + 1;
    for field in fields.iter_mut() {
        if field.id == 0 || !seen.insert(field.id) {
            field.id = next;
            seen.insert(next);
            next += 1;
        }
    }
}

// ── Stage 3: ExtractedData ───────────────────────────────────────────────

/// Field name → extracted value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedData(Map<String, Value>);

impl ExtractedData {
    /// Validate a stage 3 response.
    ///
    /// A top-level `extracted_data` (or `form_data`) object is unwrapped and
    /// any sibling `table_data` is kept under the same key. Every field name in
    /// `fields` that the model skipped is filled with `null`.
    pub fn from_value(value: Value, fields: Option<&FieldSet>) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err(format!("expected a JSON object, got {}", json_kind(&value)));
        };
        let wrapper = ["extracted_data", "form_data"]
            .into_iter()
            .find(|k| map.get(*k).is_some_and(Value::is_object));
        if let Some(key) = wrapper {
            let table_data = map.remove("table_data");
            if let Some(Value::Object(inner)) = map.remove(key) {
                map = inner;
            }
            if let Some(tables) = table_data {
                map.insert("table_data".into(), tables);
            }
        }
        if let Some(fields) = fields {
            for name in fields.names() {
                if !map.contains_key(name) {
                    map.insert(name.to_string(), Value::Null);
                }
            }
        }
        Ok(ExtractedData(map))
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        ExtractedData(map)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// A stage result tagged with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "result", rename_all = "snake_case")]
pub enum StageResult {
    Classification(Structure),
    FieldIdentification(FieldSet),
    Extraction(ExtractedData),
}

impl StageResult {
    pub fn stage(&self) -> Stage {
        match self {
            StageResult::Classification(_) => Stage::Classification,
            StageResult::FieldIdentification(_) => Stage::FieldIdentification,
            StageResult::Extraction(_) => Stage::Extraction,
        }
    }

    /// The untagged JSON payload.
    pub fn to_value(&self) -> Value {
        match self {
            StageResult::Classification(s) => s.to_value(),
            StageResult::FieldIdentification(f) => f.to_value(),
            StageResult::Extraction(d) => d.to_value(),
        }
    }
}

// ── Pipeline state ───────────────────────────────────────────────────────

/// One user feedback iteration on a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub stage: Stage,
    /// 1-based iteration counter per stage.
    pub iteration: u32,
    pub feedback: String,
    pub result_before: Option<Value>,
    pub result_after: Value,
    pub timestamp: DateTime<Utc>,
}

/// Everything the pipeline knows about one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub document_id: String,
    #[serde(default)]
    pub classification: Option<Structure>,
    #[serde(default)]
    pub field_identification: Option<FieldSet>,
    #[serde(default)]
    pub extraction: Option<ExtractedData>,
    #[serde(default)]
    pub stage_status: BTreeMap<Stage, StageStatus>,
    /// Stages whose current result was confirmed or corrected by a user.
    #[serde(default)]
    pub validated_at: BTreeMap<Stage, DateTime<Utc>>,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackEntry>,
    /// Set when the current extraction was assembled page by page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_merge: Option<MergeReport>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            classification: None,
            field_identification: None,
            extraction: None,
            stage_status: Stage::ALL.iter().map(|s| (*s, StageStatus::Pending)).collect(),
            validated_at: BTreeMap::new(),
            feedback_history: Vec::new(),
            page_merge: None,
            updated_at: Utc::now(),
        }
    }

    pub fn has_result(&self, stage: Stage) -> bool {
        match stage {
            Stage::Classification => self.classification.is_some(),
            Stage::FieldIdentification => self.field_identification.is_some(),
            Stage::Extraction => self.extraction.is_some(),
        }
    }

    pub fn result(&self, stage: Stage) -> Option<StageResult> {
        match stage {
            Stage::Classification => self.classification.clone().map(StageResult::Classification),
            Stage::FieldIdentification => self
                .field_identification
                .clone()
                .map(StageResult::FieldIdentification),
            Stage::Extraction => self.extraction.clone().map(StageResult::Extraction),
        }
    }

    /// Store a result, replacing any previous one for the same stage.
    ///
    /// A fresh model result invalidates any earlier user validation of that stage.
    pub fn set_result(&mut self, result: StageResult) {
        let stage = result.stage();
        match result {
            StageResult::Classification(s) => self.classification = Some(s),
            StageResult::FieldIdentification(f) => self.field_identification = Some(f),
            StageResult::Extraction(d) => self.extraction = Some(d),
        }
        self.validated_at.remove(&stage);
        self.set_status(stage, StageStatus::Done);
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stage_status.get(&stage).cloned().unwrap_or_default()
    }

    pub fn set_status(&mut self, stage: Stage, status: StageStatus) {
        self.stage_status.insert(stage, status);
        self.updated_at = Utc::now();
    }

    pub fn feedback_for(&self, stage: Stage) -> Vec<&FeedbackEntry> {
        self.feedback_history.iter().filter(|f| f.stage == stage).collect()
    }

    pub fn next_iteration(&self, stage: Stage) -> u32 {
        self.feedback_for(stage).len() as u32 + 1
    }
}

// ── Usage accounting ─────────────────────────────────────────────────────

/// Token and cost accounting for one completion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub document_id: Option<String>,
    pub stage: Stage,
    pub model: String,
    /// 1-based attempt number within one completion call.
    pub attempt: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// `None` when the attempt returned a response.
    #[serde(default)]
    pub error: Option<String>,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

fn take_first_string(obj: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    let mut found = None;
    for key in keys {
        match obj.remove(*key) {
            Some(Value::String(s)) if found.is_none() => found = Some(s),
            Some(other) if found.is_none() && !other.is_null() => found = Some(other.to_string()),
            _ => {}
        }
    }
    found
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_numbers_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_number(stage.number()).unwrap(), stage);
        }
        assert!(matches!(Stage::from_number(4), Err(Pdf2JsonError::InvalidStage(4))));
        assert!(matches!(Stage::from_number(0), Err(Pdf2JsonError::InvalidStage(0))));
    }

    #[test]
    fn structure_keeps_exact_json() {
        let raw = json!({"structure": "form", "confidence": 0.9});
        let s = Structure::from_value(raw.clone()).unwrap();
        assert_eq!(s.label(), "form");
        assert_eq!(serde_json::to_value(&s).unwrap(), raw);
    }

    #[test]
    fn structure_accepts_classification_key() {
        let s = Structure::from_value(json!({"classification": "table"})).unwrap();
        assert_eq!(s.label(), "table");
    }

    #[test]
    fn structure_rejects_wrong_shape() {
        assert!(Structure::from_value(json!(["form"])).is_err());
        assert!(Structure::from_value(json!({"confidence": 0.4})).is_err());
        assert!(Structure::from_value(json!({"structure": ""})).is_err());
    }

    #[test]
    fn fieldset_accepts_label_aliases_and_assigns_ids() {
        let fs = FieldSet::from_value(
            json!({
                "field_type": "form",
                "fields": [
                    {"label": "Name", "data_type": "text", "confidence": 0.9},
                    {"name": "Hire Date", "type": "date", "bbox": [10, 20, 110, 32]},
                    "Status"
                ]
            }),
            ExtractionMode::Spatial,
        )
        .unwrap();

        assert_eq!(fs.len(), 3);
        assert_eq!(fs.names().collect::<Vec<_>>(), ["Name", "Hire Date", "Status"]);
        assert_eq!(fs.fields[1].field_type, "date");
        assert_eq!(fs.fields[1].region, Some(BoundingBox::new(10.0, 20.0, 110.0, 32.0)));
        assert_eq!(fs.fields[2].field_type, "text");
        assert!(fs.fields.iter().all(|f| f.mode == ExtractionMode::Spatial));
        assert_eq!(fs.extra.get("field_type"), Some(&json!("form")));
        assert_eq!(fs.fields[0].extra.get("confidence"), Some(&json!(0.9)));

        let ids: HashSet<u32> = fs.fields.iter().map(|f| f.id).collect();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn fieldset_renumbers_duplicate_ids() {
        let fs = FieldSet::from_value(
            json!({"fields": [{"id": 4, "name": "A"}, {"id": 4, "name": "B"}, {"name": "C"}]}),
            ExtractionMode::Text,
        )
        .unwrap();
        assert_eq!(fs.fields[0].id, 4);
        assert_eq!(fs.fields[1].id, 5);
        assert_eq!(fs.fields[2].id, 6);
    }

    #[test]
    fn fieldset_renumbers_when_ids_reach_the_top() {
        let fs = FieldSet::from_value(
            json!({"fields": [{"id": 4294967295u64, "name": "A"}, {"name": "B"}]}),
            ExtractionMode::Text,
        )
        .unwrap();
        let ids: Vec<u32> = fs.fields.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn fieldset_survives_serde_round_trip() {
        let fs = FieldSet::from_value(
            json!({"fields": [{"name": "Total", "type": "currency", "region": {"x0": 1, "y0": 2, "x1": 3, "y1": 4}}]}),
            ExtractionMode::Hybrid,
        )
        .unwrap();
        let back: FieldSet = serde_json::from_value(fs.to_value()).unwrap();
        assert_eq!(back, fs);
    }

    #[test]
    fn fieldset_rejects_missing_fields_array() {
        assert!(FieldSet::from_value(json!({"summary": "none"}), ExtractionMode::Text).is_err());
        assert!(FieldSet::from_value(json!({"fields": [{"type": "text"}]}), ExtractionMode::Text).is_err());
        assert!(FieldSet::from_value(json!({"fields": [42]}), ExtractionMode::Text).is_err());
    }

    #[test]
    fn extracted_data_unwraps_and_fills_missing_fields() {
        let fs = FieldSet::from_value(
            json!({"fields": [{"name": "Name"}, {"name": "Date"}]}),
            ExtractionMode::Text,
        )
        .unwrap();
        let data = ExtractedData::from_value(
            json!({"extracted_data": {"Name": "Jane Roe"}, "extraction_confidence": 0.8}),
            Some(&fs),
        )
        .unwrap();
        assert_eq!(data.get("Name"), Some(&json!("Jane Roe")));
        assert_eq!(data.get("Date"), Some(&Value::Null));
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn fieldset_accepts_table_only_answers() {
        let fs = FieldSet::from_value(
            json!({
                "form_fields": [{"field_name": "Employee Name"}],
                "tables": [
                    {"table_name": "Rates", "headers": ["Rate", "Description"]},
                    {"headers": [{"name": "Code"}]}
                ]
            }),
            ExtractionMode::Text,
        )
        .unwrap();
        assert_eq!(fs.names().collect::<Vec<_>>(), ["Employee Name"]);
        assert_eq!(
            fs.table_headers(),
            vec![
                ("Rates".to_string(), vec!["Rate".to_string(), "Description".to_string()]),
                ("Table 2".to_string(), vec!["Code".to_string()]),
            ]
        );

        let tables_only = FieldSet::from_value(json!({"tables": []}), ExtractionMode::Text).unwrap();
        assert!(tables_only.is_empty());
    }

    #[test]
    fn extracted_data_keeps_table_rows_beside_unwrapped_fields() {
        let data = ExtractedData::from_value(
            json!({
                "extracted_data": {"Employee Name": "Caroline Jones"},
                "table_data": [{"table_name": "Rates", "rows": [{"Rate": "19.00"}]}]
            }),
            None,
        )
        .unwrap();
        assert_eq!(data.get("Employee Name"), Some(&json!("Caroline Jones")));
        assert_eq!(data.get("table_data").unwrap()[0]["rows"][0]["Rate"], json!("19.00"));
    }

    #[test]
    fn extracted_data_rejects_non_objects() {
        assert!(ExtractedData::from_value(json!("Jane"), None).is_err());
    }

    #[test]
    fn set_result_overwrites_and_clears_validation() {
        let mut state = PipelineState::new("doc");
        state.validated_at.insert(Stage::Classification, Utc::now());
        state.set_result(StageResult::Classification(
            Structure::from_value(json!({"structure": "form"})).unwrap(),
        ));
        state.set_result(StageResult::Classification(
            Structure::from_value(json!({"structure": "table"})).unwrap(),
        ));
        assert_eq!(state.classification.as_ref().unwrap().label(), "table");
        assert_eq!(state.status(Stage::Classification), StageStatus::Done);
        assert!(!state.validated_at.contains_key(&Stage::Classification));
    }

    #[test]
    fn state_serialises_stage_keys_as_strings() {
        let mut state = PipelineState::new("doc");
        state.set_status(
            Stage::Extraction,
            StageStatus::Failed {
                error: "boom".into(),
            },
        );
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["stage_status"]["extraction"]["state"], json!("failed"));
        assert_eq!(v["stage_status"]["classification"]["state"], json!("pending"));
        let back: PipelineState = serde_json::from_value(v).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn extraction_mode_parses_aliases() {
        assert_eq!("original".parse::<ExtractionMode>().unwrap(), ExtractionMode::Text);
        assert_eq!("Hybrid".parse::<ExtractionMode>().unwrap(), ExtractionMode::Hybrid);
        assert!("ocr".parse::<ExtractionMode>().is_err());
    }
}
