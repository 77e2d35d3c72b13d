//! Bulk NDJSON import with batching and conflict policy.

use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::engines::{extract_vector_size, PointKey, PointRecord, VectorIndex};
use crate::error::ApiError;
use crate::metrics;

const BATCH_SIZE_DEFAULT: usize = 1000;
const MAX_ERROR_EXAMPLES_DEFAULT: usize = 5;
/// Bad lines are echoed back truncated to this many characters.
const ERROR_LINE_PREVIEW_CHARS: usize = 500;

fn default_batch_size() -> usize {
    BATCH_SIZE_DEFAULT
}

fn default_max_error_examples() -> usize {
    MAX_ERROR_EXAMPLES_DEFAULT
}

fn default_on_conflict() -> String {
    "upsert".to_string()
}

/// Body of `POST /collections/import`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    pub collection: String,
    /// Raw NDJSON, one `{id?, vector, payload?}` object per line.
    pub jsonl: String,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default = "default_max_error_examples")]
    pub max_error_examples: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// `upsert` (default) or `skip`.
    #[serde(default = "default_on_conflict")]
    pub on_conflict: String,
}

/// Tunables shared by the inline and file-upload variants.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub continue_on_error: bool,
    pub max_error_examples: usize,
    pub batch_size: usize,
    pub on_conflict: String,
}

impl From<&ImportRequest> for ImportOptions {
    fn from(req: &ImportRequest) -> Self {
        Self {
            continue_on_error: req.continue_on_error,
            max_error_examples: req.max_error_examples,
            batch_size: req.batch_size,
            on_conflict: req.on_conflict.clone(),
        }
    }
}

#[derive(Debug)]
struct ParsedRow {
    id: Option<PointKey>,
    vector: Vec<f32>,
    payload: Option<Value>,
}

fn parse_line(line: &str, expected_dim: u64) -> Result<ParsedRow, String> {
    let obj: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(num) => Some(PointKey::Num(num)),
            None => return Err("id must be a non-negative integer or string".to_string()),
        },
        Some(Value::String(s)) => Some(PointKey::Str(s.clone())),
        Some(_) => return Err("id must be a non-negative integer or string".to_string()),
    };

    let vector = obj
        .get("vector")
        .and_then(Value::as_array)
        .ok_or_else(|| "vector must be a list of floats".to_string())?;
    let vector: Vec<f32> = vector
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| "vector must be a list of floats".to_string())?;

    if expected_dim > 0 && vector.len() as u64 != expected_dim {
        return Err(format!(
            "vector dimension mismatch, expected {expected_dim}, got {}",
            vector.len()
        ));
    }

    Ok(ParsedRow {
        id,
        vector,
        payload: obj.get("payload").filter(|p| !p.is_null()).cloned(),
    })
}

fn line_preview(line: &str) -> String {
    line.chars().take(ERROR_LINE_PREVIEW_CHARS).collect()
}

/// Detect gzip by its magic header and inflate when present.
pub fn maybe_gunzip(raw: &[u8]) -> Result<Vec<u8>, ApiError> {
    if raw.len() >= 2 && raw[0] == 0x1F && raw[1] == 0x8B {
        let mut decoder = flate2::read::GzDecoder::new(raw);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ApiError::BadRequest(format!("failed to gunzip: {e}")))?;
        Ok(out)
    } else {
        Ok(raw.to_vec())
    }
}

/// Parse and batch-write an NDJSON document into a collection.
pub async fn import_jsonl(
    index: &Arc<dyn VectorIndex>,
    collection: &str,
    jsonl: &str,
    options: &ImportOptions,
) -> Result<Value, ApiError> {
    if !index.collection_exists(collection).await.map_err(ApiError::from)? {
        return Err(ApiError::NotFound("collection not found".to_string()));
    }

    let info = index.get_info(collection).await.map_err(ApiError::from)?;
    let expected_dim = extract_vector_size(&info);

    let lines: Vec<&str> = jsonl.lines().filter(|l| !l.trim().is_empty()).collect();
    let total_lines = lines.len();

    let mut rows: Vec<ParsedRow> = Vec::with_capacity(total_lines);
    let mut errors: Vec<Value> = Vec::new();
    let started = Instant::now();

    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;
        match parse_line(line, expected_dim) {
            Ok(row) => rows.push(row),
            Err(error) => {
                if !options.continue_on_error {
                    return Err(ApiError::BadRequest(format!(
                        "invalid jsonl line at {line_no}: {error}"
                    )));
                }
                if errors.len() < options.max_error_examples {
                    errors.push(serde_json::json!({
                        "line_no": line_no,
                        "error": error,
                        "line": line_preview(line),
                    }));
                }
                metrics::IMPORT_SKIPPED_TOTAL
                    .with_label_values(&[collection, "error"])
                    .inc();
            }
        }
    }

    let parsed_rows = rows.len();
    let mut imported = 0usize;
    let mut batches = 0usize;
    let mut skipped_conflicts = 0usize;
    let batch_size = options.batch_size.max(1);
    let skip_conflicts = options.on_conflict.to_lowercase() == "skip";

    for batch in rows.chunks(batch_size) {
        let mut kept: Vec<&ParsedRow> = batch.iter().collect();

        if skip_conflicts {
            // Conflict checks only cover rows with explicit ids; generated
            // ids cannot collide.
            let check_ids: Vec<PointKey> =
                batch.iter().filter_map(|r| r.id.clone()).collect();
            let existing: HashSet<PointKey> = if check_ids.is_empty() {
                HashSet::new()
            } else {
                index
                    .retrieve(collection, &check_ids, false, false)
                    .await
                    .map(|points| points.into_iter().map(|p| p.id).collect())
                    .unwrap_or_default()
            };
            kept = batch
                .iter()
                .filter(|row| {
                    let conflict = row
                        .id
                        .as_ref()
                        .map(|id| existing.contains(id))
                        .unwrap_or(false);
                    if conflict {
                        skipped_conflicts += 1;
                        metrics::IMPORT_SKIPPED_TOTAL
                            .with_label_values(&[collection, "conflict"])
                            .inc();
                    }
                    !conflict
                })
                .collect();
        }

        if kept.is_empty() {
            continue;
        }

        let points: Vec<PointRecord> = kept
            .iter()
            .map(|row| PointRecord {
                id: row
                    .id
                    .clone()
                    .unwrap_or_else(|| PointKey::Str(uuid::Uuid::new_v4().to_string())),
                vector: Some(row.vector.clone()),
                payload: row.payload.clone(),
            })
            .collect();
        let written = points.len();
        index.upsert(collection, points).await.map_err(ApiError::from)?;
        batches += 1;
        imported += written;
        metrics::IMPORT_BATCHES_TOTAL.with_label_values(&[collection]).inc();
        metrics::IMPORT_ROWS_TOTAL
            .with_label_values(&[collection])
            .inc_by(written as f64);
    }

    metrics::IMPORT_DURATION_SECONDS
        .with_label_values(&[collection])
        .observe(started.elapsed().as_secs_f64());

    Ok(serde_json::json!({
        "collection": collection,
        "imported": imported,
        "total_lines": total_lines,
        "skipped": (total_lines - parsed_rows) + skipped_conflicts,
        "conflicts_skipped": skipped_conflicts,
        "batches": batches,
        "errors": errors,
    }))
}

/// Parse a flat `filters` JSON object from its query-string form.
pub fn parse_filters_param(raw: Option<&str>) -> Result<Option<Map<String, Value>>, ApiError> {
    match raw {
        None | Some("") => Ok(None),
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            _ => Err(ApiError::BadRequest(
                "filters must be a valid JSON string".to_string(),
            )),
        },
    }
}
