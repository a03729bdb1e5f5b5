use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ProcessingConfig;

/// Progress callback granularity, in rows. Batching bounds update volume
/// on large inputs; the callback also fires once at the end of the run.
pub const PROGRESS_EVERY_ROWS: u64 = 100;

/// Upper bound on the number of surviving rows echoed back in the result.
const OUTPUT_PREVIEW_ROWS: usize = 50;

/// Unrecoverable pipeline errors. Only raised in strict mode; relaxed
/// mode counts offending rows and continues.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Row {row} rejected: {reason}")]
    RowValidation { row: usize, reason: String },
}

/// Aggregate statistics over the configured numeric field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericStats {
    pub field: String,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Row counts and aggregates produced by one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutputResult {
    pub total_processed: u64,
    pub total_valid: u64,
    pub total_invalid: u64,
    pub duplicates_removed: u64,
    pub nulls_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_stats: Option<NumericStats>,
    /// First surviving rows, bounded to keep the stored result small.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_preview: Vec<Value>,
}

enum Verdict {
    Keep,
    Invalid(String),
    NullDropped,
}

/// Run the validation/dedup/aggregation pipeline over `rows`.
///
/// Pure and synchronous; invoked once per lease attempt. `on_progress`
/// receives the processed-row count every [`PROGRESS_EVERY_ROWS`] rows
/// and once at the end.
pub fn process(
    rows: &[Value],
    config: &ProcessingConfig,
    mut on_progress: impl FnMut(u64),
) -> Result<OutputResult, PipelineError> {
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut result = OutputResult {
        total_processed: rows.len() as u64,
        ..OutputResult::default()
    };
    let mut numeric_acc = NumericAcc::default();

    for (idx, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            if config.strict_mode {
                return Err(PipelineError::RowValidation {
                    row: idx,
                    reason: "row is not an object".to_string(),
                });
            }
            result.total_invalid += 1;
            report_batch(idx, rows.len(), &mut on_progress);
            continue;
        };

        match check_fields(obj, config) {
            Verdict::Invalid(reason) => {
                if config.strict_mode {
                    return Err(PipelineError::RowValidation { row: idx, reason });
                }
                result.total_invalid += 1;
            }
            Verdict::NullDropped => result.nulls_dropped += 1,
            Verdict::Keep => {
                let is_duplicate = !config.dedupe_on.is_empty() && {
                    let key: Vec<String> = config
                        .dedupe_on
                        .iter()
                        .map(|field| obj.get(field).map(key_part).unwrap_or_default())
                        .collect();
                    !seen.insert(key)
                };

                if is_duplicate {
                    result.duplicates_removed += 1;
                } else {
                    if let Some(field) = &config.numeric_field {
                        if let Some(value) = obj.get(field).and_then(numeric_value) {
                            numeric_acc.push(value);
                        }
                    }
                    if result.output_preview.len() < OUTPUT_PREVIEW_ROWS {
                        result.output_preview.push(row.clone());
                    }
                    result.total_valid += 1;
                }
            }
        }

        report_batch(idx, rows.len(), &mut on_progress);
    }

    if let Some(field) = &config.numeric_field {
        result.numeric_stats = numeric_acc.finish(field);
    }

    on_progress(rows.len() as u64);
    Ok(result)
}

/// Fire the progress callback at batch boundaries (never for the final
/// row, which is reported by the end-of-run call).
fn report_batch(idx: usize, total: usize, on_progress: &mut impl FnMut(u64)) {
    let processed = (idx + 1) as u64;
    if processed % PROGRESS_EVERY_ROWS == 0 && processed < total as u64 {
        on_progress(processed);
    }
}

/// Validate required fields and the drop-nulls policy for one row.
fn check_fields(obj: &serde_json::Map<String, Value>, config: &ProcessingConfig) -> Verdict {
    for field in &config.required_fields {
        match obj.get(field) {
            None => return Verdict::Invalid(format!("missing required field `{field}`")),
            Some(value) if is_null(value) => {
                // A null in a required field is a null-drop when the job
                // opted into drop-nulls, an invalid row otherwise.
                if config.drop_nulls {
                    return Verdict::NullDropped;
                }
                return Verdict::Invalid(format!("required field `{field}` is null"));
            }
            Some(_) => {}
        }
    }

    if config.drop_nulls && obj.values().any(is_null) {
        return Verdict::NullDropped;
    }

    Verdict::Keep
}

/// Null semantics: JSON null, or a string that is blank after trimming.
fn is_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Stringified form of a value for the dedupe key tuple.
fn key_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numbers are taken as-is; strings are accepted when parseable as f64.
fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Default)]
struct NumericAcc {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

impl NumericAcc {
    fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
    }

    fn finish(self, field: &str) -> Option<NumericStats> {
        if self.count == 0 {
            return None;
        }
        Some(NumericStats {
            field: field.to_string(),
            sum: self.sum,
            avg: self.sum / self.count as f64,
            min: self.min,
            max: self.max,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn rows(value: Value) -> Vec<Value> {
        value.as_array().cloned().unwrap()
    }

    fn config() -> ProcessingConfig {
        ProcessingConfig::default()
    }

    #[test]
    fn dedupes_and_drops_nulls() {
        let rows = rows(json!([
            {"id": 1, "email": "a@x.com"},
            {"id": 1, "email": "a@x.com"},
            {"id": 2, "email": ""},
        ]));
        let config = ProcessingConfig {
            required_fields: vec!["email".into()],
            dedupe_on: vec!["id".into()],
            drop_nulls: true,
            ..config()
        };

        let result = process(&rows, &config, |_| {}).unwrap();
        assert_eq!(result.total_processed, 3);
        assert_eq!(result.total_valid, 1);
        assert_eq!(result.duplicates_removed, 1);
        assert_eq!(result.nulls_dropped, 1);
        assert_eq!(result.total_invalid, 0);
    }

    #[test]
    fn blank_required_field_is_invalid_without_drop_nulls() {
        let rows = rows(json!([{"id": 2, "email": ""}]));
        let config = ProcessingConfig {
            required_fields: vec!["email".into()],
            ..config()
        };

        let result = process(&rows, &config, |_| {}).unwrap();
        assert_eq!(result.total_invalid, 1);
        assert_eq!(result.nulls_dropped, 0);
    }

    #[test]
    fn missing_required_field_is_invalid_even_with_drop_nulls() {
        let rows = rows(json!([{"id": 3}]));
        let config = ProcessingConfig {
            required_fields: vec!["email".into()],
            drop_nulls: true,
            ..config()
        };

        let result = process(&rows, &config, |_| {}).unwrap();
        assert_eq!(result.total_invalid, 1);
        assert_eq!(result.nulls_dropped, 0);
    }

    #[test]
    fn strict_mode_aborts_on_first_invalid_row() {
        let rows = rows(json!([
            {"email": "a@x.com"},
            {"name": "no email"},
            {"email": "b@x.com"},
        ]));
        let config = ProcessingConfig {
            required_fields: vec!["email".into()],
            strict_mode: true,
            ..config()
        };

        let err = process(&rows, &config, |_| {}).unwrap_err();
        assert_matches!(err, PipelineError::RowValidation { row: 1, .. });
    }

    #[test]
    fn non_object_rows_are_invalid() {
        let rows = rows(json!([42, "text", {"id": 1}]));
        let result = process(&rows, &config(), |_| {}).unwrap();
        assert_eq!(result.total_invalid, 2);
        assert_eq!(result.total_valid, 1);
    }

    #[test]
    fn numeric_stats_accept_numbers_and_parseable_strings() {
        let rows = rows(json!([
            {"amount": 10},
            {"amount": "20.5"},
            {"amount": "not a number"},
            {"amount": 5},
        ]));
        let config = ProcessingConfig {
            numeric_field: Some("amount".into()),
            ..config()
        };

        let result = process(&rows, &config, |_| {}).unwrap();
        let stats = result.numeric_stats.unwrap();
        assert_eq!(stats.field, "amount");
        assert_eq!(stats.sum, 35.5);
        assert_eq!(stats.min, 5.0);
        assert_eq!(stats.max, 20.5);
        assert!((stats.avg - 35.5 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn numeric_stats_omitted_when_no_value_parses() {
        let rows = rows(json!([{"amount": "n/a"}]));
        let config = ProcessingConfig {
            numeric_field: Some("amount".into()),
            ..config()
        };

        let result = process(&rows, &config, |_| {}).unwrap();
        assert!(result.numeric_stats.is_none());
    }

    #[test]
    fn dedupe_key_covers_multiple_fields_in_order() {
        let rows = rows(json!([
            {"a": 1, "b": 2},
            {"a": 1, "b": 3},
            {"a": 1, "b": 2},
        ]));
        let config = ProcessingConfig {
            dedupe_on: vec!["a".into(), "b".into()],
            ..config()
        };

        let result = process(&rows, &config, |_| {}).unwrap();
        assert_eq!(result.total_valid, 2);
        assert_eq!(result.duplicates_removed, 1);
    }

    #[test]
    fn preview_is_bounded() {
        let rows: Vec<Value> = (0..120).map(|i| json!({"id": i})).collect();
        let result = process(&rows, &config(), |_| {}).unwrap();
        assert_eq!(result.total_valid, 120);
        assert_eq!(result.output_preview.len(), 50);
    }

    #[test]
    fn progress_fires_per_batch_and_at_end() {
        let rows: Vec<Value> = (0..250).map(|i| json!({"id": i})).collect();
        let mut calls = Vec::new();
        process(&rows, &config(), |processed| calls.push(processed)).unwrap();
        assert_eq!(calls, vec![100, 200, 250]);
    }

    #[test]
    fn empty_input_yields_zero_counts() {
        let result = process(&[], &config(), |_| {}).unwrap();
        assert_eq!(result.total_processed, 0);
        assert_eq!(result.total_valid, 0);
        assert!(result.output_preview.is_empty());
    }
}
