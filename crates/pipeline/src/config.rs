use serde::{Deserialize, Serialize};

/// Per-job processing configuration, supplied at submission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessingConfig {
    /// Field names that must be present and non-null on every row.
    pub required_fields: Vec<String>,

    /// Drop rows containing any null-valued field (counted separately
    /// from invalid rows).
    pub drop_nulls: bool,

    /// Ordered field names forming the duplicate-detection key. Later
    /// occurrences of a key tuple are dropped.
    pub dedupe_on: Vec<String>,

    /// Field to aggregate sum/avg/min/max over surviving rows.
    pub numeric_field: Option<String>,

    /// Abort the whole run on the first invalid row instead of counting
    /// it and continuing.
    pub strict_mode: bool,
}
