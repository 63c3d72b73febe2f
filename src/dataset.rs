//! The shared input every method runs against.

use crate::fingerprint::fingerprint_dataset;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One result or input vector; `None` entries are missing values.
pub type Column = Vec<Option<f64>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub columns: BTreeMap<String, Column>,
    pub attributes: BTreeMap<String, Value>,
    /// Ground-truth vectors keyed by assay name, consumed by metrics.
    pub ground_truths: BTreeMap<String, Column>,
}

impl Dataset {
    pub fn digest(&self) -> String {
        fingerprint_dataset(self)
    }

    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Could not read dataset file '{path}': {e}"))?;
        serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("Could not parse dataset JSON '{path}': {e}"))
    }
}

/// What the dataset provider hands over for one update.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetInput {
    Full(Dataset),
    /// Enough for the integrity check, not for recomputation.
    DigestOnly(String),
}

impl DatasetInput {
    pub fn digest(&self) -> String {
        match self {
            DatasetInput::Full(data) => data.digest(),
            DatasetInput::DigestOnly(digest) => digest.clone(),
        }
    }

    pub fn data(&self) -> Option<&Dataset> {
        match self {
            DatasetInput::Full(data) => Some(data),
            DatasetInput::DigestOnly(_) => None,
        }
    }
}

/// Interprets a raw method output as a numeric column.
pub fn column_from_value(value: &Value) -> Option<Column> {
    let items = value.as_array()?;
    items
        .iter()
        .map(|item| match item {
            Value::Null => Some(None),
            other => other.as_f64().map(Some),
        })
        .collect()
}
