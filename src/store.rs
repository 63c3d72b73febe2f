//! The persisted benchmark: stored results per method, metric values,
//! ground truths, the append-only session list and the dataset digest.
//!
//! Only `merge` mutates results and sessions; everything else reads.

use crate::{
    config::BenchParameters,
    dataset::{Column, Dataset},
    definition::{
        DefinitionSet, MethodDefinition, MethodRecord, MetricDefinition, MetricRecord,
        ParamEntry, DEFAULT_ASSAY,
    },
    metrics::MetricValue,
};
use benchkeeper_protocol::{EngineError, ErrorCode, Fingerprint, Label, SessionIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub label: Label,
    /// The definition as it was when these results were computed.
    pub definition: MethodRecord,
    pub fingerprint: Fingerprint,
    pub session: SessionIndex,
    #[serde(default)]
    pub raw: Option<Value>,
    pub assays: BTreeMap<String, Column>,
}

impl StoredResult {
    /// Assay names implied by the recorded post-processor keys.
    pub fn expected_assays(&self) -> Vec<String> {
        if self.definition.post.is_empty() {
            vec![DEFAULT_ASSAY.to_string()]
        } else {
            self.definition.post.iter().map(|p| p.key.clone()).collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValueRecord {
    pub value: MetricValue,
    pub method_session: SessionIndex,
    pub session: SessionIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMetric {
    pub definition: MetricRecord,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub values: BTreeMap<Label, MetricValueRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub package: String,
    pub version: String,
    pub build: String,
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub method_versions: BTreeMap<Label, Option<String>>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub index: SessionIndex,
    pub methods: Vec<Label>,
    /// `assay/metric` keys with at least one value computed in this session.
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<Label, Vec<ParamEntry>>,
    #[serde(default)]
    pub dataset_digest: Option<String>,
    pub environment: EnvironmentSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub method_count: usize,
    pub methods: Vec<MethodSummary>,
    pub metric_count: usize,
    pub session_count: usize,
    pub dataset_digest: Option<String>,
    pub has_dataset_copy: bool,
    pub parameters: BenchParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodSummary {
    pub label: Label,
    pub session: SessionIndex,
    pub assays: Vec<String>,
    pub rows: usize,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultStore {
    results: BTreeMap<Label, StoredResult>,
    metrics: BTreeMap<String, BTreeMap<Label, StoredMetric>>,
    ground_truths: BTreeMap<String, Column>,
    sessions: Vec<Arc<Session>>,
    dataset_digest: Option<String>,
    dataset: Option<Dataset>,
    parameters: BenchParameters,
}

fn corrupt(message: String) -> EngineError {
    EngineError::new(ErrorCode::StoreCorrupt, message)
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters(parameters: BenchParameters) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    pub fn load_from_path(path: &str) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::new(
                ErrorCode::Io,
                format!("Could not read store file '{path}': {e}"),
            )
        })?;
        let store: Self = serde_json::from_str(&text)
            .map_err(|e| corrupt(format!("Could not parse store JSON '{path}': {e}")))?;
        store.verify()?;
        Ok(store)
    }

    pub fn save_to_path(&self, path: &str) -> Result<(), EngineError> {
        let text = serde_json::to_string_pretty(self).map_err(|e| {
            EngineError::new(
                ErrorCode::Internal,
                format!("Could not serialize store: {e}"),
            )
        })?;
        std::fs::write(path, text).map_err(|e| {
            EngineError::new(
                ErrorCode::Io,
                format!("Could not write store file '{path}': {e}"),
            )
        })
    }

    pub fn results(&self) -> &BTreeMap<Label, StoredResult> {
        &self.results
    }

    pub fn result(&self, label: &str) -> Option<&StoredResult> {
        self.results.get(label)
    }

    pub fn labels(&self) -> Vec<Label> {
        self.results.keys().cloned().collect()
    }

    pub fn metric(&self, assay: &str, label: &str) -> Option<&StoredMetric> {
        self.metrics.get(assay).and_then(|m| m.get(label))
    }

    pub fn metrics(&self) -> impl Iterator<Item = (&str, &str, &StoredMetric)> {
        self.metrics.iter().flat_map(|(assay, by_label)| {
            by_label
                .iter()
                .map(move |(label, metric)| (assay.as_str(), label.as_str(), metric))
        })
    }

    pub fn ground_truths(&self) -> &BTreeMap<String, Column> {
        &self.ground_truths
    }

    pub fn sessions(&self) -> &[Arc<Session>] {
        &self.sessions
    }

    pub fn session(&self, index: SessionIndex) -> Option<&Session> {
        self.sessions.get(index).map(|s| s.as_ref())
    }

    pub fn next_session_index(&self) -> SessionIndex {
        self.sessions.len()
    }

    pub fn dataset_digest(&self) -> Option<&str> {
        self.dataset_digest.as_deref()
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    pub fn parameters(&self) -> &BenchParameters {
        &self.parameters
    }

    pub fn set_parameter(&mut self, name: &str, value: &Value) -> Result<String, EngineError> {
        self.parameters.set_parameter(name, value)
    }

    pub fn method_fingerprints(&self) -> BTreeMap<Label, Fingerprint> {
        self.results
            .iter()
            .map(|(label, result)| (label.clone(), result.fingerprint.clone()))
            .collect()
    }

    pub fn metric_fingerprints(&self) -> BTreeMap<(String, Label), Fingerprint> {
        self.metrics()
            .map(|(assay, label, metric)| {
                (
                    (assay.to_string(), label.to_string()),
                    metric.fingerprint.clone(),
                )
            })
            .collect()
    }

    /// Rebuilds the definitions the stored results were computed from. The
    /// callables come back unbound.
    pub fn recorded_definitions(&self) -> Result<DefinitionSet, EngineError> {
        DefinitionSet::from_parts(
            self.results
                .values()
                .map(|r| MethodDefinition::from_record(&r.definition))
                .collect(),
            self.metrics()
                .map(|(_, _, m)| MetricDefinition::from_record(&m.definition))
                .collect(),
        )
    }

    /// Structural integrity check; anything found here aborts an update.
    pub fn verify(&self) -> Result<(), EngineError> {
        for (idx, session) in self.sessions.iter().enumerate() {
            if session.index != idx {
                return Err(corrupt(format!(
                    "Session at position {idx} claims index {}",
                    session.index
                )));
            }
        }
        for (label, result) in &self.results {
            if &result.label != label || &result.definition.label != label {
                return Err(corrupt(format!(
                    "Stored result under '{label}' is labelled '{}'",
                    result.label
                )));
            }
            if result.session >= self.sessions.len() {
                return Err(corrupt(format!(
                    "Result '{label}' references missing session {}",
                    result.session
                )));
            }
            let mut expected = result.expected_assays();
            expected.sort();
            let actual: Vec<String> = result.assays.keys().cloned().collect();
            if expected != actual {
                return Err(corrupt(format!(
                    "Result '{label}' has assays {actual:?}, its definition records {expected:?}"
                )));
            }
        }
        for (assay, label, metric) in self.metrics() {
            if metric.definition.assay != assay || metric.definition.label != label {
                return Err(corrupt(format!(
                    "Metric stored under '{assay}/{label}' is '{}/{}'",
                    metric.definition.assay, metric.definition.label
                )));
            }
            for (method, value) in &metric.values {
                if value.session >= self.sessions.len() {
                    return Err(corrupt(format!(
                        "Metric '{assay}/{label}' value for '{method}' references missing session {}",
                        value.session
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> StoreSummary {
        StoreSummary {
            method_count: self.results.len(),
            methods: self
                .results
                .values()
                .map(|r| MethodSummary {
                    label: r.label.clone(),
                    session: r.session,
                    assays: r.assays.keys().cloned().collect(),
                    rows: r.assays.values().map(|c| c.len()).max().unwrap_or(0),
                    version: r.definition.version.clone(),
                })
                .collect(),
            metric_count: self.metrics().count(),
            session_count: self.sessions.len(),
            dataset_digest: self.dataset_digest.clone(),
            has_dataset_copy: self.dataset.is_some(),
            parameters: self.parameters.clone(),
        }
    }

    pub(crate) fn insert_result(&mut self, result: StoredResult) {
        self.results.insert(result.label.clone(), result);
    }

    pub(crate) fn remove_result(&mut self, label: &str) -> Option<StoredResult> {
        for by_label in self.metrics.values_mut() {
            for metric in by_label.values_mut() {
                metric.values.remove(label);
            }
        }
        self.results.remove(label)
    }

    /// Inserts or replaces the metric definition, keeping values only when
    /// the fingerprint is unchanged.
    pub(crate) fn upsert_metric(&mut self, definition: MetricRecord, fingerprint: Fingerprint) {
        let by_label = self.metrics.entry(definition.assay.clone()).or_default();
        match by_label.get_mut(&definition.label) {
            Some(existing) if existing.fingerprint == fingerprint => {
                existing.definition = definition;
            }
            _ => {
                by_label.insert(
                    definition.label.clone(),
                    StoredMetric {
                        definition,
                        fingerprint,
                        values: BTreeMap::new(),
                    },
                );
            }
        }
    }

    pub(crate) fn set_metric_value(
        &mut self,
        assay: &str,
        label: &str,
        method: &str,
        record: MetricValueRecord,
    ) {
        if let Some(metric) = self.metrics.get_mut(assay).and_then(|m| m.get_mut(label)) {
            metric.values.insert(method.to_string(), record);
        }
    }

    pub(crate) fn remove_metric(&mut self, assay: &str, label: &str) -> Option<StoredMetric> {
        let by_label = self.metrics.get_mut(assay)?;
        let ret = by_label.remove(label);
        if by_label.is_empty() {
            self.metrics.remove(assay);
        }
        ret
    }

    pub(crate) fn record_dataset(&mut self, digest: String, data: Option<&Dataset>) {
        self.dataset_digest = Some(digest);
        if let Some(data) = data {
            for (assay, truth) in &data.ground_truths {
                self.ground_truths.insert(assay.clone(), truth.clone());
            }
            if self.parameters.keep_dataset {
                self.dataset = Some(data.clone());
            }
        }
    }

    pub(crate) fn append_session(&mut self, session: Session) -> SessionIndex {
        let index = self.sessions.len();
        debug_assert_eq!(session.index, index);
        self.sessions.push(Arc::new(session));
        index
    }
}
