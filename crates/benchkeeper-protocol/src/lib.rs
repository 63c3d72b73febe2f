//! Machine-readable contracts shared by the benchkeeper engine, its CLI and
//! whatever presentation layer renders a staleness report.
//!
//! Everything here is plain serde data: no callables, no engine state.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

pub type Label = String;
pub type SessionIndex = usize;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    DatasetMissing,
    CallableFailure,
    FingerprintAmbiguous,
    LabelCollision,
    DatasetMismatch,
    GroundTruthMissing,
    InvalidInput,
    NotFound,
    StoreCorrupt,
    Io,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// True for failures that are contained to one method or metric value.
    pub fn is_local(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::DatasetMissing | ErrorCode::CallableFailure | ErrorCode::GroundTruthMissing
        )
    }
}

/// A semantically distinct part of a method or metric definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Function,
    Params,
    Meta,
    Post,
    Version,
}

impl Component {
    pub const METHOD: [Component; 5] = [
        Component::Function,
        Component::Params,
        Component::Meta,
        Component::Post,
        Component::Version,
    ];
    pub const METRIC: [Component; 2] = [Component::Function, Component::Params];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Function => "function",
            Component::Params => "params",
            Component::Meta => "meta",
            Component::Post => "post",
            Component::Version => "version",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content digest of one component. `None` marks a component that could not
/// be serialized deterministically; it never compares equal to anything.
pub type ComponentDigest = Option<String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Fingerprint {
    pub components: BTreeMap<Component, ComponentDigest>,
}

impl Fingerprint {
    pub fn insert(&mut self, component: Component, digest: ComponentDigest) {
        self.components.insert(component, digest);
    }

    pub fn get(&self, component: Component) -> Option<&ComponentDigest> {
        self.components.get(&component)
    }

    pub fn ambiguous(&self) -> Vec<Component> {
        self.components
            .iter()
            .filter(|(_, digest)| digest.is_none())
            .map(|(component, _)| *component)
            .collect()
    }

    /// Component-wise comparison over the union of both component sets.
    pub fn compare(&self, stored: &Fingerprint) -> BTreeMap<Component, bool> {
        let mut matches = BTreeMap::new();
        for component in self.components.keys().chain(stored.components.keys()) {
            let same = match (self.get(*component), stored.get(*component)) {
                (Some(Some(a)), Some(Some(b))) => a == b,
                _ => false,
            };
            matches.insert(*component, same);
        }
        matches
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Unchanged,
    Changed,
    New,
    Orphaned,
}

impl fmt::Display for DiffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DiffStatus::Unchanged => "unchanged",
            DiffStatus::Changed => "changed",
            DiffStatus::New => "new",
            DiffStatus::Orphaned => "orphaned",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MethodOutcome {
    /// Needs work, but the call was a dry run.
    Pending,
    Reused,
    Computed { session: SessionIndex },
    Failed { error: EngineError },
    Retained,
    Removed,
}

impl MethodOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, MethodOutcome::Failed { .. })
    }
}

impl fmt::Display for MethodOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodOutcome::Pending => f.write_str("pending"),
            MethodOutcome::Reused => f.write_str("reused"),
            MethodOutcome::Computed { session } => write!(f, "computed@{session}"),
            MethodOutcome::Failed { error } => write!(f, "failed ({:?})", error.code),
            MethodOutcome::Retained => f.write_str("retained"),
            MethodOutcome::Removed => f.write_str("removed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffRow {
    pub label: Label,
    pub status: DiffStatus,
    pub needs_rerun: bool,
    /// Rerun requested by the dataset digest policy rather than the definition.
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub components: BTreeMap<Component, bool>,
    #[serde(default)]
    pub mismatched: Vec<Component>,
    #[serde(default)]
    pub ambiguous: Vec<Component>,
    pub outcome: MethodOutcome,
}

impl DiffRow {
    pub fn marked_for_removal(&self) -> bool {
        self.status == DiffStatus::Orphaned && self.needs_rerun
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricDiffRow {
    pub assay: String,
    pub label: Label,
    pub status: DiffStatus,
    pub needs_rerun: bool,
    #[serde(default)]
    pub components: BTreeMap<Component, bool>,
    #[serde(default)]
    pub mismatched: Vec<Component>,
    #[serde(default)]
    pub ambiguous: Vec<Component>,
    /// Methods whose value for this metric was (re)evaluated.
    #[serde(default)]
    pub evaluated: Vec<Label>,
    #[serde(default)]
    pub failed: BTreeMap<Label, EngineError>,
    #[serde(default)]
    pub removed: bool,
}

impl MetricDiffRow {
    pub fn key(&self) -> String {
        format!("{}/{}", self.assay, self.label)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetCheck {
    pub recorded: Option<String>,
    pub supplied: Option<String>,
}

impl DatasetCheck {
    /// `None` when either side is unknown.
    pub fn matches(&self) -> Option<bool> {
        match (&self.recorded, &self.supplied) {
            (Some(a), Some(b)) => Some(a == b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffReport {
    pub rows: Vec<DiffRow>,
    #[serde(default)]
    pub metric_rows: Vec<MetricDiffRow>,
    #[serde(default)]
    pub dataset: DatasetCheck,
    pub dry_run: bool,
    /// Index of the session appended by this call, if any.
    #[serde(default)]
    pub session: Option<SessionIndex>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DiffReport {
    pub fn row(&self, label: &str) -> Option<&DiffRow> {
        self.rows.iter().find(|row| row.label == label)
    }

    pub fn row_mut(&mut self, label: &str) -> Option<&mut DiffRow> {
        self.rows.iter_mut().find(|row| row.label == label)
    }

    pub fn metric_row(&self, assay: &str, label: &str) -> Option<&MetricDiffRow> {
        self.metric_rows
            .iter()
            .find(|row| row.assay == assay && row.label == label)
    }

    /// Labels of current definitions that are new, changed or forced.
    pub fn rerun_labels(&self) -> Vec<Label> {
        self.rows
            .iter()
            .filter(|row| row.needs_rerun && row.status != DiffStatus::Orphaned)
            .map(|row| row.label.clone())
            .collect()
    }

    pub fn failed_labels(&self) -> Vec<Label> {
        self.rows
            .iter()
            .filter(|row| row.outcome.is_failed())
            .map(|row| row.label.clone())
            .collect()
    }

    pub fn needs_rerun_count(&self) -> usize {
        self.rows.iter().filter(|row| row.needs_rerun).count()
            + self.metric_rows.iter().filter(|row| row.needs_rerun).count()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.needs_rerun_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(pairs: &[(Component, Option<&str>)]) -> Fingerprint {
        let mut ret = Fingerprint::default();
        for (c, d) in pairs {
            ret.insert(*c, d.map(|s| s.to_string()));
        }
        ret
    }

    #[test]
    fn compare_reports_each_component() {
        let stored = fp(&[
            (Component::Function, Some("a")),
            (Component::Params, Some("b")),
        ]);
        let current = fp(&[
            (Component::Function, Some("a")),
            (Component::Params, Some("c")),
        ]);
        let cmp = current.compare(&stored);
        assert_eq!(cmp.get(&Component::Function), Some(&true));
        assert_eq!(cmp.get(&Component::Params), Some(&false));
    }

    #[test]
    fn opaque_digest_never_matches() {
        let stored = fp(&[(Component::Function, None)]);
        let current = fp(&[(Component::Function, None)]);
        assert_eq!(current.compare(&stored).get(&Component::Function), Some(&false));
        assert_eq!(current.ambiguous(), vec![Component::Function]);
    }

    #[test]
    fn missing_component_counts_as_mismatch() {
        let stored = fp(&[(Component::Function, Some("a"))]);
        let current = fp(&[
            (Component::Function, Some("a")),
            (Component::Version, Some("v")),
        ]);
        assert_eq!(current.compare(&stored).get(&Component::Version), Some(&false));
    }

    #[test]
    fn fingerprint_serializes_as_plain_map() {
        let f = fp(&[(Component::Meta, Some("abc")), (Component::Post, None)]);
        let text = serde_json::to_string(&f).unwrap();
        assert_eq!(text, r#"{"meta":"abc","post":null}"#);
        let back: Fingerprint = serde_json::from_str(&text).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn failed_outcome_round_trips_with_error() {
        let outcome = MethodOutcome::Failed {
            error: EngineError::new(ErrorCode::CallableFailure, "boom"),
        };
        let text = serde_json::to_string(&outcome).unwrap();
        let back: MethodOutcome = serde_json::from_str(&text).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn error_codes_split_local_and_structural() {
        assert!(EngineError::new(ErrorCode::DatasetMissing, "x").is_local());
        assert!(!EngineError::new(ErrorCode::LabelCollision, "x").is_local());
    }
}
