//! Matches current definitions against the fingerprints recorded in a
//! result store, label by label and component by component.

use crate::{
    definition::{DefinitionSet, MethodDefinition, MetricDefinition},
    fingerprint::{fingerprint_method, fingerprint_metric},
    metrics::stale_methods,
    store::ResultStore,
};
use benchkeeper_protocol::{
    Component, DiffReport, DiffRow, DiffStatus, EngineError, ErrorCode, Fingerprint, Label,
    MethodOutcome, MetricDiffRow,
};
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};

struct Classification {
    status: DiffStatus,
    components: BTreeMap<Component, bool>,
    mismatched: Vec<Component>,
    ambiguous: Vec<Component>,
}

fn classify(current: &Fingerprint, stored: Option<&Fingerprint>) -> Classification {
    let ambiguous = current.ambiguous();
    let Some(stored) = stored else {
        return Classification {
            status: DiffStatus::New,
            components: BTreeMap::new(),
            mismatched: vec![],
            ambiguous,
        };
    };
    let components = current.compare(stored);
    let mismatched: Vec<Component> = components
        .iter()
        .filter(|(_, same)| !**same)
        .map(|(component, _)| *component)
        .collect();
    Classification {
        status: if mismatched.is_empty() {
            DiffStatus::Unchanged
        } else {
            DiffStatus::Changed
        },
        components,
        mismatched,
        ambiguous,
    }
}

fn ambiguity_warning(what: &str, ambiguous: &[Component]) -> Option<String> {
    if ambiguous.is_empty() {
        return None;
    }
    let names: Vec<&str> = ambiguous.iter().map(|c| c.as_str()).collect();
    let error = EngineError::new(
        ErrorCode::FingerprintAmbiguous,
        format!(
            "{what}: component(s) {} cannot be serialized deterministically and are treated as changed",
            names.join(", ")
        ),
    );
    warn!("{error}");
    Some(error.to_string())
}

pub fn diff_methods(
    old: &BTreeMap<Label, Fingerprint>,
    new_defs: &[MethodDefinition],
    keep_all: bool,
    warnings: &mut Vec<String>,
) -> Vec<DiffRow> {
    let mut rows = Vec::with_capacity(old.len().max(new_defs.len()));
    let mut current: HashSet<&str> = HashSet::new();
    for def in new_defs {
        current.insert(def.label.as_str());
        let fingerprint = fingerprint_method(&def.record());
        let c = classify(&fingerprint, old.get(&def.label));
        warnings.extend(ambiguity_warning(&format!("method '{}'", def.label), &c.ambiguous));
        let needs_rerun = c.status != DiffStatus::Unchanged;
        debug!(
            "method '{}' is {} (mismatched: {:?})",
            def.label, c.status, c.mismatched
        );
        rows.push(DiffRow {
            label: def.label.clone(),
            status: c.status,
            needs_rerun,
            forced: false,
            components: c.components,
            mismatched: c.mismatched,
            ambiguous: c.ambiguous,
            outcome: if needs_rerun {
                MethodOutcome::Pending
            } else {
                MethodOutcome::Reused
            },
        });
    }
    for label in old.keys().filter(|l| !current.contains(l.as_str())) {
        debug!("method '{label}' is orphaned (keep_all={keep_all})");
        rows.push(DiffRow {
            label: label.clone(),
            status: DiffStatus::Orphaned,
            needs_rerun: !keep_all,
            forced: false,
            components: BTreeMap::new(),
            mismatched: vec![],
            ambiguous: vec![],
            outcome: if keep_all {
                MethodOutcome::Retained
            } else {
                MethodOutcome::Pending
            },
        });
    }
    rows
}

pub fn diff_metrics(
    old: &BTreeMap<(String, Label), Fingerprint>,
    new_defs: &[MetricDefinition],
    keep_all: bool,
    warnings: &mut Vec<String>,
) -> Vec<MetricDiffRow> {
    let mut rows = vec![];
    let mut current: HashSet<(String, Label)> = HashSet::new();
    for def in new_defs {
        let key = def.key();
        let fingerprint = fingerprint_metric(&def.record());
        let c = classify(&fingerprint, old.get(&key));
        warnings.extend(ambiguity_warning(
            &format!("metric '{}/{}'", def.assay, def.label),
            &c.ambiguous,
        ));
        current.insert(key);
        rows.push(MetricDiffRow {
            assay: def.assay.clone(),
            label: def.label.clone(),
            status: c.status,
            needs_rerun: c.status != DiffStatus::Unchanged,
            components: c.components,
            mismatched: c.mismatched,
            ambiguous: c.ambiguous,
            evaluated: vec![],
            failed: BTreeMap::new(),
            removed: false,
        });
    }
    for (assay, label) in old.keys().filter(|k| !current.contains(*k)) {
        rows.push(MetricDiffRow {
            assay: assay.clone(),
            label: label.clone(),
            status: DiffStatus::Orphaned,
            needs_rerun: !keep_all,
            components: BTreeMap::new(),
            mismatched: vec![],
            ambiguous: vec![],
            evaluated: vec![],
            failed: BTreeMap::new(),
            removed: false,
        });
    }
    rows
}

/// Diffs recorded fingerprints against a definition set. Methods and
/// metrics are classified independently.
pub fn diff(
    old_methods: &BTreeMap<Label, Fingerprint>,
    old_metrics: &BTreeMap<(String, Label), Fingerprint>,
    defs: &DefinitionSet,
    keep_all: bool,
) -> DiffReport {
    let mut warnings = vec![];
    let rows = diff_methods(old_methods, defs.methods(), keep_all, &mut warnings);
    let metric_rows = diff_metrics(old_metrics, defs.metrics(), keep_all, &mut warnings);
    DiffReport {
        rows,
        metric_rows,
        dry_run: true,
        warnings,
        ..DiffReport::default()
    }
}

/// Like `diff`, but an unchanged metric still needs a rerun while some
/// stored method lacks a current value for it.
pub fn diff_store(store: &ResultStore, defs: &DefinitionSet, keep_all: bool) -> DiffReport {
    let mut report = diff(
        &store.method_fingerprints(),
        &store.metric_fingerprints(),
        defs,
        keep_all,
    );
    for row in report
        .metric_rows
        .iter_mut()
        .filter(|r| r.status == DiffStatus::Unchanged)
    {
        let stale = stale_methods(store, &row.assay, &row.label);
        if !stale.is_empty() {
            debug!("metric '{}' has no current value for {stale:?}", row.key());
            row.needs_rerun = true;
        }
    }
    report
}

/// Flags every current method for rerun, e.g. after a dataset change.
pub fn force_rerun(report: &mut DiffReport) {
    for row in report
        .rows
        .iter_mut()
        .filter(|r| r.status != DiffStatus::Orphaned && !r.needs_rerun)
    {
        row.needs_rerun = true;
        row.forced = true;
        row.outcome = MethodOutcome::Pending;
    }
}
