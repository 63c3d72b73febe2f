//! Folds an execution result into a result store and records the session
//! that produced it.
//!
//! A `StagedMerge` owns a private copy of the store for the duration of one
//! update, so every structural change goes through a single writer. The
//! store handed in by the caller is never touched.

use crate::{
    about::environment_snapshot,
    dataset::Dataset,
    definition::{DefinitionSet, ParamEntry},
    executor::{ExecutionResult, ProposedResult},
    fingerprint::fingerprint_metric,
    metrics::{self, MetricEvaluation},
    store::{EnvironmentSnapshot, MetricValueRecord, ResultStore, Session, StoredResult},
};
use benchkeeper_protocol::{DiffReport, DiffStatus, Label, MethodOutcome, SessionIndex};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};

pub struct StagedMerge {
    store: ResultStore,
    session: SessionIndex,
    computed: Vec<Label>,
    computed_metrics: BTreeSet<String>,
    parameters: BTreeMap<Label, Vec<ParamEntry>>,
    method_versions: BTreeMap<Label, Option<String>>,
    dataset_digest: Option<String>,
}

fn same_content(stored: &StoredResult, proposed: &ProposedResult) -> bool {
    stored.definition == proposed.definition
        && stored.fingerprint == proposed.fingerprint
        && stored.raw == proposed.raw
        && stored.assays == proposed.assays
}

impl StagedMerge {
    /// Reserves the next session index; nothing is appended until `finish`.
    pub fn begin(store: &ResultStore) -> Self {
        Self {
            session: store.next_session_index(),
            store: store.clone(),
            computed: vec![],
            computed_metrics: BTreeSet::new(),
            parameters: BTreeMap::new(),
            method_versions: BTreeMap::new(),
            dataset_digest: store.dataset_digest().map(str::to_string),
        }
    }

    pub fn session_index(&self) -> SessionIndex {
        self.session
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn has_changes(&self) -> bool {
        !self.computed.is_empty() || !self.computed_metrics.is_empty()
    }

    /// Notes the dataset this update ran against in the session record. With
    /// `adopt`, the store also takes over its digest and ground truths.
    pub fn record_dataset(&mut self, digest: &str, data: Option<&Dataset>, adopt: bool) {
        self.dataset_digest = Some(digest.to_string());
        if adopt {
            self.store.record_dataset(digest.to_string(), data);
        }
    }

    pub fn apply_methods(
        &mut self,
        execution: &ExecutionResult,
        report: &mut DiffReport,
        keep_all: bool,
    ) {
        for proposed in &execution.proposed {
            let reproduced = self
                .store
                .result(&proposed.label)
                .is_some_and(|existing| same_content(existing, proposed));
            if reproduced {
                debug!("method '{}' reproduced its stored result", proposed.label);
                if let Some(row) = report.row_mut(&proposed.label) {
                    row.outcome = MethodOutcome::Reused;
                }
                continue;
            }
            self.store.insert_result(StoredResult {
                label: proposed.label.clone(),
                definition: proposed.definition.clone(),
                fingerprint: proposed.fingerprint.clone(),
                session: self.session,
                raw: proposed.raw.clone(),
                assays: proposed.assays.clone(),
            });
            self.computed.push(proposed.label.clone());
            self.parameters.insert(
                proposed.label.clone(),
                proposed.definition.params.clone(),
            );
            self.method_versions.insert(
                proposed.label.clone(),
                proposed.definition.version.clone(),
            );
            if let Some(row) = report.row_mut(&proposed.label) {
                row.outcome = MethodOutcome::Computed {
                    session: self.session,
                };
            }
        }

        for failure in &execution.failures {
            if let Some(row) = report.row_mut(&failure.label) {
                row.outcome = MethodOutcome::Failed {
                    error: failure.error.clone(),
                };
            }
        }

        for row in report
            .rows
            .iter_mut()
            .filter(|r| r.status == DiffStatus::Orphaned)
        {
            if keep_all {
                row.outcome = MethodOutcome::Retained;
            } else if self.store.remove_result(&row.label).is_some() {
                info!("removed orphaned method '{}'", row.label);
                row.outcome = MethodOutcome::Removed;
            }
        }
    }

    /// Removes orphaned metrics unless `keep_all`.
    pub fn apply_metric_orphans(&mut self, report: &mut DiffReport, keep_all: bool) {
        if keep_all {
            return;
        }
        for row in report
            .metric_rows
            .iter_mut()
            .filter(|r| r.status == DiffStatus::Orphaned)
        {
            if self.store.remove_metric(&row.assay, &row.label).is_some() {
                info!("removed orphaned metric '{}'", row.key());
                row.removed = true;
            }
        }
    }

    /// Stores successful metric values. A metric whose fingerprint moved is
    /// committed only when every one of its evaluations succeeded; otherwise
    /// its previous definition and values stay as they were.
    pub fn apply_metric_values(
        &mut self,
        defs: &DefinitionSet,
        evaluations: &[MetricEvaluation],
        report: &mut DiffReport,
    ) {
        for metric in defs.metrics() {
            let record = metric.record();
            let fingerprint = fingerprint_metric(&record);
            let own: Vec<&MetricEvaluation> = evaluations
                .iter()
                .filter(|e| e.task.assay == metric.assay && e.task.metric == metric.label)
                .collect();
            let moved = self
                .store
                .metric(&metric.assay, &metric.label)
                .is_none_or(|stored| stored.fingerprint != fingerprint);
            if moved && own.iter().any(|e| e.result.is_err()) {
                warn!(
                    "metric '{}/{}' not committed: some evaluations failed",
                    metric.assay, metric.label
                );
                continue;
            }
            self.store.upsert_metric(record, fingerprint);
            for evaluation in own {
                let Ok(value) = &evaluation.result else {
                    continue;
                };
                let task = &evaluation.task;
                self.store.set_metric_value(
                    &task.assay,
                    &task.metric,
                    &task.method,
                    MetricValueRecord {
                        value: value.clone(),
                        method_session: evaluation.method_session,
                        session: self.session,
                    },
                );
                self.computed_metrics
                    .insert(format!("{}/{}", task.assay, task.metric));
            }
        }
        metrics::annotate(&mut report.metric_rows, evaluations);
    }

    /// Appends the session if anything was computed and hands back the store.
    pub fn finish(self, report: &mut DiffReport) -> ResultStore {
        let tags = self.store.parameters().environment_tags.clone();
        let environment = environment_snapshot(self.method_versions.clone(), tags);
        self.finish_with(environment, report)
    }

    pub fn finish_with(
        mut self,
        environment: EnvironmentSnapshot,
        report: &mut DiffReport,
    ) -> ResultStore {
        if !self.has_changes() {
            debug!("nothing computed, no session appended");
            return self.store;
        }
        let session = Session {
            index: self.session,
            methods: self.computed,
            metrics: self.computed_metrics.into_iter().collect(),
            parameters: self.parameters,
            dataset_digest: self.dataset_digest,
            environment,
        };
        info!(
            "session {} appended: {} method(s), {} metric(s)",
            session.index,
            session.methods.len(),
            session.metrics.len()
        );
        let index = self.store.append_session(session);
        report.session = Some(index);
        self.store
    }
}

/// Merges one execution result into `store` without touching metrics.
pub fn merge(
    store: &ResultStore,
    execution: &ExecutionResult,
    report: &mut DiffReport,
    keep_all: bool,
) -> ResultStore {
    let mut staged = StagedMerge::begin(store);
    staged.apply_methods(execution, report, keep_all);
    staged.finish(report)
}
