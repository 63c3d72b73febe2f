//! Performance metrics evaluated against ground truth, recomputed only for
//! the (assay, metric, method) triples whose inputs moved.

use crate::{
    dataset::{Column, Dataset},
    definition::{resolve_params, DefinitionSet, MetricDefinition},
    store::ResultStore,
};
use benchkeeper_protocol::{DiffStatus, EngineError, ErrorCode, Label, MetricDiffRow, SessionIndex};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(Option<f64>),
    Vector(Column),
}

impl MetricValue {
    pub fn scalar(value: f64) -> Self {
        if value.is_finite() {
            MetricValue::Scalar(Some(value))
        } else {
            MetricValue::Scalar(None)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricTask {
    pub assay: String,
    pub metric: Label,
    pub method: Label,
}

#[derive(Debug, Clone)]
pub struct MetricEvaluation {
    pub task: MetricTask,
    /// Session of the method result the value was computed from.
    pub method_session: SessionIndex,
    pub result: Result<MetricValue, EngineError>,
}

fn value_is_current(store: &ResultStore, assay: &str, metric: &str, method: &str) -> bool {
    let Some(result) = store.result(method) else {
        return true;
    };
    store
        .metric(assay, metric)
        .and_then(|m| m.values.get(method))
        .is_some_and(|value| value.method_session == result.session)
}

/// Methods carrying `assay` whose value for `metric` is missing or was
/// computed from an older method result.
pub fn stale_methods(store: &ResultStore, assay: &str, metric: &str) -> Vec<Label> {
    store
        .results()
        .iter()
        .filter(|(_, result)| result.assays.contains_key(assay))
        .filter(|(method, _)| !value_is_current(store, assay, metric, method))
        .map(|(method, _)| method.clone())
        .collect()
}

/// Lists the metric values that are missing or stale in `store`. A metric
/// whose definition changed is planned for every method carrying its assay.
pub fn plan(store: &ResultStore, defs: &DefinitionSet, rows: &[MetricDiffRow]) -> Vec<MetricTask> {
    let mut tasks = vec![];
    for metric in defs.metrics() {
        let changed = rows
            .iter()
            .find(|r| r.assay == metric.assay && r.label == metric.label)
            .is_none_or(|r| r.status != DiffStatus::Unchanged);
        let methods: Vec<Label> = if changed {
            store
                .results()
                .iter()
                .filter(|(_, result)| result.assays.contains_key(&metric.assay))
                .map(|(method, _)| method.clone())
                .collect()
        } else {
            stale_methods(store, &metric.assay, &metric.label)
        };
        tasks.extend(methods.into_iter().map(|method| MetricTask {
            assay: metric.assay.clone(),
            metric: metric.label.clone(),
            method,
        }));
    }
    tasks
}

fn evaluate_one(
    store: &ResultStore,
    metric: &MetricDefinition,
    task: &MetricTask,
    dataset: Option<&Dataset>,
) -> Result<MetricValue, EngineError> {
    let column = store
        .result(&task.method)
        .and_then(|r| r.assays.get(&task.assay))
        .ok_or_else(|| {
            EngineError::new(
                ErrorCode::NotFound,
                format!("Method '{}' has no assay '{}'", task.method, task.assay),
            )
        })?;
    let truth = store.ground_truths().get(&task.assay).ok_or_else(|| {
        EngineError::new(
            ErrorCode::GroundTruthMissing,
            format!("No ground truth recorded for assay '{}'", task.assay),
        )
    })?;
    let params = resolve_params(&metric.params, dataset)?;
    let func = metric.function.func.as_ref().ok_or_else(|| {
        EngineError::new(
            ErrorCode::CallableFailure,
            format!("Metric function '{}' is not bound", metric.function.name()),
        )
    })?;
    match catch_unwind(AssertUnwindSafe(|| func(column, truth, &params))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(EngineError::new(
            ErrorCode::CallableFailure,
            format!("Metric '{}' failed on '{}': {message}", task.metric, task.method),
        )),
        Err(_) => Err(EngineError::new(
            ErrorCode::CallableFailure,
            format!("Metric '{}' panicked on '{}'", task.metric, task.method),
        )),
    }
}

pub fn evaluate(
    store: &ResultStore,
    defs: &DefinitionSet,
    tasks: &[MetricTask],
    dataset: Option<&Dataset>,
    parallel: bool,
) -> Vec<MetricEvaluation> {
    let run = |task: &MetricTask| {
        let method_session = store.result(&task.method).map(|r| r.session).unwrap_or(0);
        let result = match defs.metric(&task.assay, &task.metric) {
            Some(metric) => evaluate_one(store, metric, task, dataset),
            None => Err(EngineError::new(
                ErrorCode::NotFound,
                format!("Metric '{}/{}' is not defined", task.assay, task.metric),
            )),
        };
        match &result {
            Ok(_) => debug!(
                "metric {}/{} evaluated for '{}'",
                task.assay, task.metric, task.method
            ),
            Err(e) => warn!("{e}"),
        }
        MetricEvaluation {
            task: task.clone(),
            method_session,
            result,
        }
    };
    if parallel {
        tasks.par_iter().map(run).collect()
    } else {
        tasks.iter().map(run).collect()
    }
}

/// Folds evaluation outcomes into the report rows.
pub fn annotate(rows: &mut [MetricDiffRow], evaluations: &[MetricEvaluation]) {
    for evaluation in evaluations {
        let Some(row) = rows.iter_mut().find(|r| {
            r.assay == evaluation.task.assay
                && r.label == evaluation.task.metric
                && r.status != DiffStatus::Orphaned
        }) else {
            continue;
        };
        match &evaluation.result {
            Ok(_) => row.evaluated.push(evaluation.task.method.clone()),
            Err(e) => {
                row.failed.insert(evaluation.task.method.clone(), e.clone());
            }
        }
    }
}

/// Metric bodies for p-value assays scored against 0/1 ground truth.
pub mod builtin {
    use super::MetricValue;
    use crate::dataset::Column;

    /// Fraction of calls at `alpha` whose ground truth is 0.
    pub fn false_discovery_rate(pvalues: &Column, truth: &Column, alpha: f64) -> MetricValue {
        let mut called = 0usize;
        let mut false_calls = 0usize;
        for (p, t) in pvalues.iter().zip(truth.iter()) {
            let (Some(p), Some(t)) = (p, t) else {
                continue;
            };
            if *p <= alpha {
                called += 1;
                if *t == 0.0 {
                    false_calls += 1;
                }
            }
        }
        if called == 0 {
            return MetricValue::Scalar(None);
        }
        MetricValue::scalar(false_calls as f64 / called as f64)
    }

    pub fn true_positive_rate(pvalues: &Column, truth: &Column, alpha: f64) -> MetricValue {
        let mut positives = 0usize;
        let mut hits = 0usize;
        for (p, t) in pvalues.iter().zip(truth.iter()) {
            let (Some(p), Some(t)) = (p, t) else {
                continue;
            };
            if *t != 0.0 {
                positives += 1;
                if *p <= alpha {
                    hits += 1;
                }
            }
        }
        if positives == 0 {
            return MetricValue::Scalar(None);
        }
        MetricValue::scalar(hits as f64 / positives as f64)
    }
}
