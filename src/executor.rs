//! Runs exactly the methods a diff flagged, each in isolation. Nothing here
//! touches a result store; the output is a proposal for `merge`.

use crate::{
    dataset::{column_from_value, Column, Dataset},
    definition::{resolve_params, DefinitionSet, MethodDefinition, MethodRecord, DEFAULT_ASSAY},
    fingerprint::fingerprint_method,
};
use benchkeeper_protocol::{DiffReport, EngineError, ErrorCode, Fingerprint, Label};
use log::{debug, warn};
use rayon::prelude::*;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    time::Instant,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedResult {
    pub label: Label,
    pub definition: MethodRecord,
    pub fingerprint: Fingerprint,
    pub raw: Option<Value>,
    pub assays: BTreeMap<String, Column>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodFailure {
    pub label: Label,
    pub error: EngineError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub proposed: Vec<ProposedResult>,
    pub failures: Vec<MethodFailure>,
}

impl ExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.proposed.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    pub dry_run: bool,
    pub parallel: bool,
    pub keep_raw_output: bool,
}

fn guarded<T>(label: &str, stage: &str, f: impl FnOnce() -> Result<T, String>) -> Result<T, EngineError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(EngineError::new(
            ErrorCode::CallableFailure,
            format!("Method '{label}' failed in {stage}: {message}"),
        )),
        Err(_) => Err(EngineError::new(
            ErrorCode::CallableFailure,
            format!("Method '{label}' panicked in {stage}"),
        )),
    }
}

fn unbound(label: &str, name: &str) -> EngineError {
    EngineError::new(
        ErrorCode::CallableFailure,
        format!("Method '{label}': callable '{name}' is not bound"),
    )
}

/// Runs one method: primary callable, then each post-processor in order.
pub fn run_method(
    def: &MethodDefinition,
    dataset: Option<&Dataset>,
    keep_raw_output: bool,
) -> Result<ProposedResult, EngineError> {
    let started = Instant::now();
    let dataset = dataset.ok_or_else(|| {
        EngineError::new(
            ErrorCode::DatasetMissing,
            format!("Method '{}' needs recomputation but no dataset was supplied", def.label),
        )
    })?;
    let params = resolve_params(&def.params, Some(dataset))?;
    let func = def
        .function
        .func
        .as_ref()
        .ok_or_else(|| unbound(&def.label, def.function.name()))?;
    let raw = guarded(&def.label, def.function.name(), || func(dataset, &params))?;

    let mut assays = BTreeMap::new();
    if def.post.is_empty() {
        let column = column_from_value(&raw).ok_or_else(|| {
            EngineError::new(
                ErrorCode::CallableFailure,
                format!(
                    "Method '{}' has no post-processors and its output is not a numeric column",
                    def.label
                ),
            )
        })?;
        assays.insert(DEFAULT_ASSAY.to_string(), column);
    } else {
        for (key, post) in &def.post {
            let post_fn = post
                .func
                .as_ref()
                .ok_or_else(|| unbound(&def.label, post.name()))?;
            let column = guarded(&def.label, &format!("post-processor '{key}'"), || post_fn(&raw))?;
            assays.insert(key.clone(), column);
        }
    }

    let definition = def.record();
    Ok(ProposedResult {
        label: def.label.clone(),
        fingerprint: fingerprint_method(&definition),
        definition,
        raw: keep_raw_output.then_some(raw),
        assays,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

pub fn execute(
    defs: &DefinitionSet,
    report: &DiffReport,
    dataset: Option<&Dataset>,
    options: ExecuteOptions,
) -> ExecutionResult {
    if options.dry_run {
        return ExecutionResult::default();
    }
    let pending: Vec<&MethodDefinition> = report
        .rerun_labels()
        .iter()
        .filter_map(|label| defs.method(label))
        .collect();
    let run = |def: &&MethodDefinition| {
        let outcome = run_method(def, dataset, options.keep_raw_output);
        match &outcome {
            Ok(p) => debug!("method '{}' computed in {} ms", p.label, p.elapsed_ms),
            Err(e) => warn!("{e}"),
        }
        (def.label.clone(), outcome)
    };
    let outcomes: Vec<(Label, Result<ProposedResult, EngineError>)> = if options.parallel {
        pending.par_iter().map(run).collect()
    } else {
        pending.iter().map(run).collect()
    };

    let mut ret = ExecutionResult::default();
    for (label, outcome) in outcomes {
        match outcome {
            Ok(proposed) => ret.proposed.push(proposed),
            Err(error) => ret.failures.push(MethodFailure { label, error }),
        }
    }
    ret
}
