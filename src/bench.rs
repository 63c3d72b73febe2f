//! Entry points: staleness reports and the update cycle
//! diff -> execute -> merge -> metrics.

use crate::{
    config::{DatasetPolicy, UpdateOptions},
    dataset::{Dataset, DatasetInput},
    definition::DefinitionSet,
    differ::{diff_store, force_rerun},
    executor::{execute, ExecuteOptions, ExecutionResult},
    fingerprint::fingerprint_method,
    merge::StagedMerge,
    metrics,
    store::ResultStore,
};
use benchkeeper_protocol::{DatasetCheck, DiffReport, DiffStatus, EngineError, ErrorCode};
use log::{info, warn};

/// Compares every stored fingerprint with the one its recorded definition
/// hashes to now. Never changes anything.
pub fn self_check(store: &ResultStore) -> Result<DiffReport, EngineError> {
    store.verify()?;
    let defs = store.recorded_definitions()?;
    let mut report = diff_store(store, &defs, true);
    for (label, stored) in store.results() {
        if fingerprint_method(&stored.definition) != stored.fingerprint {
            let message = format!(
                "Stored fingerprint of '{label}' does not match its recorded definition"
            );
            warn!("{message}");
            report.warnings.push(message);
        }
    }
    report.dataset = DatasetCheck {
        recorded: store.dataset_digest().map(str::to_string),
        supplied: None,
    };
    report.dry_run = true;
    Ok(report)
}

/// Staleness of a store against its own recorded definitions.
pub fn report_staleness(store: &ResultStore) -> Result<DiffReport, EngineError> {
    self_check(store)
}

/// Staleness of a store against a candidate definition set, as a dry run.
pub fn report_staleness_against(
    store: &ResultStore,
    defs: &DefinitionSet,
    dataset: Option<&DatasetInput>,
) -> Result<DiffReport, EngineError> {
    let options = UpdateOptions::from_parameters(store.parameters());
    let (_, report) = update_bench(store, Some(defs), dataset, options)?;
    Ok(report)
}

fn apply_dataset_policy(
    report: &mut DiffReport,
    policy: DatasetPolicy,
    dry_run: bool,
) -> Result<bool, EngineError> {
    if report.dataset.matches() != Some(false) {
        return Ok(false);
    }
    let message = format!(
        "Dataset digest {} differs from the recorded {}",
        report.dataset.supplied.as_deref().unwrap_or("-"),
        report.dataset.recorded.as_deref().unwrap_or("-"),
    );
    match policy {
        DatasetPolicy::Refuse if !dry_run => {
            Err(EngineError::new(ErrorCode::DatasetMismatch, message))
        }
        DatasetPolicy::Recompute => {
            warn!("{message}; recomputing every method");
            report.warnings.push(format!("{message}; every method is rerun"));
            force_rerun(report);
            Ok(true)
        }
        _ => {
            warn!("{message}");
            report.warnings.push(message);
            Ok(false)
        }
    }
}

/// Main entry point. Without `defs` this is the self-check and nothing is
/// proposed. Otherwise the store is diffed against `defs` and, unless
/// `options.dry_run`, flagged methods are executed and merged.
///
/// The input store is never modified; the returned store is the merged one
/// (an unchanged clone on dry runs).
pub fn update_bench(
    store: &ResultStore,
    defs: Option<&DefinitionSet>,
    dataset: Option<&DatasetInput>,
    options: UpdateOptions,
) -> Result<(ResultStore, DiffReport), EngineError> {
    let Some(defs) = defs else {
        return Ok((store.clone(), self_check(store)?));
    };
    defs.validate()?;
    store.verify()?;

    let supplied = dataset.map(DatasetInput::digest);
    let mut report = diff_store(store, defs, options.keep_all);
    report.dataset = DatasetCheck {
        recorded: store.dataset_digest().map(str::to_string),
        supplied: supplied.clone(),
    };
    let forced = apply_dataset_policy(&mut report, options.dataset_policy, options.dry_run)?;

    if options.dry_run {
        info!(
            "dry run: {} of {} method(s) need work",
            report.rerun_labels().len(),
            defs.methods().len()
        );
        return Ok((store.clone(), report));
    }
    report.dry_run = false;

    let data: Option<&Dataset> = dataset.and_then(DatasetInput::data).or(store.dataset());
    let execution: ExecutionResult = execute(
        defs,
        &report,
        data,
        ExecuteOptions {
            dry_run: false,
            parallel: options.parallel,
            keep_raw_output: store.parameters().keep_raw_output,
        },
    );

    let mut staged = StagedMerge::begin(store);
    if let (Some(input), Some(digest)) = (dataset, supplied.as_deref()) {
        let adopt = match report.dataset.matches() {
            None | Some(true) => true,
            Some(false) => forced && execution.failures.is_empty(),
        };
        staged.record_dataset(digest, input.data(), adopt);
    }
    staged.apply_methods(&execution, &mut report, options.keep_all);
    staged.apply_metric_orphans(&mut report, options.keep_all);
    let tasks = metrics::plan(staged.store(), defs, &report.metric_rows);
    let evaluations = metrics::evaluate(staged.store(), defs, &tasks, data, options.parallel);
    staged.apply_metric_values(defs, &evaluations, &mut report);
    let merged = staged.finish(&mut report);

    info!(
        "update finished: {} computed, {} failed, session {:?}",
        execution.proposed.len(),
        execution.failures.len(),
        report.session
    );
    Ok((merged, report))
}

/// Drops orphaned methods and metrics. Refused while any current definition
/// still needs computation, so pruning never mixes with new results.
pub fn prune_orphans(
    store: &ResultStore,
    defs: &DefinitionSet,
) -> Result<(ResultStore, DiffReport), EngineError> {
    defs.validate()?;
    store.verify()?;
    let mut report = diff_store(store, defs, false);
    let pending = report
        .rows
        .iter()
        .filter(|r| r.needs_rerun && r.status != DiffStatus::Orphaned)
        .count()
        + report
            .metric_rows
            .iter()
            .filter(|r| r.needs_rerun && r.status != DiffStatus::Orphaned)
            .count();
    if pending > 0 {
        return Err(EngineError::new(
            ErrorCode::InvalidInput,
            format!("{pending} definition(s) need computation; update before pruning"),
        ));
    }
    report.dry_run = false;
    let mut staged = StagedMerge::begin(store);
    staged.apply_methods(&ExecutionResult::default(), &mut report, false);
    staged.apply_metric_orphans(&mut report, false);
    Ok((staged.finish(&mut report), report))
}
