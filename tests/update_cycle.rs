use benchkeeper::{
    bench::{report_staleness, update_bench},
    config::{DatasetPolicy, UpdateOptions},
    dataset::{column_from_value, Dataset, DatasetInput},
    definition::{
        Callable, CallableRecord, DefinitionSet, MethodDefinition, MetricDefinition, ParamValue,
    },
    metrics::MetricValue,
    registry::FunctionRegistry,
    store::ResultStore,
    Component, DiffReport, DiffStatus, ErrorCode, MethodOutcome,
};
use serde_json::{json, Value};

fn dataset() -> Dataset {
    let mut d = Dataset::default();
    d.columns.insert(
        "p".to_string(),
        vec![Some(0.001), Some(0.02), Some(0.2), Some(0.04), None],
    );
    d.attributes.insert("shrink".to_string(), json!(0.5));
    d.ground_truths.insert(
        "pv".to_string(),
        vec![Some(1.0), Some(1.0), Some(0.0), Some(0.0), Some(1.0)],
    );
    d
}

fn input() -> DatasetInput {
    DatasetInput::Full(dataset())
}

/// Multiplies the input p-values by `scale`, with a `pv` post-processor.
fn scaled(label: &str, scale: f64) -> MethodDefinition {
    MethodDefinition::new(
        label,
        Callable::method("scaled", Some("p * scale"), |d, params| {
            let scale = params["scale"].as_f64().ok_or("scale must be numeric")?;
            let out: Vec<Value> = d.columns["p"]
                .iter()
                .map(|p| p.map(|p| json!((p * scale).min(1.0))).unwrap_or(Value::Null))
                .collect();
            Ok(Value::Array(out))
        }),
    )
    .with_param("scale", ParamValue::literal(scale))
    .with_post(
        "pv",
        Callable::post("as_column", Some("identity"), |raw| {
            column_from_value(raw).ok_or_else(|| "raw output is not numeric".to_string())
        }),
    )
}

fn broken(label: &str) -> MethodDefinition {
    MethodDefinition::new(
        label,
        Callable::method("broken", Some("raise"), |_, _| {
            Err("singular matrix".to_string())
        }),
    )
    .with_post(
        "pv",
        Callable::post("as_column", Some("identity"), |raw| {
            column_from_value(raw).ok_or_else(|| "raw output is not numeric".to_string())
        }),
    )
}

/// Loaded by name only, the way a definition file would describe it.
fn fdr() -> MetricDefinition {
    MetricDefinition::new(
        "pv",
        "fdr",
        Callable::unbound(CallableRecord::new("false_discovery_rate", Some("fdr v1"))),
    )
    .with_param("alpha", ParamValue::literal(0.05))
}

fn run(store: &ResultStore, defs: &DefinitionSet) -> (ResultStore, DiffReport) {
    update_bench(store, Some(defs), Some(&input()), UpdateOptions::default().execute()).unwrap()
}

fn ab() -> DefinitionSet {
    let mut defs =
        DefinitionSet::from_parts(vec![scaled("A", 1.0), scaled("B", 1.0)], vec![fdr()]).unwrap();
    assert!(FunctionRegistry::with_builtins().bind(&mut defs).is_empty());
    defs
}

#[test]
fn changed_and_new_methods_are_the_only_ones_recomputed() {
    let (store, _) = run(&ResultStore::new(), &ab());
    let a_before = store.result("A").unwrap().clone();

    let mut defs = ab();
    defs.modify_method("B", |m| m.set_param("scale", ParamValue::literal(2.0)))
        .unwrap();
    defs.add_method(scaled("C", 0.5)).unwrap();

    let (_, dry) = update_bench(&store, Some(&defs), Some(&input()), UpdateOptions::default())
        .unwrap();
    let statuses: Vec<(&str, DiffStatus)> = dry
        .rows
        .iter()
        .map(|r| (r.label.as_str(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("A", DiffStatus::Unchanged),
            ("B", DiffStatus::Changed),
            ("C", DiffStatus::New),
        ]
    );
    assert_eq!(dry.row("B").unwrap().mismatched, vec![Component::Params]);

    let (after, report) = run(&store, &defs);
    assert_eq!(report.session, Some(1));
    assert_eq!(after.session(1).unwrap().methods, vec!["B", "C"]);
    assert_eq!(after.result("A").unwrap(), &a_before);
    assert_eq!(after.result("B").unwrap().session, 1);
    assert_eq!(
        after.result("B").unwrap().assays["pv"],
        vec![Some(0.002), Some(0.04), Some(0.4), Some(0.08), None]
    );
}

#[test]
fn second_update_finds_nothing_to_do() {
    let (once, _) = run(&ResultStore::new(), &ab());
    let (twice, report) = run(&once, &ab());
    assert!(report.is_up_to_date());
    assert_eq!(report.session, None);
    assert_eq!(twice, once);
    assert!(report_staleness(&twice).unwrap().is_up_to_date());
}

#[test]
fn metadata_edit_flags_only_meta() {
    let (store, _) = run(&ResultStore::new(), &ab());
    let mut defs = ab();
    defs.modify_method("A", |m| {
        m.meta.insert("note".to_string(), json!("rerun on new cluster"));
    })
    .unwrap();
    let (_, report) = update_bench(&store, Some(&defs), None, UpdateOptions::default()).unwrap();
    let row = report.row("A").unwrap();
    assert_eq!(row.mismatched, vec![Component::Meta]);
    for component in [
        Component::Function,
        Component::Params,
        Component::Post,
        Component::Version,
    ] {
        assert!(row.components[&component]);
    }
}

#[test]
fn orphan_policy_is_all_or_nothing() {
    let (store, _) = run(&ResultStore::new(), &ab());
    let mut defs = ab();
    defs.drop_method("B").unwrap();

    let (kept, report) = run(&store, &defs);
    assert_eq!(kept.result("B"), store.result("B"));
    assert_eq!(report.row("B").unwrap().outcome, MethodOutcome::Retained);

    let options = UpdateOptions::default().execute().keep_all(false);
    let (dropped, report) = update_bench(&store, Some(&defs), Some(&input()), options).unwrap();
    assert!(dropped.result("B").is_none());
    assert!(dropped.metric("pv", "fdr").unwrap().values.get("B").is_none());
    assert_eq!(report.row("B").unwrap().outcome, MethodOutcome::Removed);
    dropped.verify().unwrap();
}

#[test]
fn one_failing_method_does_not_sink_the_others() {
    let defs = DefinitionSet::from_parts(
        vec![scaled("A", 1.0), broken("X"), scaled("B", 2.0)],
        vec![],
    )
    .unwrap();
    let (store, report) = run(&ResultStore::new(), &defs);
    assert_eq!(store.labels(), vec!["A", "B"]);
    assert_eq!(report.failed_labels(), vec!["X"]);
    assert!(report.row("X").unwrap().outcome.is_failed());
    assert_eq!(store.session(0).unwrap().methods, vec!["A", "B"]);

    // still stale next time round
    let (_, again) = update_bench(&store, Some(&defs), None, UpdateOptions::default()).unwrap();
    assert_eq!(again.rerun_labels(), vec!["X"]);
}

#[test]
fn metrics_follow_method_recomputation() {
    let (store, report) = run(&ResultStore::new(), &ab());
    let fdr_row = report.metric_row("pv", "fdr").unwrap();
    assert_eq!(fdr_row.evaluated.len(), 2);
    let value = &store.metric("pv", "fdr").unwrap().values["A"];
    // called at 0.05: 0.001, 0.02 and 0.04, of which only 0.04 is a true null
    assert_eq!(value.value, MetricValue::Scalar(Some(1.0 / 3.0)));
    assert_eq!(value.method_session, 0);

    let mut defs = ab();
    defs.modify_method("B", |m| m.set_param("scale", ParamValue::literal(10.0)))
        .unwrap();
    let (after, report) = run(&store, &defs);
    let row = report.metric_row("pv", "fdr").unwrap();
    assert_eq!(row.status, DiffStatus::Unchanged);
    assert_eq!(row.evaluated, vec!["B"]);
    let values = &after.metric("pv", "fdr").unwrap().values;
    assert_eq!(values["A"], store.metric("pv", "fdr").unwrap().values["A"]);
    assert_eq!(values["B"].method_session, 1);
    assert_eq!(after.session(1).unwrap().metrics, vec!["pv/fdr"]);
}

#[test]
fn metric_without_ground_truth_fails_locally() {
    let mut data = dataset();
    data.ground_truths.clear();
    let (store, report) = update_bench(
        &ResultStore::new(),
        Some(&ab()),
        Some(&DatasetInput::Full(data)),
        UpdateOptions::default().execute(),
    )
    .unwrap();
    assert_eq!(store.labels(), vec!["A", "B"]);
    let row = report.metric_row("pv", "fdr").unwrap();
    assert_eq!(row.failed["A"].code, ErrorCode::GroundTruthMissing);
    assert!(store.metric("pv", "fdr").is_none());

    let (_, next) = update_bench(&store, Some(&ab()), None, UpdateOptions::default()).unwrap();
    let row = next.metric_row("pv", "fdr").unwrap();
    assert_eq!(row.status, DiffStatus::New);
    assert!(row.needs_rerun);
    assert!(!next.is_up_to_date());
}

#[test]
fn failed_metric_change_keeps_old_values_and_stays_stale() {
    let (store, _) = run(&ResultStore::new(), &ab());
    let before = store.metric("pv", "fdr").unwrap().clone();

    let unbound = MetricDefinition::new(
        "pv",
        "fdr",
        Callable::unbound(CallableRecord::new("nope", Some("fdr v2"))),
    )
    .with_param("alpha", ParamValue::literal(0.05));
    let defs =
        DefinitionSet::from_parts(vec![scaled("A", 1.0), scaled("B", 1.0)], vec![unbound]).unwrap();

    let (after, report) = run(&store, &defs);
    let row = report.metric_row("pv", "fdr").unwrap();
    assert_eq!(row.failed.keys().collect::<Vec<_>>(), vec!["A", "B"]);
    assert_eq!(row.failed["A"].code, ErrorCode::CallableFailure);
    assert_eq!(report.session, None);
    assert_eq!(after.metric("pv", "fdr").unwrap(), &before);

    let (_, dry) = update_bench(&after, Some(&defs), Some(&input()), UpdateOptions::default())
        .unwrap();
    let row = dry.metric_row("pv", "fdr").unwrap();
    assert_eq!(row.status, DiffStatus::Changed);
    assert_eq!(row.mismatched, vec![Component::Function]);
    assert!(row.needs_rerun);
    assert!(!dry.is_up_to_date());
}

#[test]
fn orphaned_metric_follows_keep_all() {
    let (store, _) = run(&ResultStore::new(), &ab());
    let no_metrics =
        DefinitionSet::from_parts(vec![scaled("A", 1.0), scaled("B", 1.0)], vec![]).unwrap();

    let (kept, report) = run(&store, &no_metrics);
    let row = report.metric_row("pv", "fdr").unwrap();
    assert_eq!(row.status, DiffStatus::Orphaned);
    assert!(!row.removed);
    assert_eq!(kept.metric("pv", "fdr"), store.metric("pv", "fdr"));
    assert_eq!(report.session, None);

    let options = UpdateOptions::default().execute().keep_all(false);
    let (dropped, report) =
        update_bench(&store, Some(&no_metrics), Some(&input()), options).unwrap();
    assert!(report.metric_row("pv", "fdr").unwrap().removed);
    assert!(dropped.metric("pv", "fdr").is_none());
    assert_eq!(dropped.labels(), vec!["A", "B"]);
    assert_eq!(dropped.sessions().len(), 1);
    dropped.verify().unwrap();
}

#[test]
fn recompute_with_a_failure_keeps_the_recorded_digest() {
    let defs = DefinitionSet::from_parts(vec![scaled("A", 1.0), broken("X")], vec![]).unwrap();
    let (store, _) = run(&ResultStore::new(), &defs);
    let recorded = store.dataset_digest().map(str::to_string);
    assert_eq!(recorded, Some(dataset().digest()));

    let mut moved = dataset();
    moved.columns.insert("p".to_string(), vec![Some(0.5); 5]);
    let other = DatasetInput::Full(moved);
    let options = UpdateOptions::default()
        .execute()
        .dataset_policy(DatasetPolicy::Recompute);
    let (after, report) = update_bench(&store, Some(&defs), Some(&other), options).unwrap();

    assert!(report.row("A").unwrap().forced);
    assert_eq!(report.failed_labels(), vec!["X"]);
    assert_eq!(after.result("A").unwrap().session, 1);
    assert_eq!(after.dataset_digest().map(str::to_string), recorded);
    assert_eq!(
        after.session(1).unwrap().dataset_digest,
        Some(other.digest())
    );
}

#[test]
fn kept_dataset_copy_serves_later_updates() {
    let mut empty = ResultStore::new();
    empty.set_parameter("keep_dataset", &json!(true)).unwrap();
    let (store, _) = run(&empty, &ab());
    assert_eq!(store.dataset(), Some(&dataset()));

    let mut defs = ab();
    defs.modify_method("B", |m| m.set_param("scale", ParamValue::literal(2.0)))
        .unwrap();
    let (after, report) =
        update_bench(&store, Some(&defs), None, UpdateOptions::default().execute()).unwrap();
    assert!(report.failed_labels().is_empty());
    assert_eq!(after.result("B").unwrap().session, 1);
    assert_eq!(after.result("B").unwrap().assays["pv"][0], Some(0.002));
    assert_eq!(report.metric_row("pv", "fdr").unwrap().evaluated, vec!["B"]);

    // without the copy there is nothing to run against
    let (plain, _) = run(&ResultStore::new(), &ab());
    let (_, report) =
        update_bench(&plain, Some(&defs), None, UpdateOptions::default().execute()).unwrap();
    match &report.row("B").unwrap().outcome {
        MethodOutcome::Failed { error } => assert_eq!(error.code, ErrorCode::DatasetMissing),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn deferred_parameters_resolve_against_the_dataset() {
    let method = scaled("A", 1.0).with_param("scale", ParamValue::deferred("dataset.shrink"));
    let defs = DefinitionSet::from_parts(vec![method], vec![]).unwrap();
    let (store, _) = run(&ResultStore::new(), &defs);
    assert_eq!(store.result("A").unwrap().assays["pv"][0], Some(0.0005));

    let mut missing = defs.clone();
    missing
        .modify_method("A", |m| {
            m.set_param("scale", ParamValue::deferred("dataset.nope"))
        })
        .unwrap();
    let (_, report) = run(&store, &missing);
    match &report.row("A").unwrap().outcome {
        MethodOutcome::Failed { error } => assert_eq!(error.code, ErrorCode::InvalidInput),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn store_survives_a_save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.json");
    let path = path.to_str().unwrap();

    let (store, _) = run(&ResultStore::new(), &ab());
    store.save_to_path(path).unwrap();
    let back = ResultStore::load_from_path(path).unwrap();
    assert_eq!(back, store);

    let (_, report) = update_bench(&back, Some(&ab()), None, UpdateOptions::default()).unwrap();
    assert!(report.is_up_to_date());
}
