use anyhow::{anyhow, bail, Context};
use benchkeeper::{
    about,
    bench::{prune_orphans, report_staleness, update_bench},
    config::{BenchParameters, UpdateOptions},
    dataset::{Dataset, DatasetInput},
    definition::{DefinitionSet, DefinitionSetRecord},
    registry::FunctionRegistry,
    report::render_table,
    store::ResultStore,
    DiffReport,
};
use log::{info, warn};
use serde::Serialize;
use std::{env, fs, path::Path};

const DEFAULT_STORE_PATH: &str = ".benchkeeper_store.json";

#[derive(Serialize)]
struct DatasetVerification {
    recorded: Option<String>,
    supplied: String,
    matches: Option<bool>,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  benchkeeper_cli --version\n  \
  benchkeeper_cli [--store PATH] summary\n  \
  benchkeeper_cli [--store PATH] sessions\n  \
  benchkeeper_cli [--store PATH] staleness [DEFS.json] [--data DATA.json] [--table]\n  \
  benchkeeper_cli [--store PATH] design\n  \
  benchkeeper_cli [--store PATH] verify-dataset DATA.json\n  \
  benchkeeper_cli [--store PATH] prune DEFS.json [--table]\n  \
  benchkeeper_cli [--store PATH] export-store PATH\n  \
  benchkeeper_cli [--store PATH] import-store PATH\n  \
  benchkeeper_cli [--store PATH] set-parameter NAME JSON\n\n  \
  Tip: pass @file.json instead of inline JSON"
    );
}

fn load_json_arg(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix('@') {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("Could not read JSON file '{path}'"))
        }
        None => Ok(value.to_string()),
    }
}

fn load_store(path: &str) -> anyhow::Result<ResultStore> {
    if Path::new(path).exists() {
        Ok(ResultStore::load_from_path(path)?)
    } else {
        info!("no store at '{path}', starting empty");
        Ok(ResultStore::with_parameters(
            BenchParameters::default().with_env_overrides(),
        ))
    }
}

fn load_definitions(path: &str) -> anyhow::Result<DefinitionSet> {
    let record = DefinitionSetRecord::load_from_path(path)?;
    let mut defs = DefinitionSet::from_record(&record)?;
    for name in FunctionRegistry::with_builtins().bind(&mut defs) {
        warn!("unbound callable {name}");
    }
    Ok(defs)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn print_report(report: &DiffReport, table: bool) -> anyhow::Result<()> {
    if table {
        println!("{}", render_table(report));
        Ok(())
    } else {
        print_json(report)
    }
}

fn parse_global_store_arg(args: &[String]) -> (String, usize) {
    if args.len() >= 3 && args[1] == "--store" {
        return (args[2].clone(), 3);
    }
    (DEFAULT_STORE_PATH.to_string(), 1)
}

/// Splits `--table` and `--data PATH` off the positional arguments.
fn parse_report_flags(args: &[String]) -> anyhow::Result<(Vec<String>, bool, Option<String>)> {
    let mut positional = vec![];
    let mut table = false;
    let mut data = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--table" => table = true,
            "--data" => {
                data = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("--data requires a path"))?
                        .clone(),
                );
            }
            _ => positional.push(arg.clone()),
        }
    }
    Ok((positional, table, data))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        bail!("Missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }

    let (store_path, cmd_idx) = parse_global_store_arg(&args);
    if args.len() <= cmd_idx {
        usage();
        bail!("Missing command");
    }
    let command = &args[cmd_idx];
    let rest = &args[cmd_idx + 1..];

    match command.as_str() {
        "summary" => print_json(&load_store(&store_path)?.summary()),
        "sessions" => print_json(&load_store(&store_path)?.sessions()),
        "design" => print_json(&load_store(&store_path)?.recorded_definitions()?.record()),
        "staleness" => {
            let (positional, table, data_path) = parse_report_flags(rest)?;
            let store = load_store(&store_path)?;
            let report = match positional.first() {
                None => report_staleness(&store)?,
                Some(defs_path) => {
                    let defs = load_definitions(defs_path)?;
                    let dataset = data_path
                        .as_deref()
                        .map(Dataset::load_from_path)
                        .transpose()?
                        .map(DatasetInput::Full);
                    let parameters = store.parameters().clone().with_env_overrides();
                    let options = UpdateOptions::from_parameters(&parameters);
                    update_bench(&store, Some(&defs), dataset.as_ref(), options)?.1
                }
            };
            print_report(&report, table)
        }
        "verify-dataset" => {
            let path = rest
                .first()
                .ok_or_else(|| anyhow!("verify-dataset requires DATA.json"))?;
            let store = load_store(&store_path)?;
            let supplied = Dataset::load_from_path(path)?.digest();
            let recorded = store.dataset_digest().map(str::to_string);
            let matches = recorded.as_ref().map(|r| *r == supplied);
            print_json(&DatasetVerification {
                recorded,
                supplied,
                matches,
            })
        }
        "prune" => {
            let (positional, table, _) = parse_report_flags(rest)?;
            let defs_path = positional
                .first()
                .ok_or_else(|| anyhow!("prune requires DEFS.json"))?;
            let store = load_store(&store_path)?;
            let defs = load_definitions(defs_path)?;
            let (pruned, report) = prune_orphans(&store, &defs)?;
            pruned.save_to_path(&store_path)?;
            print_report(&report, table)
        }
        "export-store" => {
            let path = rest
                .first()
                .ok_or_else(|| anyhow!("export-store requires PATH"))?;
            load_store(&store_path)?.save_to_path(path)?;
            println!("Wrote store to '{path}'");
            Ok(())
        }
        "import-store" => {
            let path = rest
                .first()
                .ok_or_else(|| anyhow!("import-store requires PATH"))?;
            let store = ResultStore::load_from_path(path)?;
            store.save_to_path(&store_path)?;
            println!("Imported store from '{path}' into '{store_path}'");
            Ok(())
        }
        "set-parameter" => {
            if rest.len() < 2 {
                bail!("set-parameter requires NAME JSON");
            }
            let value: serde_json::Value = serde_json::from_str(&load_json_arg(&rest[1])?)
                .context("Invalid parameter JSON")?;
            let mut store = load_store(&store_path)?;
            let message = store.set_parameter(&rest[0], &value)?;
            store.save_to_path(&store_path)?;
            println!("{message}");
            Ok(())
        }
        other => {
            usage();
            bail!("Unknown command '{other}'")
        }
    }
}
