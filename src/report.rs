//! Plain-text rendering of a `DiffReport`.

use benchkeeper_protocol::{Component, DiffReport};
use itertools::Itertools;
use std::collections::BTreeMap;

fn component_cell(components: &BTreeMap<Component, bool>, component: Component) -> &'static str {
    match components.get(&component) {
        Some(true) => "ok",
        Some(false) => "CHANGED",
        None => "-",
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

fn render_rows(header: Vec<String>, rows: Vec<Vec<String>>) -> String {
    let widths: Vec<usize> = (0..header.len())
        .map(|i| {
            rows.iter()
                .map(|r| r[i].len())
                .chain(std::iter::once(header[i].len()))
                .max()
                .unwrap_or(0)
        })
        .collect();
    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(widths.iter().copied())
            .map(|(cell, w)| format!("{cell:<w$}"))
            .join("  ")
            .trim_end()
            .to_string()
    };
    let rule = widths.iter().map(|w| "-".repeat(*w)).join("  ");
    std::iter::once(line(header.as_slice()))
        .chain(std::iter::once(rule))
        .chain(rows.iter().map(|r| line(r.as_slice())))
        .join("\n")
}

/// Fixed-width method table, then the metric table and any warnings.
pub fn render_table(report: &DiffReport) -> String {
    let mut header: Vec<String> = vec!["label".into(), "status".into(), "rerun".into()];
    header.extend(Component::METHOD.iter().map(|c| c.to_string()));
    header.push("outcome".into());
    let rows = report
        .rows
        .iter()
        .map(|row| {
            let mut cells = vec![
                row.label.clone(),
                row.status.to_string(),
                if row.forced {
                    "yes (forced)".to_string()
                } else {
                    yes_no(row.needs_rerun).to_string()
                },
            ];
            cells.extend(
                Component::METHOD
                    .iter()
                    .map(|c| component_cell(&row.components, *c).to_string()),
            );
            cells.push(row.outcome.to_string());
            cells
        })
        .collect();
    let mut out = render_rows(header, rows);

    if !report.metric_rows.is_empty() {
        let mut header: Vec<String> = vec!["metric".into(), "status".into(), "rerun".into()];
        header.extend(Component::METRIC.iter().map(|c| c.to_string()));
        header.extend(["evaluated".to_string(), "failed".to_string()]);
        let rows = report
            .metric_rows
            .iter()
            .map(|row| {
                let mut cells = vec![
                    row.key(),
                    if row.removed {
                        "removed".to_string()
                    } else {
                        row.status.to_string()
                    },
                    yes_no(row.needs_rerun).to_string(),
                ];
                cells.extend(
                    Component::METRIC
                        .iter()
                        .map(|c| component_cell(&row.components, *c).to_string()),
                );
                cells.push(row.evaluated.len().to_string());
                cells.push(row.failed.keys().join(","));
                cells
            })
            .collect();
        out.push_str("\n\n");
        out.push_str(&render_rows(header, rows));
    }

    if report.dataset.matches() == Some(false) {
        out.push_str("\n\ndataset: digest differs from the recorded one");
    }
    for warning in &report.warnings {
        out.push_str(&format!("\nwarning: {warning}"));
    }
    if let Some(session) = report.session {
        out.push_str(&format!("\nsession {session} appended"));
    } else if report.dry_run {
        out.push_str(&format!(
            "\ndry run: {} row(s) need work",
            report.needs_rerun_count()
        ));
    }
    out
}
