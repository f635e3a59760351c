//! Display formatting for CLI output
//!
//! Pure functions that format data for display

use serde::Serialize;

use super::OutputFormat;
use crate::apis::SetLabelsRequest;
use crate::gc::GcReport;
use crate::master::DesiredState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRunOutput<'a> {
    node: &'a str,
    #[serde(flatten)]
    state: &'a DesiredState,
}

/// Render the outcome of a dry run
pub fn format_desired_state(
    node: &str,
    state: &DesiredState,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let output = DryRunOutput { node, state };
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(&output)?,
        OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&output)?),
    })
}

pub fn format_report_sent(request: &SetLabelsRequest, server: &str) -> String {
    format!(
        "Reported {} labels for node {} to {}\n",
        request.labels.len(),
        request.node_name,
        server
    )
}

pub fn format_prune_summary(pruned: usize) -> String {
    match pruned {
        0 => "No nodes needed pruning.\n".to_string(),
        1 => "Pruned 1 node.\n".to_string(),
        n => format!("Pruned {} nodes.\n", n),
    }
}

pub fn format_gc_report(report: &GcReport) -> String {
    if report.deleted.is_empty() && report.failed == 0 {
        return "No orphaned objects found.\n".to_string();
    }

    let mut output = String::new();
    for object in &report.deleted {
        output.push_str(&format!(
            "deleted {} (node {})\n",
            object.display_name(),
            object.node
        ));
    }
    if report.failed > 0 {
        output.push_str(&format!("{} deletions failed\n", report.failed));
    }
    output
}
