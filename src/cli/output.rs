//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{InfraConfig, ValidationResult};
use crate::engine::{DriftReport, RunSummary};
use crate::graph::{DependencyGraph, NodeStatus};
use crate::planner::{Action, AttributeChange, Plan, PlanEntry};
use crate::state::{LockInfo, StateDocument};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan entry row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Run outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for machine-readable output.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan ({})\n", plan.mode);
        let _ = write!(output, "   Config hash: {}\n\n", short(&plan.config_hash));

        let changes = plan.changes();
        let rows: Vec<PlanRow> = changes
            .iter()
            .enumerate()
            .map(|(i, entry)| PlanRow {
                index: i + 1,
                action: Self::format_action(entry.action),
                resource: entry.address.to_string(),
                detail: Self::truncate(&Self::entry_detail(entry), 50),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for entry in changes.iter().filter(|e| !e.changes.is_empty()) {
                let _ = writeln!(output, "\n  {} {}", Self::format_action(entry.action), entry.address);
                for change in &entry.changes {
                    let _ = writeln!(output, "      {}", Self::format_change(change));
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Json => to_json(summary),
            OutputFormat::Text => {
                let status = if summary.is_success() {
                    format!("{} {} complete", "✓".green(), summary.operation)
                } else {
                    format!("{} {} incomplete", "✗".red(), summary.operation)
                };

                let mut output = format!("{status}\n\n");
                let rows: Vec<OutcomeRow> = summary
                    .outcomes
                    .iter()
                    .filter(|o| o.action != Action::NoOp || !o.status.is_success())
                    .map(|o| OutcomeRow {
                        resource: o.address.to_string(),
                        action: o.action.to_string(),
                        status: Self::format_status(o.status),
                        error: Self::truncate(o.error.as_deref().unwrap_or(""), 60),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push_str("\n\n");
                }

                let _ = writeln!(output, "   Changed: {}", summary.changed);
                let _ = writeln!(output, "   Unchanged: {}", summary.unchanged);
                let _ = writeln!(output, "   Destroyed: {}", summary.destroyed);
                if !summary.is_success() {
                    let _ = writeln!(output, "   Failed: {}", summary.failed.to_string().red());
                    let _ = writeln!(output, "   Skipped: {}", summary.skipped.to_string().yellow());
                }
                if summary.cancelled {
                    let _ = writeln!(output, "\n{} Run was cancelled before completion.", "⚠".yellow());
                }
                let _ = writeln!(output, "   State serial: {}", summary.serial);
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!(
                        "{} No drift detected - {} resource(s) match state.\n",
                        "✓".green(),
                        report.checked
                    )
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for resource in &report.drifted {
                        let detail = if resource.missing {
                            "remote object is gone".red().to_string()
                        } else {
                            resource.changed.join(", ")
                        };
                        let _ = writeln!(output, "   - {} ({}): {detail}", resource.address, resource.id);
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources have drifted.\n",
                        report.drifted.len(),
                        report.checked
                    );
                    output
                }
            }
        }
    }

    /// Formats the state document.
    #[must_use]
    pub fn format_state(&self, state: &StateDocument) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Config hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.len());

                if !state.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .resources
                        .iter()
                        .map(|(address, record)| RecordRow {
                            resource: if record.tainted {
                                format!("{address} {}", "(tainted)".red())
                            } else {
                                address.to_string()
                            },
                            id: record.id.clone(),
                            dependencies: record
                                .dependencies
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", "),
                            updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a validation result with a short configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &InfraConfig,
        graph: &DependencyGraph,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": config.project.environment,
                "resources": graph.len(),
                "order": graph.topological_order(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration is valid!\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", graph.len());
                let _ = writeln!(output, "   Schemas: {} custom", config.schemas.len());
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "{} State locked by {} (lock ID {}, expires in {}s)\n",
                "✓".green(),
                lock.holder,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, marker: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }

    /// Short detail for a plan entry: changed attributes, forcing ones starred.
    fn entry_detail(entry: &PlanEntry) -> String {
        let mut detail = entry
            .changes
            .iter()
            .map(|c| {
                if c.force_new {
                    format!("{}*", c.attribute)
                } else {
                    c.attribute.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        if !entry.displaces.is_empty() {
            let _ = write!(detail, " (deletes {} dependent(s) first)", entry.displaces.len());
        }
        if !entry.deposed.is_empty() {
            let _ = write!(detail, " (+{} deposed)", entry.deposed.len());
        }
        if entry.deferred {
            detail.push_str(" (deferred)");
        }
        detail
    }

    /// Formats one attribute change.
    fn format_change(change: &AttributeChange) -> String {
        let before = change.before.as_ref().map_or_else(|| "(none)".to_string(), ToString::to_string);
        let after = if change.unknown {
            "(known after apply)".to_string()
        } else {
            change.after.as_ref().map_or_else(|| "(removed)".to_string(), ToString::to_string)
        };
        let mut line = format!("{}: {before} -> {after}", change.attribute);
        if change.force_new {
            let _ = write!(line, " {}", "(forces replacement)".red());
        }
        line
    }

    /// Formats an action with color.
    fn format_action(action: Action) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Replace => "±replace".magenta().to_string(),
            Action::Delete => "-delete".red().to_string(),
            Action::NoOp => "no-op".dimmed().to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_status(status: NodeStatus) -> String {
        match status {
            NodeStatus::Applied | NodeStatus::Destroyed => status.to_string().green().to_string(),
            NodeStatus::Failed => status.to_string().red().to_string(),
            NodeStatus::Skipped => status.to_string().yellow().to_string(),
            NodeStatus::Pending | NodeStatus::Planned | NodeStatus::Executing => {
                status.to_string().dimmed().to_string()
            }
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
