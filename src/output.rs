use std::fmt::{self, Write as _};
use std::io::{self, Write};

use serde::Serialize;
use tracing::{info, warn};

use crate::orchestrator::{
    DryRunPlan, ProgressSink, RunSummary, StatusReport, UnitEvent, UnitOutcome,
};

const RULE_WIDTH: usize = 80;
const BAR_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_plan(plan: &DryRunPlan) -> io::Result<()> {
        Self::print_json(plan)
    }

    pub fn print_status(report: &StatusReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print(Self::render_summary(summary))
    }

    pub fn print_plan(plan: &DryRunPlan) -> io::Result<()> {
        Self::print(Self::render_plan(plan))
    }

    pub fn print_status(report: &StatusReport) -> io::Result<()> {
        Self::print(Self::render_status(report))
    }

    fn print(rendered: Result<String, fmt::Error>) -> io::Result<()> {
        let text = rendered.map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()
    }

    pub fn render_summary(summary: &RunSummary) -> Result<String, fmt::Error> {
        let rule = "=".repeat(RULE_WIDTH);
        let mut out = String::new();
        writeln!(out, "{rule}")?;
        writeln!(out, "BACKFILL RUN ({})", summary.provider)?;
        writeln!(out, "{rule}")?;
        writeln!(out, "Stopped:            {}", summary.stop_reason)?;
        if let Some(error) = &summary.error {
            writeln!(out, "Error:              {error}")?;
        }
        writeln!(out, "Queued units:       {}", summary.queue_len)?;
        writeln!(out, "Attempted:          {}", summary.attempted)?;
        writeln!(out, "  completed:        {}", summary.completed)?;
        writeln!(out, "  no data:          {}", summary.no_data)?;
        writeln!(out, "  failed:           {}", summary.failed)?;
        writeln!(out, "  rate limited:     {}", summary.rate_limited)?;
        writeln!(out, "Observations:       {}", summary.observations_written)?;
        writeln!(
            out,
            "Budget used:        {:.1} / {:.1}",
            summary.spent, summary.cap
        )?;
        if !summary.untouched_targets.is_empty() {
            let ids: Vec<&str> = summary
                .untouched_targets
                .iter()
                .map(|id| id.as_str())
                .collect();
            writeln!(
                out,
                "Untouched targets:  {} ({})",
                ids.len(),
                ids.join(", ")
            )?;
        }
        writeln!(out, "{rule}")?;
        Ok(out)
    }

    pub fn render_plan(plan: &DryRunPlan) -> Result<String, fmt::Error> {
        let rule = "=".repeat(RULE_WIDTH);
        let mut out = String::new();
        writeln!(out, "{rule}")?;
        writeln!(out, "DRY RUN ({})", plan.provider)?;
        writeln!(out, "{rule}")?;
        writeln!(
            out,
            "Work queue: {} units ({} targets x {} periods in range)",
            plan.total_units, plan.targets, plan.periods
        )?;
        for tier in &plan.tiers {
            writeln!(out, "  tier {} ({}): {}", tier.tier.rank(), tier.tier, tier.units)?;
        }
        if !plan.preview.is_empty() {
            writeln!(out, "\nFirst {} units:", plan.preview.len())?;
            for unit in &plan.preview {
                writeln!(
                    out,
                    "  {} ({}) - {} - cost: {:.1}",
                    unit.display_name, unit.target_id, unit.period, plan.cost_per_unit
                )?;
            }
        }
        writeln!(out, "\nTotal estimated cost: {:.0} weighted calls", plan.total_cost)?;
        match plan.days_to_complete {
            Some(days) => writeln!(
                out,
                "Days to complete at {:.0}/day budget: {:.0}",
                plan.budget,
                days.ceil()
            )?,
            None => writeln!(out, "Days to complete: never (budget is zero)")?,
        }
        Ok(out)
    }

    pub fn render_status(report: &StatusReport) -> Result<String, fmt::Error> {
        let rule = "=".repeat(RULE_WIDTH);
        let mut out = String::new();
        writeln!(out, "\n{rule}")?;
        writeln!(
            out,
            "BACKFILL PROGRESS ({}, {}-{})",
            report.provider, report.first_period, report.last_period
        )?;
        writeln!(out, "{rule}")?;
        writeln!(out, "Total units: {}", report.total_units)?;
        writeln!(out, "Completed: {}", report.counts.completed)?;
        writeln!(out, "No data: {}", report.counts.no_data)?;
        writeln!(out, "Failed: {}", report.counts.failed)?;
        writeln!(out, "Remaining: {}", report.remaining)?;
        writeln!(out, "Progress: {:.1}%", report.percent_done)?;
        match report.days_remaining {
            Some(days) => writeln!(out, "Est. days remaining: {:.0}", days.ceil())?,
            None => writeln!(out, "Est. days remaining: n/a (budget is zero)")?,
        }

        writeln!(out, "\n{rule}")?;
        writeln!(out, "BY GROUP:")?;
        writeln!(out, "{rule}")?;
        for group in &report.groups {
            writeln!(
                out,
                "  {:30} [{}] {:5.1}% ({}/{})",
                group.group,
                progress_bar(group.percent_done),
                group.percent_done,
                group.terminal_units,
                group.total_units
            )?;
        }
        writeln!(out, "{rule}")?;
        Ok(out)
    }
}

fn progress_bar(percent: f64) -> String {
    let filled = ((percent / 100.0) * BAR_WIDTH as f64).floor().clamp(0.0, BAR_WIDTH as f64) as usize;
    format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

/// Reports each attempted unit through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: UnitEvent) {
        let position = format!("[{}/{}]", event.position, event.queue_len);
        match &event.outcome {
            UnitOutcome::Completed { observations } => info!(
                "{position} {} ({}) {}: {observations} days (cost {:.1}, spent {:.1})",
                event.display_name, event.target_id, event.period, event.charged, event.spent
            ),
            UnitOutcome::NoData => info!(
                "{position} {} ({}) {}: no data (cost {:.1}, spent {:.1})",
                event.display_name, event.target_id, event.period, event.charged, event.spent
            ),
            UnitOutcome::Failed { error } => warn!(
                "{position} {} ({}) {}: failed: {error}",
                event.display_name, event.target_id, event.period
            ),
            UnitOutcome::RateLimited { error } => warn!(
                "{position} {} ({}) {}: {error}, will retry next run",
                event.display_name, event.target_id, event.period
            ),
        }
    }
}

/// Swallows events; JSON mode keeps stdout for the final document.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: UnitEvent) {}
}
