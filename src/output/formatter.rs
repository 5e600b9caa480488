//! Output formatters for suite reports
//!
//! Provides JSON, table and one-line summary renderings.

use std::io::Write;

use crate::models::{Report, SpecReport, SpecState};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Report formatter
pub struct ReportFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ReportFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Format a single spec report
    pub fn format_spec_report(&self, report: &SpecReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(report).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Table | OutputFormat::Summary => self.format_spec_line(report),
        }
    }

    fn format_spec_line(&self, report: &SpecReport) -> String {
        let state = if self.colorize {
            match report.state {
                SpecState::Passed => format!("\x1b[32m{}\x1b[0m", report.state),
                SpecState::Pending | SpecState::Skipped => {
                    format!("\x1b[33m{}\x1b[0m", report.state)
                }
                s if s.is_failure() => format!("\x1b[31m{s}\x1b[0m"),
                s => s.to_string(),
            }
        } else {
            report.state.to_string()
        };

        let mut line = format!(
            "{} {:12} {} [{}ms]",
            report.state.symbol(),
            state,
            display_text(report),
            report.run_time.as_millis()
        );
        if report.state.is_failure() && !report.failure.message.is_empty() {
            line.push_str(&format!("\n    {}", report.failure.message));
            if !report.failure.location.is_zero() {
                line.push_str(&format!("\n    at {}", report.failure.location));
            }
        }
        line
    }

    /// Format a suite report
    pub fn format_report(&self, report: &Report) -> String {
        match self.format {
            OutputFormat::Table => self.format_report_table(report),
            OutputFormat::Json => serde_json::to_string(report).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Summary => self.format_report_brief(report),
        }
    }

    fn format_report_table(&self, report: &Report) -> String {
        let mut output = String::new();

        output.push_str("\n═══════════════════════════════════════════════════════════════\n");
        output.push_str(&format!(" {}\n", report.suite_description));
        output.push_str("═══════════════════════════════════════════════════════════════\n");

        for spec in &report.spec_reports {
            output.push_str(&format!(" {}\n", self.format_spec_line(spec)));
        }

        output.push_str(" ───────────────────────────────────────────────────────────\n");
        for reason in &report.special_suite_failure_reasons {
            output.push_str(&format!(" ! {reason}\n"));
        }

        let verdict = match (report.suite_succeeded, self.colorize) {
            (true, true) => "\x1b[32mSUCCESS!\x1b[0m".to_string(),
            (false, true) => "\x1b[31mFAIL!\x1b[0m".to_string(),
            (true, false) => "SUCCESS!".to_string(),
            (false, false) => "FAIL!".to_string(),
        };
        output.push_str(&format!(" {} {}\n", verdict, self.format_counts(report)));
        output
    }

    fn format_report_brief(&self, report: &Report) -> String {
        format!(
            "{} - {} in {}ms",
            if report.suite_succeeded { "SUCCESS" } else { "FAIL" },
            self.format_counts(report),
            report.run_time.as_millis()
        )
    }

    fn format_counts(&self, report: &Report) -> String {
        format!(
            "{} Passed | {} Failed | {} Pending | {} Skipped",
            report.count_with_state(|s| s == SpecState::Passed),
            report.count_with_state(|s| s.is_failure()),
            report.count_with_state(|s| s == SpecState::Pending),
            report.count_with_state(|s| s == SpecState::Skipped),
        )
    }
}

impl Default for ReportFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn display_text(report: &SpecReport) -> String {
    let text = report.full_text();
    match report.leaf_node_type {
        Some(node_type) if text.is_empty() => format!("[{node_type}]"),
        _ => text,
    }
}

/// Write a suite report to a file
pub fn write_report_to_file(path: &str, report: &Report, format: OutputFormat) -> anyhow::Result<()> {
    let formatter = ReportFormatter::new(format).no_color();
    let content = formatter.format_report(report);

    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}
