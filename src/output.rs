//! Output Rendering
//!
//! Findings followed by the run summary, as plain text lines or one JSON
//! document.

use std::fmt::Write;

use binscope_core::{Finding, ProgressSnapshot, TimingSummary};
use binscope_engine::PipelineStats;
use serde::Serialize;

use crate::analysis::AnalysisOutcome;
use crate::error::AppResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// JSON document written for [`OutputFormat::Json`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary<'a> {
    pub findings: &'a [Finding],
    pub timing: TimingSummary,
    pub progress: ProgressSnapshot,
    pub pipeline: PipelineStats,
}

impl<'a> From<&'a AnalysisOutcome> for RunSummary<'a> {
    fn from(outcome: &'a AnalysisOutcome) -> Self {
        Self {
            findings: &outcome.findings,
            timing: outcome.timing.summary(),
            progress: outcome.progress,
            pipeline: outcome.pipeline,
        }
    }
}

pub fn render(outcome: &AnalysisOutcome, format: OutputFormat) -> AppResult<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&RunSummary::from(outcome))?),
        OutputFormat::Text => Ok(render_text(outcome)),
    }
}

fn render_text(outcome: &AnalysisOutcome) -> String {
    let mut out = String::new();
    for finding in &outcome.findings {
        out.push_str(&finding_line(finding));
        out.push('\n');
    }

    let progress = &outcome.progress;
    let _ = writeln!(
        out,
        "{} findings; analyzed {}, skipped {} unsupported and {} inaccessible, {} bytes loaded",
        outcome.findings.len(),
        progress.analyzed,
        progress.skipped_unsupported,
        progress.skipped_inaccessible,
        progress.loaded_bytes,
    );

    let timing = outcome.timing.summary();
    if let Some(started) = timing.started_at {
        let _ = write!(out, "started {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(ms) = timing.duration_ms {
            let _ = write!(out, ", took {ms} ms");
        }
        if timing.interrupted {
            out.push_str(" (interrupted)");
        }
        out.push('\n');
    }
    out
}

/// `[level] path: message_id (name=value, ...)`
pub fn finding_line(finding: &Finding) -> String {
    let entity = finding
        .entity
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<analysis>".to_string());
    let mut line = format!("[{}] {}: {}", finding.level, entity, finding.message_id);
    if !finding.args.is_empty() {
        let args: Vec<String> = finding
            .args
            .iter()
            .map(|arg| format!("{}={}", arg.name, arg.value))
            .collect();
        let _ = write!(line, " ({})", args.join(", "));
    }
    line
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use binscope_core::{arg, ReportLevel, TimeTracker};
    use chrono::Utc;

    use super::*;

    fn outcome() -> AnalysisOutcome {
        let mut timing = TimeTracker::new();
        timing.start();
        timing.stop(false);
        AnalysisOutcome {
            findings: vec![Finding {
                entity: Some(PathBuf::from("/bin/tool")),
                level: ReportLevel::Error,
                message_id: "truncated_header".to_string(),
                args: vec![arg("expected", 64), arg("actual", 10)],
                recorded_at: Utc::now(),
            }],
            timing,
            progress: ProgressSnapshot {
                loaded: 1,
                analyzed: 1,
                ..ProgressSnapshot::default()
            },
            pipeline: PipelineStats::default(),
        }
    }

    #[test]
    fn test_finding_line() {
        let outcome = outcome();
        assert_eq!(
            finding_line(&outcome.findings[0]),
            "[error] /bin/tool: truncated_header (expected=64, actual=10)"
        );

        let common = Finding {
            entity: None,
            args: Vec::new(),
            ..outcome.findings[0].clone()
        };
        assert_eq!(finding_line(&common), "[error] <analysis>: truncated_header");
    }

    #[test]
    fn test_text_summary() {
        let text = render(&outcome(), OutputFormat::Text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("1 findings; analyzed 1"));
        assert!(lines[2].starts_with("started "));
        assert!(!lines[2].contains("interrupted"));
    }

    #[test]
    fn test_json_document() {
        let json = render(&outcome(), OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["findings"][0]["messageId"], "truncated_header");
        assert_eq!(value["findings"][0]["level"], "error");
        assert_eq!(value["progress"]["analyzed"], 1);
        assert_eq!(value["timing"]["interrupted"], false);
        assert!(value["pipeline"]["submitted"].is_number());
    }
}
