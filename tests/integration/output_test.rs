//! Configuration and Output Integration Tests

use std::io::Write;

use binscope::{render, run, AnalysisConfig, AppError, OutputFormat};
use tempfile::NamedTempFile;

use super::fixtures::{config_for, sample_tree};

#[test]
fn test_json_output_round_trips_findings() {
    let dir = sample_tree();
    let outcome = run(&config_for(dir.path())).unwrap();

    let json = render(&outcome, OutputFormat::Json).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    let findings = value["findings"].as_array().unwrap();
    assert_eq!(findings.len(), outcome.findings.len());
    assert_eq!(findings[0]["messageId"], "truncated_header");
    assert_eq!(value["progress"]["skippedUnsupported"], 1);
    assert_eq!(value["timing"]["interrupted"], false);
}

#[test]
fn test_text_output_lists_every_finding() {
    let dir = sample_tree();
    let outcome = run(&config_for(dir.path())).unwrap();

    let text = render(&outcome, OutputFormat::Text).unwrap();
    let finding_lines = text.lines().filter(|line| line.starts_with('[')).count();
    assert_eq!(finding_lines, outcome.findings.len());
    assert!(text.contains("4 findings; analyzed 4"));
}

#[test]
fn test_config_file_drives_run() {
    let dir = sample_tree();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
targets = [{:?}]
signal_cancellation = false
combined_analysis = false

[selector]
mode = "include_selected"
reports = ["truncated_header"]

[[selector.filters]]
report = "truncated_header"
action = "exclude"
args = {{ actual = "^100$" }}
"#,
        dir.path().display().to_string()
    )
    .unwrap();

    let config = AnalysisConfig::load_from_file(file.path()).unwrap();
    let outcome = run(&config).unwrap();
    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].arg("actual"), Some("20"));
}

#[test]
fn test_unknown_report_rejected_before_run() {
    let dir = sample_tree();
    let mut config = config_for(dir.path());
    config.selector.reports = vec!["no_such_report".to_string()];
    assert!(matches!(run(&config), Err(AppError::Validation(_))));
}
