//! Analysis Integration Tests
//!
//! Runs the full pipeline over temporary directory trees and checks the
//! recorded findings and counters.

use std::path::PathBuf;

use binscope::{run, AnalysisConfig, SelectorConfig, TargetConfig};
use binscope_core::{ReportLevel, SelectionMode};
use binscope_engine::AdmissionLimit;

use super::fixtures::{config_for, elf64, sample_tree, write};

fn ids(outcome: &binscope::AnalysisOutcome) -> Vec<(Option<PathBuf>, String)> {
    outcome
        .findings
        .iter()
        .map(|finding| (finding.entity.clone(), finding.message_id.clone()))
        .collect()
}

// ============================================================================
// Built-in rules
// ============================================================================

#[test]
fn test_sample_tree_findings() {
    let dir = sample_tree();
    let root = dir.path();
    let outcome = run(&config_for(root)).unwrap();

    assert_eq!(
        ids(&outcome),
        vec![
            (Some(root.join("bin/short")), "truncated_header".to_string()),
            (Some(root.join("bin/tool")), "duplicate_content".to_string()),
            (Some(root.join("lib/tool.copy")), "duplicate_content".to_string()),
            (Some(root.join("win/app.exe")), "truncated_header".to_string()),
        ]
    );

    let short = &outcome.findings[0];
    assert_eq!(short.level, ReportLevel::Error);
    assert_eq!(short.arg("expected"), Some("64"));
    assert_eq!(short.arg("actual"), Some("20"));

    let duplicate = &outcome.findings[1];
    let other = root.join("lib/tool.copy");
    assert_eq!(duplicate.arg("duplicate_of"), Some(other.to_string_lossy().as_ref()));
    assert_eq!(duplicate.arg("copies"), Some("2"));
    assert_eq!(duplicate.arg("digest").map(str::len), Some(64));

    let pe = &outcome.findings[3];
    assert_eq!(pe.arg("expected"), Some("152"));
    assert_eq!(pe.arg("actual"), Some("100"));
}

#[test]
fn test_progress_counters() {
    let dir = sample_tree();
    let outcome = run(&config_for(dir.path())).unwrap();

    assert_eq!(outcome.progress.analyzed, 4);
    assert_eq!(outcome.progress.skipped_unsupported, 1);
    assert_eq!(outcome.progress.skipped_inaccessible, 0);
    assert_eq!(outcome.pipeline.submitted, 4);
    assert_eq!(outcome.pipeline.finished, 4);
    assert!(!outcome.interrupted());
    assert!(outcome.timing.duration().is_some());
}

#[test]
fn test_combined_analysis_disabled() {
    let dir = sample_tree();
    let config = AnalysisConfig {
        combined_analysis: false,
        ..config_for(dir.path())
    };
    let outcome = run(&config).unwrap();
    assert!(outcome
        .findings
        .iter()
        .all(|finding| finding.message_id != "duplicate_content"));
    assert_eq!(outcome.findings.len(), 2);
}

#[test]
fn test_selector_excludes_reports() {
    let dir = sample_tree();
    let mut config = config_for(dir.path());
    config.selector.mode = SelectionMode::IncludeSelected;
    config.selector.reports = vec!["duplicate_content".to_string()];
    let outcome = run(&config).unwrap();
    assert_eq!(outcome.findings.len(), 2);
    assert!(outcome
        .findings
        .iter()
        .all(|finding| finding.message_id == "duplicate_content"));

    let mut config = config_for(dir.path());
    config.selector.excluded_levels = vec![ReportLevel::Info];
    let outcome = run(&config).unwrap();
    assert!(outcome
        .findings
        .iter()
        .all(|finding| finding.level != ReportLevel::Info));
}

// ============================================================================
// Per-target settings
// ============================================================================

fn quiet(reports: &[&str]) -> Option<SelectorConfig> {
    Some(SelectorConfig {
        reports: reports.iter().map(|uid| uid.to_string()).collect(),
        ..SelectorConfig::default()
    })
}

#[test]
fn test_targets_with_different_selectors() {
    let dir = sample_tree();
    let root = dir.path();
    let config = AnalysisConfig {
        targets: vec![
            TargetConfig::new(root.join("bin")),
            TargetConfig {
                selector: quiet(&["truncated_header", "duplicate_content"]),
                ..TargetConfig::new(root.join("lib"))
            },
            TargetConfig {
                selector: quiet(&["truncated_header"]),
                ..TargetConfig::new(root.join("win"))
            },
        ],
        ..config_for(root)
    };
    let outcome = run(&config).unwrap();

    // lib/tool.copy still feeds the digest index but reports nothing itself.
    assert_eq!(
        ids(&outcome),
        vec![
            (Some(root.join("bin/short")), "truncated_header".to_string()),
            (Some(root.join("bin/tool")), "duplicate_content".to_string()),
        ]
    );
    let copy = root.join("lib/tool.copy");
    assert_eq!(
        outcome.findings[1].arg("duplicate_of"),
        Some(copy.to_string_lossy().as_ref())
    );
    assert_eq!(outcome.progress.analyzed, 4);
}

#[test]
fn test_target_path_filters() {
    let dir = sample_tree();
    let root = dir.path();

    let tools_only = AnalysisConfig {
        targets: vec![TargetConfig {
            include: vec!["/tool".to_string()],
            ..TargetConfig::new(root)
        }],
        ..config_for(root)
    };
    let outcome = run(&tools_only).unwrap();
    assert_eq!(outcome.progress.analyzed, 2);
    assert_eq!(outcome.progress.skipped_unsupported, 0);
    assert!(outcome
        .findings
        .iter()
        .all(|finding| finding.message_id == "duplicate_content"));
    assert_eq!(outcome.findings.len(), 2);

    let without_copy = AnalysisConfig {
        targets: vec![TargetConfig {
            include: vec!["/tool".to_string()],
            exclude: vec![r"\.copy$".to_string()],
            ..TargetConfig::new(root)
        }],
        ..config_for(root)
    };
    let outcome = run(&without_copy).unwrap();
    assert_eq!(outcome.progress.analyzed, 1);
    assert!(outcome.findings.is_empty());
}

#[test]
fn test_admission_limits_give_same_findings() {
    let dir = sample_tree();
    let baseline = ids(&run(&config_for(dir.path())).unwrap());

    for limit in [
        AdmissionLimit::BufferedItems(1),
        AdmissionLimit::MaxConcurrentTasks(1),
        AdmissionLimit::MaxLoadedBytes(64),
    ] {
        let config = AnalysisConfig {
            preload_limit: limit,
            ..config_for(dir.path())
        };
        assert_eq!(ids(&run(&config).unwrap()), baseline, "{limit:?}");
    }
}

#[test]
fn test_flat_walk_skips_subdirectories() {
    let dir = sample_tree();
    write(dir.path(), "top", &elf64(8, 0));
    let config = AnalysisConfig {
        recursive: false,
        ..config_for(dir.path())
    };
    let outcome = run(&config).unwrap();
    assert_eq!(
        ids(&outcome),
        vec![(Some(dir.path().join("top")), "truncated_header".to_string())]
    );
    assert_eq!(outcome.progress.skipped_unsupported, 1);
}

#[test]
fn test_missing_target_is_inaccessible() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let outcome = run(&config_for(&missing)).unwrap();
    assert_eq!(outcome.findings.len(), 1);
    assert_eq!(outcome.findings[0].message_id, "inaccessible_entity");
    assert_eq!(outcome.findings[0].level, ReportLevel::Critical);
    assert_eq!(outcome.progress.skipped_inaccessible, 1);
}

#[cfg(unix)]
#[test]
fn test_world_writable_executable() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let open = write(dir.path(), "open", &elf64(128, 1));
    std::fs::set_permissions(&open, std::fs::Permissions::from_mode(0o777)).unwrap();
    let closed = write(dir.path(), "closed", &elf64(128, 2));
    std::fs::set_permissions(&closed, std::fs::Permissions::from_mode(0o755)).unwrap();
    // Writable by everyone but not executable
    let data = write(dir.path(), "data", &elf64(128, 3));
    std::fs::set_permissions(&data, std::fs::Permissions::from_mode(0o666)).unwrap();

    let outcome = run(&config_for(dir.path())).unwrap();
    assert_eq!(ids(&outcome), vec![(Some(open), "world_writable_binary".to_string())]);
    assert_eq!(outcome.findings[0].arg("mode"), Some("777"));
}
