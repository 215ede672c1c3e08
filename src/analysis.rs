//! Analysis Runner
//!
//! Wires the built-in detectors and rules into a [`SharedContext`] and runs
//! one analysis over the configured targets. [`run`] owns the pipeline
//! runtimes, so it must be called from synchronous code.

use std::sync::Arc;

use binscope_core::{
    FileResourceLoader, Finding, InMemoryReport, ProgressSnapshot, ProgressStats, TimeTracker,
    TracingProgress,
};
use binscope_engine::{AnalysisContext, EntityAnalyzer, Pipeline, PipelineStats, SharedContext};

use crate::config::AnalysisConfig;
use crate::error::{AppError, AppResult};
use crate::fs::{FsTarget, FsTargetSource};
use crate::{detectors, rules};

/// Result of one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// Sorted by entity path (common findings first), then message id
    pub findings: Vec<Finding>,
    pub timing: TimeTracker,
    pub progress: ProgressSnapshot,
    pub pipeline: PipelineStats,
}

impl AnalysisOutcome {
    pub fn interrupted(&self) -> bool {
        self.timing.interrupted()
    }
}

/// Register the built-in detectors, rules and the optional resource loader.
pub fn build_shared_context(config: &AnalysisConfig) -> AppResult<SharedContext> {
    let mut builder = SharedContext::builder();
    detectors::register(&mut builder);
    rules::register(&mut builder)?;
    if let Some(dir) = &config.resources_dir {
        builder.resource_loader(Arc::new(FileResourceLoader::new(dir)))?;
    }
    Ok(builder.build()?)
}

/// Analyze every target of `config` and collect the findings.
pub fn run(config: &AnalysisConfig) -> AppResult<AnalysisOutcome> {
    config.validate()?;
    if config.targets.is_empty() {
        return Err(AppError::config("no targets to analyze"));
    }

    let shared = Arc::new(build_shared_context(config)?);
    let selector = Arc::new(config.selector.build(&shared)?);
    let report = InMemoryReport::new();
    let progress = Arc::new(ProgressStats::forwarding_to(Arc::new(TracingProgress)));
    let context = Arc::new(AnalysisContext::new(
        Arc::clone(&shared),
        selector,
        Arc::new(report.clone()),
        progress.clone(),
        config.analysis_options(),
    ));
    let source = FsTargetSource::new(fs_targets(config, &shared)?);
    let analyzer = EntityAnalyzer::new(context, Box::new(source));

    let pipeline = Pipeline::new(analyzer, config.pipeline_config())?;
    if config.signal_cancellation {
        pipeline.enable_signal_cancellation()?;
    }
    pipeline.start()?;
    let timing = pipeline.join()?;
    let stats = pipeline.stats();
    drop(pipeline);

    let mut findings = report.findings();
    findings.sort_by(|a, b| {
        a.entity
            .cmp(&b.entity)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });

    tracing::info!(
        findings = findings.len(),
        interrupted = timing.interrupted(),
        "analysis finished"
    );

    Ok(AnalysisOutcome {
        findings,
        timing,
        progress: progress.snapshot(),
        pipeline: stats,
    })
}

/// Resolve per-target depth, path filter and selector.
fn fs_targets(config: &AnalysisConfig, shared: &SharedContext) -> AppResult<Vec<FsTarget>> {
    config
        .targets
        .iter()
        .map(|target| -> AppResult<FsTarget> {
            let selector = target
                .selector
                .as_ref()
                .map(|selector| selector.build(shared))
                .transpose()?
                .map(Arc::new);
            Ok(FsTarget::new(&target.path, target.recursive.unwrap_or(config.recursive))
                .with_filter(target.filter()?)
                .with_selector(selector))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use binscope_core::{ResourceLoaderRef, Value};

    use super::*;
    use crate::config::{SelectorConfig, TargetConfig};

    #[test]
    fn test_shared_context_knows_builtin_reports() {
        let shared = build_shared_context(&AnalysisConfig::default()).unwrap();
        for uid in ["truncated_header", "world_writable_binary", "duplicate_content"] {
            assert!(shared.knows_report(uid), "{uid}");
        }
        assert!(!shared.knows_report("no_such_report"));
    }

    #[test]
    fn test_run_without_targets_fails() {
        let err = run(&AnalysisConfig::default()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_resources_dir_published() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalysisConfig {
            resources_dir: Some(dir.path().to_path_buf()),
            ..AnalysisConfig::default()
        };
        let shared = build_shared_context(&config).unwrap();
        assert!(shared
            .shared_values()
            .try_get(ResourceLoaderRef::TAG)
            .is_some_and(|slot| slot.is_some()));
    }

    #[test]
    fn test_target_selector_must_name_known_reports() {
        let shared = build_shared_context(&AnalysisConfig::default()).unwrap();
        let config = AnalysisConfig {
            targets: vec![TargetConfig {
                selector: Some(SelectorConfig {
                    reports: vec!["no_such_report".to_string()],
                    ..SelectorConfig::default()
                }),
                ..TargetConfig::new("/usr/bin")
            }],
            recursive: false,
            ..AnalysisConfig::default()
        };
        let err = fs_targets(&config, &shared).unwrap_err();
        assert!(err.to_string().contains("no_such_report"));

        let config = AnalysisConfig {
            targets: vec![TargetConfig::new("/usr/bin")],
            ..config
        };
        let targets = fs_targets(&config, &shared).unwrap();
        assert!(!targets[0].recursive);
        assert!(targets[0].selector.is_none());
        assert!(targets[0].filter.is_empty());
    }
}
