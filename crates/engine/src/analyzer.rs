//! Entity Analyzer
//!
//! Drives one entity through the pipeline. The load step runs on the I/O
//! runtime: enumerate, classify, seed the value provider. The analysis step
//! runs on the CPU runtime: evaluate the enabled rules, then trim and stage
//! the entity for combined analysis.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use binscope_core::report::messages;
use binscope_core::{
    arg, AsyncValueProvider, CoreError, CoreResult, Dependency, EntityRef, InaccessibleEntity,
    ProgressState, ReportLevel, ReportSink, ResolvedValues, Rule, RuleClassMask, RuleReporter,
    RuleSelector, StreamProvider, SubjectEntity, ValueCache, ValuePtr, ValueProvider, ValueTag,
};
use futures_util::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::combined::{panic_message, ActiveSelector, EntityReport, EntityValues, AMBIENT_TAGS};
use crate::context::AnalysisContext;
use crate::detector::RuleDetector;
use crate::pipeline::{PipelineTask, Producer};
use crate::target::{TargetEntry, TargetSource};

/// An entity that passed the load step.
pub struct LoadedEntity {
    entity: Arc<dyn SubjectEntity>,
    report: Arc<dyn ReportSink>,
    /// Target selector, or the run selector when the target has none
    selector: Arc<RuleSelector>,
    values: AsyncValueProvider,
}

impl LoadedEntity {
    pub fn entity(&self) -> &Arc<dyn SubjectEntity> {
        &self.entity
    }

    pub fn selector(&self) -> &Arc<RuleSelector> {
        &self.selector
    }

    pub fn rule_classes(&self) -> RuleClassMask {
        self.values.rule_classes()
    }
}

/// [`PipelineTask`] analyzing every entity of a [`TargetSource`].
pub struct EntityAnalyzer {
    context: Arc<AnalysisContext>,
    source: Box<dyn TargetSource>,
}

impl EntityAnalyzer {
    pub fn new(context: Arc<AnalysisContext>, source: Box<dyn TargetSource>) -> Self {
        Self { context, source }
    }

    pub fn context(&self) -> &Arc<AnalysisContext> {
        &self.context
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Classify `entry` and build its value provider. `None` when the entry
    /// is skipped.
    pub async fn load(
        &self,
        entry: TargetEntry,
        cancel: &CancellationToken,
    ) -> Option<LoadedEntity> {
        let (entity, selector) = match entry {
            TargetEntry::Entity { entity, selector } => (entity, selector),
            TargetEntry::Inaccessible { path, reason } => {
                tracing::warn!(path = %path.display(), %reason, "entity inaccessible");
                let entity: Arc<dyn SubjectEntity> =
                    Arc::new(InaccessibleEntity::new(path, reason.clone()));
                self.context
                    .entity_report(&entity, RuleClassMask::EMPTY)
                    .log(
                        ReportLevel::Critical,
                        messages::INACCESSIBLE_ENTITY,
                        &[arg("reason", reason)],
                    );
                self.context
                    .report_progress(Some(&entity), ProgressState::SkippedInaccessible);
                return None;
            }
        };

        self.context
            .report_progress(Some(&entity), ProgressState::LoadStarted);
        let shared = self.context.shared();
        let mut stream = StreamProvider::new(Arc::clone(&entity));
        let mut values = ValueCache::new();
        let mut rule_classes = RuleClassMask::EMPTY;
        let detected = shared
            .detectors()
            .detect(entity.as_ref(), &mut stream, &mut values, &mut rule_classes)
            .await;
        drop(stream);

        match detected {
            Ok(true) if !rule_classes.is_empty() => {}
            Ok(_) => {
                tracing::debug!(entity = %entity.path().display(), "unsupported entity skipped");
                self.context
                    .report_progress(Some(&entity), ProgressState::SkippedUnsupported);
                return None;
            }
            Err(err) => {
                tracing::warn!(
                    entity = %entity.path().display(),
                    error = %err,
                    "entity load failed"
                );
                self.context
                    .entity_report(&entity, RuleClassMask::EMPTY)
                    .log(
                        ReportLevel::Error,
                        messages::ENTITY_LOAD_ERROR,
                        &[arg("error", err)],
                    );
                self.context
                    .report_progress(Some(&entity), ProgressState::SkippedInaccessible);
                return None;
            }
        }

        values.insert(EntityRef(Arc::clone(&entity)));
        let provider =
            ValueProvider::with_cache(values, Arc::clone(shared.generators()), rule_classes);
        let values = AsyncValueProvider::new(
            provider,
            Arc::clone(shared.async_generators()),
            cancel.child_token(),
        );
        let report = self.context.entity_report(&entity, rule_classes);
        self.context.report_progress(Some(&entity), ProgressState::Loaded);

        Some(LoadedEntity {
            entity,
            report,
            selector: selector.unwrap_or_else(|| Arc::clone(self.context.selector())),
            values,
        })
    }

    // ========================================================================
    // Analyze
    // ========================================================================

    /// Run every enabled rule on `loaded`, then stage it for combined
    /// analysis.
    pub async fn analyze(&self, loaded: LoadedEntity) {
        self.context
            .report_progress(Some(&loaded.entity), ProgressState::AnalysisStarted);

        let rules = self
            .context
            .shared()
            .rules()
            .enabled_rules(loaded.rule_classes(), &loaded.selector);
        for rule in &rules {
            self.run_rule(&loaded, rule.as_ref()).await;
        }

        let combined = self.context.combined_classes(loaded.rule_classes());
        if !combined.is_empty() {
            self.stage(&loaded, combined).await;
        }

        self.context
            .report_progress(Some(&loaded.entity), ProgressState::AnalysisCompleted);
    }

    async fn run_rule(&self, loaded: &LoadedEntity, rule: &dyn Rule) {
        let outcome = AssertUnwindSafe(self.execute_rule(loaded, rule))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(CoreError::Cancelled)) => {
                tracing::debug!(rule = rule.name(), "rule cancelled");
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        tracing::error!(
            entity = %loaded.entity.path().display(),
            rule = rule.name(),
            %error,
            "rule failed"
        );
        loaded.report.log(
            ReportLevel::Error,
            messages::RULE_ERROR,
            &[arg("rule", rule.name()), arg("error", error)],
        );
    }

    async fn execute_rule(&self, loaded: &LoadedEntity, rule: &dyn Rule) -> CoreResult<()> {
        let prerequisites = self.fetch(loaded, rule.prerequisites()).await?;
        if !prerequisites.satisfies(rule.prerequisites()) || !rule.is_applicable(&prerequisites) {
            tracing::debug!(rule = rule.name(), "rule not applicable");
            return Ok(());
        }

        let inputs = self.fetch(loaded, rule.dependencies()).await?;
        if !inputs.satisfies(rule.dependencies()) {
            tracing::debug!(rule = rule.name(), "required dependency absent, skipping rule");
            return Ok(());
        }

        let reporter = RuleReporter::new(loaded.report.as_ref(), &loaded.selector, rule.name());
        rule.run(&reporter, &inputs)
    }

    /// Resolve rule inputs: shared values first, then the entity's own
    /// provider. Optional inputs are generated as well.
    async fn fetch(
        &self,
        loaded: &LoadedEntity,
        deps: &[Dependency],
    ) -> CoreResult<ResolvedValues> {
        let mut resolved = ResolvedValues::with_capacity(deps.len());
        for dep in deps {
            resolved.push(dep.tag, self.value(loaded, dep.tag).await?);
        }
        Ok(resolved)
    }

    /// Shared generation outlives any one entity, so only this request
    /// stops waiting on cancellation.
    async fn value(&self, loaded: &LoadedEntity, tag: ValueTag) -> CoreResult<Option<ValuePtr>> {
        let shared = self.context.shared().shared_values();
        if shared.try_get(tag).is_some() || shared.provides(tag) {
            return tokio::select! {
                biased;
                _ = loaded.values.cancellation_token().cancelled() => Err(CoreError::Cancelled),
                value = shared.get_async(tag) => value,
            };
        }
        loaded.values.get_async(tag).await
    }

    async fn stage(&self, loaded: &LoadedEntity, combined: RuleClassMask) {
        let required = self.context.required_individual_dependencies(combined);
        for tag in &required {
            match loaded.values.get_async(*tag).await {
                Ok(_) => {}
                Err(CoreError::Cancelled) => return,
                Err(err) => {
                    tracing::warn!(
                        entity = %loaded.entity.path().display(),
                        tag = %tag,
                        error = %err,
                        "combined value preparation failed"
                    );
                    loaded.report.log(
                        ReportLevel::Error,
                        messages::COMBINED_PREPARATION_ERROR,
                        &[arg("value", tag), arg("error", err)],
                    );
                }
            }
        }

        let values = self.trimmed_values(loaded, &required);
        if let Err(err) = self.context.stage(combined, values) {
            tracing::warn!(
                entity = %loaded.entity.path().display(),
                error = %err,
                "entity not staged"
            );
        }
    }

    fn trimmed_values(
        &self,
        loaded: &LoadedEntity,
        required: &HashSet<ValueTag>,
    ) -> Arc<EntityValues> {
        loaded
            .values
            .retain(|tag| required.contains(&tag) || AMBIENT_TAGS.contains(&tag));
        let mut cache = loaded.values.take_cache();
        cache.insert(EntityReport(Arc::clone(&loaded.report)));
        cache.insert(ActiveSelector(Arc::clone(&loaded.selector)));
        Arc::new(EntityValues::new(cache, loaded.rule_classes()))
    }
}

#[async_trait]
impl PipelineTask for EntityAnalyzer {
    type Item = LoadedEntity;

    async fn produce(&self, producer: &Producer<Self>) -> CoreResult<()> {
        let cancel = producer.cancellation_token();
        let mut targets = self.source.targets();
        loop {
            let entry = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                entry = targets.next() => entry,
            };
            let Some(entry) = entry else { break };
            if let Some(loaded) = self.load(entry, cancel).await {
                producer.submit(loaded).await?;
            }
        }
        Ok(())
    }

    fn task_weight(&self, item: &LoadedEntity) -> u64 {
        item.entity.size()
    }

    async fn process(&self, item: LoadedEntity) {
        self.analyze(item).await;
    }

    async fn on_all_tasks_complete(&self, interrupted: bool) {
        if interrupted {
            tracing::warn!("analysis interrupted, skipping combined analysis");
            self.context.report_interrupted();
            return;
        }
        self.context.run_combined_analysis();
    }

    fn stop_requested(&self) {
        tracing::info!("stopping entity analysis");
    }
}
