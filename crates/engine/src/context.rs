//! Analysis Contexts
//!
//! [`SharedContext`] holds everything fixed before a run starts: generator
//! catalogs, rule lists, the detector chain and the shared value provider.
//! [`AnalysisContext`] adds the per-run state: selector, report factory,
//! progress receiver and the buckets of entities staged for combined
//! analysis.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use binscope_core::report::messages;
use binscope_core::{
    AsyncCatalog, AsyncGenerator, AsyncValueProvider, CatalogEntry, CoreError, CoreResult,
    Dependency, EmbeddedResourceLoader, Generator, ProgressReport, ProgressState, ReportFactory,
    ReportLevel, ReportSink, ResourceLoaderGenerator, Rule, RuleClass, RuleClassMask, RuleList,
    RuleSelector, SubjectEntity, SyncCatalog, ValueProvider, ValueTag,
};
use tokio_util::sync::CancellationToken;

use crate::combined::{
    required_individual_dependencies, run_combined_rules, CombinedCatalog, CombinedGenerator,
    CombinedRule, EntityValues,
};
use crate::detector::{DetectorChain, RuleDetector};

// ============================================================================
// SharedContext
// ============================================================================

/// Immutable registries shared by every entity of a run.
pub struct SharedContext {
    generators: Arc<SyncCatalog>,
    async_generators: Arc<AsyncCatalog>,
    combined_generators: Arc<CombinedCatalog>,
    rules: RuleList<dyn Rule>,
    combined_rules: RuleList<dyn CombinedRule>,
    detectors: DetectorChain,
    shared_values: AsyncValueProvider,
}

impl SharedContext {
    pub fn builder() -> SharedContextBuilder {
        SharedContextBuilder::default()
    }

    pub fn generators(&self) -> &Arc<SyncCatalog> {
        &self.generators
    }

    pub fn async_generators(&self) -> &Arc<AsyncCatalog> {
        &self.async_generators
    }

    pub fn combined_generators(&self) -> &CombinedCatalog {
        &self.combined_generators
    }

    pub fn rules(&self) -> &RuleList<dyn Rule> {
        &self.rules
    }

    pub fn combined_rules(&self) -> &RuleList<dyn CombinedRule> {
        &self.combined_rules
    }

    pub fn detectors(&self) -> &DetectorChain {
        &self.detectors
    }

    /// Provider of values shared across entities (resource loader, ...).
    pub fn shared_values(&self) -> &AsyncValueProvider {
        &self.shared_values
    }

    /// Whether a report uid is declared by any registered rule.
    pub fn knows_report(&self, uid: &str) -> bool {
        self.rules.find_report(uid).is_some() || self.combined_rules.find_report(uid).is_some()
    }
}

/// Collects registrations and validates them into a [`SharedContext`].
pub struct SharedContextBuilder {
    generators: SyncCatalog,
    async_generators: AsyncCatalog,
    combined_generators: CombinedCatalog,
    shared_generators: SyncCatalog,
    shared_async_generators: AsyncCatalog,
    rules: RuleList<dyn Rule>,
    combined_rules: RuleList<dyn CombinedRule>,
    detectors: DetectorChain,
    check_cycles: bool,
}

impl Default for SharedContextBuilder {
    fn default() -> Self {
        Self {
            generators: SyncCatalog::class_aware(),
            async_generators: AsyncCatalog::class_aware(),
            combined_generators: CombinedCatalog::class_agnostic(),
            shared_generators: SyncCatalog::class_agnostic(),
            shared_async_generators: AsyncCatalog::class_agnostic(),
            rules: RuleList::new(),
            combined_rules: RuleList::new(),
            detectors: DetectorChain::new(),
            check_cycles: true,
        }
    }
}

impl SharedContextBuilder {
    pub fn generator(&mut self, generator: Arc<dyn Generator>) -> CoreResult<&mut Self> {
        self.generators.register(generator)?;
        Ok(self)
    }

    pub fn async_generator(&mut self, generator: Arc<dyn AsyncGenerator>) -> CoreResult<&mut Self> {
        self.async_generators.register(generator)?;
        Ok(self)
    }

    pub fn combined_generator(
        &mut self,
        generator: Arc<dyn CombinedGenerator>,
    ) -> CoreResult<&mut Self> {
        self.combined_generators.register(generator)?;
        Ok(self)
    }

    /// Register a generator whose values are shared by every entity.
    pub fn shared_generator(&mut self, generator: Arc<dyn Generator>) -> CoreResult<&mut Self> {
        self.shared_generators.register(generator)?;
        Ok(self)
    }

    pub fn shared_async_generator(
        &mut self,
        generator: Arc<dyn AsyncGenerator>,
    ) -> CoreResult<&mut Self> {
        self.shared_async_generators.register(generator)?;
        Ok(self)
    }

    /// Publish `loader` as the shared `ResourceLoaderRef` value.
    pub fn resource_loader(
        &mut self,
        loader: Arc<dyn EmbeddedResourceLoader>,
    ) -> CoreResult<&mut Self> {
        self.shared_generator(Arc::new(ResourceLoaderGenerator::new(loader)))
    }

    pub fn rule(&mut self, rule: Arc<dyn Rule>) -> CoreResult<&mut Self> {
        self.rules.register(rule)?;
        Ok(self)
    }

    pub fn combined_rule(&mut self, rule: Arc<dyn CombinedRule>) -> CoreResult<&mut Self> {
        self.combined_rules.register(rule)?;
        Ok(self)
    }

    pub fn format_detector(&mut self, detector: Arc<dyn RuleDetector>) -> &mut Self {
        self.detectors.add_format_detector(detector);
        self
    }

    pub fn extra_detector(&mut self, detector: Arc<dyn RuleDetector>) -> &mut Self {
        self.detectors.add_extra_detector(detector);
        self
    }

    /// Toggle the static dependency cycle check run by [`Self::build`].
    pub fn check_cycles(&mut self, enabled: bool) -> &mut Self {
        self.check_cycles = enabled;
        self
    }

    /// Validate the registrations, then generate every shared sync value.
    pub fn build(self) -> CoreResult<SharedContext> {
        if self.detectors.is_empty() {
            return Err(CoreError::config("no format detector registered"));
        }
        if self.check_cycles {
            let entity_graph = catalog_edges(&self.generators)
                .chain(catalog_edges(&self.async_generators));
            check_acyclic(entity_graph)?;
            check_acyclic(catalog_edges(&self.combined_generators))?;
            let shared_graph = catalog_edges(&self.shared_generators)
                .chain(catalog_edges(&self.shared_async_generators));
            check_acyclic(shared_graph)?;
        }

        let mut shared_sync =
            ValueProvider::new(Arc::new(self.shared_generators), RuleClassMask::ALL);
        let shared_tags: Vec<ValueTag> = shared_sync
            .generators()
            .iter()
            .flat_map(|generator| generator.outputs().iter().copied())
            .collect();
        for tag in shared_tags {
            shared_sync.get(tag)?;
        }
        let shared_values = AsyncValueProvider::new(
            shared_sync,
            Arc::new(self.shared_async_generators),
            CancellationToken::new(),
        );

        tracing::info!(
            generators = self.generators.len(),
            async_generators = self.async_generators.len(),
            combined_generators = self.combined_generators.len(),
            rules = self.rules.len(),
            combined_rules = self.combined_rules.len(),
            "shared context built"
        );

        Ok(SharedContext {
            generators: Arc::new(self.generators),
            async_generators: Arc::new(self.async_generators),
            combined_generators: Arc::new(self.combined_generators),
            rules: self.rules,
            combined_rules: self.combined_rules,
            detectors: self.detectors,
            shared_values,
        })
    }
}

type Edges = (&'static str, Vec<Dependency>, Vec<ValueTag>);

fn catalog_edges<G: ?Sized + CatalogEntry>(
    catalog: &binscope_core::GeneratorCatalog<G>,
) -> impl Iterator<Item = Edges> + '_ {
    catalog.iter().map(|generator| {
        (
            generator.entry_name(),
            generator.entry_inputs(),
            generator.entry_outputs().to_vec(),
        )
    })
}

/// Reject generator graphs where an output (transitively) feeds itself.
/// Rule classes are ignored, so the check is conservative.
fn check_acyclic(entries: impl Iterator<Item = Edges>) -> CoreResult<()> {
    let mut edges: HashMap<ValueTag, Vec<ValueTag>> = HashMap::new();
    for (_, inputs, outputs) in entries {
        for output in outputs {
            edges
                .entry(output)
                .or_default()
                .extend(inputs.iter().map(|dep| dep.tag));
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        tag: ValueTag,
        edges: &HashMap<ValueTag, Vec<ValueTag>>,
        marks: &mut HashMap<ValueTag, Mark>,
    ) -> CoreResult<()> {
        match marks.get(&tag) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(CoreError::DependencyCycle(tag)),
            None => {}
        }
        marks.insert(tag, Mark::Visiting);
        for next in edges.get(&tag).into_iter().flatten() {
            visit(*next, edges, marks)?;
        }
        marks.insert(tag, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for tag in edges.keys() {
        visit(*tag, &edges, &mut marks)?;
    }
    Ok(())
}

// ============================================================================
// AnalysisContext
// ============================================================================

/// Options of one analysis run.
#[derive(Clone, Copy, Debug)]
pub struct AnalysisOptions {
    pub combined_analysis: bool,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            combined_analysis: true,
        }
    }
}

struct CombinedBuckets {
    entities: Vec<Vec<Arc<EntityValues>>>,
    sealed: RuleClassMask,
}

/// Per-run state shared by the pipeline stages.
pub struct AnalysisContext {
    shared: Arc<SharedContext>,
    selector: Arc<RuleSelector>,
    reports: Arc<dyn ReportFactory>,
    common_report: Arc<dyn ReportSink>,
    progress: Arc<dyn ProgressReport>,
    /// Enabled combined rules per class index; empty when combined analysis is off
    combined_rules: Vec<Vec<Arc<dyn CombinedRule>>>,
    required_individual: Vec<HashSet<ValueTag>>,
    buckets: Mutex<CombinedBuckets>,
}

impl AnalysisContext {
    pub fn new(
        shared: Arc<SharedContext>,
        selector: Arc<RuleSelector>,
        reports: Arc<dyn ReportFactory>,
        progress: Arc<dyn ProgressReport>,
        options: AnalysisOptions,
    ) -> Self {
        let combined_rules: Vec<Vec<Arc<dyn CombinedRule>>> = RuleClassMask::ALL
            .iter()
            .map(|class| {
                if options.combined_analysis {
                    shared.combined_rules().enabled_rules(class.into(), &selector)
                } else {
                    Vec::new()
                }
            })
            .collect();
        let required_individual = combined_rules
            .iter()
            .map(|rules| required_individual_dependencies(rules, shared.combined_generators()))
            .collect();
        let buckets = CombinedBuckets {
            entities: vec![Vec::new(); combined_rules.len()],
            sealed: RuleClassMask::EMPTY,
        };

        Self {
            common_report: reports.common_report(),
            shared,
            selector,
            reports,
            progress,
            combined_rules,
            required_individual,
            buckets: Mutex::new(buckets),
        }
    }

    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    pub fn selector(&self) -> &Arc<RuleSelector> {
        &self.selector
    }

    pub fn common_report(&self) -> &Arc<dyn ReportSink> {
        &self.common_report
    }

    pub fn entity_report(
        &self,
        entity: &Arc<dyn SubjectEntity>,
        rule_classes: RuleClassMask,
    ) -> Arc<dyn ReportSink> {
        self.reports.entity_report(entity, rule_classes)
    }

    pub fn report_progress(&self, entity: Option<&Arc<dyn SubjectEntity>>, state: ProgressState) {
        self.progress.report_progress(entity, state);
    }

    /// Classes in `mask` with at least one enabled combined rule.
    pub fn combined_classes(&self, mask: RuleClassMask) -> RuleClassMask {
        mask.iter()
            .filter(|class| !self.combined_rules[class.index() as usize].is_empty())
            .collect()
    }

    /// Per-entity tags combined rules of the classes in `mask` need.
    pub fn required_individual_dependencies(&self, mask: RuleClassMask) -> HashSet<ValueTag> {
        mask.iter()
            .flat_map(|class| self.required_individual[class.index() as usize].iter().copied())
            .collect()
    }

    fn lock_buckets(&self) -> MutexGuard<'_, CombinedBuckets> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `values` to the bucket of every class in `mask` that has
    /// combined rules.
    pub fn stage(&self, mask: RuleClassMask, values: Arc<EntityValues>) -> CoreResult<()> {
        let classes = self.combined_classes(mask);
        let mut buckets = self.lock_buckets();
        if let Some(class) = classes.iter().find(|class| buckets.sealed.is_set(*class)) {
            return Err(CoreError::CombinedPhaseClosed(class.index()));
        }
        for class in classes {
            buckets.entities[class.index() as usize].push(Arc::clone(&values));
        }
        Ok(())
    }

    /// Number of entities staged for `class` and not yet reduced.
    pub fn staged_count(&self, class: RuleClass) -> usize {
        self.lock_buckets().entities[class.index() as usize].len()
    }

    /// Run the combined rules of every class over its staged entities.
    pub fn run_combined_analysis(&self) {
        self.report_progress(None, ProgressState::CombinedAnalysisStarted);
        for (index, rules) in self.combined_rules.iter().enumerate() {
            if rules.is_empty() {
                continue;
            }
            let class = RuleClass::new(index as u8);
            let entities = {
                let mut buckets = self.lock_buckets();
                buckets.sealed.set(class);
                std::mem::take(&mut buckets.entities[index])
            };
            if entities.is_empty() {
                continue;
            }
            tracing::info!(
                rule_class = index,
                entities = entities.len(),
                rules = rules.len(),
                "running combined analysis"
            );
            run_combined_rules(
                rules,
                self.shared.combined_generators(),
                &entities,
                self.common_report.as_ref(),
            );
        }
        self.report_progress(None, ProgressState::CombinedAnalysisCompleted);
    }

    /// Record that the run stopped before combined analysis.
    pub fn report_interrupted(&self) {
        self.common_report
            .log(ReportLevel::Warning, messages::ANALYSIS_INTERRUPTED, &[]);
    }
}
