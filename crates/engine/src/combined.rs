//! Combined Analysis
//!
//! Generators and rules that run once per rule class over every staged
//! entity. Entities are staged as read-only [`EntityValues`]; the reduction
//! builds a [`CombinedValueProvider`] over them and runs the enabled
//! [`CombinedRule`]s with filtered per-entity views.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use binscope_core::report::messages;
use binscope_core::{
    arg, CatalogEntry, CoreError, CoreResult, Dependency, EntityRef, GeneratedValues,
    GeneratorCatalog, ReportLevel, ReportSink, ResolvedValues, RuleClassMask, RuleMetadata,
    RuleReporter, RuleSelector, SubjectEntity, Value, ValueCache, ValuePtr, ValueTag,
};

// ============================================================================
// Ambient Values
// ============================================================================

/// The entity's report sink, attached when the entity is staged.
#[derive(Clone)]
pub struct EntityReport(pub Arc<dyn ReportSink>);
binscope_core::impl_value!(EntityReport, "core.entity_report");

/// The selector active for the run, attached when the entity is staged.
#[derive(Clone)]
pub struct ActiveSelector(pub Arc<RuleSelector>);
binscope_core::impl_value!(ActiveSelector, "core.active_selector");

/// Tags every staged entity keeps regardless of combined requirements.
pub const AMBIENT_TAGS: &[ValueTag] = &[EntityRef::TAG, EntityReport::TAG, ActiveSelector::TAG];

// ============================================================================
// EntityValues
// ============================================================================

/// Trimmed, read-only values of one analyzed entity.
pub struct EntityValues {
    cache: ValueCache,
    rule_classes: RuleClassMask,
}

impl EntityValues {
    pub fn new(cache: ValueCache, rule_classes: RuleClassMask) -> Self {
        Self {
            cache,
            rule_classes,
        }
    }

    pub fn try_get(&self, tag: ValueTag) -> Option<&ValuePtr> {
        self.cache.value(tag)
    }

    /// Typed access; a payload of the wrong type reads as `None`.
    pub fn get<T: Value>(&self) -> Option<&T> {
        self.cache.get_typed::<T>().ok().flatten()
    }

    /// Whether the entity carries a value for `tag`.
    pub fn contains(&self, tag: ValueTag) -> bool {
        self.cache.has_value(tag)
    }

    pub fn entity(&self) -> Option<&Arc<dyn SubjectEntity>> {
        self.get::<EntityRef>().map(|entity| &entity.0)
    }

    pub fn report(&self) -> Option<&Arc<dyn ReportSink>> {
        self.get::<EntityReport>().map(|report| &report.0)
    }

    pub fn selector(&self) -> Option<&RuleSelector> {
        self.get::<ActiveSelector>().map(|selector| selector.0.as_ref())
    }

    /// Reporter scoped to this entity and `rule_name`.
    pub fn reporter(&self, rule_name: &'static str) -> Option<RuleReporter<'_>> {
        Some(RuleReporter::new(
            self.report()?.as_ref(),
            self.selector()?,
            rule_name,
        ))
    }

    pub fn rule_classes(&self) -> RuleClassMask {
        self.rule_classes
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

// ============================================================================
// Combined Generators and Rules
// ============================================================================

/// Per-entity input of a combined rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndividualDependency {
    pub tag: ValueTag,
    /// The rule is skipped when no staged entity carries the value
    pub required: bool,
    /// Only entities the rule [`CombinedRule::applies_to`] are visible
    pub filtered: bool,
}

impl IndividualDependency {
    pub const fn required(tag: ValueTag) -> Self {
        Self {
            tag,
            required: true,
            filtered: false,
        }
    }

    pub const fn optional(tag: ValueTag) -> Self {
        Self {
            tag,
            required: false,
            filtered: false,
        }
    }

    pub const fn filtered(mut self) -> Self {
        self.filtered = true;
        self
    }
}

/// Generator aggregating values across all staged entities.
pub trait CombinedGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Per-entity values this generator reads from the staged entities.
    fn individual_dependencies(&self) -> &[Dependency] {
        &[]
    }

    /// Combined values this generator needs.
    fn combined_dependencies(&self) -> &[Dependency] {
        &[]
    }

    fn outputs(&self) -> &[ValueTag];

    fn generate(
        &self,
        entities: &[Arc<EntityValues>],
        combined: &ResolvedValues,
        out: &mut GeneratedValues<'_>,
    ) -> CoreResult<()>;
}

impl CatalogEntry for dyn CombinedGenerator {
    fn entry_name(&self) -> &'static str {
        self.name()
    }

    fn entry_rule_classes(&self) -> RuleClassMask {
        RuleClassMask::ALL
    }

    fn entry_inputs(&self) -> Vec<Dependency> {
        self.combined_dependencies().to_vec()
    }

    fn entry_outputs(&self) -> &[ValueTag] {
        self.outputs()
    }
}

/// Catalog of combined generators. Always class-agnostic.
pub type CombinedCatalog = GeneratorCatalog<dyn CombinedGenerator>;

/// Rule running once per rule class over all staged entities.
pub trait CombinedRule: RuleMetadata {
    fn individual_dependencies(&self) -> &[IndividualDependency];

    fn combined_dependencies(&self) -> &[Dependency] {
        &[]
    }

    /// Whether `entity` is visible through filtered dependencies. By default
    /// the entity's selector must enable one of the rule's reports.
    fn applies_to(&self, entity: &EntityValues) -> bool {
        entity
            .selector()
            .is_some_and(|selector| selector.is_any_enabled(self.reports()))
    }

    fn run(&self, inputs: &CombinedInputs<'_>, common_report: &dyn ReportSink) -> CoreResult<()>;
}

/// Inputs of one combined rule invocation.
pub struct CombinedInputs<'a> {
    views: Vec<(IndividualDependency, Vec<&'a Arc<EntityValues>>)>,
    combined: ResolvedValues,
}

impl<'a> CombinedInputs<'a> {
    /// Entities visible through the dependency on `tag`, in staging order.
    pub fn entities(&self, tag: ValueTag) -> &[&'a Arc<EntityValues>] {
        self.views
            .iter()
            .find(|(dep, _)| dep.tag == tag)
            .map(|(_, entities)| entities.as_slice())
            .unwrap_or(&[])
    }

    /// Visible entities paired with their `T` value.
    pub fn values<T: Value>(&self) -> impl Iterator<Item = (&'a EntityValues, &'a T)> + '_ {
        self.entities(T::TAG).iter().filter_map(|entity| {
            let entity: &'a Arc<EntityValues> = *entity;
            let entity: &'a EntityValues = entity;
            entity.get::<T>().map(|value| (entity, value))
        })
    }

    pub fn combined(&self) -> &ResolvedValues {
        &self.combined
    }
}

// ============================================================================
// CombinedValueProvider
// ============================================================================

/// Memoizing provider for combined values over a span of staged entities.
pub struct CombinedValueProvider<'a> {
    generators: &'a CombinedCatalog,
    entities: &'a [Arc<EntityValues>],
    cache: ValueCache,
    in_progress: HashSet<usize>,
}

impl<'a> CombinedValueProvider<'a> {
    pub fn new(generators: &'a CombinedCatalog, entities: &'a [Arc<EntityValues>]) -> Self {
        Self {
            generators,
            entities,
            cache: ValueCache::new(),
            in_progress: HashSet::new(),
        }
    }

    pub fn entities(&self) -> &'a [Arc<EntityValues>] {
        self.entities
    }

    pub fn try_get(&self, tag: ValueTag) -> Option<Option<ValuePtr>> {
        self.cache.get(tag)
    }

    /// Read a combined value, generating and memoizing it on a miss.
    pub fn get(&mut self, tag: ValueTag) -> CoreResult<Option<ValuePtr>> {
        if let Some(slot) = self.cache.get(tag) {
            return Ok(slot);
        }
        let Some((index, generator)) = self.generators.lookup_indexed(tag, RuleClassMask::ALL)
        else {
            self.cache.insert_absent(tag);
            return Ok(None);
        };
        if !self.in_progress.insert(index) {
            return Err(CoreError::DependencyCycle(tag));
        }
        let result = self.run_generator(generator.as_ref());
        self.in_progress.remove(&index);
        result?;
        Ok(self.cache.get(tag).flatten())
    }

    /// Resolve a generator dependency list: required entries generate,
    /// optional entries are read from the cache only.
    pub fn resolve(&mut self, deps: &[Dependency]) -> CoreResult<ResolvedValues> {
        let mut resolved = ResolvedValues::with_capacity(deps.len());
        for dep in deps {
            let value = if dep.required {
                self.get(dep.tag)?
            } else {
                self.try_get(dep.tag).flatten()
            };
            resolved.push(dep.tag, value);
        }
        Ok(resolved)
    }

    /// Resolve a rule dependency list, generating every entry.
    pub fn resolve_on_demand(&mut self, deps: &[Dependency]) -> CoreResult<ResolvedValues> {
        let mut resolved = ResolvedValues::with_capacity(deps.len());
        for dep in deps {
            resolved.push(dep.tag, self.get(dep.tag)?);
        }
        Ok(resolved)
    }

    fn run_generator(&mut self, generator: &dyn CombinedGenerator) -> CoreResult<()> {
        let inputs = self.resolve(generator.combined_dependencies())?;
        if !inputs.satisfies(generator.combined_dependencies()) {
            for tag in generator.outputs() {
                self.cache.insert_absent(*tag);
            }
            return Ok(());
        }

        let mut out = GeneratedValues::new(generator.name(), generator.outputs());
        let result = generator.generate(self.entities, &inputs, &mut out);
        match result {
            Ok(()) => {
                for (tag, slot) in out.into_slots() {
                    self.cache.insert_slot(tag, slot);
                }
                Ok(())
            }
            Err(err) => {
                for tag in generator.outputs() {
                    self.cache.insert_absent(*tag);
                }
                Err(err)
            }
        }
    }
}

// ============================================================================
// Dependency Helpers
// ============================================================================

/// Per-entity tags the given rules need, directly or through the combined
/// generators they (transitively) depend on.
pub fn required_individual_dependencies(
    rules: &[Arc<dyn CombinedRule>],
    generators: &CombinedCatalog,
) -> HashSet<ValueTag> {
    let mut required: HashSet<ValueTag> = rules
        .iter()
        .flat_map(|rule| rule.individual_dependencies().iter().map(|dep| dep.tag))
        .collect();

    let mut queue: VecDeque<ValueTag> = rules
        .iter()
        .flat_map(|rule| rule.combined_dependencies().iter().map(|dep| dep.tag))
        .collect();
    let mut visited = HashSet::new();
    while let Some(tag) = queue.pop_front() {
        if !visited.insert(tag) {
            continue;
        }
        let Some(generator) = generators.lookup_any(tag) else {
            continue;
        };
        required.extend(generator.individual_dependencies().iter().map(|dep| dep.tag));
        queue.extend(generator.combined_dependencies().iter().map(|dep| dep.tag));
    }
    required
}

/// Run `rules` over the staged `entities`. Errors and panics are reported to
/// `common_report` per rule.
pub fn run_combined_rules(
    rules: &[Arc<dyn CombinedRule>],
    generators: &CombinedCatalog,
    entities: &[Arc<EntityValues>],
    common_report: &dyn ReportSink,
) {
    let mut provider = CombinedValueProvider::new(generators, entities);
    for rule in rules {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            run_combined_rule(rule.as_ref(), &mut provider, entities, common_report)
        }));
        let error = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        tracing::error!(rule = rule.name(), %error, "combined rule failed");
        common_report.log(
            ReportLevel::Error,
            messages::RULE_ERROR,
            &[arg("rule", rule.name()), arg("error", error)],
        );
    }
}

fn run_combined_rule(
    rule: &dyn CombinedRule,
    provider: &mut CombinedValueProvider<'_>,
    entities: &[Arc<EntityValues>],
    common_report: &dyn ReportSink,
) -> CoreResult<()> {
    let combined = provider.resolve_on_demand(rule.combined_dependencies())?;
    if !combined.satisfies(rule.combined_dependencies()) {
        tracing::debug!(rule = rule.name(), "combined dependency absent, skipping rule");
        return Ok(());
    }

    let mut views = Vec::with_capacity(rule.individual_dependencies().len());
    for dep in rule.individual_dependencies() {
        let visible: Vec<&Arc<EntityValues>> = entities
            .iter()
            .filter(|entity| entity.contains(dep.tag))
            .filter(|entity| !dep.filtered || rule.applies_to(entity))
            .collect();
        if dep.required && visible.is_empty() {
            tracing::debug!(rule = rule.name(), tag = %dep.tag, "no entity carries required value");
            return Ok(());
        }
        views.push((*dep, visible));
    }

    rule.run(&CombinedInputs { views, combined }, common_report)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

#[cfg(test)]
mod tests {
    use binscope_core::{
        InMemoryReport, MemoryEntity, ReportCategory, ReportFactory, RuleClass, RuleReport,
        SelectionMode,
    };

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Digest(&'static str);
    binscope_core::impl_value!(Digest, "test.digest");

    #[derive(Debug, PartialEq)]
    struct DigestCount(usize);
    binscope_core::impl_value!(DigestCount, "test.digest_count");

    #[derive(Debug)]
    struct Doubled(usize);
    binscope_core::impl_value!(Doubled, "test.doubled");

    const CLASS: RuleClass = RuleClass::new(0);
    const DUPLICATE: RuleReport =
        RuleReport::new("duplicate", ReportLevel::Info, ReportCategory::Optimization);

    fn staged(
        report: &InMemoryReport,
        path: &str,
        digest: Option<&'static str>,
        selector: Arc<RuleSelector>,
    ) -> Arc<EntityValues> {
        let entity: Arc<dyn SubjectEntity> = Arc::new(MemoryEntity::new(path, vec![]));
        let mut cache = ValueCache::new();
        if let Some(digest) = digest {
            cache.insert(Digest(digest));
        }
        cache.insert(EntityReport(report.entity_report(&entity, CLASS.into())));
        cache.insert(EntityRef(entity));
        cache.insert(ActiveSelector(selector));
        Arc::new(EntityValues::new(cache, CLASS.into()))
    }

    struct CountDigests;

    const COUNT_DEPS: &[Dependency] = &[Dependency::required(Digest::TAG)];
    const COUNT_OUTPUTS: &[ValueTag] = &[DigestCount::TAG];

    impl CombinedGenerator for CountDigests {
        fn name(&self) -> &'static str {
            "count_digests"
        }

        fn individual_dependencies(&self) -> &[Dependency] {
            COUNT_DEPS
        }

        fn outputs(&self) -> &[ValueTag] {
            COUNT_OUTPUTS
        }

        fn generate(
            &self,
            entities: &[Arc<EntityValues>],
            _combined: &ResolvedValues,
            out: &mut GeneratedValues<'_>,
        ) -> CoreResult<()> {
            out.set(DigestCount(entities.iter().filter(|e| e.contains(Digest::TAG)).count()))
        }
    }

    struct DoubleCount;

    const DOUBLE_DEPS: &[Dependency] = &[Dependency::required(DigestCount::TAG)];
    const DOUBLE_OUTPUTS: &[ValueTag] = &[Doubled::TAG];

    impl CombinedGenerator for DoubleCount {
        fn name(&self) -> &'static str {
            "double_count"
        }

        fn combined_dependencies(&self) -> &[Dependency] {
            DOUBLE_DEPS
        }

        fn outputs(&self) -> &[ValueTag] {
            DOUBLE_OUTPUTS
        }

        fn generate(
            &self,
            _entities: &[Arc<EntityValues>],
            combined: &ResolvedValues,
            out: &mut GeneratedValues<'_>,
        ) -> CoreResult<()> {
            out.set(Doubled(combined.require::<DigestCount>()?.0 * 2))
        }
    }

    struct ReportDuplicates {
        reports: [RuleReport; 1],
        deps: [IndividualDependency; 1],
        combined: [Dependency; 1],
        fail: bool,
    }

    impl ReportDuplicates {
        fn new(fail: bool) -> Self {
            Self {
                reports: [DUPLICATE],
                deps: [IndividualDependency::required(Digest::TAG).filtered()],
                combined: [Dependency::required(Doubled::TAG)],
                fail,
            }
        }
    }

    impl RuleMetadata for ReportDuplicates {
        fn name(&self) -> &'static str {
            "report_duplicates"
        }

        fn rule_classes(&self) -> RuleClassMask {
            CLASS.into()
        }

        fn reports(&self) -> &[RuleReport] {
            &self.reports
        }
    }

    impl CombinedRule for ReportDuplicates {
        fn individual_dependencies(&self) -> &[IndividualDependency] {
            &self.deps
        }

        fn combined_dependencies(&self) -> &[Dependency] {
            &self.combined
        }

        fn run(
            &self,
            inputs: &CombinedInputs<'_>,
            common_report: &dyn ReportSink,
        ) -> CoreResult<()> {
            if self.fail {
                return Err(CoreError::rule("aggregation failed"));
            }
            let doubled = inputs.combined().require::<Doubled>()?.0;
            common_report.log(ReportLevel::Info, "doubled", &[arg("value", doubled)]);
            for (entity, digest) in inputs.values::<Digest>() {
                if let Some(reporter) = entity.reporter(self.name()) {
                    reporter.log(&DUPLICATE, &[arg("digest", digest.0)]);
                }
            }
            Ok(())
        }
    }

    fn catalog() -> CombinedCatalog {
        let mut catalog = CombinedCatalog::class_agnostic();
        catalog.register(Arc::new(CountDigests)).unwrap();
        catalog.register(Arc::new(DoubleCount)).unwrap();
        catalog
    }

    #[test]
    fn test_duplicate_combined_generator_is_fatal() {
        let mut catalog = catalog();
        let err = catalog.register(Arc::new(CountDigests)).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateGenerator { .. }));
    }

    #[test]
    fn test_required_individual_dependencies_are_transitive() {
        let rules: Vec<Arc<dyn CombinedRule>> = vec![Arc::new(ReportDuplicates::new(false))];
        let required = required_individual_dependencies(&rules, &catalog());
        assert_eq!(required, HashSet::from([Digest::TAG]));
    }

    #[test]
    fn test_combined_generator_sees_whole_span() {
        let report = InMemoryReport::new();
        let selector = Arc::new(RuleSelector::new());
        let entities = vec![
            staged(&report, "a", Some("x"), selector.clone()),
            staged(&report, "b", None, selector.clone()),
            staged(&report, "c", Some("x"), selector),
        ];
        let catalog = catalog();
        let mut provider = CombinedValueProvider::new(&catalog, &entities);
        let doubled = provider.get(Doubled::TAG).unwrap().unwrap();
        assert_eq!(doubled.downcast_ref::<Doubled>().unwrap().0, 4);
        assert!(provider.try_get(DigestCount::TAG).is_some());
    }

    #[test]
    fn test_filtered_view_respects_entity_selector() {
        let report = InMemoryReport::new();
        let everything = Arc::new(RuleSelector::new());
        let nothing = Arc::new(
            RuleSelector::new()
                .with_mode(SelectionMode::IncludeSelected)
                .select_report("other"),
        );
        let entities = vec![
            staged(&report, "a", Some("x"), everything.clone()),
            staged(&report, "b", Some("y"), nothing),
            staged(&report, "c", None, everything),
        ];
        let rules: Vec<Arc<dyn CombinedRule>> = vec![Arc::new(ReportDuplicates::new(false))];
        let common = report.common_report();

        run_combined_rules(&rules, &catalog(), &entities, common.as_ref());

        let duplicates = report.findings_for("duplicate");
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].arg("digest"), Some("x"));
        assert_eq!(report.findings_for("doubled")[0].arg("value"), Some("4"));
    }

    #[test]
    fn test_rule_error_is_reported_not_raised() {
        let report = InMemoryReport::new();
        let entities = vec![staged(&report, "a", Some("x"), Arc::new(RuleSelector::new()))];
        let rules: Vec<Arc<dyn CombinedRule>> = vec![Arc::new(ReportDuplicates::new(true))];
        let common = report.common_report();

        run_combined_rules(&rules, &catalog(), &entities, common.as_ref());

        let errors = report.findings_for(messages::RULE_ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].arg("rule"), Some("report_duplicates"));
    }

    #[test]
    fn test_required_view_empty_skips_rule() {
        let report = InMemoryReport::new();
        let entities = vec![staged(&report, "a", None, Arc::new(RuleSelector::new()))];
        let rules: Vec<Arc<dyn CombinedRule>> = vec![Arc::new(ReportDuplicates::new(true))];
        let common = report.common_report();

        run_combined_rules(&rules, &catalog(), &entities, common.as_ref());
        assert!(report.findings().is_empty());
    }
}
