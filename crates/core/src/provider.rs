//! Synchronous Value Provider
//!
//! Lazily generates values for one analysis scope. `try_get` only reads the
//! cache; `get` generates on a miss through the [`SyncCatalog`] and memoizes
//! the result, including "absent" results.

use std::collections::HashSet;
use std::sync::Arc;

use crate::dependency::{Dependency, GeneratedValues, ResolvedValues};
use crate::error::{CoreError, CoreResult};
use crate::generator::{Generator, SyncCatalog};
use crate::rule_class::RuleClassMask;
use crate::value::{downcast_arc, Value, ValueCache, ValuePtr, ValueTag};

/// Memoizing provider over one [`ValueCache`].
pub struct ValueProvider {
    cache: ValueCache,
    generators: Arc<SyncCatalog>,
    rule_classes: RuleClassMask,
    in_progress: HashSet<usize>,
}

impl ValueProvider {
    /// Create a provider over an empty cache.
    pub fn new(generators: Arc<SyncCatalog>, rule_classes: RuleClassMask) -> Self {
        Self::with_cache(ValueCache::new(), generators, rule_classes)
    }

    /// Create a provider over a pre-seeded cache (e.g. detector output).
    pub fn with_cache(
        cache: ValueCache,
        generators: Arc<SyncCatalog>,
        rule_classes: RuleClassMask,
    ) -> Self {
        Self {
            cache,
            generators,
            rule_classes,
            in_progress: HashSet::new(),
        }
    }

    /// Read a slot without generating. `None` means never initialized.
    pub fn try_get(&self, tag: ValueTag) -> Option<Option<ValuePtr>> {
        self.cache.get(tag)
    }

    /// Read a value, generating and memoizing it on a miss.
    ///
    /// Returns `Ok(None)` when no generator applies under the active rule
    /// classes or when a required dependency is absent.
    pub fn get(&mut self, tag: ValueTag) -> CoreResult<Option<ValuePtr>> {
        if let Some(slot) = self.cache.get(tag) {
            return Ok(slot);
        }

        let generators = Arc::clone(&self.generators);
        let Some((index, generator)) = generators.lookup_indexed(tag, self.rule_classes) else {
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

    /// Typed [`ValueProvider::get`].
    pub fn get_value<T: Value>(&mut self) -> CoreResult<Option<Arc<T>>> {
        self.get(T::TAG)?.map(downcast_arc::<T>).transpose()
    }

    /// Typed [`ValueProvider::try_get`]; absent and uninitialized both read as `None`.
    pub fn try_get_value<T: Value>(&self) -> CoreResult<Option<Arc<T>>> {
        self.try_get(T::TAG)
            .flatten()
            .map(downcast_arc::<T>)
            .transpose()
    }

    /// Resolve a dependency list: required entries generate, optional
    /// entries are read from the cache only.
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

    fn run_generator(&mut self, generator: &dyn Generator) -> CoreResult<()> {
        let prerequisites = self.resolve(generator.prerequisites())?;
        if !prerequisites.satisfies(generator.prerequisites())
            || !generator.can_generate(&prerequisites)
        {
            tracing::debug!(generator = generator.name(), "generator not applicable");
            self.store_absent(generator.outputs());
            return Ok(());
        }

        let inputs = self.resolve(generator.dependencies())?;
        if !inputs.satisfies(generator.dependencies()) {
            tracing::debug!(
                generator = generator.name(),
                "required dependency absent, skipping generation"
            );
            self.store_absent(generator.outputs());
            return Ok(());
        }

        let mut out = GeneratedValues::new(generator.name(), generator.outputs());
        match generator.generate(&inputs, &mut out) {
            Ok(()) => {
                self.store_slots(out.into_slots());
                Ok(())
            }
            Err(err) => {
                self.store_absent(generator.outputs());
                Err(err)
            }
        }
    }

    pub(crate) fn store_slots(&mut self, slots: Vec<(ValueTag, Option<ValuePtr>)>) {
        for (tag, slot) in slots {
            self.cache.insert_slot(tag, slot);
        }
    }

    pub(crate) fn store_absent(&mut self, tags: &[ValueTag]) {
        for tag in tags {
            self.cache.insert_absent(*tag);
        }
    }

    /// Store a value directly, bypassing generators.
    pub fn insert<T: Value>(&mut self, value: T) {
        self.cache.insert(value);
    }

    /// Drop a memoized slot so the next `get` regenerates it.
    pub fn remove(&mut self, tag: ValueTag) -> Option<Option<ValuePtr>> {
        self.cache.remove(tag)
    }

    /// Keep only the slots whose tag satisfies `keep`.
    pub fn retain(&mut self, keep: impl FnMut(ValueTag) -> bool) {
        self.cache.retain(keep);
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    /// Move the cache out, leaving this provider empty.
    pub fn take_cache(&mut self) -> ValueCache {
        std::mem::take(&mut self.cache)
    }

    pub fn into_cache(self) -> ValueCache {
        self.cache
    }

    pub fn rule_classes(&self) -> RuleClassMask {
        self.rule_classes
    }

    pub fn generators(&self) -> &Arc<SyncCatalog> {
        &self.generators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{optional, required};
    use crate::generator::testing::{constant, FnGenerator};
    use crate::rule_class::RuleClass;
    use crate::value::value_ptr;

    #[derive(Clone, Debug, PartialEq)]
    struct A(u32);
    crate::impl_value!(A, "test.a");

    #[derive(Clone, Debug, PartialEq)]
    struct B(u32);
    crate::impl_value!(B, "test.b");

    #[derive(Clone, Debug, PartialEq)]
    struct C(&'static str);
    crate::impl_value!(C, "test.c");

    const X: RuleClass = RuleClass::new(0);
    const Y: RuleClass = RuleClass::new(1);

    fn catalog(generators: Vec<Arc<dyn Generator>>) -> Arc<SyncCatalog> {
        let mut catalog = SyncCatalog::class_aware();
        for generator in generators {
            catalog.register(generator).unwrap();
        }
        Arc::new(catalog)
    }

    #[test]
    fn test_get_is_memoized() {
        let gen_a = Arc::new(FnGenerator::new("a", A::TAG, vec![], constant(A(5))));
        let mut provider = ValueProvider::new(catalog(vec![gen_a.clone()]), RuleClassMask::ALL);

        let first = provider.get_value::<A>().unwrap().unwrap();
        let second = provider.get_value::<A>().unwrap().unwrap();
        assert_eq!(*first, A(5));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(gen_a.calls(), 1);
    }

    #[test]
    fn test_try_get_never_generates() {
        let gen_a = Arc::new(FnGenerator::new("a", A::TAG, vec![], constant(A(5))));
        let provider = ValueProvider::new(catalog(vec![gen_a.clone()]), RuleClassMask::ALL);
        assert!(provider.try_get(A::TAG).is_none());
        assert_eq!(gen_a.calls(), 0);
    }

    #[test]
    fn test_missing_generator_is_absent_not_error() {
        let mut provider = ValueProvider::new(catalog(vec![]), RuleClassMask::ALL);
        assert!(provider.get(A::TAG).unwrap().is_none());
        // Memoized as initialized absent.
        assert!(matches!(provider.try_get(A::TAG), Some(None)));
    }

    #[test]
    fn test_required_and_optional_dependencies() {
        // G1 -> A is restricted to class X, the provider runs with class Y.
        let g1 = Arc::new(
            FnGenerator::new("g1", A::TAG, vec![], constant(A(1))).with_classes(X.into()),
        );
        let g2 = Arc::new(FnGenerator::new("g2", B::TAG, vec![required::<A>()], |values| {
            Ok(Some(value_ptr(B(values.require::<A>()?.0 + 1))))
        }));
        let g3 = Arc::new(FnGenerator::new("g3", C::TAG, vec![optional::<A>()], |values| {
            let label = if values.get::<A>().is_some() { "with a" } else { "without a" };
            Ok(Some(value_ptr(C(label))))
        }));
        let mut provider = ValueProvider::new(
            catalog(vec![g1.clone(), g2.clone(), g3.clone()]),
            Y.into(),
        );

        assert!(provider.get(B::TAG).unwrap().is_none());
        assert_eq!(g2.calls(), 0);
        assert_eq!(g1.calls(), 0);

        let c = provider.get_value::<C>().unwrap().unwrap();
        assert_eq!(*c, C("without a"));
        assert_eq!(g3.calls(), 1);
    }

    #[test]
    fn test_rule_class_dispatch() {
        let for_x = Arc::new(
            FnGenerator::new("for_x", A::TAG, vec![], constant(A(1))).with_classes(X.into()),
        );
        let for_y = Arc::new(
            FnGenerator::new("for_y", A::TAG, vec![], constant(A(2))).with_classes(Y.into()),
        );
        let mut provider =
            ValueProvider::new(catalog(vec![for_x.clone(), for_y.clone()]), Y.into());

        assert_eq!(*provider.get_value::<A>().unwrap().unwrap(), A(2));
        assert_eq!(for_x.calls(), 0);
        assert_eq!(for_y.calls(), 1);
    }

    #[test]
    fn test_generator_error_propagates_once() {
        let failing = Arc::new(FnGenerator::new("failing", A::TAG, vec![], |_| {
            Err(CoreError::generator("failing", "corrupt input"))
        }));
        let mut provider = ValueProvider::new(catalog(vec![failing.clone()]), RuleClassMask::ALL);

        assert!(matches!(provider.get(A::TAG), Err(CoreError::Generator { .. })));
        assert!(provider.get(A::TAG).unwrap().is_none());
        assert_eq!(failing.calls(), 1);
    }

    #[test]
    fn test_remove_allows_regeneration() {
        let gen_a = Arc::new(FnGenerator::new("a", A::TAG, vec![], constant(A(3))));
        let mut provider = ValueProvider::new(catalog(vec![gen_a.clone()]), RuleClassMask::ALL);
        provider.get(A::TAG).unwrap();
        provider.remove(A::TAG);
        provider.get(A::TAG).unwrap();
        assert_eq!(gen_a.calls(), 2);
    }

    #[test]
    fn test_dependency_cycle_is_detected() {
        let a_from_b = Arc::new(FnGenerator::new("a_from_b", A::TAG, vec![required::<B>()], |_| {
            Ok(None)
        }));
        let b_from_a = Arc::new(FnGenerator::new("b_from_a", B::TAG, vec![required::<A>()], |_| {
            Ok(None)
        }));
        let mut provider =
            ValueProvider::new(catalog(vec![a_from_b, b_from_a]), RuleClassMask::ALL);
        assert!(matches!(provider.get(A::TAG), Err(CoreError::DependencyCycle(_))));
    }

    #[test]
    fn test_seeded_cache_is_used() {
        let gen_a = Arc::new(FnGenerator::new("a", A::TAG, vec![], constant(A(9))));
        let mut cache = ValueCache::new();
        cache.insert(A(1));
        let mut provider =
            ValueProvider::with_cache(cache, catalog(vec![gen_a.clone()]), RuleClassMask::ALL);
        assert_eq!(*provider.get_value::<A>().unwrap().unwrap(), A(1));
        assert_eq!(gen_a.calls(), 0);
    }

    // ========================================================================
    // Prerequisites
    // ========================================================================

    struct Gated {
        outputs: [ValueTag; 2],
        prerequisites: [Dependency; 1],
    }

    impl Generator for Gated {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn prerequisites(&self) -> &[Dependency] {
            &self.prerequisites
        }

        fn can_generate(&self, prerequisites: &ResolvedValues) -> bool {
            prerequisites.get::<A>().is_some_and(|a| a.0 > 10)
        }

        fn dependencies(&self) -> &[Dependency] {
            &[]
        }

        fn outputs(&self) -> &[ValueTag] {
            &self.outputs
        }

        fn generate(
            &self,
            _inputs: &ResolvedValues,
            out: &mut GeneratedValues<'_>,
        ) -> CoreResult<()> {
            out.set(B(1))?;
            out.set(C("gated"))
        }
    }

    fn gated() -> Arc<dyn Generator> {
        Arc::new(Gated {
            outputs: [B::TAG, C::TAG],
            prerequisites: [required::<A>()],
        })
    }

    #[test]
    fn test_can_generate_false_stores_absent_outputs() {
        let gen_a = Arc::new(FnGenerator::new("a", A::TAG, vec![], constant(A(3))));
        let mut provider = ValueProvider::new(catalog(vec![gen_a, gated()]), RuleClassMask::ALL);
        assert!(provider.get(B::TAG).unwrap().is_none());
        assert!(matches!(provider.try_get(C::TAG), Some(None)));
    }

    #[test]
    fn test_all_outputs_stored_together() {
        let gen_a = Arc::new(FnGenerator::new("a", A::TAG, vec![], constant(A(30))));
        let mut provider = ValueProvider::new(catalog(vec![gen_a, gated()]), RuleClassMask::ALL);
        assert_eq!(*provider.get_value::<B>().unwrap().unwrap(), B(1));
        assert_eq!(
            provider.try_get_value::<C>().unwrap().as_deref(),
            Some(&C("gated"))
        );
    }
}
