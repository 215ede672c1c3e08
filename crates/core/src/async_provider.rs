//! Asynchronous Value Provider
//!
//! Extends [`ValueProvider`] with suspending generators. Each async generator
//! owns one `tokio::sync::Mutex`, so concurrent requests for any of its
//! outputs generate at most once: late callers wait for the lock, then find
//! the value already memoized. Lock waits and generation race the provider's
//! cancellation token.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::dependency::{Dependency, GeneratedValues, ResolvedValues};
use crate::error::{CoreError, CoreResult};
use crate::generator::{AsyncCatalog, AsyncGenerator};
use crate::provider::ValueProvider;
use crate::rule_class::RuleClassMask;
use crate::value::{downcast_arc, Value, ValueCache, ValuePtr, ValueTag};

/// Shareable provider resolving values through async and sync generators.
pub struct AsyncValueProvider {
    inner: Mutex<ValueProvider>,
    async_generators: Arc<AsyncCatalog>,
    generation_locks: Vec<tokio::sync::Mutex<()>>,
    rule_classes: RuleClassMask,
    cancel: CancellationToken,
}

impl AsyncValueProvider {
    pub fn new(
        provider: ValueProvider,
        async_generators: Arc<AsyncCatalog>,
        cancel: CancellationToken,
    ) -> Self {
        let generation_locks = (0..async_generators.len())
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();
        Self {
            rule_classes: provider.rule_classes(),
            inner: Mutex::new(provider),
            async_generators,
            generation_locks,
            cancel,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ValueProvider> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a slot without generating. `None` means never initialized.
    pub fn try_get(&self, tag: ValueTag) -> Option<Option<ValuePtr>> {
        self.lock_inner().try_get(tag)
    }

    /// Read a value, generating it on a miss.
    ///
    /// Async generators take precedence; tags only a sync generator knows
    /// are generated inline by the wrapped [`ValueProvider`]. A generator
    /// that transitively requires its own output fails with
    /// [`CoreError::DependencyCycle`] instead of waiting on its own lock.
    pub fn get_async(&self, tag: ValueTag) -> BoxFuture<'_, CoreResult<Option<ValuePtr>>> {
        async move {
            let mut in_progress = HashSet::new();
            self.fetch(tag, &mut in_progress).await
        }
        .boxed()
    }

    fn fetch<'a>(
        &'a self,
        tag: ValueTag,
        in_progress: &'a mut HashSet<usize>,
    ) -> BoxFuture<'a, CoreResult<Option<ValuePtr>>> {
        async move {
            if let Some(slot) = self.try_get(tag) {
                return Ok(slot);
            }

            let Some((index, generator)) =
                self.async_generators.lookup_indexed(tag, self.rule_classes)
            else {
                return self.lock_inner().get(tag);
            };
            let generator = Arc::clone(generator);

            if !in_progress.insert(index) {
                return Err(CoreError::DependencyCycle(tag));
            }
            let result = self.generate_locked(index, tag, generator.as_ref(), in_progress).await;
            in_progress.remove(&index);
            result
        }
        .boxed()
    }

    async fn generate_locked(
        &self,
        index: usize,
        tag: ValueTag,
        generator: &dyn AsyncGenerator,
        in_progress: &mut HashSet<usize>,
    ) -> CoreResult<Option<ValuePtr>> {
        let _generation = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
            guard = self.generation_locks[index].lock() => guard,
        };

        // Another caller may have finished while we waited.
        if let Some(slot) = self.try_get(tag) {
            return Ok(slot);
        }

        self.run_generator(generator, in_progress).await?;
        Ok(self.try_get(tag).flatten())
    }

    /// Typed [`AsyncValueProvider::get_async`].
    pub async fn get_value<T: Value>(&self) -> CoreResult<Option<Arc<T>>> {
        self.get_async(T::TAG)
            .await?
            .map(downcast_arc::<T>)
            .transpose()
    }

    /// Resolve a generator dependency list: required entries generate,
    /// optional entries are read from the cache only.
    pub async fn resolve(&self, deps: &[Dependency]) -> CoreResult<ResolvedValues> {
        self.resolve_tracked(deps, &mut HashSet::new()).await
    }

    async fn resolve_tracked(
        &self,
        deps: &[Dependency],
        in_progress: &mut HashSet<usize>,
    ) -> CoreResult<ResolvedValues> {
        let mut resolved = ResolvedValues::with_capacity(deps.len());
        for dep in deps {
            let value = if dep.required {
                self.fetch(dep.tag, in_progress).await?
            } else {
                self.try_get(dep.tag).flatten()
            };
            resolved.push(dep.tag, value);
        }
        Ok(resolved)
    }

    async fn run_generator(
        &self,
        generator: &dyn AsyncGenerator,
        in_progress: &mut HashSet<usize>,
    ) -> CoreResult<()> {
        let prerequisites = self.resolve_tracked(generator.prerequisites(), in_progress).await?;
        if !prerequisites.satisfies(generator.prerequisites())
            || !generator.can_generate(&prerequisites)
        {
            tracing::debug!(generator = generator.name(), "generator not applicable");
            self.lock_inner().store_absent(generator.outputs());
            return Ok(());
        }

        let inputs = self.resolve_tracked(generator.dependencies(), in_progress).await?;
        if !inputs.satisfies(generator.dependencies()) {
            tracing::debug!(
                generator = generator.name(),
                "required dependency absent, skipping generation"
            );
            self.lock_inner().store_absent(generator.outputs());
            return Ok(());
        }

        let mut out = GeneratedValues::new(generator.name(), generator.outputs());
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CoreError::Cancelled),
            result = generator.generate(&inputs, &mut out) => result,
        };

        match result {
            Ok(()) => {
                self.lock_inner().store_slots(out.into_slots());
                Ok(())
            }
            Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
            Err(err) => {
                self.lock_inner().store_absent(generator.outputs());
                Err(err)
            }
        }
    }

    /// Store a value directly, bypassing generators.
    pub fn insert<T: Value>(&self, value: T) {
        self.lock_inner().insert(value);
    }

    /// Keep only the slots whose tag satisfies `keep`.
    pub fn retain(&self, keep: impl FnMut(ValueTag) -> bool) {
        self.lock_inner().retain(keep);
    }

    /// Move the cache out, leaving this provider empty.
    pub fn take_cache(&self) -> ValueCache {
        self.lock_inner().take_cache()
    }

    /// Run `f` against the wrapped synchronous provider.
    pub fn with_sync<R>(&self, f: impl FnOnce(&mut ValueProvider) -> R) -> R {
        f(&mut self.lock_inner())
    }

    /// Whether a generator in either catalog can produce `tag`.
    pub fn provides(&self, tag: ValueTag) -> bool {
        self.async_generators.lookup(tag, self.rule_classes).is_some()
            || self
                .lock_inner()
                .generators()
                .lookup(tag, self.rule_classes)
                .is_some()
    }

    pub fn rule_classes(&self) -> RuleClassMask {
        self.rule_classes
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
