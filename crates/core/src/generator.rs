//! Generator Catalog
//!
//! Generators compute values from declared dependencies. They come in three
//! flavors: synchronous ([`Generator`]), suspending ([`AsyncGenerator`]) and
//! cross-entity (`CombinedGenerator`, in the engine crate). Each flavor is
//! registered into a [`GeneratorCatalog`] once at startup; catalogs are
//! read-only afterwards and shared behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dependency::{Dependency, GeneratedValues, ResolvedValues};
use crate::error::{CoreError, CoreResult};
use crate::rule_class::RuleClassMask;
use crate::value::ValueTag;

// ============================================================================
// Generator Traits
// ============================================================================

/// A generator that runs to completion without suspending.
pub trait Generator: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Rule classes this generator serves.
    fn rule_classes(&self) -> RuleClassMask {
        RuleClassMask::ALL
    }

    /// Values resolved before [`Generator::can_generate`] is consulted.
    fn prerequisites(&self) -> &[Dependency] {
        &[]
    }

    /// Decide from the prerequisites whether generation makes sense at all.
    /// Returning `false` stores every output as absent.
    fn can_generate(&self, _prerequisites: &ResolvedValues) -> bool {
        true
    }

    fn dependencies(&self) -> &[Dependency];

    fn outputs(&self) -> &[ValueTag];

    fn generate(&self, inputs: &ResolvedValues, out: &mut GeneratedValues<'_>) -> CoreResult<()>;
}

/// A generator that may suspend, for example to read the entity stream.
#[async_trait]
pub trait AsyncGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn rule_classes(&self) -> RuleClassMask {
        RuleClassMask::ALL
    }

    fn prerequisites(&self) -> &[Dependency] {
        &[]
    }

    fn can_generate(&self, _prerequisites: &ResolvedValues) -> bool {
        true
    }

    fn dependencies(&self) -> &[Dependency];

    fn outputs(&self) -> &[ValueTag];

    async fn generate(
        &self,
        inputs: &ResolvedValues,
        out: &mut GeneratedValues<'_>,
    ) -> CoreResult<()>;
}

/// What a catalog needs to know about an entry.
pub trait CatalogEntry: Send + Sync {
    fn entry_name(&self) -> &'static str;
    fn entry_rule_classes(&self) -> RuleClassMask;
    fn entry_inputs(&self) -> Vec<Dependency>;
    fn entry_outputs(&self) -> &[ValueTag];
}

impl CatalogEntry for dyn Generator {
    fn entry_name(&self) -> &'static str {
        self.name()
    }

    fn entry_rule_classes(&self) -> RuleClassMask {
        self.rule_classes()
    }

    fn entry_inputs(&self) -> Vec<Dependency> {
        self.prerequisites()
            .iter()
            .chain(self.dependencies())
            .copied()
            .collect()
    }

    fn entry_outputs(&self) -> &[ValueTag] {
        self.outputs()
    }
}

impl CatalogEntry for dyn AsyncGenerator {
    fn entry_name(&self) -> &'static str {
        self.name()
    }

    fn entry_rule_classes(&self) -> RuleClassMask {
        self.rule_classes()
    }

    fn entry_inputs(&self) -> Vec<Dependency> {
        self.prerequisites()
            .iter()
            .chain(self.dependencies())
            .copied()
            .collect()
    }

    fn entry_outputs(&self) -> &[ValueTag] {
        self.outputs()
    }
}

// ============================================================================
// GeneratorCatalog
// ============================================================================

/// Registry of generators indexed by output tag.
pub struct GeneratorCatalog<G: ?Sized + CatalogEntry> {
    generators: Vec<Arc<G>>,
    by_tag: HashMap<ValueTag, Vec<usize>>,
    class_aware: bool,
}

/// Catalog of synchronous generators.
pub type SyncCatalog = GeneratorCatalog<dyn Generator>;

/// Catalog of suspending generators.
pub type AsyncCatalog = GeneratorCatalog<dyn AsyncGenerator>;

impl<G: ?Sized + CatalogEntry> GeneratorCatalog<G> {
    /// Catalog where generators restricted to disjoint rule classes may share
    /// an output tag.
    pub fn class_aware() -> Self {
        Self {
            generators: Vec::new(),
            by_tag: HashMap::new(),
            class_aware: true,
        }
    }

    /// Catalog where every output tag has exactly one generator.
    pub fn class_agnostic() -> Self {
        Self {
            generators: Vec::new(),
            by_tag: HashMap::new(),
            class_aware: false,
        }
    }

    /// Register a generator for all of its declared outputs.
    pub fn register(&mut self, generator: Arc<G>) -> CoreResult<()> {
        let name = generator.entry_name();
        let outputs = generator.entry_outputs();
        if outputs.is_empty() {
            return Err(CoreError::InvalidGenerator {
                name,
                reason: "declares no outputs".to_string(),
            });
        }
        if let Some(dep) = generator
            .entry_inputs()
            .iter()
            .find(|dep| outputs.contains(&dep.tag))
        {
            return Err(CoreError::InvalidGenerator {
                name,
                reason: format!("depends on its own output '{}'", dep.tag),
            });
        }

        let classes = generator.entry_rule_classes();
        for tag in outputs {
            let Some(existing) = self.by_tag.get(tag) else {
                continue;
            };
            let conflict = existing.iter().map(|&i| &self.generators[i]).find(|other| {
                !self.class_aware || other.entry_rule_classes().intersects(classes)
            });
            if let Some(other) = conflict {
                return Err(CoreError::DuplicateGenerator {
                    tag: *tag,
                    existing: other.entry_name(),
                    duplicate: name,
                });
            }
        }

        let index = self.generators.len();
        for tag in outputs {
            self.by_tag.entry(*tag).or_default().push(index);
        }
        tracing::debug!(generator = name, outputs = outputs.len(), "registered generator");
        self.generators.push(generator);
        Ok(())
    }

    /// First generator for `tag` whose rule classes intersect `mask`.
    pub fn lookup(&self, tag: ValueTag, mask: RuleClassMask) -> Option<&Arc<G>> {
        self.lookup_indexed(tag, mask).map(|(_, generator)| generator)
    }

    /// Like [`GeneratorCatalog::lookup`], with the registration index.
    pub fn lookup_indexed(&self, tag: ValueTag, mask: RuleClassMask) -> Option<(usize, &Arc<G>)> {
        self.by_tag.get(&tag)?.iter().find_map(|&index| {
            let generator = &self.generators[index];
            (!self.class_aware || generator.entry_rule_classes().intersects(mask))
                .then_some((index, generator))
        })
    }

    /// First generator for `tag`, ignoring rule classes.
    pub fn lookup_any(&self, tag: ValueTag) -> Option<&Arc<G>> {
        self.by_tag
            .get(&tag)
            .and_then(|indices| indices.first())
            .map(|&index| &self.generators[index])
    }

    /// Whether any generator produces `tag`.
    pub fn provides(&self, tag: ValueTag) -> bool {
        self.by_tag.contains_key(&tag)
    }

    pub fn get(&self, index: usize) -> Option<&Arc<G>> {
        self.generators.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<G>> {
        self.generators.iter()
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }
}
