//! Dependency Declarations
//!
//! Generators and rules declare their inputs as a fixed slice of
//! [`Dependency`] and receive them back as [`ResolvedValues`]. Outputs are
//! collected through [`GeneratedValues`], which only accepts declared tags.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::value::{downcast_arc, downcast_ref, value_ptr, Value, ValuePtr, ValueTag};

/// One declared input: a tag and whether it must be present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub tag: ValueTag,
    pub required: bool,
}

impl Dependency {
    /// A dependency that must be present for the consumer to run.
    pub const fn required(tag: ValueTag) -> Self {
        Self {
            tag,
            required: true,
        }
    }

    /// A dependency the consumer tolerates being absent.
    pub const fn optional(tag: ValueTag) -> Self {
        Self {
            tag,
            required: false,
        }
    }
}

/// Shorthand for a required dependency on `T`.
pub const fn required<T: Value>() -> Dependency {
    Dependency::required(T::TAG)
}

/// Shorthand for an optional dependency on `T`.
pub const fn optional<T: Value>() -> Dependency {
    Dependency::optional(T::TAG)
}

// ============================================================================
// ResolvedValues
// ============================================================================

/// Inputs resolved for one generator or rule invocation, in declaration order.
#[derive(Clone, Default)]
pub struct ResolvedValues {
    entries: Vec<(ValueTag, Option<ValuePtr>)>,
}

impl ResolvedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, tag: ValueTag, value: Option<ValuePtr>) {
        self.entries.push((tag, value));
    }

    /// Raw access by tag.
    pub fn value(&self, tag: ValueTag) -> Option<&ValuePtr> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .and_then(|(_, v)| v.as_ref())
    }

    /// Typed access to an optional input. Absent and undeclared both read as `None`.
    pub fn get<T: Value>(&self) -> Option<&T> {
        self.value(T::TAG)
            .and_then(|ptr| ptr.as_ref().downcast_ref::<T>())
    }

    /// Typed access to an input that must be present.
    pub fn require<T: Value>(&self) -> CoreResult<&T> {
        let ptr = self.value(T::TAG).ok_or(CoreError::MissingValue(T::TAG))?;
        downcast_ref::<T>(ptr)
    }

    /// Typed shared handle to an input.
    pub fn get_arc<T: Value>(&self) -> Option<Arc<T>> {
        self.value(T::TAG)
            .cloned()
            .and_then(|ptr| downcast_arc::<T>(ptr).ok())
    }

    pub fn is_present(&self, tag: ValueTag) -> bool {
        self.value(tag).is_some()
    }

    /// Whether every required dependency in `deps` resolved to a value.
    pub fn satisfies(&self, deps: &[Dependency]) -> bool {
        deps.iter()
            .filter(|dep| dep.required)
            .all(|dep| self.is_present(dep.tag))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// GeneratedValues
// ============================================================================

/// Output collector handed to a generator.
pub struct GeneratedValues<'a> {
    generator: &'static str,
    declared: &'a [ValueTag],
    values: HashMap<ValueTag, ValuePtr>,
}

impl<'a> GeneratedValues<'a> {
    pub fn new(generator: &'static str, declared: &'a [ValueTag]) -> Self {
        Self {
            generator,
            declared,
            values: HashMap::with_capacity(declared.len()),
        }
    }

    /// Store one output. The tag must be among the declared outputs.
    pub fn set<T: Value>(&mut self, value: T) -> CoreResult<()> {
        self.set_raw(T::TAG, value_ptr(value))
    }

    /// Store an already type-erased output.
    pub fn set_raw(&mut self, tag: ValueTag, value: ValuePtr) -> CoreResult<()> {
        if !self.declared.contains(&tag) {
            return Err(CoreError::UndeclaredOutput {
                name: self.generator,
                tag,
            });
        }
        self.values.insert(tag, value);
        Ok(())
    }

    /// Slots for every declared output; unset outputs come back absent.
    pub fn into_slots(mut self) -> Vec<(ValueTag, Option<ValuePtr>)> {
        self.declared
            .iter()
            .map(|tag| (*tag, self.values.remove(tag)))
            .collect()
    }

    pub fn declared(&self) -> &'a [ValueTag] {
        self.declared
    }
}
