//! Value Registry
//!
//! Typed, heterogeneous storage keyed by an explicit per-type `ValueTag`.
//! Every value type declares its tag through [`impl_value!`]; tags are plain
//! string keys, so they stay stable across builds and toolchains.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};

/// Stable key identifying one value type in a [`ValueCache`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueTag(&'static str);

impl ValueTag {
    /// Create a tag from its stable name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The stable name of this tag.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueTag({})", self.0)
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A value that can live in a [`ValueCache`].
///
/// Implement it with [`impl_value!`] rather than by hand.
pub trait Value: Any + Send + Sync {
    /// Stable tag of this value type.
    const TAG: ValueTag;
}

/// Declare the stable tag of a value type.
///
/// ```ignore
/// struct HeaderBytes(Vec<u8>);
/// binscope_core::impl_value!(HeaderBytes, "core.header_bytes");
/// ```
#[macro_export]
macro_rules! impl_value {
    ($ty:ty, $name:literal) => {
        impl $crate::value::Value for $ty {
            const TAG: $crate::value::ValueTag = $crate::value::ValueTag::new($name);
        }
    };
}

/// Shared handle to a stored value.
pub type ValuePtr = Arc<dyn Any + Send + Sync>;

/// Wrap a value for storage.
pub fn value_ptr<T: Value>(value: T) -> ValuePtr {
    Arc::new(value)
}

/// Borrow a stored value as `T`, checking its tag's payload type.
pub fn downcast_ref<T: Value>(ptr: &ValuePtr) -> CoreResult<&T> {
    ptr.as_ref()
        .downcast_ref::<T>()
        .ok_or(CoreError::ValueTypeMismatch(T::TAG))
}

/// Convert a stored value into a typed `Arc<T>`.
pub fn downcast_arc<T: Value>(ptr: ValuePtr) -> CoreResult<Arc<T>> {
    ptr.downcast::<T>()
        .map_err(|_| CoreError::ValueTypeMismatch(T::TAG))
}

// ============================================================================
// ValueCache
// ============================================================================

/// Tag-to-value storage for one analysis scope.
///
/// A slot is either present or "initialized absent": generation was attempted
/// and produced nothing. Missing slots have never been initialized.
#[derive(Default, Clone)]
pub struct ValueCache {
    slots: HashMap<ValueTag, Option<ValuePtr>>,
}

impl ValueCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a slot. `None` means never initialized.
    pub fn get(&self, tag: ValueTag) -> Option<Option<ValuePtr>> {
        self.slots.get(&tag).cloned()
    }

    /// Look up a present value.
    pub fn value(&self, tag: ValueTag) -> Option<&ValuePtr> {
        self.slots.get(&tag).and_then(Option::as_ref)
    }

    /// Typed access to a present value.
    pub fn get_typed<T: Value>(&self) -> CoreResult<Option<&T>> {
        self.value(T::TAG).map(downcast_ref::<T>).transpose()
    }

    /// Whether the slot was initialized (present or absent).
    pub fn contains(&self, tag: ValueTag) -> bool {
        self.slots.contains_key(&tag)
    }

    /// Whether the slot holds a value.
    pub fn has_value(&self, tag: ValueTag) -> bool {
        self.value(tag).is_some()
    }

    /// Store a typed value under its own tag.
    pub fn insert<T: Value>(&mut self, value: T) {
        self.slots.insert(T::TAG, Some(value_ptr(value)));
    }

    /// Store a slot as-is.
    pub fn insert_slot(&mut self, tag: ValueTag, slot: Option<ValuePtr>) {
        self.slots.insert(tag, slot);
    }

    /// Mark a slot as initialized without a value.
    pub fn insert_absent(&mut self, tag: ValueTag) {
        self.slots.insert(tag, None);
    }

    /// Remove a slot, returning whatever it held.
    pub fn remove(&mut self, tag: ValueTag) -> Option<Option<ValuePtr>> {
        self.slots.remove(&tag)
    }

    /// Keep only the slots whose tag satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(ValueTag) -> bool) {
        self.slots.retain(|tag, _| keep(*tag));
    }

    /// Move every slot of `other` into this cache, overwriting.
    pub fn extend(&mut self, other: ValueCache) {
        self.slots.extend(other.slots);
    }

    /// Initialized tags, in no particular order.
    pub fn tags(&self) -> impl Iterator<Item = ValueTag> + '_ {
        self.slots.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl fmt::Debug for ValueCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.slots.iter().map(|(t, v)| (t.0, v.is_some())).collect();
        tags.sort_unstable();
        f.debug_struct("ValueCache").field("slots", &tags).finish()
    }
}
