//! Rule Classes
//!
//! A rule class is a small index (format family, bitness, executable, ...)
//! defined by the application. Generators, rules and detectors declare the
//! set of classes they apply to as a [`RuleClassMask`].

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Upper bound on distinct rule classes.
pub const MAX_RULE_CLASSES: u8 = 64;

/// One rule class, identified by its bit index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct RuleClass(u8);

impl RuleClass {
    /// Create a rule class. Indices at or above [`MAX_RULE_CLASSES`] wrap.
    pub const fn new(index: u8) -> Self {
        Self(index % MAX_RULE_CLASSES)
    }

    pub const fn index(self) -> u8 {
        self.0
    }
}

/// Bitmask over rule classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RuleClassMask(u64);

impl RuleClassMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(u64::MAX);

    /// Mask with exactly the given classes.
    pub fn of(classes: &[RuleClass]) -> Self {
        let mut mask = Self::EMPTY;
        for class in classes {
            mask.set(*class);
        }
        mask
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn set(&mut self, class: RuleClass) {
        self.0 |= 1u64 << class.0;
    }

    pub fn with(mut self, class: RuleClass) -> Self {
        self.set(class);
        self
    }

    pub const fn is_set(self, class: RuleClass) -> bool {
        self.0 & (1u64 << class.0) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether the two masks share at least one class.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterate the set classes in ascending index order.
    pub fn iter(self) -> RuleClassIter {
        RuleClassIter(self.0)
    }
}

impl BitOr for RuleClassMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for RuleClassMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<RuleClass> for RuleClassMask {
    fn from(class: RuleClass) -> Self {
        Self::EMPTY.with(class)
    }
}

impl FromIterator<RuleClass> for RuleClassMask {
    fn from_iter<I: IntoIterator<Item = RuleClass>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

impl fmt::Debug for RuleClassMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return f.write_str("RuleClassMask(ALL)");
        }
        f.debug_set()
            .entries(self.iter().map(RuleClass::index))
            .finish()
    }
}

impl IntoIterator for RuleClassMask {
    type Item = RuleClass;
    type IntoIter = RuleClassIter;

    fn into_iter(self) -> RuleClassIter {
        self.iter()
    }
}

/// Iterator over the set bits of a [`RuleClassMask`].
pub struct RuleClassIter(u64);

impl Iterator for RuleClassIter {
    type Item = RuleClass;

    fn next(&mut self) -> Option<RuleClass> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros() as u8;
        self.0 &= self.0 - 1;
        Some(RuleClass(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for RuleClassIter {}
