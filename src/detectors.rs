//! Format Detectors
//!
//! [`MagicDetector`] recognizes PE, ELF and Mach-O files by their leading
//! magic bytes and seeds the header prefix it read. The
//! [`ExecutablePermissionDetector`] extra detector tags files carrying any
//! unix execute bit.

use std::sync::Arc;

use async_trait::async_trait;
use binscope_core::{
    CoreResult, RuleClass, RuleClassMask, StreamProvider, SubjectEntity, ValueCache,
};
use binscope_engine::{RuleDetector, SharedContextBuilder};

// ============================================================================
// Rule Classes
// ============================================================================

pub const PE: RuleClass = RuleClass::new(0);
pub const ELF32: RuleClass = RuleClass::new(1);
pub const ELF64: RuleClass = RuleClass::new(2);
pub const MACH_O32: RuleClass = RuleClass::new(3);
pub const MACH_O64: RuleClass = RuleClass::new(4);
/// Added on top of a format class when any execute bit is set
pub const EXECUTABLE: RuleClass = RuleClass::new(8);

/// Every format class.
pub fn format_classes() -> RuleClassMask {
    RuleClassMask::of(&[PE, ELF32, ELF64, MACH_O32, MACH_O64])
}

// ============================================================================
// Seeded Values
// ============================================================================

/// Number of leading bytes kept as [`HeaderBytes`].
pub const HEADER_PREFIX_LEN: usize = 64;

/// Leading bytes of the entity, read during detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBytes(pub Vec<u8>);
binscope_core::impl_value!(HeaderBytes, "binscope.header_bytes");

/// Container format recognized by [`MagicDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Pe,
    Elf32,
    Elf64,
    MachO32,
    MachO64,
}
binscope_core::impl_value!(BinaryFormat, "binscope.binary_format");

impl BinaryFormat {
    pub fn rule_class(self) -> RuleClass {
        match self {
            Self::Pe => PE,
            Self::Elf32 => ELF32,
            Self::Elf64 => ELF64,
            Self::MachO32 => MACH_O32,
            Self::MachO64 => MACH_O64,
        }
    }

    /// Identify the format from the leading bytes.
    pub fn from_magic(prefix: &[u8]) -> Option<Self> {
        match prefix {
            [b'M', b'Z', ..] => Some(Self::Pe),
            [0x7f, b'E', b'L', b'F', class, ..] => match class {
                1 => Some(Self::Elf32),
                2 => Some(Self::Elf64),
                _ => None,
            },
            [a, b, c, d, ..] => match u32::from_be_bytes([*a, *b, *c, *d]) {
                0xfeed_face | 0xcefa_edfe => Some(Self::MachO32),
                0xfeed_facf | 0xcffa_edfe => Some(Self::MachO64),
                _ => None,
            },
            _ => None,
        }
    }
}

// ============================================================================
// Detectors
// ============================================================================

/// Format detector keyed on magic bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicDetector;

#[async_trait]
impl RuleDetector for MagicDetector {
    fn name(&self) -> &'static str {
        "magic"
    }

    async fn detect(
        &self,
        _entity: &dyn SubjectEntity,
        stream: &mut StreamProvider,
        values: &mut ValueCache,
        rule_classes: &mut RuleClassMask,
    ) -> CoreResult<bool> {
        let prefix = stream.read_prefix(HEADER_PREFIX_LEN).await?;
        let Some(format) = BinaryFormat::from_magic(&prefix) else {
            return Ok(false);
        };
        rule_classes.set(format.rule_class());
        values.insert(format);
        values.insert(HeaderBytes(prefix));
        Ok(true)
    }
}

/// Extra detector adding [`EXECUTABLE`] for files with an execute bit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutablePermissionDetector;

#[async_trait]
impl RuleDetector for ExecutablePermissionDetector {
    fn name(&self) -> &'static str {
        "executable_permission"
    }

    async fn detect(
        &self,
        entity: &dyn SubjectEntity,
        _stream: &mut StreamProvider,
        _values: &mut ValueCache,
        rule_classes: &mut RuleClassMask,
    ) -> CoreResult<bool> {
        let executable = entity.unix_mode().is_some_and(|mode| mode & 0o111 != 0);
        if executable {
            rule_classes.set(EXECUTABLE);
        }
        Ok(executable)
    }
}

/// Register the built-in detectors.
pub fn register(builder: &mut SharedContextBuilder) {
    builder
        .format_detector(Arc::new(MagicDetector))
        .extra_detector(Arc::new(ExecutablePermissionDetector));
}

#[cfg(test)]
mod tests {
    use binscope_core::MemoryEntity;
    use binscope_engine::DetectorChain;

    use super::*;

    async fn classify(content: &[u8], mode: Option<u32>) -> (bool, RuleClassMask, ValueCache) {
        let mut entity = MemoryEntity::new("subject", content.to_vec());
        if let Some(mode) = mode {
            entity = entity.with_unix_mode(mode);
        }
        let entity: Arc<dyn SubjectEntity> = Arc::new(entity);

        let mut chain = DetectorChain::new();
        chain
            .add_format_detector(Arc::new(MagicDetector))
            .add_extra_detector(Arc::new(ExecutablePermissionDetector));
        let mut stream = StreamProvider::new(Arc::clone(&entity));
        let mut values = ValueCache::new();
        let mut mask = RuleClassMask::EMPTY;
        let matched = chain
            .detect(entity.as_ref(), &mut stream, &mut values, &mut mask)
            .await
            .unwrap();
        (matched, mask, values)
    }

    #[test]
    fn test_magic_table() {
        assert_eq!(BinaryFormat::from_magic(b"MZ\x90\x00"), Some(BinaryFormat::Pe));
        assert_eq!(BinaryFormat::from_magic(b"\x7fELF\x01"), Some(BinaryFormat::Elf32));
        assert_eq!(BinaryFormat::from_magic(b"\x7fELF\x02"), Some(BinaryFormat::Elf64));
        assert_eq!(BinaryFormat::from_magic(b"\x7fELF\x09"), None);
        assert_eq!(
            BinaryFormat::from_magic(&[0xcf, 0xfa, 0xed, 0xfe]),
            Some(BinaryFormat::MachO64)
        );
        assert_eq!(
            BinaryFormat::from_magic(&[0xfe, 0xed, 0xfa, 0xce]),
            Some(BinaryFormat::MachO32)
        );
        assert_eq!(BinaryFormat::from_magic(b"#!/bin/sh"), None);
        assert_eq!(BinaryFormat::from_magic(b"M"), None);
    }

    #[tokio::test]
    async fn test_elf_with_exec_bit() {
        let (matched, mask, values) = classify(b"\x7fELF\x02\x01\x01", Some(0o755)).await;
        assert!(matched);
        assert_eq!(mask, RuleClassMask::of(&[ELF64, EXECUTABLE]));
        assert_eq!(
            values.get_typed::<HeaderBytes>().unwrap().unwrap().0,
            b"\x7fELF\x02\x01\x01"
        );
        assert_eq!(
            values.get_typed::<BinaryFormat>().unwrap(),
            Some(&BinaryFormat::Elf64)
        );
    }

    #[tokio::test]
    async fn test_script_is_unsupported_even_when_executable() {
        let (matched, mask, values) = classify(b"#!/bin/sh\necho hi\n", Some(0o755)).await;
        assert!(!matched);
        assert!(mask.is_empty());
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_pe_without_mode() {
        let (matched, mask, _) = classify(b"MZ\x90\x00", None).await;
        assert!(matched);
        assert_eq!(mask, RuleClassMask::from(PE));
    }
}
