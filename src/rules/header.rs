//! Header Rules
//!
//! [`HeaderInfoGenerator`] derives the minimum size a file of the detected
//! format must have to hold its fixed headers; `truncated_header` reports
//! files shorter than that.

use binscope_core::{
    arg, required, CoreResult, Dependency, EntityRef, GeneratedValues, Generator, ReportCategory,
    ReportLevel, ResolvedValues, Rule, RuleClassMask, RuleMetadata, RuleReport, RuleReporter,
    Value, ValueTag,
};

use crate::detectors::{format_classes, BinaryFormat, HeaderBytes};

/// Offset of `e_lfanew` in the DOS header.
const PE_HEADER_OFFSET_FIELD: usize = 0x3c;
/// `PE\0\0` signature plus the COFF file header.
const PE_SIGNATURE_AND_COFF: u64 = 4 + 20;
const DOS_HEADER_LEN: u64 = 64;

/// Fixed header extent of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub format: BinaryFormat,
    /// Bytes the fixed headers occupy
    pub expected_len: u64,
    /// Size of the entity
    pub actual_len: u64,
}
binscope_core::impl_value!(HeaderInfo, "binscope.header_info");

impl HeaderInfo {
    pub fn is_truncated(&self) -> bool {
        self.actual_len < self.expected_len
    }
}

/// Bytes the fixed headers of `format` occupy, given the header prefix.
pub fn expected_header_len(format: BinaryFormat, prefix: &[u8]) -> u64 {
    match format {
        BinaryFormat::Pe => {
            let field = prefix.get(PE_HEADER_OFFSET_FIELD..PE_HEADER_OFFSET_FIELD + 4);
            match field {
                Some(bytes) => {
                    let offset = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    (u64::from(offset) + PE_SIGNATURE_AND_COFF).max(DOS_HEADER_LEN)
                }
                None => DOS_HEADER_LEN,
            }
        }
        BinaryFormat::Elf32 => 52,
        BinaryFormat::Elf64 => 64,
        BinaryFormat::MachO32 => 28,
        BinaryFormat::MachO64 => 32,
    }
}

// ============================================================================
// Generator
// ============================================================================

pub struct HeaderInfoGenerator;

const HEADER_INFO_DEPS: &[Dependency] = &[
    required::<HeaderBytes>(),
    required::<BinaryFormat>(),
    required::<EntityRef>(),
];
const HEADER_INFO_OUTPUTS: &[ValueTag] = &[HeaderInfo::TAG];

impl Generator for HeaderInfoGenerator {
    fn name(&self) -> &'static str {
        "header_info"
    }

    fn rule_classes(&self) -> RuleClassMask {
        format_classes()
    }

    fn dependencies(&self) -> &[Dependency] {
        HEADER_INFO_DEPS
    }

    fn outputs(&self) -> &[ValueTag] {
        HEADER_INFO_OUTPUTS
    }

    fn generate(&self, inputs: &ResolvedValues, out: &mut GeneratedValues<'_>) -> CoreResult<()> {
        let format = *inputs.require::<BinaryFormat>()?;
        let prefix = inputs.require::<HeaderBytes>()?;
        let entity = inputs.require::<EntityRef>()?;
        out.set(HeaderInfo {
            format,
            expected_len: expected_header_len(format, &prefix.0),
            actual_len: entity.0.size(),
        })
    }
}

// ============================================================================
// Rule
// ============================================================================

pub const TRUNCATED_HEADER: RuleReport =
    RuleReport::new("truncated_header", ReportLevel::Error, ReportCategory::Format);

pub struct TruncatedHeaderRule;

const TRUNCATED_HEADER_REPORTS: &[RuleReport] = &[TRUNCATED_HEADER];
const TRUNCATED_HEADER_DEPS: &[Dependency] = &[required::<HeaderInfo>()];

impl RuleMetadata for TruncatedHeaderRule {
    fn name(&self) -> &'static str {
        "truncated_header"
    }

    fn rule_classes(&self) -> RuleClassMask {
        format_classes()
    }

    fn reports(&self) -> &[RuleReport] {
        TRUNCATED_HEADER_REPORTS
    }
}

impl Rule for TruncatedHeaderRule {
    fn dependencies(&self) -> &[Dependency] {
        TRUNCATED_HEADER_DEPS
    }

    fn run(&self, reporter: &RuleReporter<'_>, inputs: &ResolvedValues) -> CoreResult<()> {
        let info = inputs.require::<HeaderInfo>()?;
        if info.is_truncated() {
            reporter.log(
                &TRUNCATED_HEADER,
                &[
                    arg("expected", info.expected_len),
                    arg("actual", info.actual_len),
                ],
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pe_prefix(e_lfanew: u32) -> Vec<u8> {
        let mut prefix = vec![0u8; 64];
        prefix[..2].copy_from_slice(b"MZ");
        prefix[0x3c..0x40].copy_from_slice(&e_lfanew.to_le_bytes());
        prefix
    }

    #[test]
    fn test_expected_len_per_format() {
        assert_eq!(expected_header_len(BinaryFormat::Elf32, b"\x7fELF\x01"), 52);
        assert_eq!(expected_header_len(BinaryFormat::Elf64, b"\x7fELF\x02"), 64);
        assert_eq!(expected_header_len(BinaryFormat::MachO32, &[]), 28);
        assert_eq!(expected_header_len(BinaryFormat::MachO64, &[]), 32);
    }

    #[test]
    fn test_pe_expected_len_follows_e_lfanew() {
        assert_eq!(expected_header_len(BinaryFormat::Pe, &pe_prefix(0x80)), 0x80 + 24);
        assert_eq!(expected_header_len(BinaryFormat::Pe, &pe_prefix(0)), 64);
        // Prefix too short to carry e_lfanew
        assert_eq!(expected_header_len(BinaryFormat::Pe, b"MZ"), 64);
    }

    #[test]
    fn test_truncation() {
        let info = HeaderInfo {
            format: BinaryFormat::Elf64,
            expected_len: 64,
            actual_len: 63,
        };
        assert!(info.is_truncated());
        assert!(!HeaderInfo { actual_len: 64, ..info }.is_truncated());
    }
}
