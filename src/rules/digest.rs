//! Content Digest Rules
//!
//! Every recognized entity gets a SHA-256 [`ContentDigest`] of its full
//! stream. The combined [`DigestIndexGenerator`] groups staged entities by
//! digest and `duplicate_content` reports each entity whose bytes also exist
//! under another path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use binscope_core::{
    arg, required, AsyncGenerator, CoreResult, Dependency, EntityRef, GeneratedValues,
    ReportCategory, ReportLevel, ReportSink, ResolvedValues, RuleClassMask, RuleMetadata,
    RuleReport, Value, ValueTag,
};
use binscope_engine::{
    CombinedGenerator, CombinedInputs, CombinedRule, EntityValues, IndividualDependency,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::detectors::format_classes;

const READ_CHUNK: usize = 64 * 1024;

/// Lowercase hex SHA-256 of the entity content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest(pub String);
binscope_core::impl_value!(ContentDigest, "binscope.content_digest");

/// Paths of staged entities grouped by content digest, in staging order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestIndex(pub BTreeMap<String, Vec<PathBuf>>);
binscope_core::impl_value!(DigestIndex, "binscope.digest_index");

impl DigestIndex {
    pub fn paths(&self, digest: &str) -> &[PathBuf] {
        self.0.get(digest).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ============================================================================
// Generators
// ============================================================================

pub struct ContentDigestGenerator;

const CONTENT_DIGEST_DEPS: &[Dependency] = &[required::<EntityRef>()];
const CONTENT_DIGEST_OUTPUTS: &[ValueTag] = &[ContentDigest::TAG];

#[async_trait]
impl AsyncGenerator for ContentDigestGenerator {
    fn name(&self) -> &'static str {
        "content_digest"
    }

    fn rule_classes(&self) -> RuleClassMask {
        format_classes()
    }

    fn dependencies(&self) -> &[Dependency] {
        CONTENT_DIGEST_DEPS
    }

    fn outputs(&self) -> &[ValueTag] {
        CONTENT_DIGEST_OUTPUTS
    }

    async fn generate(
        &self,
        inputs: &ResolvedValues,
        out: &mut GeneratedValues<'_>,
    ) -> CoreResult<()> {
        let entity = inputs.require::<EntityRef>()?;
        let mut stream = entity.0.open_stream().await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        out.set(ContentDigest(format!("{:x}", hasher.finalize())))
    }
}

pub struct DigestIndexGenerator;

const DIGEST_INDEX_INDIVIDUAL: &[Dependency] = &[required::<ContentDigest>()];
const DIGEST_INDEX_OUTPUTS: &[ValueTag] = &[DigestIndex::TAG];

impl CombinedGenerator for DigestIndexGenerator {
    fn name(&self) -> &'static str {
        "digest_index"
    }

    fn individual_dependencies(&self) -> &[Dependency] {
        DIGEST_INDEX_INDIVIDUAL
    }

    fn outputs(&self) -> &[ValueTag] {
        DIGEST_INDEX_OUTPUTS
    }

    fn generate(
        &self,
        entities: &[Arc<EntityValues>],
        _combined: &ResolvedValues,
        out: &mut GeneratedValues<'_>,
    ) -> CoreResult<()> {
        let mut index = DigestIndex::default();
        for values in entities {
            let (Some(digest), Some(entity)) = (values.get::<ContentDigest>(), values.entity())
            else {
                continue;
            };
            index
                .0
                .entry(digest.0.clone())
                .or_default()
                .push(entity.path().to_path_buf());
        }
        out.set(index)
    }
}

// ============================================================================
// Rule
// ============================================================================

pub const DUPLICATE_CONTENT: RuleReport = RuleReport::new(
    "duplicate_content",
    ReportLevel::Info,
    ReportCategory::Optimization,
);

pub struct DuplicateContentRule;

const DUPLICATE_CONTENT_REPORTS: &[RuleReport] = &[DUPLICATE_CONTENT];
const DUPLICATE_CONTENT_INDIVIDUAL: &[IndividualDependency] =
    &[IndividualDependency::required(ContentDigest::TAG).filtered()];
const DUPLICATE_CONTENT_COMBINED: &[Dependency] = &[required::<DigestIndex>()];

impl RuleMetadata for DuplicateContentRule {
    fn name(&self) -> &'static str {
        "duplicate_content"
    }

    fn rule_classes(&self) -> RuleClassMask {
        format_classes()
    }

    fn reports(&self) -> &[RuleReport] {
        DUPLICATE_CONTENT_REPORTS
    }
}

impl CombinedRule for DuplicateContentRule {
    fn individual_dependencies(&self) -> &[IndividualDependency] {
        DUPLICATE_CONTENT_INDIVIDUAL
    }

    fn combined_dependencies(&self) -> &[Dependency] {
        DUPLICATE_CONTENT_COMBINED
    }

    fn run(&self, inputs: &CombinedInputs<'_>, common_report: &dyn ReportSink) -> CoreResult<()> {
        let index = inputs.combined().require::<DigestIndex>()?;
        for (values, digest) in inputs.values::<ContentDigest>() {
            let Some(entity) = values.entity() else {
                continue;
            };
            let copies = index.paths(&digest.0);
            let Some(other) = copies.iter().find(|path| path.as_path() != entity.path()) else {
                continue;
            };
            let args = [
                arg("digest", &digest.0),
                arg("copies", copies.len()),
                arg("duplicate_of", other.display()),
            ];
            match values.reporter(self.name()) {
                Some(reporter) => reporter.log(&DUPLICATE_CONTENT, &args),
                None => {
                    let mut args = args.to_vec();
                    args.push(arg("path", entity.path().display()));
                    common_report.log(DUPLICATE_CONTENT.level, DUPLICATE_CONTENT.uid, &args);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use binscope_core::{
        InMemoryReport, MemoryEntity, ReportFactory, RuleSelector, SelectionMode, SubjectEntity,
        ValueCache,
    };
    use binscope_engine::combined::run_combined_rules;
    use binscope_engine::{ActiveSelector, CombinedCatalog, EntityReport};

    use super::*;
    use crate::detectors::ELF64;

    async fn digest_of(content: &[u8]) -> String {
        let entity: Arc<dyn SubjectEntity> = Arc::new(MemoryEntity::new("e", content.to_vec()));
        let mut inputs = ResolvedValues::new();
        inputs.push(
            EntityRef::TAG,
            Some(binscope_core::value::value_ptr(EntityRef(entity))),
        );
        let mut out = GeneratedValues::new("content_digest", CONTENT_DIGEST_OUTPUTS);
        ContentDigestGenerator.generate(&inputs, &mut out).await.unwrap();

        let mut cache = ValueCache::new();
        for (tag, slot) in out.into_slots() {
            cache.insert_slot(tag, slot);
        }
        cache.get_typed::<ContentDigest>().unwrap().unwrap().0.clone()
    }

    fn staged(
        report: &InMemoryReport,
        path: &str,
        digest: &str,
        selector: &Arc<RuleSelector>,
    ) -> Arc<EntityValues> {
        let entity: Arc<dyn SubjectEntity> = Arc::new(MemoryEntity::new(path, vec![]));
        let mut cache = ValueCache::new();
        cache.insert(ContentDigest(digest.to_string()));
        cache.insert(EntityReport(report.entity_report(&entity, ELF64.into())));
        cache.insert(EntityRef(entity));
        cache.insert(ActiveSelector(Arc::clone(selector)));
        Arc::new(EntityValues::new(cache, ELF64.into()))
    }

    fn catalog() -> CombinedCatalog {
        let mut catalog = CombinedCatalog::class_agnostic();
        catalog.register(Arc::new(DigestIndexGenerator)).unwrap();
        catalog
    }

    #[tokio::test]
    async fn test_sha256_digest() {
        assert_eq!(
            digest_of(b"abc").await,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        // Spans several read chunks
        let large = vec![7u8; READ_CHUNK * 2 + 5];
        let expected = format!("{:x}", Sha256::digest(&large));
        assert_eq!(digest_of(&large).await, expected);
    }

    #[test]
    fn test_duplicates_reported_per_entity() {
        let report = InMemoryReport::new();
        let selector = Arc::new(RuleSelector::new());
        let entities = vec![
            staged(&report, "/bin/a", "d1", &selector),
            staged(&report, "/bin/b", "d2", &selector),
            staged(&report, "/bin/c", "d1", &selector),
        ];
        let rules: Vec<Arc<dyn CombinedRule>> = vec![Arc::new(DuplicateContentRule)];
        run_combined_rules(&rules, &catalog(), &entities, report.common_report().as_ref());

        let findings = report.findings_for("duplicate_content");
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].entity, Some(PathBuf::from("/bin/a")));
        assert_eq!(findings[0].arg("duplicate_of"), Some("/bin/c"));
        assert_eq!(findings[0].arg("copies"), Some("2"));
        assert_eq!(findings[1].entity, Some(PathBuf::from("/bin/c")));
        assert_eq!(findings[1].arg("duplicate_of"), Some("/bin/a"));
    }

    #[test]
    fn test_disabled_report_hides_entities() {
        let report = InMemoryReport::new();
        let selector = Arc::new(
            RuleSelector::new()
                .with_mode(SelectionMode::ExcludeSelected)
                .select_report("duplicate_content"),
        );
        let entities = vec![
            staged(&report, "/bin/a", "d1", &selector),
            staged(&report, "/bin/b", "d1", &selector),
        ];
        let rules: Vec<Arc<dyn CombinedRule>> = vec![Arc::new(DuplicateContentRule)];
        run_combined_rules(&rules, &catalog(), &entities, report.common_report().as_ref());
        assert!(report.findings().is_empty());
    }
}
