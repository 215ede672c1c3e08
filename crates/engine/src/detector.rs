//! Rule Detector Chain
//!
//! Classifies an entity into a [`RuleClassMask`]. Format detectors are tried
//! in registration order and the first match wins; extra detectors then run
//! unconditionally and may only add classes.

use std::sync::Arc;

use async_trait::async_trait;
use binscope_core::{CoreResult, RuleClassMask, StreamProvider, SubjectEntity, ValueCache};

/// Classifies entities, optionally seeding values it decoded on the way.
#[async_trait]
pub trait RuleDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `true` when the entity is recognized. Detected classes are
    /// added to `rule_classes`; decoded values go into `values`.
    async fn detect(
        &self,
        entity: &dyn SubjectEntity,
        stream: &mut StreamProvider,
        values: &mut ValueCache,
        rule_classes: &mut RuleClassMask,
    ) -> CoreResult<bool>;
}

/// Ordered format detectors plus extra detectors.
#[derive(Default)]
pub struct DetectorChain {
    format_detectors: Vec<Arc<dyn RuleDetector>>,
    extra_detectors: Vec<Arc<dyn RuleDetector>>,
}

impl DetectorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a format detector. Formats are mutually exclusive.
    pub fn add_format_detector(&mut self, detector: Arc<dyn RuleDetector>) -> &mut Self {
        self.format_detectors.push(detector);
        self
    }

    /// Add a detector run after any format match.
    pub fn add_extra_detector(&mut self, detector: Arc<dyn RuleDetector>) -> &mut Self {
        self.extra_detectors.push(detector);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.format_detectors.is_empty()
    }
}

#[async_trait]
impl RuleDetector for DetectorChain {
    fn name(&self) -> &'static str {
        "detector_chain"
    }

    async fn detect(
        &self,
        entity: &dyn SubjectEntity,
        stream: &mut StreamProvider,
        values: &mut ValueCache,
        rule_classes: &mut RuleClassMask,
    ) -> CoreResult<bool> {
        let mut matched = None;
        for detector in &self.format_detectors {
            let mut detected = RuleClassMask::EMPTY;
            if detector.detect(entity, stream, values, &mut detected).await? {
                matched = Some((detector.name(), detected));
                break;
            }
        }

        let Some((format, mut baseline)) = matched else {
            tracing::debug!(entity = %entity.path().display(), "no format detector matched");
            return Ok(false);
        };

        for detector in &self.extra_detectors {
            let mut extended = baseline;
            detector.detect(entity, stream, values, &mut extended).await?;
            baseline |= extended;
        }

        tracing::debug!(
            entity = %entity.path().display(),
            format,
            rule_classes = ?baseline,
            "entity classified"
        );
        *rule_classes |= baseline;
        Ok(true)
    }
}
