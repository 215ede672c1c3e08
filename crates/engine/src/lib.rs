//! binscope Engine
//!
//! Everything between enumerated targets and recorded findings: the
//! detector chain, the per-entity analyzer, combined analysis across
//! entities and the two-runtime pipeline that drives them.
//!
//! ## Module Organization
//!
//! - `detector` - `RuleDetector` trait and `DetectorChain`
//! - `target` - `TargetSource` and `TargetEntry`
//! - `combined` - Combined generators, rules and value provider
//! - `context` - `SharedContext` registries and per-run `AnalysisContext`
//! - `analyzer` - `EntityAnalyzer`, the per-entity orchestrator
//! - `pipeline` - `Pipeline`, `PipelineTask`, admission limits

pub mod analyzer;
pub mod combined;
pub mod context;
pub mod detector;
pub mod pipeline;
pub mod target;

// ── Detection & Targets ────────────────────────────────────────────────
pub use detector::{DetectorChain, RuleDetector};
pub use target::{StaticTargetSource, TargetEntry, TargetSource};

// ── Combined Analysis ──────────────────────────────────────────────────
pub use combined::{
    required_individual_dependencies, ActiveSelector, CombinedCatalog, CombinedGenerator,
    CombinedInputs, CombinedRule, CombinedValueProvider, EntityReport, EntityValues,
    IndividualDependency,
};

// ── Orchestration ──────────────────────────────────────────────────────
pub use analyzer::{EntityAnalyzer, LoadedEntity};
pub use context::{AnalysisContext, AnalysisOptions, SharedContext, SharedContextBuilder};
pub use pipeline::{AdmissionLimit, Pipeline, PipelineConfig, PipelineStats, PipelineTask, Producer};
