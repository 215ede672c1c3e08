//! binscope Core
//!
//! Value registry, generator catalogs, value providers and the rule model
//! shared by the binscope workspace. Nothing in here knows about binary
//! formats, the filesystem walk or the execution pipeline.
//!
//! ## Module Organization
//!
//! - `value` - Stable value tags and the per-scope `ValueCache`
//! - `dependency` - Declared inputs and generator output collection
//! - `generator` - Sync/async generator traits and `GeneratorCatalog`
//! - `provider` - Memoizing synchronous `ValueProvider`
//! - `async_provider` - `AsyncValueProvider` with at-most-once generation
//! - `rule_class` - `RuleClass` and `RuleClassMask`
//! - `rule` - Rule traits, `RuleReporter`, `RuleList`
//! - `selector` - `RuleSelector` and argument filters
//! - `report` - Report levels, categories, sinks, in-memory report
//! - `entity` - `SubjectEntity` and stream access
//! - `progress` - Progress notifications and extended stats
//! - `resource` - Embedded resource loading
//! - `time_tracker` - Run timing

pub mod error;
pub mod value;
pub mod dependency;
pub mod generator;
pub mod provider;
pub mod async_provider;
pub mod rule_class;
pub mod rule;
pub mod selector;
pub mod report;
pub mod entity;
pub mod progress;
pub mod resource;
pub mod time_tracker;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Values & Dependencies ──────────────────────────────────────────────
pub use dependency::{optional, required, Dependency, GeneratedValues, ResolvedValues};
pub use value::{Value, ValueCache, ValuePtr, ValueTag};

// ── Generators & Providers ─────────────────────────────────────────────
pub use async_provider::AsyncValueProvider;
pub use generator::{
    AsyncCatalog, AsyncGenerator, CatalogEntry, Generator, GeneratorCatalog, SyncCatalog,
};
pub use provider::ValueProvider;

// ── Rules ──────────────────────────────────────────────────────────────
pub use rule::{Rule, RuleList, RuleMetadata, RuleReporter};
pub use rule_class::{RuleClass, RuleClassMask};
pub use selector::{ArgAggregation, FilterAction, ReportFilter, RuleSelector, SelectionMode};

// ── Reporting ──────────────────────────────────────────────────────────
pub use progress::{
    NoProgress, ProgressReport, ProgressSnapshot, ProgressState, ProgressStats, TracingProgress,
};
pub use report::{
    arg, Finding, InMemoryReport, ReportArg, ReportCategory, ReportFactory, ReportLevel, ReportSink,
    RuleReport,
};

// ── Entities & Resources ───────────────────────────────────────────────
pub use entity::{
    EntityRef, EntityStream, InaccessibleEntity, MemoryEntity, StreamProvider, SubjectEntity,
};
pub use resource::{
    EmbeddedResourceLoader, FileResourceLoader, MemoryResourceLoader, ResourceLoaderGenerator,
    ResourceLoaderRef,
};
pub use time_tracker::{TimeTracker, TimingSummary};
