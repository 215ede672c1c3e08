//! binscope - Rule-based Static Analysis of Executables
//!
//! This library wires the binscope engine to the filesystem. It includes:
//! - TOML analysis configuration and report selection
//! - File entities and directory enumeration with per-target filters
//! - Magic-byte format detectors for PE, ELF and Mach-O
//! - The built-in rule pack
//! - Text and JSON output

pub mod analysis;
pub mod config;
pub mod detectors;
pub mod error;
pub mod fs;
pub mod output;
pub mod rules;

// ── Running an analysis ────────────────────────────────────────────────
pub use analysis::{build_shared_context, run, AnalysisOutcome};
pub use config::{AnalysisConfig, FilterConfig, SelectorConfig, TargetConfig};
pub use output::{render, OutputFormat, RunSummary};

// ── Front-end building blocks ──────────────────────────────────────────
pub use detectors::{BinaryFormat, ExecutablePermissionDetector, HeaderBytes, MagicDetector};
pub use error::{AppError, AppResult};
pub use fs::{FileEntity, FsTarget, FsTargetSource, TargetFilter};
