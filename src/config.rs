//! Analysis Configuration
//!
//! TOML configuration of one analysis run. Every field has a default, so an
//! empty file is a valid configuration; command line values are applied on
//! top by the binary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use binscope_core::{
    ArgAggregation, FilterAction, ReportCategory, ReportFilter, ReportLevel, RuleSelector,
    SelectionMode,
};
use binscope_engine::{AdmissionLimit, AnalysisOptions, PipelineConfig, SharedContext};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::fs::TargetFilter;

/// Settings of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Files or directories to analyze
    pub targets: Vec<TargetConfig>,
    /// Descend into subdirectories of directory targets
    pub recursive: bool,
    /// CPU worker threads, one per core when unset
    pub thread_count: Option<usize>,
    pub combined_analysis: bool,
    /// Stop gracefully on ctrl-c / SIGTERM
    pub signal_cancellation: bool,
    /// Directory served as embedded resources
    pub resources_dir: Option<PathBuf>,
    pub preload_limit: AdmissionLimit,
    pub selector: SelectorConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            recursive: true,
            thread_count: None,
            combined_analysis: true,
            signal_cancellation: true,
            resources_dir: None,
            preload_limit: AdmissionLimit::default(),
            selector: SelectorConfig::default(),
        }
    }
}

/// One analysis target. A bare path string is accepted in its place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TargetRepr")]
pub struct TargetConfig {
    pub path: PathBuf,
    /// Overrides the run-wide `recursive`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive: Option<bool>,
    /// Path regexes; when any is given, one must match
    pub include: Vec<String>,
    /// Path regexes; a match drops the entry
    pub exclude: Vec<String>,
    /// Replaces the run selector for every entity of this target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorConfig>,
}

impl TargetConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recursive: None,
            include: Vec::new(),
            exclude: Vec::new(),
            selector: None,
        }
    }

    pub fn filter(&self) -> AppResult<TargetFilter> {
        TargetFilter::new(&self.include, &self.exclude)
    }
}

impl From<PathBuf> for TargetConfig {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetRepr {
    Path(PathBuf),
    Table {
        path: PathBuf,
        #[serde(default)]
        recursive: Option<bool>,
        #[serde(default)]
        include: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
        #[serde(default)]
        selector: Option<SelectorConfig>,
    },
}

impl From<TargetRepr> for TargetConfig {
    fn from(repr: TargetRepr) -> Self {
        match repr {
            TargetRepr::Path(path) => Self::new(path),
            TargetRepr::Table {
                path,
                recursive,
                include,
                exclude,
                selector,
            } => Self {
                path,
                recursive,
                include,
                exclude,
                selector,
            },
        }
    }
}

/// Report selection as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub mode: SelectionMode,
    /// Report uids included or excluded, depending on `mode`
    pub reports: Vec<String>,
    pub excluded_levels: Vec<ReportLevel>,
    pub excluded_categories: Vec<ReportCategory>,
    pub filters: Vec<FilterConfig>,
}

/// Argument filter for one report uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub report: String,
    #[serde(default)]
    pub action: FilterAction,
    #[serde(default)]
    pub aggregation: ArgAggregation,
    /// Argument name to regex
    pub args: BTreeMap<String, String>,
}

impl AnalysisConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> AppResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that do not depend on the registered rules
    pub fn validate(&self) -> AppResult<()> {
        if self.thread_count == Some(0) {
            return Err(AppError::validation("thread_count must be positive"));
        }

        let limit_is_zero = match self.preload_limit {
            AdmissionLimit::BufferedItems(items) => items == 0,
            AdmissionLimit::MaxConcurrentTasks(tasks) => tasks == 0,
            AdmissionLimit::MaxLoadedBytes(bytes) => bytes == 0,
        };
        if limit_is_zero {
            return Err(AppError::validation("preload_limit must be positive"));
        }

        for target in &self.targets {
            target.filter()?;
        }

        if let Some(dir) = &self.resources_dir {
            if !dir.is_dir() {
                return Err(AppError::validation(format!(
                    "resources_dir is not a directory: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            cpu_threads: self.thread_count,
            admission: self.preload_limit,
        }
    }

    pub fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            combined_analysis: self.combined_analysis,
        }
    }
}

impl SelectorConfig {
    /// Build the selector, rejecting report uids no registered rule declares
    pub fn build(&self, shared: &SharedContext) -> AppResult<RuleSelector> {
        let referenced = self
            .reports
            .iter()
            .chain(self.filters.iter().map(|filter| &filter.report));
        for uid in referenced {
            if !shared.knows_report(uid) {
                return Err(AppError::validation(format!("unknown report '{uid}'")));
            }
        }

        let mut selector = RuleSelector::new().with_mode(self.mode);
        for uid in &self.reports {
            selector = selector.select_report(uid.as_str());
        }
        for level in &self.excluded_levels {
            selector = selector.exclude_level(*level);
        }
        for category in &self.excluded_categories {
            selector = selector.exclude_category(*category);
        }
        for filter in &self.filters {
            let built = ReportFilter::new(
                filter.action,
                filter.aggregation,
                filter
                    .args
                    .iter()
                    .map(|(name, pattern)| (name.clone(), pattern.clone())),
            )?;
            selector = selector.with_filter(filter.report.as_str(), built);
        }
        Ok(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::build_shared_context;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: AnalysisConfig = toml::from_str("").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert!(config.recursive);
        assert!(config.combined_analysis);
    }

    #[test]
    fn test_full_file_parses() {
        let content = r#"
            targets = ["/usr/bin"]
            recursive = false
            thread_count = 4
            combined_analysis = false

            [preload_limit]
            buffered_items = 16

            [selector]
            mode = "include_selected"
            reports = ["truncated_header"]
            excluded_levels = ["info"]
            excluded_categories = ["optimization"]

            [[selector.filters]]
            report = "truncated_header"
            action = "exclude"
            args = { actual = "^0$" }
        "#;
        let config: AnalysisConfig = toml::from_str(content).unwrap();
        assert_eq!(config.targets, vec![TargetConfig::new("/usr/bin")]);
        assert!(!config.recursive);
        assert_eq!(config.pipeline_config().cpu_threads, Some(4));
        assert_eq!(config.preload_limit, AdmissionLimit::BufferedItems(16));
        assert_eq!(config.selector.mode, SelectionMode::IncludeSelected);
        assert_eq!(config.selector.filters[0].action, FilterAction::Exclude);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file_validates() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"thread_count = 0\n").unwrap();
        let err = AnalysisConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = AnalysisConfig {
            preload_limit: AdmissionLimit::MaxLoadedBytes(0),
            ..AnalysisConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"recursive = \"yes\"\n").unwrap();
        let err = AnalysisConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Toml(_)));
    }

    #[test]
    fn test_selector_rejects_unknown_report() {
        let shared = build_shared_context(&AnalysisConfig::default()).unwrap();
        let config = SelectorConfig {
            reports: vec!["no_such_report".to_string()],
            ..SelectorConfig::default()
        };
        let err = config.build(&shared).unwrap_err();
        assert!(err.to_string().contains("no_such_report"));

        let config = SelectorConfig {
            mode: SelectionMode::IncludeSelected,
            reports: vec!["truncated_header".to_string()],
            ..SelectorConfig::default()
        };
        let selector = config.build(&shared).unwrap();
        assert_eq!(selector.selected_reports(), vec!["truncated_header"]);
    }

    #[test]
    fn test_selector_rejects_bad_regex() {
        let shared = build_shared_context(&AnalysisConfig::default()).unwrap();
        let config = SelectorConfig {
            filters: vec![FilterConfig {
                report: "truncated_header".to_string(),
                action: FilterAction::Include,
                aggregation: ArgAggregation::Any,
                args: BTreeMap::from([("actual".to_string(), "(".to_string())]),
            }],
            ..SelectorConfig::default()
        };
        assert!(matches!(config.build(&shared), Err(AppError::Core(_))));
    }

    #[test]
    fn test_target_tables_parse() {
        let content = r#"
            [[targets]]
            path = "/usr/bin"
            include = ["\\.so$"]
            exclude = ["/debug/"]

            [targets.selector]
            mode = "include_selected"
            reports = ["truncated_header"]

            [[targets]]
            path = "/opt/tools"
            recursive = false
        "#;
        let config: AnalysisConfig = toml::from_str(content).unwrap();
        assert_eq!(config.targets.len(), 2);

        let libs = &config.targets[0];
        assert_eq!(libs.path, PathBuf::from("/usr/bin"));
        assert_eq!(libs.include, vec![r"\.so$".to_string()]);
        assert_eq!(libs.recursive, None);
        let selector = libs.selector.as_ref().unwrap();
        assert_eq!(selector.mode, SelectionMode::IncludeSelected);

        let tools = &config.targets[1];
        assert_eq!(tools.recursive, Some(false));
        assert!(tools.selector.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_target_regex_rejected() {
        let config = AnalysisConfig {
            targets: vec![TargetConfig {
                exclude: vec!["[".to_string()],
                ..TargetConfig::new("/usr/bin")
            }],
            ..AnalysisConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains('['));
    }
}
