//! Rule Selector
//!
//! User-level choice of which reports are emitted: an include or exclude list
//! of report uids, excluded levels and categories, and optional per-report
//! argument filters. A rule runs when at least one of its reports is enabled.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::report::{ReportArg, ReportCategory, ReportLevel, RuleReport};

/// How the selected report uids are interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Only the selected reports are enabled
    IncludeSelected,
    /// Every report except the selected ones is enabled
    #[default]
    ExcludeSelected,
}

/// How several argument patterns combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgAggregation {
    #[default]
    Any,
    All,
}

/// What a matching argument filter does to the report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    /// Emit only reports whose arguments match
    #[default]
    Include,
    /// Suppress reports whose arguments match
    Exclude,
}

/// Argument-level filter for one report uid.
#[derive(Clone, Debug)]
pub struct ReportFilter {
    action: FilterAction,
    aggregation: ArgAggregation,
    patterns: Vec<(String, Regex)>,
}

impl ReportFilter {
    /// Build a filter from `(argument name, regex)` pairs.
    pub fn new(
        action: FilterAction,
        aggregation: ArgAggregation,
        patterns: impl IntoIterator<Item = (String, String)>,
    ) -> CoreResult<Self> {
        let patterns = patterns
            .into_iter()
            .map(|(name, pattern)| {
                Regex::new(&pattern)
                    .map(|regex| (name, regex))
                    .map_err(|e| CoreError::InvalidSelector(format!("'{pattern}': {e}")))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            action,
            aggregation,
            patterns,
        })
    }

    fn pattern_matches(name: &str, regex: &Regex, args: &[ReportArg]) -> bool {
        args.iter()
            .any(|arg| arg.name == name && regex.is_match(&arg.value))
    }

    /// Whether a report with these arguments passes the filter.
    pub fn allows(&self, args: &[ReportArg]) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let mut results = self
            .patterns
            .iter()
            .map(|(name, regex)| Self::pattern_matches(name, regex, args));
        let matched = match self.aggregation {
            ArgAggregation::Any => results.any(|m| m),
            ArgAggregation::All => results.all(|m| m),
        };
        match self.action {
            FilterAction::Include => matched,
            FilterAction::Exclude => !matched,
        }
    }
}

/// Selection of enabled reports.
#[derive(Clone, Debug, Default)]
pub struct RuleSelector {
    mode: SelectionMode,
    reports: HashSet<String>,
    excluded_levels: HashSet<ReportLevel>,
    excluded_categories: HashSet<ReportCategory>,
    filters: HashMap<String, ReportFilter>,
}

impl RuleSelector {
    /// Selector that enables everything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: SelectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn select_report(mut self, uid: impl Into<String>) -> Self {
        self.reports.insert(uid.into());
        self
    }

    pub fn exclude_level(mut self, level: ReportLevel) -> Self {
        self.excluded_levels.insert(level);
        self
    }

    pub fn exclude_category(mut self, category: ReportCategory) -> Self {
        self.excluded_categories.insert(category);
        self
    }

    pub fn with_filter(mut self, uid: impl Into<String>, filter: ReportFilter) -> Self {
        self.filters.insert(uid.into(), filter);
        self
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Selected report uids, sorted.
    pub fn selected_reports(&self) -> Vec<&str> {
        let mut uids: Vec<&str> = self.reports.iter().map(String::as_str).collect();
        uids.sort_unstable();
        uids
    }

    /// Whether `report` may be emitted at all.
    pub fn is_enabled(&self, report: &RuleReport) -> bool {
        if self.excluded_levels.contains(&report.level)
            || self.excluded_categories.contains(&report.category)
        {
            return false;
        }
        let selected = self.reports.contains(report.uid);
        match self.mode {
            SelectionMode::IncludeSelected => selected,
            SelectionMode::ExcludeSelected => !selected,
        }
    }

    /// Whether any of `reports` is enabled.
    pub fn is_any_enabled(&self, reports: &[RuleReport]) -> bool {
        reports.iter().any(|report| self.is_enabled(report))
    }

    /// Whether `report` may be emitted with these concrete arguments.
    pub fn is_enabled_with_args(&self, report: &RuleReport, args: &[ReportArg]) -> bool {
        self.is_enabled(report)
            && self
                .filters
                .get(report.uid)
                .map_or(true, |filter| filter.allows(args))
    }
}
