//! Rules
//!
//! A rule inspects resolved values and emits reports through a
//! [`RuleReporter`]. Rules are registered per rule class into a [`RuleList`];
//! the orchestrator asks the list for the rules enabled under a
//! [`RuleSelector`].

use std::collections::HashSet;
use std::sync::Arc;

use crate::dependency::{Dependency, ResolvedValues};
use crate::error::{CoreError, CoreResult};
use crate::report::{arg, ReportArg, ReportSink, RuleReport};
use crate::rule_class::{RuleClassMask, MAX_RULE_CLASSES};
use crate::selector::RuleSelector;

/// Identity shared by per-entity and combined rules.
pub trait RuleMetadata: Send + Sync {
    fn name(&self) -> &'static str;

    fn rule_classes(&self) -> RuleClassMask;

    /// Every report this rule may emit.
    fn reports(&self) -> &[RuleReport];
}

/// A per-entity rule.
pub trait Rule: RuleMetadata {
    /// Values resolved before [`Rule::is_applicable`] is consulted.
    fn prerequisites(&self) -> &[Dependency] {
        &[]
    }

    fn is_applicable(&self, _prerequisites: &ResolvedValues) -> bool {
        true
    }

    fn dependencies(&self) -> &[Dependency];

    fn run(&self, reporter: &RuleReporter<'_>, inputs: &ResolvedValues) -> CoreResult<()>;
}

// ============================================================================
// RuleReporter
// ============================================================================

/// Report sink scoped to one (entity, rule) pair.
///
/// Suppresses reports the selector disables and tags every report with the
/// rule name.
pub struct RuleReporter<'a> {
    sink: &'a dyn ReportSink,
    selector: &'a RuleSelector,
    rule_name: &'static str,
}

impl<'a> RuleReporter<'a> {
    pub fn new(
        sink: &'a dyn ReportSink,
        selector: &'a RuleSelector,
        rule_name: &'static str,
    ) -> Self {
        Self {
            sink,
            selector,
            rule_name,
        }
    }

    /// Emit `report` unless the selector disables it for these arguments.
    pub fn log(&self, report: &RuleReport, args: &[ReportArg]) {
        if !self.selector.is_enabled_with_args(report, args) {
            return;
        }
        let mut tagged = Vec::with_capacity(args.len() + 1);
        tagged.extend_from_slice(args);
        tagged.push(arg("rule", self.rule_name));
        self.sink.log(report.level, report.uid, &tagged);
    }

    pub fn rule_name(&self) -> &'static str {
        self.rule_name
    }
}

// ============================================================================
// RuleList
// ============================================================================

/// Rules bucketed by rule class, in registration order.
pub struct RuleList<R: ?Sized + RuleMetadata> {
    rules: Vec<Arc<R>>,
    by_class: Vec<Vec<usize>>,
    report_uids: HashSet<&'static str>,
}

impl<R: ?Sized + RuleMetadata> Default for RuleList<R> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            by_class: vec![Vec::new(); MAX_RULE_CLASSES as usize],
            report_uids: HashSet::new(),
        }
    }
}

impl<R: ?Sized + RuleMetadata> RuleList<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule for each of its rule classes. Report uids must be
    /// unique across the list.
    pub fn register(&mut self, rule: Arc<R>) -> CoreResult<()> {
        let mut uids = HashSet::new();
        for report in rule.reports() {
            if self.report_uids.contains(report.uid) || !uids.insert(report.uid) {
                return Err(CoreError::DuplicateReport(report.uid.to_string()));
            }
        }
        self.report_uids.extend(uids);

        let index = self.rules.len();
        for class in rule.rule_classes() {
            self.by_class[class.index() as usize].push(index);
        }
        tracing::debug!(rule = rule.name(), "registered rule");
        self.rules.push(rule);
        Ok(())
    }

    /// Rules registered for any class in `mask` with at least one enabled
    /// report. Each rule appears once, in registration order.
    pub fn enabled_rules(&self, mask: RuleClassMask, selector: &RuleSelector) -> Vec<Arc<R>> {
        let mut indices: Vec<usize> = mask
            .iter()
            .flat_map(|class| self.by_class[class.index() as usize].iter().copied())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|index| &self.rules[index])
            .filter(|rule| selector.is_any_enabled(rule.reports()))
            .cloned()
            .collect()
    }

    /// Metadata of the report with `uid`, if a registered rule declares it.
    pub fn find_report(&self, uid: &str) -> Option<RuleReport> {
        self.rules
            .iter()
            .flat_map(|rule| rule.reports().iter())
            .find(|report| report.uid == uid)
            .copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<R>> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
