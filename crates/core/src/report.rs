//! Report Sinks
//!
//! Findings leave the engine through [`ReportSink::log`]. Formatting and
//! serialization are the sink's business; the engine only needs a common
//! sink plus a per-entity factory ([`ReportFactory`]).

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::SubjectEntity;
use crate::rule_class::RuleClassMask;

/// Severity of a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        })
    }
}

/// Topic of a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportCategory {
    System,
    Optimization,
    Security,
    Configuration,
    Format,
}

/// Report metadata declared by a rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuleReport {
    pub uid: &'static str,
    pub level: ReportLevel,
    pub category: ReportCategory,
}

impl RuleReport {
    pub const fn new(uid: &'static str, level: ReportLevel, category: ReportCategory) -> Self {
        Self {
            uid,
            level,
            category,
        }
    }
}

/// One named report argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArg {
    pub name: String,
    pub value: String,
}

/// Build a report argument.
pub fn arg(name: impl Into<String>, value: impl ToString) -> ReportArg {
    ReportArg {
        name: name.into(),
        value: value.to_string(),
    }
}

/// Message ids the engine itself emits.
pub mod messages {
    pub const INACCESSIBLE_ENTITY: &str = "inaccessible_entity";
    pub const ENTITY_LOAD_ERROR: &str = "entity_load_error";
    pub const RULE_ERROR: &str = "rule_error";
    pub const COMBINED_PREPARATION_ERROR: &str = "combined_preparation_error";
    pub const TARGET_ENUMERATION_ERROR: &str = "target_enumeration_error";
    pub const ANALYSIS_INTERRUPTED: &str = "analysis_interrupted";
}

/// Destination for findings.
pub trait ReportSink: Send + Sync {
    fn log(&self, level: ReportLevel, message_id: &str, args: &[ReportArg]);
}

/// Creates the common sink and one sink per entity.
pub trait ReportFactory: Send + Sync {
    fn common_report(&self) -> Arc<dyn ReportSink>;

    fn entity_report(
        &self,
        entity: &Arc<dyn SubjectEntity>,
        rule_classes: RuleClassMask,
    ) -> Arc<dyn ReportSink>;
}

// ============================================================================
// In-Memory Report
// ============================================================================

/// A recorded finding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Path of the entity, `None` for common findings
    pub entity: Option<PathBuf>,
    pub level: ReportLevel,
    pub message_id: String,
    pub args: Vec<ReportArg>,
    pub recorded_at: DateTime<Utc>,
}

impl Finding {
    /// Value of a named argument.
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }
}

/// Report factory that keeps every finding in memory.
#[derive(Clone, Default)]
pub struct InMemoryReport {
    findings: Arc<Mutex<Vec<Finding>>>,
}

impl InMemoryReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the findings recorded so far, in arrival order.
    pub fn findings(&self) -> Vec<Finding> {
        self.findings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Findings recorded for one message id.
    pub fn findings_for(&self, message_id: &str) -> Vec<Finding> {
        self.findings()
            .into_iter()
            .filter(|f| f.message_id == message_id)
            .collect()
    }

    fn sink(&self, entity: Option<PathBuf>) -> Arc<dyn ReportSink> {
        Arc::new(InMemorySink {
            entity,
            findings: Arc::clone(&self.findings),
        })
    }
}

impl ReportFactory for InMemoryReport {
    fn common_report(&self) -> Arc<dyn ReportSink> {
        self.sink(None)
    }

    fn entity_report(
        &self,
        entity: &Arc<dyn SubjectEntity>,
        _rule_classes: RuleClassMask,
    ) -> Arc<dyn ReportSink> {
        self.sink(Some(entity.path().to_path_buf()))
    }
}

struct InMemorySink {
    entity: Option<PathBuf>,
    findings: Arc<Mutex<Vec<Finding>>>,
}

impl ReportSink for InMemorySink {
    fn log(&self, level: ReportLevel, message_id: &str, args: &[ReportArg]) {
        tracing::debug!(
            entity = ?self.entity,
            %level,
            message_id,
            "finding recorded"
        );
        let finding = Finding {
            entity: self.entity.clone(),
            level,
            message_id: message_id.to_string(),
            args: args.to_vec(),
            recorded_at: Utc::now(),
        };
        self.findings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(finding);
    }
}
