//! Permission Rules

use binscope_core::{
    arg, required, CoreResult, Dependency, EntityRef, ReportCategory, ReportLevel, ResolvedValues,
    Rule, RuleClassMask, RuleMetadata, RuleReport, RuleReporter,
};

use crate::detectors::EXECUTABLE;

pub const WORLD_WRITABLE_BINARY: RuleReport = RuleReport::new(
    "world_writable_binary",
    ReportLevel::Warning,
    ReportCategory::Security,
);

/// Flags executables any user may overwrite.
pub struct WorldWritableRule;

const WORLD_WRITABLE_REPORTS: &[RuleReport] = &[WORLD_WRITABLE_BINARY];
const WORLD_WRITABLE_DEPS: &[Dependency] = &[required::<EntityRef>()];

pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}

impl RuleMetadata for WorldWritableRule {
    fn name(&self) -> &'static str {
        "world_writable_binary"
    }

    fn rule_classes(&self) -> RuleClassMask {
        EXECUTABLE.into()
    }

    fn reports(&self) -> &[RuleReport] {
        WORLD_WRITABLE_REPORTS
    }
}

impl Rule for WorldWritableRule {
    fn dependencies(&self) -> &[Dependency] {
        WORLD_WRITABLE_DEPS
    }

    fn run(&self, reporter: &RuleReporter<'_>, inputs: &ResolvedValues) -> CoreResult<()> {
        let entity = inputs.require::<EntityRef>()?;
        if let Some(mode) = entity.0.unix_mode().filter(|mode| is_world_writable(*mode)) {
            reporter.log(
                &WORLD_WRITABLE_BINARY,
                &[arg("mode", format!("{:o}", mode & 0o7777))],
            );
        }
        Ok(())
    }
}
