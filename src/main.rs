//! binscope command line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use binscope::{AnalysisConfig, OutputFormat, TargetConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "binscope=info,binscope_core=info,binscope_engine=info";
/// Conventional exit status after SIGINT
const EXIT_INTERRUPTED: u8 = 130;

/// Rule-based static analysis of executable files
#[derive(Parser, Debug)]
#[command(name = "binscope", version, about = "Rule-based static analysis of executable files")]
pub struct Cli {
    /// Path to configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// CPU worker threads (overrides thread_count)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Skip combined analysis across files
    #[arg(long)]
    pub no_combined: bool,

    /// Print findings as JSON
    #[arg(long)]
    pub json: bool,

    /// Files or directories to analyze, added to the configured targets
    pub paths: Vec<PathBuf>,
}

impl Cli {
    fn resolve_config(&self) -> Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::load_from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        config
            .targets
            .extend(self.paths.iter().cloned().map(TargetConfig::from));
        if let Some(threads) = self.threads {
            config.thread_count = Some(threads);
        }
        if self.no_combined {
            config.combined_analysis = false;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.resolve_config()?;
    if config.targets.is_empty() {
        bail!("no targets given; pass paths or set `targets` in the config file");
    }

    let outcome = binscope::run(&config).context("analysis failed")?;
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let rendered = binscope::render(&outcome, format)?;
    print!("{rendered}");
    if !rendered.ends_with('\n') {
        println!();
    }

    if outcome.interrupted() {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}
