use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "tplscan")]
#[command(about = "Template-driven vulnerability and fingerprint scanner")]
#[command(long_about = r#"
tplscan evaluates YAML detection templates (HTTP, DNS, raw network and
headless-browser probes) against one target or a list of targets.

WARNING: Only scan systems you own or have explicit permission to test.

Usage Examples:
  tplscan check --url example.com                  # Check a single target
  tplscan scan --targets hosts.txt --threads 100   # Batch scan, results to goods.txt
  tplscan templates --templates ./templates        # List loaded templates
"#)]
#[command(version)]
#[command(author)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Template file or directory
    #[arg(short, long, global = true, value_name = "DIR")]
    pub templates: Option<PathBuf>,

    /// Configuration file path (TOML, YAML or JSON)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Concurrent targets
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Concurrent template evaluations per target
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Overall deadline per target in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Retries for transient network errors
    #[arg(long, global = true)]
    pub retries: Option<u32>,

    /// File positive results are appended to
    #[arg(short, long, global = true, value_name = "FILE")]
    pub results: Option<PathBuf>,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only matches and errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a single target against all templates
    Check {
        /// Target host or URL (https:// is assumed)
        #[arg(short, long, required = true)]
        url: String,
    },

    /// Scan a newline-delimited list of targets
    Scan {
        /// Target list file
        #[arg(long, required = true, value_name = "FILE")]
        targets: PathBuf,

        /// Also write a JSON report
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// List loaded templates
    Templates {
        /// Only show templates carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },
}

impl CommonArgs {
    /// Apply command line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.templates {
            config.templates_dir = dir.clone();
        }
        if let Some(threads) = self.threads {
            config.settings.threads = threads;
        }
        if let Some(workers) = self.workers {
            config.settings.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.settings.timeout = timeout;
        }
        if let Some(retries) = self.retries {
            config.settings.retries = retries;
        }
        if let Some(results) = &self.results {
            config.results_file = results.clone();
        }
    }

    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
