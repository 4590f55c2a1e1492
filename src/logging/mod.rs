//! Logging setup and human-facing output
//!
//! Library code emits `tracing` events; [`init`] installs the subscriber the
//! binary uses. The [`Logger`] prints sections and sync reports to the console.

use crate::sync::{SyncReport, SyncStatus};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Level used when `RUST_LOG` is not set
pub fn default_filter(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "warn"
    } else if verbose {
        "syncerd=debug,info"
    } else {
        "info"
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` takes precedence over the flags.
pub fn init(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose, quiet)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .try_init();
}

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
}

impl Logger {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        Self { verbose, quiet }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if !self.quiet {
            println!("\n=== {} ===", title);
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("ℹ️  {}", message);
        }
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("✅ {}", message);
        }
    }

    pub fn warning(&self, message: &str) {
        if !self.quiet {
            println!("⚠️  WARNING: {}", message);
        }
    }

    /// Errors are printed even in quiet mode
    pub fn error(&self, message: &str) {
        eprintln!("❌ ERROR: {}", message);
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("   {}", message);
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }

    /// One line per outcome followed by the totals
    pub fn report(&self, report: &SyncReport) {
        if !self.quiet {
            self.section("Sync Report");
            for line in self.report_lines(report) {
                println!("{}", line);
            }
        } else {
            for outcome in report.failures() {
                let tag = outcome.tag.as_deref().unwrap_or("*");
                let error = outcome
                    .error
                    .as_ref()
                    .map(|e| format!("[{}] {}", e.kind(), e))
                    .unwrap_or_default();
                eprintln!("❌ {} [{}]: {}", outcome.mapping, tag, error);
            }
        }
    }

    pub fn report_lines(&self, report: &SyncReport) -> Vec<String> {
        let mut lines = Vec::with_capacity(report.outcomes.len() + 1);
        for outcome in &report.outcomes {
            if outcome.status == SyncStatus::SkippedExists && !self.verbose {
                continue;
            }
            let icon = match outcome.status {
                SyncStatus::Synced => "✅",
                SyncStatus::SkippedExists => "⏭️ ",
                SyncStatus::Failed => "❌",
            };
            let tag = outcome.tag.as_deref().unwrap_or("*");
            let mut line = format!(
                "  {} {}:{} -> {}/{}:{} {}",
                icon,
                outcome.mapping.source_image,
                tag,
                outcome.mapping.destination_registry,
                outcome.mapping.destination_image,
                tag,
                outcome.status
            );
            if let Some(error) = &outcome.error {
                line.push_str(&format!(" [{}] ({})", error.kind(), error));
            }
            lines.push(line);
        }
        lines.push(format!(
            "📋 {} in {}",
            report,
            self.format_duration(report.duration())
        ));
        lines
    }
}
