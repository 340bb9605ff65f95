use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::reporting::StatsSnapshot;
use crate::scanner::{CheckReport, CompletionStatus};
use crate::template::{Severity, Template};

/// Colored terminal output for check and scan results
pub struct DisplayManager {
    use_colors: bool,
    quiet_mode: bool,
}

impl DisplayManager {
    pub fn new() -> Self {
        Self::with_quiet(false)
    }

    pub fn with_quiet(quiet: bool) -> Self {
        let use_colors = std::env::var("NO_COLOR").is_err()
            && std::env::var("TERM").map_or(true, |term| term != "dumb");

        Self {
            use_colors,
            quiet_mode: quiet,
        }
    }

    /// A single positive result. Printed even in quiet mode.
    pub fn print_match(&self, target: &str, template: &Template) {
        let severity = template.info.severity;
        if self.use_colors {
            println!(
                "  {} {} {} {}",
                format!("[{}]", severity).color(severity_color(severity)).bold(),
                template.id.bright_white().bold(),
                "→".bright_black(),
                target.cyan()
            );
        } else {
            println!("  [{}] {} -> {}", severity, template.id, target);
        }
    }

    /// Matches and timing for one `check` run
    pub fn print_check_report(&self, report: &CheckReport, templates: &[std::sync::Arc<Template>]) {
        for id in &report.matched {
            match templates.iter().find(|t| &t.id == id) {
                Some(template) => self.print_match(&report.target, template),
                None => println!("  {} -> {}", id, report.target),
            }
        }

        if self.quiet_mode {
            return;
        }

        println!();
        let summary = format!(
            "{} of {} templates matched in {:.2}s",
            report.matched.len(),
            report.evaluated,
            report.elapsed.as_secs_f64()
        );
        match report.status {
            CompletionStatus::Completed if report.is_match() => self.print_success(&summary),
            CompletionStatus::Completed => self.print_info(&summary),
            CompletionStatus::Canceled => self.print_warning(&format!("Canceled: {}", summary)),
            CompletionStatus::DeadlineExceeded => self.print_warning(&format!("Deadline exceeded: {}", summary)),
        }
    }

    pub fn print_scan_summary(&self, stats: &StatsSnapshot, status: CompletionStatus) {
        if self.quiet_mode {
            return;
        }

        println!();
        self.print_section_header("SCAN RESULTS SUMMARY");
        let rows = [
            ("Targets loaded", stats.loaded.to_string()),
            ("Processed", stats.processed.to_string()),
            ("Successes", stats.successes.to_string()),
            ("Misses", stats.misses.to_string()),
            ("Errors", stats.errors.to_string()),
            ("Matches", stats.matches.to_string()),
            ("Elapsed", format!("{:.1}s", stats.elapsed_ms as f64 / 1000.0)),
            ("Avg per target", format!("{:.0}ms", stats.avg_ms_per_target)),
        ];

        for (label, value) in rows {
            if self.use_colors {
                println!("  {:<16} {}", label.bright_white().bold(), value.cyan().bold());
            } else {
                println!("  {:<16} {}", label, value);
            }
        }

        if status == CompletionStatus::Canceled {
            self.print_warning("Scan canceled before all targets were processed");
        }
        println!();
    }

    /// Loaded templates as an aligned table
    pub fn print_template_table(&self, templates: &[std::sync::Arc<Template>]) {
        println!("  {:<40} {:<10} {:<8} {}", "ID", "SEVERITY", "REQS", "NAME / TAGS");
        for template in templates {
            let tags = template.tags().join(",");
            let severity = template.info.severity.to_string();
            let severity = if self.use_colors {
                format!("{:<10}", severity).color(severity_color(template.info.severity)).to_string()
            } else {
                format!("{:<10}", severity)
            };
            println!(
                "  {:<40} {} {:<8} {}{}",
                template.id.truncate_with_ellipsis(40),
                severity,
                template.requests.len(),
                template.info.name,
                if tags.is_empty() { String::new() } else { format!(" [{}]", tags) }
            );
        }
        println!("\n  {} templates", templates.len());
    }

    pub fn print_section_header(&self, title: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("{}", title.bright_cyan().bold());
            println!("{}", "─".repeat(title.chars().count()).bright_cyan());
        } else {
            println!("{}", title);
            println!("{}", "=".repeat(title.len()));
        }
    }

    pub fn print_success(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "✓".bright_green().bold(), message.green());
        } else {
            println!("[✓] {}", message);
        }
    }

    pub fn print_warning(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "!".bright_yellow().bold(), message.yellow());
        } else {
            println!("[!] {}", message);
        }
    }

    pub fn print_error(&self, message: &str) {
        if self.use_colors {
            eprintln!("  {} {}", "✗".bright_red().bold(), message.red().bold());
        } else {
            eprintln!("[✗] {}", message);
        }
    }

    pub fn print_info(&self, message: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("  {} {}", "i".bright_blue().bold(), message.blue());
        } else {
            println!("[i] {}", message);
        }
    }

    pub fn print_banner(&self, title: &str, subtitle: Option<&str>) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!();
            println!("  {}", "┌─".bright_cyan().to_string() + &"─".repeat(title.len() + 2) + "─┐");
            println!("  {} {} {}", "│".bright_cyan(), title.bright_white().bold(), "│".bright_cyan());
            if let Some(sub) = subtitle {
                println!(
                    "  {} {} {}",
                    "│".bright_cyan(),
                    format!("{:^width$}", sub, width = title.len()).bright_black(),
                    "│".bright_cyan()
                );
            }
            println!("  {}", "└─".bright_cyan().to_string() + &"─".repeat(title.len() + 2) + "─┘");
            println!();
        } else {
            let border = "=".repeat(title.len() + 4);
            println!("\n{}", border);
            println!("  {}  ", title);
            if let Some(sub) = subtitle {
                println!("  {}  ", sub);
            }
            println!("{}\n", border);
        }
    }

    /// Progress bar for batch scans; hidden in quiet mode
    pub fn create_progress_bar(&self, total: u64, message: &str) -> ProgressBar {
        if self.quiet_mode {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("  {spinner:.cyan} [{bar:25.green/bright_black}] {pos:>3}/{len:3} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏ ");
        pb.set_style(style);
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }
}

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new()
    }
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Critical => Color::BrightRed,
        Severity::High => Color::Red,
        Severity::Medium => Color::Yellow,
        Severity::Low => Color::Green,
        Severity::Info => Color::Blue,
        Severity::Unknown => Color::BrightBlack,
    }
}

trait StringExt {
    fn truncate_with_ellipsis(&self, max_len: usize) -> String;
}

impl StringExt for str {
    fn truncate_with_ellipsis(&self, max_len: usize) -> String {
        if self.chars().count() <= max_len {
            self.to_string()
        } else {
            let kept: String = self.chars().take(max_len.saturating_sub(3)).collect();
            format!("{}...", kept)
        }
    }
}
