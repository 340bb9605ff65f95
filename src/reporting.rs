use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::scanner::{CompletionStatus, ScanSummary};
use crate::Result;

/// Append-only log of positive results, one `target -> templateID` per line.
pub struct ResultLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ResultLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Appending results to {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, target: &str, template_id: &str) -> Result<()> {
        let mut file = self.file.lock();
        writeln!(file, "{} -> {}", target, template_id)?;
        file.flush()?;
        Ok(())
    }
}

/// Aggregate counters for a batch scan, safe to update from any worker.
#[derive(Debug, Default)]
pub struct ScanStats {
    loaded: AtomicUsize,
    processed: AtomicUsize,
    successes: AtomicUsize,
    errors: AtomicUsize,
    misses: AtomicUsize,
    matches: AtomicUsize,
    busy_ms: AtomicU64,
    started: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub loaded: usize,
    pub processed: usize,
    pub successes: usize,
    pub errors: usize,
    pub misses: usize,
    pub matches: usize,
    pub elapsed_ms: u64,
    pub avg_ms_per_target: f64,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the counters and start the clock for a new scan.
    pub fn start(&self, loaded: usize) {
        self.loaded.store(loaded, Ordering::SeqCst);
        self.processed.store(0, Ordering::SeqCst);
        self.successes.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        self.misses.store(0, Ordering::SeqCst);
        self.matches.store(0, Ordering::SeqCst);
        self.busy_ms.store(0, Ordering::SeqCst);
        *self.started.lock() = Some(Instant::now());
    }

    pub fn record_success(&self, matches: usize, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.matches.fetch_add(matches, Ordering::SeqCst);
        self.record_processed(elapsed);
    }

    pub fn record_miss(&self, elapsed: Duration) {
        self.misses.fetch_add(1, Ordering::SeqCst);
        self.record_processed(elapsed);
    }

    pub fn record_error(&self, elapsed: Duration) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.record_processed(elapsed);
    }

    fn record_processed(&self, elapsed: Duration) {
        self.busy_ms.fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.processed.load(Ordering::SeqCst);
        let busy_ms = self.busy_ms.load(Ordering::SeqCst);
        let started = *self.started.lock();
        let elapsed_ms = started
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or_default();

        StatsSnapshot {
            loaded: self.loaded.load(Ordering::SeqCst),
            processed,
            successes: self.successes.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            matches: self.matches.load(Ordering::SeqCst),
            elapsed_ms,
            avg_ms_per_target: if processed == 0 {
                0.0
            } else {
                busy_ms as f64 / processed as f64
            },
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: DateTime<Utc>,
    status: CompletionStatus,
    stats: &'a StatsSnapshot,
    results: Vec<TargetEntry<'a>>,
}

#[derive(Serialize)]
struct TargetEntry<'a> {
    target: &'a str,
    status: CompletionStatus,
    matched: &'a [String],
    elapsed_ms: u64,
}

/// Write a JSON summary of a finished scan. Targets without matches are left out.
pub fn write_json_report(summary: &ScanSummary, path: &Path) -> Result<()> {
    debug!("Generating JSON report: {}", path.display());

    let report = JsonReport {
        generated_at: Utc::now(),
        status: summary.status,
        stats: &summary.stats,
        results: summary
            .reports
            .iter()
            .filter(|r| !r.matched.is_empty())
            .map(|r| TargetEntry {
                target: &r.target,
                status: r.status,
                matched: &r.matched,
                elapsed_ms: r.elapsed.as_millis() as u64,
            })
            .collect(),
    };

    std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
    info!("Report written to {}", path.display());
    Ok(())
}
