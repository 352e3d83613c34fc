//! Run reports and their rendering.
//!
//! Every command that touches the index produces a [`RunReport`]. It is
//! printed on stdout (human text, or JSON with `--json`) and stored in the
//! `runs` table for `shelf status`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

use crate::discover::Discovery;
use crate::index::ScanSummary;
use crate::models::Format;
use crate::stages::{Failure, StageOutcome};

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub command: String,
    pub scanned: usize,
    pub duplicates: usize,
    pub converted: usize,
    pub summarized: usize,
    pub classified: usize,
    /// Number of entries in `failures`.
    pub failed: usize,
    pub failures: Vec<Failure>,
    /// Failed records not retried because their attempts are used up,
    /// listed with their last error.
    pub exhausted: Vec<Failure>,
    /// Model host unavailable: the reason, once per run.
    pub degraded: Option<String>,
    pub interrupted: bool,
    /// Stages that found no input.
    pub nothing_to_do: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanSummary>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl RunReport {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            started_at: chrono::Utc::now().timestamp(),
            ..Self::default()
        }
    }

    pub fn absorb_scan(&mut self, summary: ScanSummary) {
        self.scanned = summary.scanned;
        self.duplicates = summary.duplicates;
        for (path, reason) in &summary.errors {
            self.push_failure(Failure {
                path: path.clone(),
                stage: "scan",
                reason: reason.clone(),
            });
        }
        self.scan = Some(summary);
    }

    /// Folds one stage's outcome in. `stage` is the stage's name.
    pub fn absorb_stage(&mut self, stage: &'static str, outcome: StageOutcome) {
        match stage {
            crate::stages::conversion::STAGE => self.converted += outcome.succeeded,
            crate::stages::summarize::STAGE => self.summarized += outcome.succeeded,
            crate::stages::classify::STAGE => self.classified += outcome.succeeded,
            _ => {}
        }
        for failure in outcome.failures {
            self.push_failure(failure);
        }
        self.exhausted.extend(outcome.exhausted);
        if outcome.nothing_to_do {
            self.nothing_to_do.push(stage);
        }
        if self.degraded.is_none() {
            self.degraded = outcome.degraded;
        }
        self.interrupted |= outcome.interrupted;
    }

    fn push_failure(&mut self, failure: Failure) {
        self.failures.push(failure);
        self.failed = self.failures.len();
    }

    pub fn finish(&mut self) {
        self.finished_at = chrono::Utc::now().timestamp();
    }

    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "shelf {}", self.command);
        if let Some(scan) = &self.scan {
            let _ = writeln!(
                out,
                "  scanned     {:>6}   ({} new, {} changed, {} unchanged)",
                scan.scanned, scan.new, scan.changed, scan.unchanged
            );
            let _ = writeln!(out, "  duplicates  {:>6}", self.duplicates);
            if scan.unsupported + scan.oversized > 0 {
                let _ = writeln!(
                    out,
                    "  skipped     {:>6}   ({} unsupported, {} over size limit)",
                    scan.unsupported + scan.oversized,
                    scan.unsupported,
                    scan.oversized
                );
            }
            if !scan.vanished.is_empty() {
                let _ = writeln!(
                    out,
                    "  vanished    {:>6}   ({} pruned)",
                    scan.vanished.len(),
                    scan.pruned
                );
            }
        }
        let _ = writeln!(out, "  converted   {:>6}", self.converted);
        let _ = writeln!(out, "  summarized  {:>6}", self.summarized);
        let _ = writeln!(out, "  classified  {:>6}", self.classified);
        let _ = writeln!(out, "  failed      {:>6}", self.failed);
        if !self.exhausted.is_empty() {
            let _ = writeln!(
                out,
                "  exhausted   {:>6}   (run `shelf retry` to try again)",
                self.exhausted.len()
            );
        }

        for stage in &self.nothing_to_do {
            let _ = writeln!(out, "\n{}: nothing to do", stage);
        }
        if let Some(reason) = &self.degraded {
            let _ = writeln!(
                out,
                "\nDEGRADED: {}\n  conversions are kept; summaries and classification resume when the model is reachable",
                reason
            );
        }
        if self.interrupted {
            let _ = writeln!(out, "\nINTERRUPTED: progress saved, re-run to continue");
        }

        if !self.failures.is_empty() {
            let _ = writeln!(out, "\nFailures:");
            for f in &self.failures {
                let _ = writeln!(out, "  [{}] {}: {}", f.stage, f.path.display(), f.reason);
            }
        }
        if !self.exhausted.is_empty() {
            let _ = writeln!(out, "\nNot retried (attempts used up):");
            for f in &self.exhausted {
                let _ = writeln!(out, "  [{}] {}: {}", f.stage, f.path.display(), f.reason);
            }
        }
        out
    }
}

/// Dry-run listing of what a scan would pick up.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Preview {
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_size_human: String,
    pub by_format: BTreeMap<String, FormatGroup>,
    pub unsupported: usize,
    pub oversized: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct FormatGroup {
    pub count: usize,
    pub bytes: u64,
    pub files: Vec<PathBuf>,
}

impl Preview {
    pub fn from_discovery(discovery: &Discovery) -> Self {
        let mut preview = Preview {
            unsupported: discovery.unsupported,
            oversized: discovery.oversized,
            ..Preview::default()
        };
        for file in &discovery.files {
            let group = preview
                .by_format
                .entry(file.format.as_str().to_string())
                .or_default();
            group.count += 1;
            group.bytes += file.size_bytes;
            group.files.push(file.path.clone());
            preview.total_files += 1;
            preview.total_bytes += file.size_bytes;
        }
        preview.total_size_human = human_size(preview.total_bytes);
        preview
    }

    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Found {} document(s), {} total",
            self.total_files, self.total_size_human
        );
        for format in Format::ALL {
            if let Some(group) = self.by_format.get(format.as_str()) {
                let _ = writeln!(
                    out,
                    "  {:<9} {:>5} file(s)  {:>10}",
                    format.as_str(),
                    group.count,
                    human_size(group.bytes)
                );
                for path in &group.files {
                    let _ = writeln!(out, "      {}", path.display());
                }
            }
        }
        if self.unsupported + self.oversized > 0 {
            let _ = writeln!(
                out,
                "Skipped: {} unsupported, {} over size limit",
                self.unsupported, self.oversized
            );
        }
        let _ = writeln!(out, "Dry run: nothing was written.");
        out
    }
}

/// Format a byte count as a human-readable string.
pub fn human_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
