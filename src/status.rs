//! Index overview for `shelf status`.
//!
//! Counts per stage, the three classification views as category
//! histograms, failed documents, and the last recorded run.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

use crate::config::Config;
use crate::index;
use crate::models::{Axis, DocumentRecord, Stage};
use crate::report::human_size;
use crate::store::IndexStore;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub db_path: PathBuf,
    pub documents: usize,
    pub total_bytes: u64,
    pub by_stage: BTreeMap<&'static str, usize>,
    /// axis → category → canonical documents with that label.
    pub views: BTreeMap<&'static str, BTreeMap<String, usize>>,
    pub failed: Vec<FailedDocument>,
    pub last_run: Option<LastRun>,
}

#[derive(Debug, Serialize)]
pub struct FailedDocument {
    pub path: PathBuf,
    pub stage: Stage,
    pub attempts: u32,
    pub exhausted: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LastRun {
    pub id: String,
    pub command: String,
    pub finished_at: i64,
}

pub async fn build(store: &dyn IndexStore, config: &Config) -> Result<StatusReport> {
    let records = index::load(store).await?;
    let last_run = store.last_run().await?.map(|run| LastRun {
        id: run.id,
        command: run.command,
        finished_at: run.finished_at,
    });
    Ok(summarize(&records, config, last_run))
}

fn summarize(records: &[DocumentRecord], config: &Config, last_run: Option<LastRun>) -> StatusReport {
    let mut by_stage: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut views: BTreeMap<&'static str, BTreeMap<String, usize>> = BTreeMap::new();
    let mut failed = Vec::new();

    for record in records {
        *by_stage.entry(record.stage.as_str()).or_default() += 1;

        if record.is_canonical() {
            for (axis, label) in &record.labels {
                *views
                    .entry(axis.as_str())
                    .or_default()
                    .entry(label.name().to_string())
                    .or_default() += 1;
            }
        }

        if record.stage.is_failed() {
            let cap = match record.stage {
                Stage::ConversionFailed => config.converter.max_attempts,
                _ => config.model.max_attempts,
            };
            failed.push(FailedDocument {
                path: record.path.clone(),
                stage: record.stage,
                attempts: record.attempts,
                exhausted: record.attempts >= cap,
                last_error: record.last_error.clone(),
            });
        }
    }

    StatusReport {
        db_path: config.db.path.clone(),
        documents: records.len(),
        total_bytes: records.iter().map(|r| r.size_bytes).sum(),
        by_stage,
        views,
        failed,
        last_run,
    }
}

impl StatusReport {
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Document Index");
        let _ = writeln!(out, "==============");
        let _ = writeln!(out);
        let _ = writeln!(out, "  Index:      {}", self.db_path.display());
        let _ = writeln!(
            out,
            "  Documents:  {} ({})",
            self.documents,
            human_size(self.total_bytes)
        );

        let _ = writeln!(out);
        let _ = writeln!(out, "  By stage:");
        for stage in Stage::ALL {
            if let Some(n) = self.by_stage.get(stage.as_str()) {
                let _ = writeln!(out, "    {:<22} {:>6}", stage.as_str(), n);
            }
        }

        for axis in Axis::ALL {
            if let Some(categories) = self.views.get(axis.as_str()) {
                let _ = writeln!(out);
                let _ = writeln!(out, "  View: {}", axis);
                for (category, n) in categories {
                    let _ = writeln!(out, "    {:<22} {:>6}", category, n);
                }
            }
        }

        if !self.failed.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "  Failed:");
            for f in &self.failed {
                let _ = writeln!(
                    out,
                    "    [{}{}] {}: {}",
                    f.stage,
                    if f.exhausted { ", exhausted" } else { "" },
                    f.path.display(),
                    f.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        if let Some(run) = &self.last_run {
            let when = chrono::DateTime::from_timestamp(run.finished_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| run.finished_at.to_string());
            let _ = writeln!(out);
            let _ = writeln!(out, "  Last run:   {} at {}", run.command, when);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Format, Label};

    fn rec(path: &str, stage: Stage) -> DocumentRecord {
        let mut r = DocumentRecord::new(path.into(), path.into(), 2048, Format::Pdf);
        r.stage = stage;
        r
    }

    #[test]
    fn counts_stages_views_and_failures() {
        let mut classified = rec("/a.pdf", Stage::Classified);
        classified.labels.insert(Axis::Topic, Label::Category("finance".into()));
        classified.labels.insert(Axis::Usage, Label::Uncategorized);
        classified.labels.insert(Axis::Client, Label::Uncategorized);
        let mut failed = rec("/b.pdf", Stage::ConversionFailed);
        failed.attempts = 3;
        failed.last_error = Some("corrupt file: x".into());

        let config = Config::minimal();
        let status = summarize(&[classified, failed, rec("/c.pdf", Stage::Indexed)], &config, None);

        assert_eq!(status.documents, 3);
        assert_eq!(status.by_stage["classified"], 1);
        assert_eq!(status.views["topic"]["finance"], 1);
        assert_eq!(status.views["client"]["uncategorized"], 1);
        assert_eq!(status.failed.len(), 1);
        assert!(status.failed[0].exhausted);

        let text = status.render_human();
        assert!(text.contains("View: topic"));
        assert!(text.contains("[conversion_failed, exhausted] /b.pdf: corrupt file: x"));
    }
}
