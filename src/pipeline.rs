//! Pipeline orchestrator.
//!
//! Sequences `scan → convert → summarize → classify`, folds every stage's
//! outcome into one [`RunReport`], and records the report in the index.
//! Each stage is also callable on its own; a stage whose input state no
//! record has reached reports "nothing to do".
//!
//! A degraded summarization (model unavailable) ends the model-backed part
//! of the run: classification is not attempted. A stop request ends the run
//! after the documents in flight are persisted.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::Config;
use crate::convert::{create_converter, Converter};
use crate::discover::{absolute, discover};
use crate::index::{self, ScanOptions};
use crate::llm::{create_model, LanguageModel, ModelGate};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::report::{Preview, RunReport};
use crate::stages::classify::{self, label_spaces, ClassifyStage};
use crate::stages::conversion::{self, ConversionStage};
use crate::stages::summarize::{self, SummarizeStage};
use crate::stages::StageContext;
use crate::store::{IndexStore, RunEntry, SqliteIndexStore};
use crate::views::{RebuildSummary, ViewTree};
use crate::{db, migrate};

/// The workspace and view trees are never scanned as sources.
fn excluded_roots(config: &Config) -> Vec<PathBuf> {
    vec![absolute(&config.workspace.root), absolute(&config.workspace.views)]
}

/// Dry run: what a scan of `paths` would pick up. Touches neither the index
/// nor the workspace.
pub fn preview(config: &Config, paths: &[PathBuf]) -> Result<Preview> {
    let discovery = discover(paths, &config.scan, &excluded_roots(config))?;
    Ok(Preview::from_discovery(&discovery))
}

/// Which stages `run` executes after the scan.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub prune: bool,
    pub summarize: bool,
    pub classify: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            prune: false,
            summarize: true,
            classify: true,
        }
    }
}

pub struct Pipeline {
    config: Config,
    ctx: StageContext,
    conversion: ConversionStage,
    summarize: SummarizeStage,
    classify: ClassifyStage,
    views: Arc<ViewTree>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn IndexStore>,
        converter: Arc<dyn Converter>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let gate = Arc::new(ModelGate::new(model, &config.model));
        let views = Arc::new(ViewTree::new(&config.workspace.views));
        let ctx = StageContext {
            store,
            workers: config.pipeline.workers,
            stop: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(NoProgress),
        };

        Self {
            conversion: ConversionStage {
                converter,
                out_dir: absolute(&config.workspace.converted_dir()),
                max_attempts: config.converter.max_attempts,
            },
            summarize: SummarizeStage {
                gate: gate.clone(),
                out_dir: absolute(&config.workspace.briefs_dir()),
                max_input_chars: config.model.max_input_chars,
                max_attempts: config.model.max_attempts,
            },
            classify: ClassifyStage {
                gate,
                spaces: label_spaces(&config.taxonomy),
                views: views.clone(),
            },
            views,
            ctx,
            config,
        }
    }

    /// Opens the SQLite index (creating the schema if needed) and builds the
    /// configured collaborators.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool));
        let converter = create_converter(&config.converter)?;
        let model = create_model(&config.model)?;
        if !config.model.is_enabled() {
            tracing::info!("model provider disabled; summarization will report degraded");
        }
        Ok(Self::new(config.clone(), store, converter, model))
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.ctx.progress = progress;
        self
    }

    /// Shares a stop flag (set from the Ctrl-C handler).
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.ctx.stop = stop;
        self
    }

    pub fn store(&self) -> &dyn IndexStore {
        self.ctx.store.as_ref()
    }

    pub fn views(&self) -> &Arc<ViewTree> {
        &self.views
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn discover(&self, paths: &[PathBuf]) -> Result<crate::discover::Discovery> {
        self.ctx.progress.report(ProgressEvent::Scanning);
        discover(paths, &self.config.scan, &excluded_roots(&self.config))
    }

    pub async fn scan(&self, paths: &[PathBuf], prune: bool, report: &mut RunReport) -> Result<()> {
        let discovery = self.discover(paths)?;
        let options = ScanOptions {
            workers: self.config.pipeline.workers,
            prune,
        };
        let summary = index::scan(self.store(), discovery, &options, Some(&self.views))
            .await
            .context("Scan failed")?;
        report.absorb_scan(summary);
        Ok(())
    }

    pub async fn convert(&self, report: &mut RunReport) -> Result<()> {
        let outcome = self.conversion.run(&self.ctx).await?;
        report.absorb_stage(conversion::STAGE, outcome);
        Ok(())
    }

    pub async fn summarize(&self, report: &mut RunReport) -> Result<()> {
        let outcome = self.summarize.run(&self.ctx).await?;
        report.absorb_stage(summarize::STAGE, outcome);
        Ok(())
    }

    pub async fn classify(&self, report: &mut RunReport) -> Result<()> {
        let outcome = self.classify.run(&self.ctx).await?;
        report.absorb_stage(classify::STAGE, outcome);
        Ok(())
    }

    /// Full pipeline over `paths`.
    pub async fn run(&self, paths: &[PathBuf], options: RunOptions) -> Result<RunReport> {
        let mut report = RunReport::new("run");

        self.scan(paths, options.prune, &mut report).await?;
        if self.ctx.stop_requested() {
            report.interrupted = true;
            return self.finish(report).await;
        }

        self.convert(&mut report).await?;
        if options.summarize && self.may_continue(&report) {
            self.summarize(&mut report).await?;
        }
        if options.classify && self.may_continue(&report) {
            self.classify(&mut report).await?;
        }

        self.finish(report).await
    }

    fn may_continue(&self, report: &RunReport) -> bool {
        !report.interrupted && report.degraded.is_none() && !self.ctx.stop_requested()
    }

    /// Stamps the report and records it in the `runs` table.
    pub async fn finish(&self, mut report: RunReport) -> Result<RunReport> {
        report.finish();
        let entry = RunEntry {
            id: uuid::Uuid::new_v4().to_string(),
            command: report.command.clone(),
            started_at: report.started_at,
            finished_at: report.finished_at,
            report_json: serde_json::to_string(&report)?,
        };
        self.store().record_run(&entry).await?;
        tracing::info!(
            command = %report.command,
            failed = report.failed,
            degraded = report.degraded.is_some(),
            "run recorded"
        );
        Ok(report)
    }

    pub async fn rebuild_views(&self) -> Result<RebuildSummary> {
        let records = index::load(self.store()).await?;
        let summary = self
            .views
            .blocking(move |views| views.rebuild(&records))
            .await
            .with_context(|| format!("Failed to rebuild views under {}", self.views.root().display()))?;
        tracing::info!(created = summary.created, removed = summary.removed, "views rebuilt");
        Ok(summary)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::{ConvertError, ModelError};
    use crate::llm::{DisabledModel, ModelRequest};
    use crate::models::{Axis, Format, Stage};
    use crate::store::MemoryIndexStore;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    struct EchoConverter;

    #[async_trait]
    impl Converter for EchoConverter {
        fn name(&self) -> &str {
            "echo"
        }
        async fn convert(&self, path: &Path, _format: Format) -> Result<String, ConvertError> {
            Ok(format!("contents of {}\n", path.display()))
        }
    }

    /// Always answers the first category offered.
    struct FirstChoice;

    #[async_trait]
    impl LanguageModel for FirstChoice {
        fn name(&self) -> &str {
            "first-choice"
        }
        async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
            match &request.instruction {
                crate::llm::Instruction::Brief => Ok("Brief.".into()),
                crate::llm::Instruction::Choose { categories } => {
                    Ok(categories.first().cloned().unwrap_or_default())
                }
            }
        }
    }

    fn config(tmp: &TempDir) -> Config {
        let mut config = Config::minimal();
        config.db.path = tmp.path().join("data/shelf.sqlite");
        config.workspace.root = tmp.path().join("ws");
        config.workspace.views = tmp.path().join("views");
        config.model.max_attempts = 1;
        config
    }

    fn docs(tmp: &TempDir) -> PathBuf {
        let dir = tmp.path().join("docs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.pdf"), b"same").unwrap();
        std::fs::write(dir.join("b.pdf"), b"same").unwrap();
        std::fs::write(dir.join("c.docx"), b"other").unwrap();
        dir
    }

    fn pipeline(tmp: &TempDir, model: Arc<dyn LanguageModel>) -> Pipeline {
        Pipeline::new(
            config(tmp),
            Arc::new(MemoryIndexStore::new()),
            Arc::new(EchoConverter),
            model,
        )
    }

    #[tokio::test]
    async fn full_run_classifies_canonical_documents() {
        let tmp = TempDir::new().unwrap();
        let dir = docs(&tmp);
        let pipeline = pipeline(&tmp, Arc::new(FirstChoice));

        let report = pipeline.run(&[dir], RunOptions::default()).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.converted, 2);
        assert_eq!(report.summarized, 2);
        assert_eq!(report.classified, 2);
        assert_eq!(report.failed, 0);

        let records = index::load(pipeline.store()).await.unwrap();
        for record in records.iter().filter(|r| r.stage == Stage::Classified) {
            assert!(record.has_all_labels());
            for axis in Axis::ALL {
                let label = &record.labels[&axis];
                let link = pipeline.views().find_link(axis, label, record).unwrap();
                assert_eq!(std::fs::read_link(link).unwrap(), record.path);
            }
        }
        assert_eq!(
            records.iter().filter(|r| r.stage == Stage::Duplicate).count(),
            1
        );
        assert!(pipeline.store().last_run().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_model_keeps_conversions() {
        let tmp = TempDir::new().unwrap();
        let dir = docs(&tmp);
        let pipeline = pipeline(&tmp, Arc::new(DisabledModel));

        let report = pipeline.run(&[dir], RunOptions::default()).await.unwrap();
        assert_eq!(report.converted, 2);
        assert_eq!(report.summarized, 0);
        assert!(report.degraded.is_some());
        assert!(report.failures.is_empty());
        // classification was not attempted after the degraded summary stage
        assert!(!report.nothing_to_do.contains(&classify::STAGE));

        let records = index::load(pipeline.store()).await.unwrap();
        assert_eq!(
            records.iter().filter(|r| r.stage == Stage::Converted).count(),
            2
        );
        assert!(records.iter().all(|r| r.stage != Stage::Summarized));
    }

    #[tokio::test]
    async fn standalone_summarize_before_conversion_is_nothing_to_do() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(&tmp, Arc::new(FirstChoice));
        let mut report = RunReport::new("summarize");
        pipeline.summarize(&mut report).await.unwrap();
        assert_eq!(report.nothing_to_do, vec![summarize::STAGE]);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = docs(&tmp);
        let pipeline = pipeline(&tmp, Arc::new(FirstChoice));
        pipeline
            .run(&[dir.clone()], RunOptions::default())
            .await
            .unwrap();
        let before = index::load(pipeline.store()).await.unwrap();

        let report = pipeline.run(&[dir], RunOptions::default()).await.unwrap();
        assert_eq!(report.converted + report.summarized + report.classified, 0);
        assert_eq!(index::load(pipeline.store()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn workspace_and_views_are_not_rescanned() {
        let tmp = TempDir::new().unwrap();
        docs(&tmp);
        let pipeline = pipeline(&tmp, Arc::new(FirstChoice));
        pipeline
            .run(&[tmp.path().to_path_buf()], RunOptions::default())
            .await
            .unwrap();

        let report = pipeline
            .run(&[tmp.path().to_path_buf()], RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.scanned, 3);
    }

    #[test]
    fn preview_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let dir = docs(&tmp);
        let preview = preview(&config(&tmp), &[dir]).unwrap();
        assert_eq!(preview.total_files, 3);
        assert_eq!(preview.by_format["pdf"].count, 2);
        assert!(!tmp.path().join("ws").exists());
        assert!(!tmp.path().join("data").exists());
    }

    #[tokio::test]
    async fn rebuild_views_restores_deleted_links() {
        let tmp = TempDir::new().unwrap();
        let dir = docs(&tmp);
        let pipeline = pipeline(&tmp, Arc::new(FirstChoice));
        pipeline.run(&[dir], RunOptions::default()).await.unwrap();

        std::fs::remove_dir_all(pipeline.views().root().join("topic")).unwrap();
        let summary = pipeline.rebuild_views().await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.kept, 4);
    }
}
