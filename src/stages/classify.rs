//! Classification stage: one model query per taxonomy axis, then one view
//! link per axis.
//!
//! Each axis is resolved against its closed [`LabelSpace`]; an unusable or
//! failed answer becomes `uncategorized` for that axis only.
//! Axes already labeled on the record (an earlier run stopped between
//! queries) are not asked again.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use super::summarize::truncate_chars;
use super::{mark_done, run_batch, select, DocOutcome, StageContext, StageOutcome};
use crate::config::TaxonomyConfig;
use crate::error::IndexResult;
use crate::llm::{Instruction, ModelGate, ModelRequest};
use crate::models::{Axis, DocumentRecord, Label, LabelSpace, Stage};
use crate::store::IndexStore;
use crate::views::ViewTree;

pub const STAGE: &str = "classify";

const MAX_BRIEF_CHARS: usize = 4000;

pub struct ClassifyStage {
    pub gate: Arc<ModelGate>,
    pub spaces: Vec<LabelSpace>,
    pub views: Arc<ViewTree>,
}

/// One closed label space per axis, in axis order.
pub fn label_spaces(taxonomy: &TaxonomyConfig) -> Vec<LabelSpace> {
    Axis::ALL
        .iter()
        .map(|axis| LabelSpace::new(*axis, taxonomy.categories(*axis)))
        .collect()
}

impl ClassifyStage {
    pub async fn run(&self, ctx: &StageContext) -> IndexResult<StageOutcome> {
        let all = crate::index::load(ctx.store.as_ref()).await?;
        let mut outcome = StageOutcome::default();

        let (todo, _) = select(all, STAGE, Stage::Summarized, None, u32::MAX);
        outcome.selected = todo.len();
        if todo.is_empty() {
            outcome.nothing_to_do = true;
            tracing::info!("classify: nothing to do");
            return Ok(outcome);
        }

        tracing::info!(documents = todo.len(), model = self.gate.model_name(), "classifying");
        run_batch(ctx, STAGE, todo, &mut outcome, |record| self.classify_one(record)).await?;
        Ok(outcome)
    }

    async fn classify_one(&self, mut record: DocumentRecord) -> DocOutcome {
        let brief = match &record.brief_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    let reason = format!("cannot read {}: {}", path.display(), e);
                    return self.fail(record, reason);
                }
            },
            None => return self.fail(record, "brief path missing".to_string()),
        };

        let labeled_before = record.labels.len();
        for space in &self.spaces {
            if record.labels.contains_key(&space.axis()) {
                continue;
            }
            let label = match self.ask(space, &record, &brief).await {
                Ok(label) => label,
                Err(reason) => {
                    if record.labels.len() == labeled_before {
                        return DocOutcome::Systemic(None, reason);
                    }
                    record.touch();
                    return DocOutcome::Systemic(Some(record), reason);
                }
            };
            tracing::debug!(path = %record.path.display(), axis = %space.axis(), %label, "labeled");
            record.labels.insert(space.axis(), label);
        }

        let linked = record.clone();
        let result = self
            .views
            .blocking(move |views| {
                for (axis, label) in &linked.labels {
                    views.link(*axis, label, &linked).map_err(|e| {
                        std::io::Error::new(e.kind(), format!("{} view: {}", axis, e))
                    })?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            let reason = format!("cannot link {}", e);
            return self.fail(record, reason);
        }

        mark_done(&mut record, Stage::Classified);
        DocOutcome::Done(record)
    }

    /// Asks one axis. Only `Unavailable` is returned as an error; every
    /// other failure resolves to `uncategorized`.
    async fn ask(&self, space: &LabelSpace, record: &DocumentRecord, brief: &str) -> Result<Label, String> {
        if space.is_empty() {
            return Ok(Label::Uncategorized);
        }
        let request = ModelRequest {
            prompt: format!(
                "{}\n\nDocument: {}\n\n{}",
                space.axis().question(),
                record.file_name(),
                truncate_chars(brief, MAX_BRIEF_CHARS)
            ),
            instruction: Instruction::Choose {
                categories: space.categories().to_vec(),
            },
        };
        match self.gate.complete(&request).await {
            Ok(answer) => Ok(space.resolve(&answer)),
            Err(e) if e.is_systemic() => Err(e.to_string()),
            Err(e) => {
                tracing::warn!(path = %record.path.display(), axis = %space.axis(), error = %e,
                    "model failed; using uncategorized");
                Ok(Label::Uncategorized)
            }
        }
    }

    /// Link or read failures keep the record `Summarized` (with any labels
    /// gathered) so the next run retries.
    fn fail(&self, mut record: DocumentRecord, reason: String) -> DocOutcome {
        record.last_error = Some(reason.clone());
        record.touch();
        DocOutcome::Failed(record, reason)
    }
}

/// Operator override: moves one axis of a classified record to `category`
/// and replaces only that axis's view link.
pub async fn set_label(
    store: &dyn IndexStore,
    views: &Arc<ViewTree>,
    taxonomy: &TaxonomyConfig,
    path: &Path,
    axis: Axis,
    category: &str,
) -> Result<Label> {
    let space = LabelSpace::new(axis, taxonomy.categories(axis));
    let Some(label) = space.lookup(category) else {
        bail!(
            "'{}' is not a {} category. Known: {}",
            category,
            axis,
            space.categories().join(", ")
        );
    };

    let mut record = store
        .get(path)
        .await?
        .with_context(|| format!("{} is not in the index", path.display()))?;
    if record.stage != Stage::Classified {
        bail!(
            "{} is {}, only classified documents can be relabeled",
            path.display(),
            record.stage
        );
    }

    if record.labels.get(&axis) != Some(&label) {
        let (target, linked) = (label.clone(), record.clone());
        views
            .blocking(move |views| views.relabel(axis, &target, &linked))
            .await
            .with_context(|| format!("Failed to relink {} view", axis))?;
        record.labels.insert(axis, label.clone());
        record.touch();
        store.put(&record).await?;
    }
    Ok(label)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::error::ModelError;
    use crate::llm::{DisabledModel, LanguageModel};
    use crate::stages::testing::{context, record};
    use crate::store::MemoryIndexStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Answers by axis question: topic → "Finance, Legal", usage → "report",
    /// client → a name outside the space.
    struct AxisModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for AxisModel {
        fn name(&self) -> &str {
            "axis-model"
        }
        async fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = &request.prompt;
            if prompt.starts_with(Axis::Topic.question()) {
                Ok("Finance, Legal".into())
            } else if prompt.starts_with(Axis::Usage.question()) {
                Ok("report".into())
            } else {
                Ok("I cannot tell which client this is.".into())
            }
        }
    }

    /// Fails every per-document query.
    struct TimeoutModel;

    #[async_trait]
    impl LanguageModel for TimeoutModel {
        fn name(&self) -> &str {
            "timeout"
        }
        async fn complete(&self, _request: &ModelRequest) -> Result<String, ModelError> {
            Err(ModelError::Timeout(Duration::from_secs(1)))
        }
    }

    fn taxonomy() -> TaxonomyConfig {
        TaxonomyConfig {
            topic: vec!["finance".into(), "legal".into()],
            usage: vec!["report".into(), "contract".into()],
            client: vec!["acme".into()],
        }
    }

    fn stage(model: Arc<dyn LanguageModel>, views: Arc<ViewTree>) -> ClassifyStage {
        let config = ModelConfig {
            max_attempts: 1,
            ..ModelConfig::default()
        };
        ClassifyStage {
            gate: Arc::new(ModelGate::new(model, &config).with_retry_delay(Duration::ZERO)),
            spaces: label_spaces(&taxonomy()),
            views,
        }
    }

    async fn summarized(store: &MemoryIndexStore, tmp: &TempDir, name: &str) -> DocumentRecord {
        let src = tmp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let path = src.join(name);
        std::fs::write(&path, name).unwrap();
        let brief = tmp.path().join(format!("{}.brief.md", name));
        std::fs::write(&brief, "A brief about money.").unwrap();

        let mut r = record(&path, &format!("hash-{}", name), 1);
        r.stage = Stage::Summarized;
        r.converted_text_path = Some(tmp.path().join("c.md"));
        r.brief_path = Some(brief);
        store.put(&r).await.unwrap();
        r
    }

    #[tokio::test]
    async fn unusable_client_answer_is_uncategorized() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let views = Arc::new(ViewTree::new(&tmp.path().join("views")));
        let r = summarized(&store, &tmp, "a.pdf").await;

        let model = Arc::new(AxisModel {
            calls: AtomicUsize::new(0),
        });
        let outcome = stage(model.clone(), views.clone())
            .run(&context(store.clone(), 2))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);

        let r = store.get(&r.path).await.unwrap().unwrap();
        assert_eq!(r.stage, Stage::Classified);
        assert_eq!(r.labels[&Axis::Topic], Label::Category("finance".into()));
        assert_eq!(r.labels[&Axis::Usage], Label::Category("report".into()));
        assert_eq!(r.labels[&Axis::Client], Label::Uncategorized);

        for (axis, label) in &r.labels {
            let link = views.find_link(*axis, label, &r).unwrap();
            assert_eq!(std::fs::read_link(&link).unwrap(), r.path);
        }
        assert!(views.root().join("client/uncategorized/a.pdf").is_symlink());
    }

    #[tokio::test]
    async fn link_failure_keeps_record_summarized_with_labels() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        // A regular file where the view root should be makes every link fail.
        let blocked = tmp.path().join("views");
        std::fs::write(&blocked, b"not a directory").unwrap();
        let views = Arc::new(ViewTree::new(&blocked));
        let r = summarized(&store, &tmp, "a.pdf").await;

        let model = Arc::new(AxisModel {
            calls: AtomicUsize::new(0),
        });
        let outcome = stage(model, views)
            .run(&context(store.clone(), 1))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.starts_with("cannot link"));

        let r = store.get(&r.path).await.unwrap().unwrap();
        assert_eq!(r.stage, Stage::Summarized);
        assert_eq!(r.labels.len(), 3);
        assert!(r.last_error.is_some());
    }

    #[tokio::test]
    async fn rerun_on_classified_record_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let views = Arc::new(ViewTree::new(&tmp.path().join("views")));
        summarized(&store, &tmp, "a.pdf").await;

        let model = Arc::new(AxisModel {
            calls: AtomicUsize::new(0),
        });
        let stage = stage(model.clone(), views);
        let ctx = context(store.clone(), 1);
        stage.run(&ctx).await.unwrap();
        let before = store.load_all().await.unwrap();

        let again = stage.run(&ctx).await.unwrap();
        assert!(again.nothing_to_do);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.load_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn per_document_model_errors_default_every_axis() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let views = Arc::new(ViewTree::new(&tmp.path().join("views")));
        let r = summarized(&store, &tmp, "a.pdf").await;

        stage(Arc::new(TimeoutModel), views)
            .run(&context(store.clone(), 1))
            .await
            .unwrap();
        let r = store.get(&r.path).await.unwrap().unwrap();
        assert_eq!(r.stage, Stage::Classified);
        assert!(r.labels.values().all(|l| *l == Label::Uncategorized));
    }

    #[tokio::test]
    async fn unavailable_model_leaves_record_summarized() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let views = Arc::new(ViewTree::new(&tmp.path().join("views")));
        let r = summarized(&store, &tmp, "a.pdf").await;

        let outcome = stage(Arc::new(DisabledModel), views.clone())
            .run(&context(store.clone(), 1))
            .await
            .unwrap();
        assert!(outcome.degraded.is_some());
        let r = store.get(&r.path).await.unwrap().unwrap();
        assert_eq!(r.stage, Stage::Summarized);
        assert!(r.labels.is_empty());
        assert!(!views.root().join("topic").exists());
    }

    #[tokio::test]
    async fn partially_labeled_record_only_asks_missing_axes() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let views = Arc::new(ViewTree::new(&tmp.path().join("views")));
        let mut r = summarized(&store, &tmp, "a.pdf").await;
        r.labels.insert(Axis::Topic, Label::Category("legal".into()));
        r.labels.insert(Axis::Usage, Label::Category("contract".into()));
        store.put(&r).await.unwrap();

        let model = Arc::new(AxisModel {
            calls: AtomicUsize::new(0),
        });
        stage(model.clone(), views)
            .run(&context(store.clone(), 1))
            .await
            .unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        let r = store.get(&r.path).await.unwrap().unwrap();
        assert_eq!(r.labels[&Axis::Topic], Label::Category("legal".into()));
        assert_eq!(r.stage, Stage::Classified);
    }

    #[tokio::test]
    async fn set_label_replaces_only_one_axis() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let views = Arc::new(ViewTree::new(&tmp.path().join("views")));
        let r = summarized(&store, &tmp, "a.pdf").await;
        let model = Arc::new(AxisModel {
            calls: AtomicUsize::new(0),
        });
        stage(model, views.clone())
            .run(&context(store.clone(), 1))
            .await
            .unwrap();

        let label = set_label(store.as_ref(), &views, &taxonomy(), &r.path, Axis::Client, "ACME")
            .await
            .unwrap();
        assert_eq!(label, Label::Category("acme".into()));

        let r = store.get(&r.path).await.unwrap().unwrap();
        assert_eq!(r.labels[&Axis::Client], Label::Category("acme".into()));
        assert!(views.root().join("client/acme/a.pdf").is_symlink());
        assert!(!views.root().join("client/uncategorized").exists());
        assert!(views.root().join("topic/finance/a.pdf").is_symlink());

        assert!(
            set_label(store.as_ref(), &views, &taxonomy(), &r.path, Axis::Client, "globex")
                .await
                .is_err()
        );
    }
}
