//! Conversion stage: source document → normalized Markdown artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{mark_done, mark_failed, run_batch, select, DocOutcome, StageContext, StageOutcome};
use crate::convert::Converter;
use crate::error::IndexResult;
use crate::models::{DocumentRecord, Stage};
use crate::report::human_size;

pub const STAGE: &str = "convert";

pub struct ConversionStage {
    pub converter: Arc<dyn Converter>,
    /// Directory receiving `<stem>-<hash>.md` artifacts.
    pub out_dir: PathBuf,
    pub max_attempts: u32,
}

impl ConversionStage {
    pub async fn run(&self, ctx: &StageContext) -> IndexResult<StageOutcome> {
        let all = crate::index::load(ctx.store.as_ref()).await?;
        let mut outcome = StageOutcome::default();

        let (todo, exhausted) = select(
            all,
            STAGE,
            Stage::Indexed,
            Some(Stage::ConversionFailed),
            self.max_attempts,
        );
        outcome.selected = todo.len();
        outcome.exhausted = exhausted;
        if todo.is_empty() {
            outcome.nothing_to_do = outcome.exhausted.is_empty();
            tracing::info!("convert: nothing to do");
            return Ok(outcome);
        }

        tokio::fs::create_dir_all(&self.out_dir).await?;
        tracing::info!(documents = todo.len(), converter = self.converter.name(), "converting");

        run_batch(ctx, STAGE, todo, &mut outcome, |record| self.convert_one(record)).await?;
        Ok(outcome)
    }

    async fn convert_one(&self, mut record: DocumentRecord) -> DocOutcome {
        let text = match self.converter.convert(&record.path, record.format).await {
            Ok(text) => text,
            Err(e) => {
                let reason = e.to_string();
                mark_failed(&mut record, Stage::ConversionFailed, &reason);
                return DocOutcome::Failed(record, reason);
            }
        };

        let target = artifact_path(&self.out_dir, &record);
        let body = render_artifact(&record, &text);
        if let Err(e) = write_atomic(&target, &body).await {
            let reason = format!("cannot write {}: {}", target.display(), e);
            mark_failed(&mut record, Stage::ConversionFailed, &reason);
            return DocOutcome::Failed(record, reason);
        }

        record.converted_text_path = Some(target);
        mark_done(&mut record, Stage::Converted);
        DocOutcome::Done(record)
    }
}

/// `<dir>/<stem>-<first 12 hash chars>.md`; stable for a given content.
pub fn artifact_path(dir: &Path, record: &DocumentRecord) -> PathBuf {
    let stem = record
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let short: String = record.content_hash.chars().take(12).collect();
    dir.join(format!("{}-{}.md", stem, short))
}

fn render_artifact(record: &DocumentRecord, text: &str) -> String {
    let title = record
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| record.file_name());
    format!(
        "# {}\n\n> Source: {}\n> Type: {} | Size: {}\n> Converted: {}\n\n---\n\n{}",
        title,
        record.path.display(),
        record.format,
        human_size(record.size_bytes),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        text
    )
}

/// Writes via a sibling temp file and rename, so a crash never leaves a
/// half-written artifact behind a `Converted` record.
pub(crate) async fn write_atomic(target: &Path, body: &str) -> std::io::Result<()> {
    let tmp = target.with_extension("md.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvertError;
    use crate::models::Format;
    use crate::stages::testing::{context, record};
    use crate::store::{IndexStore, MemoryIndexStore};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Fails for paths containing "bad", otherwise echoes the file name.
    struct FakeConverter {
        calls: Mutex<Vec<PathBuf>>,
    }

    impl FakeConverter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Converter for FakeConverter {
        fn name(&self) -> &str {
            "fake"
        }
        async fn convert(&self, path: &Path, _format: Format) -> Result<String, ConvertError> {
            self.calls.lock().unwrap().push(path.to_path_buf());
            if path.to_string_lossy().contains("bad") {
                Err(ConvertError::CorruptFile("broken xref table".into()))
            } else {
                Ok(format!("text of {}\n", path.display()))
            }
        }
    }

    fn stage(converter: Arc<FakeConverter>, out: &Path) -> ConversionStage {
        ConversionStage {
            converter,
            out_dir: out.to_path_buf(),
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn converts_canonical_records_and_isolates_failures() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        let mut dup = record(Path::new("/docs/b.pdf"), "h1", 2);
        dup.stage = Stage::Duplicate;
        dup.duplicate_of = Some("/docs/a.pdf".into());
        store
            .put_many(&[
                record(Path::new("/docs/a.pdf"), "h1", 1),
                dup,
                record(Path::new("/docs/bad.docx"), "h2", 3),
                record(Path::new("/docs/c.md"), "h3", 4),
            ])
            .await
            .unwrap();

        let converter = FakeConverter::new();
        let ctx = context(store.clone(), 3);
        let outcome = stage(converter.clone(), tmp.path()).run(&ctx).await.unwrap();

        assert_eq!(outcome.selected, 3);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("corrupt file"));

        let called: HashSet<PathBuf> = converter.calls.lock().unwrap().iter().cloned().collect();
        assert!(!called.contains(Path::new("/docs/b.pdf")));

        let a = store.get(Path::new("/docs/a.pdf")).await.unwrap().unwrap();
        assert_eq!(a.stage, Stage::Converted);
        let artifact = std::fs::read_to_string(a.converted_text_path.unwrap()).unwrap();
        assert!(artifact.starts_with("# a\n"));
        assert!(artifact.contains("> Source: /docs/a.pdf"));
        assert!(artifact.ends_with("text of /docs/a.pdf\n"));

        let bad = store.get(Path::new("/docs/bad.docx")).await.unwrap().unwrap();
        assert_eq!(bad.stage, Stage::ConversionFailed);
        assert_eq!(bad.attempts, 1);
        assert!(bad.last_error.is_some());
    }

    #[tokio::test]
    async fn failed_records_retry_until_exhausted() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        store
            .put(&record(Path::new("/docs/bad.pdf"), "h", 1))
            .await
            .unwrap();
        let ctx = context(store.clone(), 1);
        let stage = stage(FakeConverter::new(), tmp.path());

        assert_eq!(stage.run(&ctx).await.unwrap().failures.len(), 1);
        assert_eq!(stage.run(&ctx).await.unwrap().failures.len(), 1);
        let third = stage.run(&ctx).await.unwrap();
        assert_eq!(third.selected, 0);
        assert_eq!(third.exhausted.len(), 1);
        assert_eq!(third.exhausted[0].path, PathBuf::from("/docs/bad.pdf"));
        assert_eq!(third.exhausted[0].stage, STAGE);
        assert!(!third.exhausted[0].reason.is_empty());
        assert!(!third.nothing_to_do);

        let mut report = crate::report::RunReport::new("convert");
        report.absorb_stage(STAGE, third);
        assert_eq!(report.exhausted.len(), 1);
        assert!(report.render_human().contains("/docs/bad.pdf"));

        let bad = store.get(Path::new("/docs/bad.pdf")).await.unwrap().unwrap();
        assert_eq!(bad.attempts, 2);
    }

    #[tokio::test]
    async fn second_run_processes_only_remaining_documents() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        store
            .put_many(&[
                record(Path::new("/docs/a.md"), "h1", 1),
                record(Path::new("/docs/b.md"), "h2", 2),
            ])
            .await
            .unwrap();
        let ctx = context(store.clone(), 2);

        let converter = FakeConverter::new();
        stage(converter.clone(), tmp.path()).run(&ctx).await.unwrap();
        store
            .put(&record(Path::new("/docs/c.md"), "h3", 3))
            .await
            .unwrap();

        let again = FakeConverter::new();
        let outcome = stage(again.clone(), tmp.path()).run(&ctx).await.unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(
            again.calls.lock().unwrap().clone(),
            vec![PathBuf::from("/docs/c.md")]
        );
    }

    #[tokio::test]
    async fn stop_flag_leaves_remaining_records_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryIndexStore::new());
        store
            .put(&record(Path::new("/docs/a.md"), "h1", 1))
            .await
            .unwrap();
        let ctx = context(store.clone(), 1);
        ctx.stop.store(true, std::sync::atomic::Ordering::SeqCst);

        let outcome = stage(FakeConverter::new(), tmp.path()).run(&ctx).await.unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.succeeded, 0);
        let a = store.get(Path::new("/docs/a.md")).await.unwrap().unwrap();
        assert_eq!(a.stage, Stage::Indexed);
    }

    #[tokio::test]
    async fn empty_index_is_nothing_to_do() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(Arc::new(MemoryIndexStore::new()), 1);
        let outcome = stage(FakeConverter::new(), tmp.path()).run(&ctx).await.unwrap();
        assert!(outcome.nothing_to_do);
    }

    #[test]
    fn artifact_path_is_content_addressed() {
        let r = record(Path::new("/docs/Q3 report.pdf"), "0123456789abcdef", 1);
        assert_eq!(
            artifact_path(Path::new("/ws"), &r),
            PathBuf::from("/ws/Q3 report-0123456789ab.md")
        );
    }
}
