//! Summarization stage: converted text → model-written brief.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::conversion::write_atomic;
use super::{mark_done, mark_failed, run_batch, select, DocOutcome, StageContext, StageOutcome};
use crate::error::IndexResult;
use crate::llm::{Instruction, ModelGate, ModelRequest};
use crate::models::{DocumentRecord, Stage};

pub const STAGE: &str = "summarize";

pub struct SummarizeStage {
    pub gate: Arc<ModelGate>,
    /// Directory receiving `<stem>-<hash>.md` briefs.
    pub out_dir: PathBuf,
    /// Converted text is cut to this many characters before prompting.
    pub max_input_chars: usize,
    pub max_attempts: u32,
}

impl SummarizeStage {
    pub async fn run(&self, ctx: &StageContext) -> IndexResult<StageOutcome> {
        let all = crate::index::load(ctx.store.as_ref()).await?;
        let mut outcome = StageOutcome::default();

        let (todo, exhausted) = select(
            all,
            STAGE,
            Stage::Converted,
            Some(Stage::SummarizationFailed),
            self.max_attempts,
        );
        outcome.selected = todo.len();
        outcome.exhausted = exhausted;
        if todo.is_empty() {
            outcome.nothing_to_do = outcome.exhausted.is_empty();
            tracing::info!("summarize: nothing to do");
            return Ok(outcome);
        }

        tokio::fs::create_dir_all(&self.out_dir).await?;
        tracing::info!(documents = todo.len(), model = self.gate.model_name(), "summarizing");

        run_batch(ctx, STAGE, todo, &mut outcome, |record| self.summarize_one(record)).await?;
        Ok(outcome)
    }

    async fn summarize_one(&self, mut record: DocumentRecord) -> DocOutcome {
        let Some(source) = record.converted_text_path.clone() else {
            let reason = "converted text path missing".to_string();
            mark_failed(&mut record, Stage::SummarizationFailed, &reason);
            return DocOutcome::Failed(record, reason);
        };
        let text = match tokio::fs::read_to_string(&source).await {
            Ok(text) => text,
            Err(e) => {
                let reason = format!("cannot read {}: {}", source.display(), e);
                mark_failed(&mut record, Stage::SummarizationFailed, &reason);
                return DocOutcome::Failed(record, reason);
            }
        };

        let request = ModelRequest {
            prompt: format!(
                "Document: {}\n\n{}",
                record.file_name(),
                truncate_chars(&text, self.max_input_chars)
            ),
            instruction: Instruction::Brief,
        };

        let brief = match self.gate.complete(&request).await {
            Ok(brief) => brief,
            Err(e) if e.is_systemic() => return DocOutcome::Systemic(None, e.to_string()),
            Err(e) => {
                let reason = e.to_string();
                mark_failed(&mut record, Stage::SummarizationFailed, &reason);
                return DocOutcome::Failed(record, reason);
            }
        };

        let target = brief_path(&self.out_dir, &record);
        let body = format!(
            "# Brief: {}\n\n> Source: {}\n> Model: {}\n\n{}\n",
            record.file_name(),
            record.path.display(),
            self.gate.model_name(),
            brief.trim()
        );
        if let Err(e) = write_atomic(&target, &body).await {
            let reason = format!("cannot write {}: {}", target.display(), e);
            mark_failed(&mut record, Stage::SummarizationFailed, &reason);
            return DocOutcome::Failed(record, reason);
        }

        record.brief_path = Some(target);
        mark_done(&mut record, Stage::Summarized);
        DocOutcome::Done(record)
    }
}

pub fn brief_path(dir: &Path, record: &DocumentRecord) -> PathBuf {
    super::conversion::artifact_path(dir, record)
}

/// Prefix of `text` holding at most `max` characters.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
