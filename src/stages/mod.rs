//! The three processing stages and their shared batch runner.
//!
//! Each stage selects the canonical records it owns, runs them through a
//! bounded worker pool, and persists every record as soon as it finishes,
//! so an interrupted batch resumes where it stopped. Workers only ever
//! write back their own record.

pub mod classify;
pub mod conversion;
pub mod summarize;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::IndexResult;
use crate::models::{DocumentRecord, Stage};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::IndexStore;

/// Shared handles for one stage run.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn IndexStore>,
    pub workers: usize,
    /// Set by Ctrl-C. Workers finish the document in flight, then stop.
    pub stop: Arc<AtomicBool>,
    pub progress: Arc<dyn ProgressReporter>,
}

impl StageContext {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// One document that failed a stage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Failure {
    pub path: PathBuf,
    pub stage: &'static str,
    pub reason: String,
}

/// Aggregated result of one stage run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StageOutcome {
    /// Records selected for this run.
    pub selected: usize,
    pub succeeded: usize,
    pub failures: Vec<Failure>,
    /// Failed records skipped because their attempts are used up, with
    /// their stored error.
    pub exhausted: Vec<Failure>,
    /// Set when the model host was unavailable and the stage stopped.
    pub degraded: Option<String>,
    pub interrupted: bool,
    /// No record had reached this stage's input state.
    pub nothing_to_do: bool,
}

/// What a worker produced for one document.
pub(crate) enum DocOutcome {
    /// Record advanced; persist it.
    Done(DocumentRecord),
    /// Per-document failure; the record already carries the failed stage.
    Failed(DocumentRecord, String),
    /// Systemic failure: stop the stage. Partial progress, if any, is
    /// persisted; the record keeps its stage.
    Systemic(Option<DocumentRecord>, String),
    /// Not started because the stage was stopping.
    Skipped,
}

/// Picks records in `ready` or `failed` state. Failed records whose
/// attempts are used up are not picked; they come back as [`Failure`]s
/// carrying their last error so the run report can list them.
pub(crate) fn select(
    records: Vec<DocumentRecord>,
    stage: &'static str,
    ready: Stage,
    failed: Option<Stage>,
    max_attempts: u32,
) -> (Vec<DocumentRecord>, Vec<Failure>) {
    let mut picked = Vec::new();
    let mut exhausted = Vec::new();
    for record in records.into_iter().filter(|r| r.is_canonical()) {
        if record.stage == ready {
            picked.push(record);
        } else if Some(record.stage) == failed {
            if record.attempts >= max_attempts {
                exhausted.push(Failure {
                    reason: record
                        .last_error
                        .clone()
                        .unwrap_or_else(|| format!("failed {} times", record.attempts)),
                    path: record.path,
                    stage,
                });
            } else {
                picked.push(record);
            }
        }
    }
    (picked, exhausted)
}

/// Marks `record` failed in `failed_stage`, counting the attempt.
pub(crate) fn mark_failed(record: &mut DocumentRecord, failed_stage: Stage, reason: &str) {
    if record.stage == failed_stage {
        record.attempts += 1;
    } else {
        record.stage = failed_stage;
        record.attempts = 1;
    }
    record.last_error = Some(reason.to_string());
    record.touch();
}

/// Marks `record` advanced to `stage`, clearing failure bookkeeping.
pub(crate) fn mark_done(record: &mut DocumentRecord, stage: Stage) {
    record.stage = stage;
    record.last_error = None;
    record.attempts = 0;
    record.touch();
}

/// Runs `work` over `records` on `ctx.workers` concurrent tasks and
/// persists each result as it arrives.
pub(crate) async fn run_batch<F, Fut>(
    ctx: &StageContext,
    stage: &'static str,
    records: Vec<DocumentRecord>,
    outcome: &mut StageOutcome,
    work: F,
) -> IndexResult<()>
where
    F: Fn(DocumentRecord) -> Fut,
    Fut: Future<Output = DocOutcome>,
{
    let total = records.len() as u64;
    let halt = AtomicBool::new(false);
    let mut done = 0u64;

    let mut results = stream::iter(records)
        .map(|record| {
            let work = &work;
            let halt = &halt;
            async move {
                if ctx.stop_requested() || halt.load(Ordering::SeqCst) {
                    return DocOutcome::Skipped;
                }
                let result = work(record).await;
                if matches!(result, DocOutcome::Systemic(..)) {
                    halt.store(true, Ordering::SeqCst);
                }
                result
            }
        })
        .buffer_unordered(ctx.workers.max(1));

    while let Some(result) = results.next().await {
        match result {
            DocOutcome::Done(record) => {
                ctx.store.put(&record).await?;
                tracing::debug!(stage, path = %record.path.display(), "done");
                outcome.succeeded += 1;
            }
            DocOutcome::Failed(record, reason) => {
                ctx.store.put(&record).await?;
                tracing::warn!(stage, path = %record.path.display(), %reason, "failed");
                outcome.failures.push(Failure {
                    path: record.path,
                    stage,
                    reason,
                });
            }
            DocOutcome::Systemic(partial, reason) => {
                if let Some(record) = partial {
                    ctx.store.put(&record).await?;
                }
                if outcome.degraded.is_none() {
                    tracing::warn!(stage, %reason, "model unavailable; stopping stage");
                    ctx.progress.report(ProgressEvent::Degraded { stage });
                    outcome.degraded = Some(reason);
                }
                continue;
            }
            DocOutcome::Skipped => continue,
        }
        done += 1;
        ctx.progress.report(ProgressEvent::Stage {
            stage,
            n: done,
            total,
        });
    }

    if ctx.stop_requested() && done < total && outcome.degraded.is_none() {
        outcome.interrupted = true;
    }
    Ok(())
}
