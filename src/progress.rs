//! Stage progress reporting.
//!
//! Progress goes to **stderr** so stdout carries only the run report and
//! stays parseable for scripts. Human lines look like
//! `summarize  12 / 1,204 documents`; JSON mode emits one object per line.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Walking and fingerprinting the inputs. Total unknown.
    Scanning,
    /// A stage finished `n` of `total` documents.
    Stage {
        stage: &'static str,
        n: u64,
        total: u64,
    },
    /// The model host is unavailable; `stage` stopped early.
    Degraded { stage: &'static str },
}

/// Reports pipeline progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning => "scan  discovering...\n".to_string(),
            ProgressEvent::Stage { stage, n, total } => format!(
                "{}  {} / {} documents\n",
                stage,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Degraded { stage } => {
                format!("{}  model unavailable, stopping stage\n", stage)
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning => serde_json::json!({
                "event": "progress",
                "stage": "scan",
                "phase": "discovering"
            }),
            ProgressEvent::Stage { stage, n, total } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "n": n,
                "total": total
            }),
            ProgressEvent::Degraded { stage } => serde_json::json!({
                "event": "degraded",
                "stage": stage
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// `Auto` becomes human progress when stderr is a TTY, otherwise off.
    pub fn resolve(self) -> Self {
        match self {
            ProgressMode::Auto if atty::is(atty::Stream::Stderr) => ProgressMode::Human,
            ProgressMode::Auto => ProgressMode::Off,
            other => other,
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn ProgressReporter> {
        match self.resolve() {
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
            _ => std::sync::Arc::new(NoProgress),
        }
    }
}
