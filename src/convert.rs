//! Converter collaborators: turn a source document into normalized text.
//!
//! - **[`BuiltinConverter`]** runs the in-process extractors in [`crate::extract`]
//!   on a blocking thread.
//! - **[`CommandConverter`]** runs an external program (e.g. `markitdown`)
//!   with the source path appended and reads the text from stdout.
//!
//! Both enforce a timeout and never write to the source file. Use
//! [`create_converter`] to pick one from configuration.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConverterConfig;
use crate::error::ConvertError;
use crate::extract;
use crate::models::Format;

#[async_trait]
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    /// Converts the file at `path` to normalized text.
    async fn convert(&self, path: &Path, format: Format) -> Result<String, ConvertError>;
}

pub fn create_converter(config: &ConverterConfig) -> Result<Arc<dyn Converter>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.kind.as_str() {
        "builtin" => Ok(Arc::new(BuiltinConverter::new(timeout))),
        "command" => Ok(Arc::new(CommandConverter::new(
            config.command.clone(),
            timeout,
        )?)),
        other => bail!("Unknown converter kind: {}", other),
    }
}

/// Collapses runs of blank lines and trims trailing whitespace. Empty
/// output is treated as a failed conversion.
pub fn normalize_text(raw: &str) -> Result<String, ConvertError> {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0usize;
    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    let trimmed = out.trim();
    if trimmed.is_empty() {
        return Err(ConvertError::CorruptFile("no extractable text".to_string()));
    }
    Ok(format!("{}\n", trimmed))
}

// ============ Builtin ============

pub struct BuiltinConverter {
    timeout: Duration,
}

impl BuiltinConverter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Converter for BuiltinConverter {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn convert(&self, path: &Path, format: Format) -> Result<String, ConvertError> {
        let owned = path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || {
            let bytes = std::fs::read(&owned)
                .map_err(|e| ConvertError::ReadError(format!("{}: {}", owned.display(), e)))?;
            extract::extract_text(&bytes, format)
        });

        // A panicking extractor (malformed PDF internals) surfaces as a join error.
        let raw = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => return Err(ConvertError::Timeout(self.timeout)),
            Ok(Err(join)) => {
                return Err(ConvertError::CorruptFile(format!(
                    "extractor aborted: {}",
                    join
                )))
            }
            Ok(Ok(result)) => result?,
        };
        normalize_text(&raw)
    }
}

// ============ External command ============

/// Runs `argv... <path>` and takes stdout as the converted text.
pub struct CommandConverter {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            bail!("converter.command must not be empty");
        }
        Ok(Self { argv, timeout })
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn name(&self) -> &str {
        &self.argv[0]
    }

    async fn convert(&self, path: &Path, _format: Format) -> Result<String, ConvertError> {
        let mut cmd = tokio::process::Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => return Err(ConvertError::Timeout(self.timeout)),
            Ok(Err(e)) => {
                return Err(ConvertError::ReadError(format!(
                    "failed to run '{}': {}",
                    self.argv[0], e
                )))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("").trim();
            return Err(ConvertError::CorruptFile(format!(
                "'{}' exited with {}: {}",
                self.argv[0], output.status, reason
            )));
        }

        let text = String::from_utf8(output.stdout).map_err(|_| {
            ConvertError::CorruptFile(format!("'{}' produced non-UTF-8 output", self.argv[0]))
        })?;
        normalize_text(&text)
    }
}
