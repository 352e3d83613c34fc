use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::{Axis, UNCATEGORIZED};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where derived artifacts and link trees live.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    #[serde(default = "default_views")]
    pub views: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            views: default_views(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./.summaries")
}
fn default_views() -> PathBuf {
    PathBuf::from("./views")
}

impl WorkspaceConfig {
    pub fn converted_dir(&self) -> PathBuf {
        self.root.join("converted")
    }

    pub fn briefs_dir(&self) -> PathBuf {
        self.root.join("briefs")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            exclude_dirs: default_exclude_dirs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    [
        ".pdf", ".docx", ".pptx", ".xlsx", ".csv", ".html", ".htm", ".json", ".xml", ".md",
        ".txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_dirs() -> Vec<String> {
    [
        ".git",
        ".svn",
        ".hg",
        ".cache",
        ".npm",
        ".yarn",
        ".pnpm",
        ".venv",
        "venv",
        "env",
        "__pycache__",
        ".pytest_cache",
        "node_modules",
        "vendor",
        "packages",
        "Library",
        ".Trash",
        ".idea",
        ".vscode",
        ".vs",
        "build",
        "dist",
        "target",
        "out",
        ".summaries",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConverterConfig {
    #[serde(default = "default_converter_kind")]
    pub kind: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_converter_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            kind: default_converter_kind(),
            command: Vec::new(),
            timeout_secs: default_converter_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_converter_kind() -> String {
    "builtin".to_string()
}
fn default_converter_timeout() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            timeout_secs: default_model_timeout(),
            max_attempts: default_max_attempts(),
            max_concurrent: default_max_concurrent(),
            max_input_chars: default_max_input_chars(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model_timeout() -> u64 {
    120
}
fn default_max_concurrent() -> usize {
    1
}
fn default_max_input_chars() -> usize {
    12_000
}
fn default_temperature() -> f32 {
    0.1
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

/// Allowed categories per taxonomy axis. Model output outside these lists
/// resolves to `uncategorized`.
#[derive(Debug, Deserialize, Clone)]
pub struct TaxonomyConfig {
    #[serde(default = "default_topics")]
    pub topic: Vec<String>,
    #[serde(default = "default_usages")]
    pub usage: Vec<String>,
    #[serde(default)]
    pub client: Vec<String>,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        Self {
            topic: default_topics(),
            usage: default_usages(),
            client: Vec::new(),
        }
    }
}

fn default_topics() -> Vec<String> {
    [
        "finance",
        "legal",
        "engineering",
        "marketing",
        "sales",
        "operations",
        "research",
        "hr",
        "personal",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_usages() -> Vec<String> {
    [
        "report",
        "presentation",
        "contract",
        "invoice",
        "proposal",
        "reference",
        "template",
        "notes",
        "dataset",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl TaxonomyConfig {
    pub fn categories(&self, axis: Axis) -> &[String] {
        match axis {
            Axis::Topic => &self.topic,
            Axis::Usage => &self.usage,
            Axis::Client => &self.client,
        }
    }
}

impl Config {
    /// Configuration used when no file is present (e.g. `shelf completions`).
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/shelf.sqlite"),
            },
            workspace: WorkspaceConfig::default(),
            scan: ScanConfig::default(),
            converter: ConverterConfig::default(),
            model: ModelConfig::default(),
            pipeline: PipelineConfig::default(),
            taxonomy: TaxonomyConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.workers == 0 {
        bail!("pipeline.workers must be >= 1");
    }

    if config.model.max_concurrent == 0 {
        bail!("model.max_concurrent must be >= 1");
    }
    if !(1..=10).contains(&config.model.max_attempts) {
        bail!("model.max_attempts must be in [1, 10]");
    }
    if !(1..=10).contains(&config.converter.max_attempts) {
        bail!("converter.max_attempts must be in [1, 10]");
    }
    if config.model.max_input_chars == 0 {
        bail!("model.max_input_chars must be > 0");
    }

    match config.model.provider.as_str() {
        "disabled" => {}
        "ollama" | "openai-compatible" => {
            if config.model.model.is_none() {
                bail!(
                    "model.model must be specified when provider is '{}'",
                    config.model.provider
                );
            }
        }
        other => bail!(
            "Unknown model provider: '{}'. Must be disabled, ollama, or openai-compatible.",
            other
        ),
    }

    match config.converter.kind.as_str() {
        "builtin" => {}
        "command" => {
            if config.converter.command.is_empty() {
                bail!("converter.command must be set when converter.kind is 'command'");
            }
        }
        other => bail!(
            "Unknown converter kind: '{}'. Must be builtin or command.",
            other
        ),
    }

    if config.scan.extensions.is_empty() {
        bail!("scan.extensions must not be empty");
    }

    for axis in Axis::ALL {
        let mut seen = HashSet::new();
        for category in config.taxonomy.categories(axis) {
            let trimmed = category.trim();
            if trimmed.is_empty() {
                bail!("taxonomy.{} contains an empty category", axis);
            }
            if trimmed.contains('/') || trimmed.contains('\\') || trimmed == "." || trimmed == ".."
            {
                bail!(
                    "taxonomy.{} category '{}' is not a valid directory name",
                    axis,
                    category
                );
            }
            if trimmed.eq_ignore_ascii_case(UNCATEGORIZED) {
                bail!(
                    "taxonomy.{} must not list the reserved category '{}'",
                    axis,
                    UNCATEGORIZED
                );
            }
            if !seen.insert(trimmed.to_lowercase()) {
                bail!("taxonomy.{} lists '{}' more than once", axis, category);
            }
        }
    }

    Ok(())
}
