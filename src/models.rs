//! Core data models for the document index.
//!
//! A [`DocumentRecord`] is one discovered source file. Its [`Stage`] moves
//! through `Indexed → Converted → Summarized → Classified`; the three
//! taxonomy [`Axis`] values each carry one [`Label`] chosen from a closed
//! [`LabelSpace`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Fallback category for an axis when the model gives nothing usable.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Lifecycle state of a document record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Indexed,
    ConversionFailed,
    Converted,
    SummarizationFailed,
    Summarized,
    Classified,
    /// Byte-identical to an earlier-scanned record; never advances.
    Duplicate,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Indexed,
        Stage::ConversionFailed,
        Stage::Converted,
        Stage::SummarizationFailed,
        Stage::Summarized,
        Stage::Classified,
        Stage::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Indexed => "indexed",
            Stage::ConversionFailed => "conversion_failed",
            Stage::Converted => "converted",
            Stage::SummarizationFailed => "summarization_failed",
            Stage::Summarized => "summarized",
            Stage::Classified => "classified",
            Stage::Duplicate => "duplicate",
        }
    }

    /// Position along the happy path. Failed side-states share the rank of
    /// the state they were reached from.
    pub fn rank(&self) -> u8 {
        match self {
            Stage::Indexed | Stage::ConversionFailed => 0,
            Stage::Converted | Stage::SummarizationFailed => 1,
            Stage::Summarized => 2,
            Stage::Classified => 3,
            Stage::Duplicate => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Stage::ConversionFailed | Stage::SummarizationFailed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Recognized source formats. Anything else is rejected during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Csv,
    Html,
    Json,
    Xml,
    Markdown,
    Text,
}

impl Format {
    pub const ALL: [Format; 10] = [
        Format::Pdf,
        Format::Docx,
        Format::Pptx,
        Format::Xlsx,
        Format::Csv,
        Format::Html,
        Format::Json,
        Format::Xml,
        Format::Markdown,
        Format::Text,
    ];

    /// Maps a lowercase extension (with leading dot) to a format.
    pub fn from_extension(ext: &str) -> Option<Format> {
        match ext {
            ".pdf" => Some(Format::Pdf),
            ".docx" => Some(Format::Docx),
            ".pptx" => Some(Format::Pptx),
            ".xlsx" => Some(Format::Xlsx),
            ".csv" => Some(Format::Csv),
            ".html" | ".htm" => Some(Format::Html),
            ".json" => Some(Format::Json),
            ".xml" => Some(Format::Xml),
            ".md" | ".markdown" => Some(Format::Markdown),
            ".txt" => Some(Format::Text),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Format> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        Format::from_extension(&format!(".{}", ext))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Pdf => "pdf",
            Format::Docx => "docx",
            Format::Pptx => "pptx",
            Format::Xlsx => "xlsx",
            Format::Csv => "csv",
            Format::Html => "html",
            Format::Json => "json",
            Format::Xml => "xml",
            Format::Markdown => "markdown",
            Format::Text => "text",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::ALL
            .iter()
            .copied()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| format!("unknown format '{}'", s))
    }
}

/// One of the three independent classification dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Topic,
    Usage,
    Client,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Topic, Axis::Usage, Axis::Client];

    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Topic => "topic",
            Axis::Usage => "usage",
            Axis::Client => "client",
        }
    }

    /// Phrase used when asking the model about this axis.
    pub fn question(&self) -> &'static str {
        match self {
            Axis::Topic => "What subject area is this document about?",
            Axis::Usage => "What kind of document is this, i.e. how is it used?",
            Axis::Client => "Which client or organization is this document for?",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "topic" => Ok(Axis::Topic),
            "usage" => Ok(Axis::Usage),
            "client" => Ok(Axis::Client),
            other => Err(format!(
                "unknown axis '{}'. Must be topic, usage, or client.",
                other
            )),
        }
    }
}

/// A category assignment on one axis. Only constructed through
/// [`LabelSpace`], so a `Category` always names a configured category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum Label {
    Category(String),
    Uncategorized,
}

impl Label {
    pub fn name(&self) -> &str {
        match self {
            Label::Category(name) => name,
            Label::Uncategorized => UNCATEGORIZED,
        }
    }

    /// Rebuilds a label from its persisted name.
    pub fn from_stored(name: &str) -> Label {
        if name == UNCATEGORIZED {
            Label::Uncategorized
        } else {
            Label::Category(name.to_string())
        }
    }
}

impl From<Label> for String {
    fn from(label: Label) -> String {
        label.name().to_string()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The closed set of categories the model may choose from on one axis.
#[derive(Debug, Clone)]
pub struct LabelSpace {
    axis: Axis,
    categories: Vec<String>,
}

impl LabelSpace {
    pub fn new(axis: Axis, categories: &[String]) -> Self {
        Self {
            axis,
            categories: categories.iter().map(|c| c.trim().to_string()).collect(),
        }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Looks up a category by name, case-insensitively. `uncategorized`
    /// is always accepted.
    pub fn lookup(&self, name: &str) -> Option<Label> {
        let wanted = name.trim();
        if wanted.eq_ignore_ascii_case(UNCATEGORIZED) {
            return Some(Label::Uncategorized);
        }
        self.categories
            .iter()
            .find(|c| c.eq_ignore_ascii_case(wanted))
            .map(|c| Label::Category(c.clone()))
    }

    /// Resolves free-form model output to exactly one label. The first line
    /// is matched whole (with and without a `Prefix:`) before it is split,
    /// so categories such as `Acme, Inc.` stay reachable. Otherwise only the
    /// first candidate counts; anything outside the space becomes
    /// [`Label::Uncategorized`].
    pub fn resolve(&self, response: &str) -> Label {
        let Some(line) = response.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Label::Uncategorized;
        };

        let whole = [Some(line), line.split_once(':').map(|(_, rest)| rest)];
        for text in whole.into_iter().flatten() {
            let text = text.trim();
            let unwrapped = text
                .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*'))
                .trim();
            if let Some(label) = self.lookup(text).or_else(|| self.lookup(unwrapped)) {
                return label;
            }
        }

        match first_candidate(line) {
            Some(candidate) => self.lookup(&candidate).unwrap_or(Label::Uncategorized),
            None => Label::Uncategorized,
        }
    }
}

/// Extracts the first candidate label from a model response such as
/// `"Category: Finance, Legal"` or `"1. **finance**\n2. legal"`.
fn first_candidate(response: &str) -> Option<String> {
    let line = response.lines().map(str::trim).find(|l| !l.is_empty())?;
    let after_prefix = match line.rfind(':') {
        Some(idx) => &line[idx + 1..],
        None => line,
    };
    let first = after_prefix
        .split([',', ';', '|'])
        .map(str::trim)
        .find(|s| !s.is_empty())?;

    let cleaned = strip_list_marker(first)
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*' | '.' | '[' | ']' | '(' | ')'))
        .trim();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Removes a leading `1.` / `2)` / `-` / `*` list marker.
fn strip_list_marker(s: &str) -> &str {
    let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
    let rest = &s[digits..];
    let rest = if digits > 0 && (rest.starts_with('.') || rest.starts_with(')')) {
        &rest[1..]
    } else if digits > 0 {
        s
    } else {
        rest
    };
    let rest = rest.trim_start();
    rest.strip_prefix("- ")
        .or_else(|| rest.strip_prefix("* "))
        .unwrap_or(rest)
        .trim_start()
}

/// One discovered source file and its pipeline progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub path: PathBuf,
    pub content_hash: String,
    pub size_bytes: u64,
    pub format: Format,
    /// Position in the scan order that first recorded this path (or its
    /// current bytes). Lower wins the canonical slot in a duplicate group.
    pub scan_seq: i64,
    pub duplicate_of: Option<PathBuf>,
    pub stage: Stage,
    pub converted_text_path: Option<PathBuf>,
    pub brief_path: Option<PathBuf>,
    pub labels: BTreeMap<Axis, Label>,
    pub last_error: Option<String>,
    /// Failed attempts in the current failed state.
    pub attempts: u32,
    pub updated_at: i64,
}

impl DocumentRecord {
    pub fn new(path: PathBuf, content_hash: String, size_bytes: u64, format: Format) -> Self {
        Self {
            path,
            content_hash,
            size_bytes,
            format,
            scan_seq: 0,
            duplicate_of: None,
            stage: Stage::Indexed,
            converted_text_path: None,
            brief_path: None,
            labels: BTreeMap::new(),
            last_error: None,
            attempts: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.duplicate_of.is_none() && self.stage != Stage::Duplicate
    }

    /// Clears everything derived from the file bytes and returns the record
    /// to `Indexed`.
    pub fn reset_derived(&mut self) {
        self.stage = Stage::Indexed;
        self.converted_text_path = None;
        self.brief_path = None;
        self.labels.clear();
        self.last_error = None;
        self.attempts = 0;
    }

    pub fn has_all_labels(&self) -> bool {
        Axis::ALL.iter().all(|axis| self.labels.contains_key(axis))
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.content_hash.clone())
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
    }
}
