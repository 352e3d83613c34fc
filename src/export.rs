//! Export the document index as JSON.
//!
//! Produces one object with every record (stage, derived paths, labels,
//! duplicate references) for external tools and spreadsheets.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::index;
use crate::models::DocumentRecord;
use crate::store::IndexStore;

#[derive(Serialize)]
struct ExportData {
    exported_at: i64,
    documents: Vec<DocumentRecord>,
}

pub async fn export_json(store: &dyn IndexStore) -> Result<String> {
    let data = ExportData {
        exported_at: chrono::Utc::now().timestamp(),
        documents: index::load(store).await?,
    };
    Ok(serde_json::to_string_pretty(&data)?)
}

/// Export the index.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(store: &dyn IndexStore, output: Option<&Path>) -> Result<()> {
    let json = export_json(store).await?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Exported index to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Axis, Format, Label, Stage};
    use crate::store::MemoryIndexStore;

    #[tokio::test]
    async fn export_includes_labels_and_duplicates() {
        let store = MemoryIndexStore::new();
        let mut a = DocumentRecord::new("/d/a.pdf".into(), "h".into(), 1, Format::Pdf);
        a.scan_seq = 1;
        a.stage = Stage::Classified;
        a.converted_text_path = Some("/ws/a.md".into());
        a.brief_path = Some("/ws/b.md".into());
        for axis in Axis::ALL {
            a.labels.insert(axis, Label::Category("x".into()));
        }
        let mut b = DocumentRecord::new("/d/b.pdf".into(), "h".into(), 1, Format::Pdf);
        b.scan_seq = 2;
        b.stage = Stage::Duplicate;
        b.duplicate_of = Some(a.path.clone());
        store.put_many(&[a, b]).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&export_json(&store).await.unwrap()).unwrap();
        let docs = json["documents"].as_array().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["labels"]["topic"], "x");
        assert_eq!(docs[0]["stage"], "classified");
        assert_eq!(docs[1]["duplicate_of"], "/d/a.pdf");
    }

    #[tokio::test]
    async fn export_writes_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("out/index.json");
        run_export(&MemoryIndexStore::new(), Some(&out)).await.unwrap();
        assert!(std::fs::read_to_string(out).unwrap().contains("\"documents\": []"));
    }
}
