//! The Document Index: scanning, duplicate grouping, and validated loading.
//!
//! `scan` walks the inputs (see [`crate::discover`]), fingerprints every
//! recognized file on a bounded pool while keeping scan order, and merges the
//! results into the persisted records:
//!
//! - a new path gets the next scan sequence number and starts `Indexed`;
//! - an unchanged path keeps its record byte-for-byte, so stage progress is
//!   untouched and re-scans are idempotent;
//! - a path whose bytes changed loses all derived state (converted text,
//!   brief, labels, view links) and takes a fresh sequence number.
//!
//! Duplicate groups are then recomputed over all records: within one content
//! hash the record with the lowest sequence number is canonical and every
//! other member is `Duplicate` with `duplicate_of` pointing at it. Failure of
//! the canonical never promotes a duplicate; only the canonical leaving the
//! group (pruned or edited) does.
//!
//! Pruned records and every record touched by the regrouping are written in
//! a single [`IndexStore::apply`], so an interrupted scan leaves the previous
//! index intact.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::discover::Discovery;
use crate::error::{IndexError, IndexResult};
use crate::fingerprint::fingerprint;
use crate::models::{DocumentRecord, Stage};
use crate::store::IndexStore;
use crate::views::ViewTree;

/// Outcome of one `scan`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanSummary {
    /// Recognized files found on disk this scan.
    pub scanned: usize,
    pub new: usize,
    pub unchanged: usize,
    pub changed: usize,
    /// Records currently marked duplicate among the scanned files.
    pub duplicates: usize,
    /// Canonical scanned records waiting for conversion.
    pub eligible: usize,
    pub unsupported: usize,
    pub oversized: usize,
    /// Paths that could not be read or hashed, with the reason.
    pub errors: Vec<(PathBuf, String)>,
    /// Indexed paths that no longer exist.
    pub vanished: Vec<PathBuf>,
    pub pruned: usize,
    /// Canonical records that became duplicates or the reverse.
    pub regrouped: usize,
}

pub struct ScanOptions {
    /// Parallel hashing width.
    pub workers: usize,
    /// Drop records whose source path vanished.
    pub prune: bool,
}

/// Loads every record and checks the cross-record invariants.
pub async fn load(store: &dyn IndexStore) -> IndexResult<Vec<DocumentRecord>> {
    let records = store.load_all().await?;
    validate(&records)?;
    Ok(records)
}

/// Cross-record consistency checks. Any violation is corruption.
pub fn validate(records: &[DocumentRecord]) -> IndexResult<()> {
    let by_path: HashMap<&Path, &DocumentRecord> =
        records.iter().map(|r| (r.path.as_path(), r)).collect();
    let mut canonical_by_hash: HashMap<&str, &Path> = HashMap::new();

    for record in records {
        let path = record.path.display();
        match (&record.duplicate_of, record.stage) {
            (Some(target), Stage::Duplicate) => {
                let canonical = by_path.get(target.as_path()).ok_or_else(|| {
                    IndexError::Corruption(format!(
                        "{} is a duplicate of unknown record {}",
                        path,
                        target.display()
                    ))
                })?;
                if !canonical.is_canonical() {
                    return Err(IndexError::Corruption(format!(
                        "{} points at {}, which is itself a duplicate",
                        path,
                        target.display()
                    )));
                }
                if canonical.content_hash != record.content_hash {
                    return Err(IndexError::Corruption(format!(
                        "{} and its canonical {} have different hashes",
                        path,
                        target.display()
                    )));
                }
            }
            (None, Stage::Duplicate) => {
                return Err(IndexError::Corruption(format!(
                    "{} is marked duplicate without a canonical record",
                    path
                )))
            }
            (Some(_), stage) => {
                return Err(IndexError::Corruption(format!(
                    "{} has a canonical reference but stage {}",
                    path, stage
                )))
            }
            (None, stage) => {
                if let Some(other) = canonical_by_hash.insert(&record.content_hash, &record.path) {
                    return Err(IndexError::Corruption(format!(
                        "{} and {} are both canonical for the same content",
                        other.display(),
                        path
                    )));
                }
                if stage.rank() >= 1 && record.converted_text_path.is_none() {
                    return Err(IndexError::Corruption(format!(
                        "{} is {} but has no converted text",
                        path, stage
                    )));
                }
                if stage.rank() >= 2 && record.brief_path.is_none() {
                    return Err(IndexError::Corruption(format!(
                        "{} is {} but has no brief",
                        path, stage
                    )));
                }
                if stage == Stage::Classified && !record.has_all_labels() {
                    return Err(IndexError::Corruption(format!(
                        "{} is classified but misses an axis label",
                        path
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Merges a discovery pass into the index and persists the changed records
/// as one batch.
pub async fn scan(
    store: &dyn IndexStore,
    discovery: Discovery,
    options: &ScanOptions,
    views: Option<&Arc<ViewTree>>,
) -> Result<ScanSummary> {
    let existing = load(store).await?;
    let original: HashMap<PathBuf, DocumentRecord> = existing
        .iter()
        .map(|r| (r.path.clone(), r.clone()))
        .collect();
    let mut records: BTreeMap<PathBuf, DocumentRecord> = existing
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect();
    let mut next_seq = records.values().map(|r| r.scan_seq).max().unwrap_or(0) + 1;

    let mut summary = ScanSummary {
        unsupported: discovery.unsupported,
        oversized: discovery.oversized,
        errors: discovery
            .errors
            .iter()
            .map(|e| (e.path.clone(), e.reason.clone()))
            .collect(),
        ..ScanSummary::default()
    };

    // `buffered` keeps input order, so sequence numbers follow scan order.
    let hashed: Vec<_> = stream::iter(discovery.files)
        .map(|file| async move {
            let path = file.path.clone();
            let hash = tokio::task::spawn_blocking(move || fingerprint(&path))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map_err(|e| e.to_string()));
            (file, hash)
        })
        .buffered(options.workers.max(1))
        .collect()
        .await;

    let mut seen: Vec<PathBuf> = Vec::new();
    let mut invalidated: Vec<DocumentRecord> = Vec::new();

    for (file, hash) in hashed {
        let hash = match hash {
            Ok(h) => h,
            Err(reason) => {
                tracing::warn!(path = %file.path.display(), %reason, "cannot fingerprint");
                summary.errors.push((file.path, reason));
                continue;
            }
        };
        summary.scanned += 1;
        seen.push(file.path.clone());

        match records.get_mut(&file.path) {
            Some(record) if record.content_hash == hash => summary.unchanged += 1,
            Some(record) => {
                tracing::info!(path = %file.path.display(), "content changed; derived state reset");
                summary.changed += 1;
                invalidated.push(record.clone());
                record.reset_derived();
                record.duplicate_of = None;
                record.content_hash = hash;
                record.size_bytes = file.size_bytes;
                record.format = file.format;
                record.scan_seq = next_seq;
                next_seq += 1;
            }
            None => {
                summary.new += 1;
                let mut record =
                    DocumentRecord::new(file.path.clone(), hash, file.size_bytes, file.format);
                record.scan_seq = next_seq;
                next_seq += 1;
                records.insert(file.path, record);
            }
        }
    }

    let vanished: Vec<PathBuf> = records
        .keys()
        .filter(|p| !p.exists())
        .cloned()
        .collect();
    let mut pruned: Vec<PathBuf> = Vec::new();
    for path in &vanished {
        if options.prune {
            if let Some(record) = records.remove(path) {
                invalidated.push(record);
            }
            pruned.push(path.clone());
        } else {
            tracing::warn!(path = %path.display(), "indexed file no longer exists");
        }
    }
    summary.pruned = pruned.len();
    summary.vanished = vanished;

    summary.regrouped = regroup(&mut records, &mut invalidated);

    let dirty: Vec<DocumentRecord> = records
        .values()
        .filter(|r| original.get(&r.path) != Some(*r))
        .map(|r| {
            let mut r = r.clone();
            r.touch();
            r
        })
        .collect();
    // Removals and regrouped survivors land together or not at all.
    if !dirty.is_empty() || !pruned.is_empty() {
        store
            .apply(&dirty, &pruned)
            .await
            .context("Failed to persist scan results")?;
    }

    if let Some(views) = views.filter(|_| !invalidated.is_empty()) {
        let unlinked = views
            .blocking(move |views| {
                for record in &invalidated {
                    if let Err(e) = views.unlink_all(record) {
                        tracing::warn!(path = %record.path.display(), error = %e, "cannot remove view links");
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = unlinked {
            tracing::warn!(error = %e, "view cleanup aborted");
        }
    }

    for path in &seen {
        if let Some(record) = records.get(path) {
            if record.stage == Stage::Duplicate {
                summary.duplicates += 1;
            } else if matches!(record.stage, Stage::Indexed | Stage::ConversionFailed) {
                summary.eligible += 1;
            }
        }
    }

    tracing::info!(
        scanned = summary.scanned,
        new = summary.new,
        changed = summary.changed,
        duplicates = summary.duplicates,
        "scan complete"
    );
    Ok(summary)
}

/// Recomputes duplicate groups. Returns how many records switched between
/// canonical and duplicate; records losing derived state are appended to
/// `invalidated`.
fn regroup(
    records: &mut BTreeMap<PathBuf, DocumentRecord>,
    invalidated: &mut Vec<DocumentRecord>,
) -> usize {
    let mut groups: HashMap<String, Vec<(i64, PathBuf)>> = HashMap::new();
    for record in records.values() {
        groups
            .entry(record.content_hash.clone())
            .or_default()
            .push((record.scan_seq, record.path.clone()));
    }

    let mut switched = 0;
    for mut members in groups.into_values() {
        members.sort();
        let canonical = members[0].1.clone();

        for (i, (_, path)) in members.iter().enumerate() {
            let Some(record) = records.get_mut(path) else {
                continue;
            };
            if i == 0 {
                if !record.is_canonical() {
                    tracing::info!(path = %path.display(), "promoted to canonical");
                    record.reset_derived();
                    record.duplicate_of = None;
                    switched += 1;
                }
            } else if record.duplicate_of.as_ref() != Some(&canonical)
                || record.stage != Stage::Duplicate
            {
                if record.is_canonical() {
                    switched += 1;
                    invalidated.push(record.clone());
                }
                record.reset_derived();
                record.stage = Stage::Duplicate;
                record.duplicate_of = Some(canonical.clone());
            }
        }
    }
    switched
}

/// Clears the attempt counter of failed records so the next stage run
/// tries them again. Returns how many records were reset.
pub async fn retry(store: &dyn IndexStore) -> Result<usize> {
    let mut reset = Vec::new();
    for mut record in load(store).await? {
        if record.stage.is_failed() && record.attempts > 0 {
            record.attempts = 0;
            record.touch();
            reset.push(record);
        }
    }
    if !reset.is_empty() {
        store.put_many(&reset).await?;
    }
    Ok(reset.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::discover::discover;
    use crate::models::{Axis, Label};
    use crate::store::MemoryIndexStore;
    use tempfile::TempDir;

    fn opts(prune: bool) -> ScanOptions {
        ScanOptions { workers: 4, prune }
    }

    async fn scan_dir(store: &MemoryIndexStore, dir: &Path, prune: bool) -> ScanSummary {
        let discovery = discover(&[dir.to_path_buf()], &ScanConfig::default(), &[]).unwrap();
        scan(store, discovery, &opts(prune), None).await.unwrap()
    }

    fn by_name<'a>(records: &'a [DocumentRecord], name: &str) -> &'a DocumentRecord {
        records
            .iter()
            .find(|r| r.path.file_name().unwrap() == name)
            .unwrap()
    }

    fn pdf_pair_and_docx(tmp: &TempDir) -> PathBuf {
        let dir = tmp.path().join("docs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.pdf"), b"%PDF same bytes").unwrap();
        std::fs::write(dir.join("b.pdf"), b"%PDF same bytes").unwrap();
        std::fs::write(dir.join("c.docx"), b"PK other bytes").unwrap();
        dir
    }

    #[tokio::test]
    async fn identical_files_share_one_canonical() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();

        let summary = scan_dir(&store, &dir, false).await;
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.eligible, 2);

        let records = load(&store).await.unwrap();
        assert_eq!(records.len(), 3);
        let a = by_name(&records, "a.pdf");
        let b = by_name(&records, "b.pdf");
        assert!(a.is_canonical());
        assert_eq!(b.stage, Stage::Duplicate);
        assert_eq!(b.duplicate_of.as_deref(), Some(a.path.as_path()));
    }

    #[tokio::test]
    async fn rescan_of_unchanged_directory_is_identical() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();

        scan_dir(&store, &dir, false).await;
        let first = load(&store).await.unwrap();
        let summary = scan_dir(&store, &dir, false).await;
        let second = load(&store).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(summary.new, 0);
        assert_eq!(summary.unchanged, 3);
    }

    #[tokio::test]
    async fn rescan_keeps_stage_progress() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();
        scan_dir(&store, &dir, false).await;

        let mut a = store.get(&dir.canonicalize().unwrap().join("a.pdf")).await.unwrap().unwrap();
        a.stage = Stage::Converted;
        a.converted_text_path = Some("/ws/converted/a.md".into());
        store.put(&a).await.unwrap();

        scan_dir(&store, &dir, false).await;
        let again = store.get(&a.path).await.unwrap().unwrap();
        assert_eq!(again.stage, Stage::Converted);
    }

    #[tokio::test]
    async fn changed_bytes_reset_derived_state() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();
        scan_dir(&store, &dir, false).await;

        let c_path = dir.canonicalize().unwrap().join("c.docx");
        let mut c = store.get(&c_path).await.unwrap().unwrap();
        c.stage = Stage::Classified;
        c.converted_text_path = Some("/ws/c.md".into());
        c.brief_path = Some("/ws/c.brief.md".into());
        for axis in Axis::ALL {
            c.labels.insert(axis, Label::Uncategorized);
        }
        store.put(&c).await.unwrap();

        std::fs::write(&c_path, b"PK edited bytes").unwrap();
        let summary = scan_dir(&store, &dir, false).await;
        assert_eq!(summary.changed, 1);

        let c = store.get(&c_path).await.unwrap().unwrap();
        assert_eq!(c.stage, Stage::Indexed);
        assert!(c.labels.is_empty());
        assert!(c.converted_text_path.is_none());
    }

    #[tokio::test]
    async fn canonical_failure_never_promotes_duplicate() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();
        scan_dir(&store, &dir, false).await;

        let a_path = dir.canonicalize().unwrap().join("a.pdf");
        let mut a = store.get(&a_path).await.unwrap().unwrap();
        a.stage = Stage::ConversionFailed;
        a.attempts = 3;
        store.put(&a).await.unwrap();

        scan_dir(&store, &dir, false).await;
        let records = load(&store).await.unwrap();
        assert_eq!(by_name(&records, "a.pdf").stage, Stage::ConversionFailed);
        assert_eq!(by_name(&records, "b.pdf").stage, Stage::Duplicate);
    }

    #[tokio::test]
    async fn vanished_canonical_is_kept_unless_pruned() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();
        scan_dir(&store, &dir, false).await;

        std::fs::remove_file(dir.join("a.pdf")).unwrap();
        let summary = scan_dir(&store, &dir, false).await;
        assert_eq!(summary.vanished.len(), 1);
        assert_eq!(load(&store).await.unwrap().len(), 3);

        let summary = scan_dir(&store, &dir, true).await;
        assert_eq!(summary.pruned, 1);
        let records = load(&store).await.unwrap();
        assert_eq!(records.len(), 2);
        let b = by_name(&records, "b.pdf");
        assert!(b.is_canonical());
        assert_eq!(b.stage, Stage::Indexed);
    }

    /// Reads from the inner store, refuses every write.
    struct ReadOnlyStore(MemoryIndexStore);

    #[async_trait::async_trait]
    impl IndexStore for ReadOnlyStore {
        async fn load_all(&self) -> IndexResult<Vec<DocumentRecord>> {
            self.0.load_all().await
        }

        async fn get(&self, path: &Path) -> IndexResult<Option<DocumentRecord>> {
            self.0.get(path).await
        }

        async fn put(&self, _record: &DocumentRecord) -> IndexResult<()> {
            Err(IndexError::Io(std::io::Error::other("disk full")))
        }

        async fn apply(&self, _puts: &[DocumentRecord], _removes: &[PathBuf]) -> IndexResult<()> {
            Err(IndexError::Io(std::io::Error::other("disk full")))
        }

        async fn record_run(&self, run: &crate::store::RunEntry) -> IndexResult<()> {
            self.0.record_run(run).await
        }

        async fn last_run(&self) -> IndexResult<Option<crate::store::RunEntry>> {
            self.0.last_run().await
        }
    }

    #[tokio::test]
    async fn failed_prune_leaves_index_loadable() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();
        scan_dir(&store, &dir, false).await;
        let before = load(&store).await.unwrap();

        std::fs::remove_file(dir.join("a.pdf")).unwrap();
        let failing = ReadOnlyStore(store);
        let discovery = discover(&[dir.clone()], &ScanConfig::default(), &[]).unwrap();
        assert!(scan(&failing, discovery, &opts(true), None).await.is_err());

        let after = load(&failing.0).await.unwrap();
        assert_eq!(after, before);

        // The same prune succeeds once writes work again.
        let summary = scan_dir(&failing.0, &dir, true).await;
        assert_eq!(summary.pruned, 1);
        let records = load(&failing.0).await.unwrap();
        assert!(by_name(&records, "b.pdf").is_canonical());
    }

    #[tokio::test]
    async fn non_utf8_file_is_skipped_and_rescans_stay_valid() {
        use std::os::unix::ffi::OsStrExt;
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("docs");
        std::fs::create_dir_all(&dir).unwrap();
        let name = std::ffi::OsStr::from_bytes(b"caf\xe9.txt");
        std::fs::write(dir.join(name), b"menu").unwrap();
        std::fs::write(dir.join("menu.txt"), b"menu").unwrap();

        let store = MemoryIndexStore::new();
        let first = scan_dir(&store, &dir, false).await;
        assert_eq!(first.scanned, 1);
        assert_eq!(first.errors.len(), 1);

        let second = scan_dir(&store, &dir, false).await;
        assert_eq!(second.new, 0);
        assert!(second.vanished.is_empty());
        let records = load(&store).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_canonical());
    }

    #[tokio::test]
    async fn edited_file_matching_another_becomes_duplicate() {
        let tmp = TempDir::new().unwrap();
        let dir = pdf_pair_and_docx(&tmp);
        let store = MemoryIndexStore::new();
        scan_dir(&store, &dir, false).await;

        std::fs::write(dir.join("c.docx"), b"%PDF same bytes").unwrap();
        scan_dir(&store, &dir, false).await;
        let records = load(&store).await.unwrap();
        let a = by_name(&records, "a.pdf");
        let c = by_name(&records, "c.docx");
        assert_eq!(c.stage, Stage::Duplicate);
        assert_eq!(c.duplicate_of.as_deref(), Some(a.path.as_path()));
    }

    #[tokio::test]
    async fn dangling_duplicate_reference_is_corruption() {
        let store = MemoryIndexStore::new();
        let mut dup = DocumentRecord::new("/b.pdf".into(), "h".into(), 1, crate::models::Format::Pdf);
        dup.stage = Stage::Duplicate;
        dup.duplicate_of = Some("/a.pdf".into());
        store.put(&dup).await.unwrap();
        assert!(matches!(load(&store).await, Err(IndexError::Corruption(_))));
    }

    #[tokio::test]
    async fn two_canonicals_for_one_hash_is_corruption() {
        let store = MemoryIndexStore::new();
        let fmt = crate::models::Format::Pdf;
        store.put(&DocumentRecord::new("/a.pdf".into(), "h".into(), 1, fmt)).await.unwrap();
        store.put(&DocumentRecord::new("/b.pdf".into(), "h".into(), 1, fmt)).await.unwrap();
        assert!(matches!(load(&store).await, Err(IndexError::Corruption(_))));
    }

    #[tokio::test]
    async fn retry_resets_failed_attempts() {
        let store = MemoryIndexStore::new();
        let mut failed =
            DocumentRecord::new("/a.pdf".into(), "h".into(), 1, crate::models::Format::Pdf);
        failed.stage = Stage::ConversionFailed;
        failed.attempts = 3;
        store.put(&failed).await.unwrap();

        assert_eq!(retry(&store).await.unwrap(), 1);
        let record = store.get(Path::new("/a.pdf")).await.unwrap().unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.stage, Stage::ConversionFailed);
        assert_eq!(retry(&store).await.unwrap(), 0);
    }
}
