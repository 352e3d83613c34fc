//! Link-based classification views.
//!
//! For every classified canonical document and every axis there is one
//! symbolic link `views/<axis>/<category>/<file name>` pointing at the
//! original source file. The source stays the only stored copy; the three
//! trees are index-only structures.
//!
//! When two different documents share a file name inside one category, the
//! second link gets the short content hash appended to its stem
//! (`report-1a2b3c4d.pdf`). Only symbolic links are ever created or
//! removed here; a regular file found in a view directory is left alone.
//!
//! Every operation is blocking filesystem work. Async callers go through
//! [`ViewTree::blocking`], which runs it on tokio's blocking pool.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::models::{Axis, DocumentRecord, Label, Stage};

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize)]
pub struct RebuildSummary {
    pub created: usize,
    pub kept: usize,
    pub removed: usize,
}

pub struct ViewTree {
    root: PathBuf,
    lock: Mutex<()>,
}

impl ViewTree {
    pub fn new(root: &Path) -> Self {
        Self {
            root: crate::discover::absolute(root),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `op` against this tree on the blocking thread pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> io::Result<T>
    where
        F: FnOnce(&ViewTree) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tree = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&tree))
            .await
            .map_err(io::Error::other)?
    }

    pub fn category_dir(&self, axis: Axis, label: &Label) -> PathBuf {
        self.root.join(axis.as_str()).join(label.name())
    }

    fn guard(&self) -> io::Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| io::Error::other("view lock poisoned"))
    }

    /// Makes sure `record` is linked under `axis/label`. Returns the link
    /// path and whether it was newly created.
    pub fn link(&self, axis: Axis, label: &Label, record: &DocumentRecord) -> io::Result<(PathBuf, bool)> {
        let _guard = self.guard()?;
        let dir = self.category_dir(axis, label);
        std::fs::create_dir_all(&dir)?;

        for name in candidate_names(record) {
            let link = dir.join(&name);
            match std::fs::symlink_metadata(&link) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    make_symlink(&record.path, &link)?;
                    return Ok((link, true));
                }
                Err(e) => return Err(e),
                Ok(meta) => {
                    if meta.file_type().is_symlink() && points_at(&link, &record.path) {
                        return Ok((link, false));
                    }
                }
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "no free link name for {} in {}",
                record.path.display(),
                dir.display()
            ),
        ))
    }

    /// Existing link for `record` under `axis/label`, if any.
    pub fn find_link(&self, axis: Axis, label: &Label, record: &DocumentRecord) -> Option<PathBuf> {
        let dir = self.category_dir(axis, label);
        candidate_names(record)
            .into_iter()
            .map(|name| dir.join(name))
            .find(|link| link.is_symlink() && points_at(link, &record.path))
    }

    /// Removes every link to `record` on one axis, whatever the category.
    pub fn unlink_axis(&self, axis: Axis, record: &DocumentRecord) -> io::Result<usize> {
        let _guard = self.guard()?;
        let axis_dir = self.root.join(axis.as_str());
        if !axis_dir.is_dir() {
            return Ok(0);
        }

        let names = candidate_names(record);
        let mut removed = 0;
        for entry in std::fs::read_dir(&axis_dir)? {
            let category_dir = entry?.path();
            if !category_dir.is_dir() {
                continue;
            }
            for name in &names {
                let link = category_dir.join(name);
                if link.is_symlink() && points_at(&link, &record.path) {
                    std::fs::remove_file(&link)?;
                    removed += 1;
                }
            }
            remove_if_empty(&category_dir);
        }
        Ok(removed)
    }

    /// Removes `record`'s links from all three axes.
    pub fn unlink_all(&self, record: &DocumentRecord) -> io::Result<usize> {
        let mut removed = 0;
        for axis in Axis::ALL {
            removed += self.unlink_axis(axis, record)?;
        }
        Ok(removed)
    }

    /// Moves one axis of `record` to `label`, leaving other axes alone.
    pub fn relabel(&self, axis: Axis, label: &Label, record: &DocumentRecord) -> io::Result<PathBuf> {
        self.unlink_axis(axis, record)?;
        let (link, _) = self.link(axis, label, record)?;
        Ok(link)
    }

    /// Recreates every expected link from `records` and removes view links
    /// that no longer correspond to a label.
    pub fn rebuild(&self, records: &[DocumentRecord]) -> io::Result<RebuildSummary> {
        let expected: HashSet<(Axis, String, PathBuf)> = records
            .iter()
            .filter(|r| r.stage == Stage::Classified && r.is_canonical())
            .flat_map(|r| {
                r.labels
                    .iter()
                    .map(move |(axis, label)| (*axis, label.name().to_string(), r.path.clone()))
            })
            .collect();

        let mut summary = RebuildSummary::default();
        {
            let _guard = self.guard()?;
            for axis in Axis::ALL {
                let axis_dir = self.root.join(axis.as_str());
                if !axis_dir.is_dir() {
                    continue;
                }
                for category in std::fs::read_dir(&axis_dir)? {
                    let category_dir = category?.path();
                    if !category_dir.is_dir() {
                        continue;
                    }
                    let category_name = category_dir
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    for entry in std::fs::read_dir(&category_dir)? {
                        let link = entry?.path();
                        if !link.is_symlink() {
                            continue;
                        }
                        let target = std::fs::read_link(&link)?;
                        let key = (axis, category_name.clone(), target);
                        if !expected.contains(&key) {
                            std::fs::remove_file(&link)?;
                            summary.removed += 1;
                        }
                    }
                    remove_if_empty(&category_dir);
                }
            }
        }

        for record in records
            .iter()
            .filter(|r| r.stage == Stage::Classified && r.is_canonical())
        {
            for (axis, label) in &record.labels {
                let (_, created) = self.link(*axis, label, record)?;
                if created {
                    summary.created += 1;
                } else {
                    summary.kept += 1;
                }
            }
        }

        Ok(summary)
    }
}

/// Link names tried in order: the plain file name, then the name with a
/// short content hash.
fn candidate_names(record: &DocumentRecord) -> Vec<String> {
    let plain = record.file_name();
    let short_hash: String = record.content_hash.chars().take(8).collect();
    let stem = record
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| plain.clone());
    let tagged = match record.path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, short_hash, ext.to_string_lossy()),
        None => format!("{}-{}", stem, short_hash),
    };
    vec![plain, tagged]
}

fn points_at(link: &Path, target: &Path) -> bool {
    std::fs::read_link(link)
        .map(|t| t == target)
        .unwrap_or(false)
}

fn remove_if_empty(dir: &Path) {
    let empty = std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        let _ = std::fs::remove_dir(dir);
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
