use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::ScanConfig;
use crate::error::DiscoveryError;
use crate::models::Format;

/// A recognized document found on disk.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub format: Format,
}

#[derive(Debug, Default)]
pub struct Discovery {
    /// Recognized files in stable scan order.
    pub files: Vec<DiscoveredFile>,
    pub errors: Vec<DiscoveryError>,
    pub unsupported: usize,
    pub oversized: usize,
}

/// Expands `inputs` into recognized documents.
///
/// Directories are walked recursively with entries sorted by name, so the
/// order is a stable total order for a fixed directory listing. Anything
/// under `excluded_roots` (the workspace and the view trees) is never
/// entered.
pub fn discover(
    inputs: &[PathBuf],
    scan: &ScanConfig,
    excluded_roots: &[PathBuf],
) -> Result<Discovery> {
    let exclude_set = build_globset(&scan.exclude_globs)?;
    let allowed_ext: HashSet<String> = scan
        .extensions
        .iter()
        .map(|e| normalize_ext(e))
        .collect();
    let excluded_roots: Vec<PathBuf> = excluded_roots.iter().map(|p| absolute(p)).collect();
    let excluded_dirs: HashSet<&str> = scan.exclude_dirs.iter().map(String::as_str).collect();

    let mut out = Discovery::default();
    let mut seen = HashSet::new();

    for input in inputs {
        let root = match std::fs::canonicalize(input) {
            Ok(p) => p,
            Err(e) => {
                out.errors.push(DiscoveryError {
                    path: input.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if is_under_any(&root, &excluded_roots) {
            tracing::warn!(path = %root.display(), "input lies inside the workspace or views; skipped");
            continue;
        }

        let walker = WalkDir::new(&root)
            .follow_links(scan.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || (!is_excluded_dir(entry, &excluded_dirs)
                        && !is_under_any(entry.path(), &excluded_roots))
            });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| root.clone());
                    out.errors.push(DiscoveryError {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if path.to_str().is_none() {
                out.errors.push(DiscoveryError {
                    path: path.to_path_buf(),
                    reason: "file name is not valid UTF-8".to_string(),
                });
                continue;
            }
            let relative = path.strip_prefix(&root).unwrap_or(path);
            if !relative.as_os_str().is_empty() && exclude_set.is_match(relative) {
                continue;
            }

            let ext = path
                .extension()
                .map(|e| normalize_ext(&e.to_string_lossy()))
                .unwrap_or_default();
            let format = match Format::from_extension(&ext) {
                Some(f) if allowed_ext.contains(&ext) => f,
                _ => {
                    out.unsupported += 1;
                    continue;
                }
            };

            let size_bytes = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    out.errors.push(DiscoveryError {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if size_bytes > scan.max_file_bytes {
                out.oversized += 1;
                continue;
            }

            if seen.insert(path.to_path_buf()) {
                out.files.push(DiscoveredFile {
                    path: path.to_path_buf(),
                    size_bytes,
                    format,
                });
            }
        }
    }

    Ok(out)
}

fn is_excluded_dir(entry: &DirEntry, excluded: &HashSet<&str>) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || excluded.contains(name.as_ref())
}

fn is_under_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

fn normalize_ext(ext: &str) -> String {
    let lower = ext.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

/// Best-effort absolute form of `path`; canonical when it exists.
pub fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
