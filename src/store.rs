//! Durable storage for the document index.
//!
//! The [`IndexStore`] trait is the seam between the pipeline and its
//! persisted state. [`SqliteIndexStore`] is the real backend;
//! [`MemoryIndexStore`] backs unit tests.
//!
//! Writes are per record, so a stage persists each document as soon as it
//! finishes and unrelated rows are never rewritten. Both stores funnel every
//! write through a single lock: concurrent stage workers may call
//! [`IndexStore::put`] freely, but the writes themselves never interleave.
//!
//! Paths are stored as UTF-8 text. A path that is not valid UTF-8 is refused
//! with [`IndexError::NonUtf8Path`] instead of being stored lossily under a
//! name that does not exist on disk.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;

use crate::error::{IndexError, IndexResult};
use crate::models::{Axis, DocumentRecord, Format, Label, Stage};

/// One finished command, kept for `shelf status`.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub id: String,
    pub command: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub report_json: String,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Every record, in scan order.
    async fn load_all(&self) -> IndexResult<Vec<DocumentRecord>>;

    async fn get(&self, path: &Path) -> IndexResult<Option<DocumentRecord>>;

    /// Inserts or replaces one record, including its labels.
    async fn put(&self, record: &DocumentRecord) -> IndexResult<()>;

    /// Writes several records atomically.
    async fn put_many(&self, records: &[DocumentRecord]) -> IndexResult<()> {
        self.apply(records, &[]).await
    }

    /// Upserts `puts` and deletes `removes` (with their labels) in one
    /// transaction. Either every change lands or none does.
    async fn apply(&self, puts: &[DocumentRecord], removes: &[PathBuf]) -> IndexResult<()>;

    async fn record_run(&self, run: &RunEntry) -> IndexResult<()>;

    async fn last_run(&self) -> IndexResult<Option<RunEntry>>;
}

// ============ SQLite ============

pub struct SqliteIndexStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn path_key(path: &Path) -> IndexResult<&str> {
    path.to_str()
        .ok_or_else(|| IndexError::NonUtf8Path(path.to_path_buf()))
}

fn corrupt(path: &str, what: impl std::fmt::Display) -> IndexError {
    IndexError::Corruption(format!("{}: {}", path, what))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> IndexResult<DocumentRecord> {
    let path: String = row.try_get("path")?;
    let stage_str: String = row.try_get("stage")?;
    let format_str: String = row.try_get("format")?;
    let size: i64 = row.try_get("size_bytes")?;
    let attempts: i64 = row.try_get("attempts")?;

    let stage = stage_str.parse::<Stage>().map_err(|e| corrupt(&path, e))?;
    let format = format_str.parse::<Format>().map_err(|e| corrupt(&path, e))?;
    if size < 0 || attempts < 0 {
        return Err(corrupt(&path, "negative size or attempt count"));
    }

    Ok(DocumentRecord {
        path: PathBuf::from(&path),
        content_hash: row.try_get("content_hash")?,
        size_bytes: size as u64,
        format,
        scan_seq: row.try_get("scan_seq")?,
        duplicate_of: row
            .try_get::<Option<String>, _>("duplicate_of")?
            .map(PathBuf::from),
        stage,
        converted_text_path: row
            .try_get::<Option<String>, _>("converted_path")?
            .map(PathBuf::from),
        brief_path: row
            .try_get::<Option<String>, _>("brief_path")?
            .map(PathBuf::from),
        labels: BTreeMap::new(),
        last_error: row.try_get("last_error")?,
        attempts: attempts as u32,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn write_record(
    conn: &mut sqlx::SqliteConnection,
    record: &DocumentRecord,
) -> IndexResult<()> {
    let path = path_key(&record.path)?;
    let duplicate_of = record.duplicate_of.as_deref().map(path_key).transpose()?;
    let converted = record
        .converted_text_path
        .as_deref()
        .map(path_key)
        .transpose()?;
    let brief = record.brief_path.as_deref().map(path_key).transpose()?;

    sqlx::query(
        r#"
        INSERT INTO documents (path, content_hash, size_bytes, format, scan_seq, duplicate_of,
                               stage, converted_path, brief_path, last_error, attempts, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            content_hash = excluded.content_hash,
            size_bytes = excluded.size_bytes,
            format = excluded.format,
            scan_seq = excluded.scan_seq,
            duplicate_of = excluded.duplicate_of,
            stage = excluded.stage,
            converted_path = excluded.converted_path,
            brief_path = excluded.brief_path,
            last_error = excluded.last_error,
            attempts = excluded.attempts,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(path)
    .bind(&record.content_hash)
    .bind(record.size_bytes as i64)
    .bind(record.format.as_str())
    .bind(record.scan_seq)
    .bind(duplicate_of)
    .bind(record.stage.as_str())
    .bind(converted)
    .bind(brief)
    .bind(&record.last_error)
    .bind(record.attempts as i64)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM labels WHERE path = ?")
        .bind(path)
        .execute(&mut *conn)
        .await?;

    for (axis, label) in &record.labels {
        sqlx::query("INSERT INTO labels (path, axis, category) VALUES (?, ?, ?)")
            .bind(path)
            .bind(axis.as_str())
            .bind(label.name())
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn load_all(&self) -> IndexResult<Vec<DocumentRecord>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY scan_seq, path")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        let mut by_path: HashMap<String, usize> = HashMap::new();
        for row in &rows {
            let key: String = row.try_get("path")?;
            by_path.insert(key, records.len());
            records.push(record_from_row(row)?);
        }

        let label_rows = sqlx::query("SELECT path, axis, category FROM labels")
            .fetch_all(&self.pool)
            .await?;
        for row in &label_rows {
            let path: String = row.try_get("path")?;
            let axis_str: String = row.try_get("axis")?;
            let category: String = row.try_get("category")?;
            let axis = axis_str.parse::<Axis>().map_err(|e| corrupt(&path, e))?;
            let idx = by_path
                .get(&path)
                .copied()
                .ok_or_else(|| corrupt(&path, "label for unknown document"))?;
            records[idx]
                .labels
                .insert(axis, Label::from_stored(&category));
        }

        Ok(records)
    }

    async fn get(&self, path: &Path) -> IndexResult<Option<DocumentRecord>> {
        let key = path_key(path)?;
        let row = sqlx::query("SELECT * FROM documents WHERE path = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let mut record = match row {
            Some(row) => record_from_row(&row)?,
            None => return Ok(None),
        };

        let label_rows = sqlx::query("SELECT axis, category FROM labels WHERE path = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        for row in &label_rows {
            let axis_str: String = row.try_get("axis")?;
            let category: String = row.try_get("category")?;
            let axis = axis_str.parse::<Axis>().map_err(|e| corrupt(key, e))?;
            record.labels.insert(axis, Label::from_stored(&category));
        }

        Ok(Some(record))
    }

    async fn put(&self, record: &DocumentRecord) -> IndexResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        write_record(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply(&self, puts: &[DocumentRecord], removes: &[PathBuf]) -> IndexResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for path in removes {
            let key = path_key(path)?;
            sqlx::query("DELETE FROM labels WHERE path = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM documents WHERE path = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        for record in puts {
            write_record(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_run(&self, run: &RunEntry) -> IndexResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "INSERT INTO runs (id, command, started_at, finished_at, report_json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.command)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.report_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_run(&self) -> IndexResult<Option<RunEntry>> {
        let row = sqlx::query(
            "SELECT id, command, started_at, finished_at, report_json FROM runs \
             ORDER BY finished_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(RunEntry {
            id: row.try_get("id")?,
            command: row.try_get("command")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            report_json: row.try_get("report_json")?,
        }))
    }
}

// ============ In-memory ============

/// Volatile store used by tests. Same semantics as the SQLite store.
#[derive(Default)]
pub struct MemoryIndexStore {
    records: RwLock<BTreeMap<PathBuf, DocumentRecord>>,
    runs: RwLock<Vec<RunEntry>>,
    write_lock: Mutex<()>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> IndexError {
    IndexError::Corruption("in-memory index lock poisoned".to_string())
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn load_all(&self) -> IndexResult<Vec<DocumentRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut all: Vec<DocumentRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.scan_seq.cmp(&b.scan_seq).then(a.path.cmp(&b.path)));
        Ok(all)
    }

    async fn get(&self, path: &Path) -> IndexResult<Option<DocumentRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(path).cloned())
    }

    async fn put(&self, record: &DocumentRecord) -> IndexResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(record.path.clone(), record.clone());
        Ok(())
    }

    async fn apply(&self, puts: &[DocumentRecord], removes: &[PathBuf]) -> IndexResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        for path in removes {
            records.remove(path);
        }
        for record in puts {
            records.insert(record.path.clone(), record.clone());
        }
        Ok(())
    }

    async fn record_run(&self, run: &RunEntry) -> IndexResult<()> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        runs.push(run.clone());
        Ok(())
    }

    async fn last_run(&self) -> IndexResult<Option<RunEntry>> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs.last().cloned())
    }
}
