use anyhow::Result;
use sqlx::SqlitePool;

/// Creates the index schema. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per discovered source path
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            format TEXT NOT NULL,
            scan_seq INTEGER NOT NULL,
            duplicate_of TEXT,
            stage TEXT NOT NULL,
            converted_path TEXT,
            brief_path TEXT,
            last_error TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Exactly one label per (document, axis)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS labels (
            path TEXT NOT NULL,
            axis TEXT NOT NULL,
            category TEXT NOT NULL,
            PRIMARY KEY (path, axis),
            FOREIGN KEY (path) REFERENCES documents(path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            command TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            report_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_stage ON documents(stage)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_labels_axis ON labels(axis, category)")
        .execute(pool)
        .await?;

    Ok(())
}
