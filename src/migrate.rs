use anyhow::Result;
use sqlx::SqlitePool;

/// Create the index tables. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One embedded document per knowledge-base row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_documents (
            row_index INTEGER PRIMARY KEY,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-row metadata; `id` is pinned to 1
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_metadata (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            source_last_modified INTEGER NOT NULL,
            document_count INTEGER NOT NULL,
            built_at TEXT NOT NULL,
            build_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
