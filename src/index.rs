//! Vector index lifecycle: build, persist, load, and staleness.
//!
//! The index holds one embedded document per knowledge-base row, tagged with
//! its row index (the only link back to the [`RecordStore`]). It is persisted
//! in a small SQLite database next to a single metadata row:
//!
//! ```text
//! index_documents(row_index, content, embedding BLOB)
//! index_metadata(source_last_modified, document_count, built_at, build_id, model, dims)
//! ```
//!
//! # Staleness
//!
//! An index is valid only while the source file's modification time read
//! fresh from disk equals `source_last_modified`. Missing or unreadable
//! artifacts, a metadata row built for a different embedding model, or any
//! mtime mismatch force a rebuild.
//!
//! # Concurrency
//!
//! The cached index is an `Arc` swapped under an `RwLock`. Builds are
//! serialized by a separate mutex, and [`IndexManager::load_or_build`]
//! re-checks the cache after acquiring it, so concurrent callers that all
//! observe a stale index trigger a single rebuild.
//!
//! # Failure
//!
//! [`IndexManager::load_or_build`] never fails: any embedding or persistence
//! error yields `None` and retrieval falls back to the lexical strategies.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};
use crate::error::PipelineError;
use crate::migrate;
use crate::models::IndexMetadata;
use crate::records::RecordStore;

/// One embedded knowledge-base row.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub row_index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// An in-memory similarity index over the knowledge base.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    documents: Vec<IndexedDocument>,
    metadata: IndexMetadata,
}

/// A scored search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row_index: usize,
    pub score: f32,
}

impl VectorIndex {
    /// The `k` nearest documents by cosine similarity, best first.
    ///
    /// Equal scores are ordered by row index so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut hits: Vec<Neighbor> = self
            .documents
            .iter()
            .map(|doc| Neighbor {
                row_index: doc.row_index,
                score: cosine_similarity(query, &doc.embedding),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.row_index.cmp(&b.row_index))
        });
        hits.truncate(k);
        hits
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn documents(&self) -> &[IndexedDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Snapshot reported by `remedy index status` and the health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStatus {
    pub path: PathBuf,
    pub embedding_enabled: bool,
    pub stale: bool,
    pub cached: bool,
    pub metadata: Option<IndexMetadata>,
}

/// Owns the cached [`VectorIndex`] and its persisted form.
pub struct IndexManager {
    path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    cache: RwLock<Option<Arc<VectorIndex>>>,
    build_lock: Mutex<()>,
}

impl IndexManager {
    pub fn new(path: &Path, embedder: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            embedder,
            batch_size: batch_size.max(1),
            cache: RwLock::new(None),
            build_lock: Mutex::new(()),
        }
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The currently cached index, without any freshness check.
    pub async fn cached(&self) -> Option<Arc<VectorIndex>> {
        self.cache.read().await.clone()
    }

    /// Whether the persisted index must be rebuilt for `source`.
    pub async fn is_stale(&self, source: &Path) -> bool {
        let fresh = match source_mtime(source) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "source mtime unreadable, treating index as stale");
                return true;
            }
        };
        match self.read_metadata().await {
            Ok(Some(meta)) => !self.matches(&meta, fresh),
            Ok(None) => true,
            Err(e) => {
                debug!(error = %e, "index metadata unreadable, treating index as stale");
                true
            }
        }
    }

    /// Return a fresh index, loading or rebuilding it as needed.
    ///
    /// Returns `None` when embeddings are disabled, the knowledge base is
    /// empty, or the build fails.
    pub async fn load_or_build(&self, records: &RecordStore) -> Option<Arc<VectorIndex>> {
        if !self.embedder.is_enabled() {
            return None;
        }
        let source = records.source_path();
        let fresh = match source_mtime(source) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %source.display(), error = %e, "knowledge base mtime unavailable, semantic retrieval disabled");
                return None;
            }
        };

        if let Some(index) = self.fresh_cached(fresh).await {
            return Some(index);
        }

        let _guard = self.build_lock.lock().await;

        // Another caller may have finished a build while we waited.
        if let Some(index) = self.fresh_cached(fresh).await {
            return Some(index);
        }

        match self.read_persisted().await {
            Ok(Some(index)) if self.matches(index.metadata(), fresh) => {
                let index = Arc::new(index);
                *self.cache.write().await = Some(index.clone());
                debug!(documents = index.len(), "loaded persisted index");
                return Some(index);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "persisted index unreadable"),
        }

        match self.build_locked(records).await {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(error = %e, "index build failed, retrieval is lexical-only");
                None
            }
        }
    }

    /// Force a rebuild from `records`, replacing the cache on success.
    ///
    /// On failure the previous cache and persisted artifacts stay in place.
    pub async fn build(
        &self,
        records: &RecordStore,
    ) -> crate::error::Result<Arc<VectorIndex>> {
        let _guard = self.build_lock.lock().await;
        self.build_locked(records).await
    }

    pub async fn status(&self, source: &Path) -> IndexStatus {
        IndexStatus {
            path: self.path.clone(),
            embedding_enabled: self.embedder.is_enabled(),
            stale: self.is_stale(source).await,
            cached: self.cache.read().await.is_some(),
            metadata: self.read_metadata().await.ok().flatten(),
        }
    }

    // ============ internals ============

    fn matches(&self, meta: &IndexMetadata, fresh_mtime: i64) -> bool {
        meta.source_last_modified == fresh_mtime && meta.model == self.embedder.model_name()
    }

    async fn fresh_cached(&self, fresh_mtime: i64) -> Option<Arc<VectorIndex>> {
        let cached = self.cache.read().await.clone()?;
        if self.matches(cached.metadata(), fresh_mtime) {
            Some(cached)
        } else {
            None
        }
    }

    async fn build_locked(
        &self,
        records: &RecordStore,
    ) -> crate::error::Result<Arc<VectorIndex>> {
        if !self.embedder.is_enabled() {
            return Err(PipelineError::IndexBuild(
                "embedding provider is disabled".to_string(),
            ));
        }
        if records.is_empty() {
            return Err(PipelineError::IndexBuild(
                "knowledge base has no rows".to_string(),
            ));
        }

        // Captured before embedding so an edit during the build reads as stale.
        let mtime = source_mtime(records.source_path())
            .map_err(|e| PipelineError::IndexBuild(format!("{:#}", e)))?;

        let texts: Vec<String> = records
            .records()
            .iter()
            .map(|r| r.index_document())
            .collect();

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self
                .embedder
                .embed(batch)
                .await
                .map_err(|e| PipelineError::IndexBuild(format!("embedding failed: {:#}", e)))?;
            if embedded.len() != batch.len() {
                return Err(PipelineError::IndexBuild(format!(
                    "embedding returned {} vectors for {} documents",
                    embedded.len(),
                    batch.len()
                )));
            }
            vectors.extend(embedded);
        }

        let dims = self.embedder.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(PipelineError::IndexBuild(format!(
                "expected {}-dimensional vectors, got {}",
                dims,
                bad.len()
            )));
        }

        let documents: Vec<IndexedDocument> = texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(row_index, (content, embedding))| IndexedDocument {
                row_index,
                content,
                embedding,
            })
            .collect();

        let metadata = IndexMetadata {
            source_last_modified: mtime,
            document_count: documents.len(),
            built_at: Utc::now(),
            build_id: Uuid::new_v4(),
            model: self.embedder.model_name().to_string(),
            dims,
        };

        self.persist(&documents, &metadata)
            .await
            .map_err(|e| PipelineError::IndexBuild(format!("persist failed: {:#}", e)))?;

        let index = Arc::new(VectorIndex {
            documents,
            metadata,
        });
        *self.cache.write().await = Some(index.clone());

        info!(
            documents = index.len(),
            build_id = %index.metadata().build_id,
            model = %index.metadata().model,
            "vector index built"
        );
        Ok(index)
    }

    /// Replace persisted documents and metadata in one transaction.
    async fn persist(&self, documents: &[IndexedDocument], metadata: &IndexMetadata) -> Result<()> {
        let pool = db::connect(&self.path, true).await?;
        migrate::run_migrations(&pool).await?;

        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM index_documents")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_metadata")
            .execute(&mut *tx)
            .await?;

        for doc in documents {
            sqlx::query(
                "INSERT INTO index_documents (row_index, content, embedding) VALUES (?, ?, ?)",
            )
            .bind(doc.row_index as i64)
            .bind(&doc.content)
            .bind(vec_to_blob(&doc.embedding))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO index_metadata
                (id, source_last_modified, document_count, built_at, build_id, model, dims)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(metadata.source_last_modified)
        .bind(metadata.document_count as i64)
        .bind(metadata.built_at.to_rfc3339())
        .bind(metadata.build_id.to_string())
        .bind(&metadata.model)
        .bind(metadata.dims as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        pool.close().await;
        Ok(())
    }

    async fn open_existing(&self) -> Result<Option<SqlitePool>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(db::connect(&self.path, false).await?))
    }

    async fn read_metadata(&self) -> Result<Option<IndexMetadata>> {
        let Some(pool) = self.open_existing().await? else {
            return Ok(None);
        };
        let meta = fetch_metadata(&pool).await;
        pool.close().await;
        meta
    }

    async fn read_persisted(&self) -> Result<Option<VectorIndex>> {
        let Some(pool) = self.open_existing().await? else {
            return Ok(None);
        };
        let result = fetch_index(&pool).await;
        pool.close().await;
        result
    }
}

async fn fetch_metadata(pool: &SqlitePool) -> Result<Option<IndexMetadata>> {
    let row = sqlx::query(
        "SELECT source_last_modified, document_count, built_at, build_id, model, dims \
         FROM index_metadata WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let built_at: String = row.try_get("built_at")?;
    let build_id: String = row.try_get("build_id")?;
    let document_count: i64 = row.try_get("document_count")?;
    let dims: i64 = row.try_get("dims")?;

    Ok(Some(IndexMetadata {
        source_last_modified: row.try_get("source_last_modified")?,
        document_count: document_count as usize,
        built_at: DateTime::parse_from_rfc3339(&built_at)
            .context("invalid built_at")?
            .with_timezone(&Utc),
        build_id: Uuid::parse_str(&build_id).context("invalid build_id")?,
        model: row.try_get("model")?,
        dims: dims as usize,
    }))
}

async fn fetch_index(pool: &SqlitePool) -> Result<Option<VectorIndex>> {
    let Some(metadata) = fetch_metadata(pool).await? else {
        return Ok(None);
    };

    let rows = sqlx::query(
        "SELECT row_index, content, embedding FROM index_documents ORDER BY row_index",
    )
    .fetch_all(pool)
    .await?;

    let mut documents = Vec::with_capacity(rows.len());
    for row in rows {
        let row_index: i64 = row.try_get("row_index")?;
        let blob: Vec<u8> = row.try_get("embedding")?;
        let embedding = blob_to_vec(&blob);
        if embedding.len() != metadata.dims {
            anyhow::bail!(
                "row {} has {} dimensions, metadata says {}",
                row_index,
                embedding.len(),
                metadata.dims
            );
        }
        documents.push(IndexedDocument {
            row_index: row_index as usize,
            content: row.try_get("content")?,
            embedding,
        });
    }

    if documents.len() != metadata.document_count {
        anyhow::bail!(
            "index holds {} documents, metadata says {}",
            documents.len(),
            metadata.document_count
        );
    }

    Ok(Some(VectorIndex {
        documents,
        metadata,
    }))
}

/// Modification time of `path` in nanoseconds since the Unix epoch.
pub fn source_mtime(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .with_context(|| format!("cannot stat {}", path.display()))?
        .modified()?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .context("modification time before the Unix epoch")?
        .as_nanos();
    Ok(i64::try_from(nanos).unwrap_or(i64::MAX))
}
