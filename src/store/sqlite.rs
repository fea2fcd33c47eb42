//! SQLite durability for the document store.
//!
//! The in-memory snapshot is authoritative for reads. This backend only
//! records writes and replays them on open.

use std::path::Path;

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{EngineError, Result};
use crate::models::{Document, Locator, Passage};
use crate::{db, migrate};

/// Everything needed to rebuild the store's snapshots.
#[derive(Debug, Default)]
pub struct LoadedState {
    /// Live documents in ingestion order.
    pub documents: Vec<Document>,
    /// Passages of live documents, grouped by document in ingestion order.
    pub passages: Vec<Passage>,
    pub vectors: Vec<(String, Vec<f32>)>,
}

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect and migrate the database at `path`.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn load(&self) -> Result<LoadedState> {
        let doc_rows = sqlx::query(
            r#"
            SELECT id, subject_id, filename, content_type, ingested_at,
                   content_hash, size_bytes, passage_count
            FROM documents
            WHERE removed_at IS NULL
            ORDER BY ingested_at, rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let documents = doc_rows
            .iter()
            .map(|row| Document {
                id: row.get("id"),
                subject_id: row.get("subject_id"),
                filename: row.get("filename"),
                content_type: row.get("content_type"),
                ingested_at: row.get("ingested_at"),
                content_hash: row.get("content_hash"),
                size_bytes: row.get::<i64, _>("size_bytes") as u64,
                passage_count: row.get::<i64, _>("passage_count") as usize,
            })
            .collect();

        let passage_rows = sqlx::query(
            r#"
            SELECT p.id, p.document_id, d.subject_id, d.filename, p.seq,
                   p.text, p.locator_json, p.hash
            FROM passages p
            JOIN documents d ON d.id = p.document_id
            WHERE d.removed_at IS NULL
            ORDER BY d.ingested_at, d.rowid, p.seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut passages = Vec::with_capacity(passage_rows.len());
        for row in &passage_rows {
            let locator_json: Option<String> = row.get("locator_json");
            let locator = match locator_json {
                Some(json) => Some(
                    serde_json::from_str::<Locator>(&json)
                        .map_err(|e| EngineError::Storage(format!("bad locator: {}", e)))?,
                ),
                None => None,
            };
            passages.push(Passage {
                id: row.get("id"),
                document_id: row.get("document_id"),
                subject_id: row.get("subject_id"),
                filename: row.get("filename"),
                seq: row.get("seq"),
                text: row.get("text"),
                locator,
                hash: row.get("hash"),
            });
        }

        let vector_rows = sqlx::query(
            r#"
            SELECT v.passage_id, v.embedding
            FROM passage_vectors v
            JOIN passages p ON p.id = v.passage_id
            JOIN documents d ON d.id = p.document_id
            WHERE d.removed_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let vectors = vector_rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get::<String, _>("passage_id"), blob_to_vec(&blob))
            })
            .collect();

        Ok(LoadedState {
            documents,
            passages,
            vectors,
        })
    }

    /// Write a document, its passages and any vectors in one transaction.
    pub async fn insert_document(
        &self,
        doc: &Document,
        passages: &[Passage],
        vectors: &[(String, Vec<f32>)],
        model: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, subject_id, filename, content_type, ingested_at,
                                   content_hash, size_bytes, passage_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.subject_id)
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(doc.ingested_at)
        .bind(&doc.content_hash)
        .bind(doc.size_bytes as i64)
        .bind(doc.passage_count as i64)
        .execute(&mut *tx)
        .await?;

        for passage in passages {
            let locator_json = passage
                .locator
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            sqlx::query(
                "INSERT INTO passages (id, document_id, seq, text, locator_json, hash) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&passage.id)
            .bind(&passage.document_id)
            .bind(passage.seq)
            .bind(&passage.text)
            .bind(locator_json)
            .bind(&passage.hash)
            .execute(&mut *tx)
            .await?;
        }

        for (passage_id, vector) in vectors {
            sqlx::query(
                "INSERT INTO passage_vectors (passage_id, model, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(passage_id)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Soft-delete a document and destroy its passages.
    pub async fn remove_document(&self, document_id: &str, removed_at: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM passage_vectors WHERE passage_id IN (SELECT id FROM passages WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM passages WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE documents SET removed_at = ? WHERE id = ? AND removed_at IS NULL")
            .bind(removed_at)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
