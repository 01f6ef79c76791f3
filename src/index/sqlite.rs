// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! SQLite-backed vector index with brute-force cosine search

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::embed::{cosine_distance, from_blob, to_blob, Embedder};
use super::{IndexRecord, QueryHit, VectorIndex};
use crate::{ArchivistError, Result};

/// Vector index stored in a single SQLite table
#[derive(Clone)]
pub struct SqliteIndex {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
}

impl SqliteIndex {
    /// Open or create the index database
    pub fn open<P: AsRef<Path>>(path: P, embedder: Arc<dyn Embedder>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn, embedder)
    }

    /// Open an in-memory index (for testing)
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, embedder)
    }

    fn with_connection(conn: Connection, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let index = Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
        };
        index.initialize()?;
        Ok(index)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ArchivistError::Index("Index lock poisoned".to_string()))
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                fingerprint TEXT,
                embedder TEXT NOT NULL,
                embedding BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        )?;
        Ok(())
    }

    /// Stored document text for an id
    pub fn document(&self, id: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let document = conn
            .query_row(
                "SELECT document FROM records WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(document)
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, record: IndexRecord) -> Result<()> {
        let vector = self.embedder.embed(&record.document).await?;
        let embedder_id = self.embedder.id();

        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO records (id, document, fingerprint, embedder, embedding, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))"#,
            params![
                record.id,
                record.document,
                record.fingerprint,
                embedder_id,
                to_blob(&vector)
            ],
        )?;
        debug!(id = %record.id, "Upserted index record");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        debug!(id, removed, "Deleted index record");
        Ok(())
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<QueryHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text).await?;

        let rows: Vec<(String, Vec<u8>)> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare("SELECT id, embedding FROM records")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut scored: Vec<(f32, String)> = rows
            .into_iter()
            .map(|(id, blob)| (cosine_distance(&query, &from_blob(&blob)), id))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(distance, id)| QueryHit {
                id,
                distance: Some(distance),
            })
            .collect())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT id FROM records ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn fingerprint(&self, id: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let fingerprint: Option<Option<String>> = conn
            .query_row(
                "SELECT fingerprint FROM records WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fingerprint.flatten())
    }

    async fn count(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
