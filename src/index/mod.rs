// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Semantic index keyed by archive-relative path

pub mod embed;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use embed::{Embedder, HashEmbedder, OllamaEmbedder};
pub use sqlite::SqliteIndex;

/// One indexed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Archive-relative path, `/`-separated
    pub id: String,
    /// Text that gets embedded
    pub document: String,
    /// blake3 of the file bytes at index time
    pub fingerprint: Option<String>,
}

impl IndexRecord {
    pub fn new(id: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: document.into(),
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, bytes: &[u8]) -> Self {
        self.fingerprint = Some(fingerprint(bytes));
        self
    }
}

/// A nearest-neighbour result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub id: String,
    pub distance: Option<f32>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the record with this id
    async fn upsert(&self, record: IndexRecord) -> Result<()>;

    /// Remove a record; unknown ids are not an error
    async fn delete(&self, id: &str) -> Result<()>;

    /// Closest records first
    async fn query(&self, text: &str, k: usize) -> Result<Vec<QueryHit>>;

    async fn list_ids(&self) -> Result<Vec<String>>;

    async fn fingerprint(&self, _id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.list_ids().await?.len())
    }
}

/// Move a record to a new id: the old id is gone once this returns Ok
pub async fn rename(index: &dyn VectorIndex, old_id: &str, record: IndexRecord) -> Result<()> {
    if old_id != record.id {
        index.delete(old_id).await?;
    }
    index.upsert(record).await
}

/// Content fingerprint used to skip redundant reindexing
pub fn fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
