// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Move log: append-only audit trail of every ingestion attempt

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::{ArchivistError, Result};

/// Largest page returned by `list_recent`
pub const MAX_LIMIT: usize = 1000;

/// Longest look-back window in hours (one year)
pub const MAX_HOURS: i64 = 8760;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
}

/// What started the move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Watcher,
    Upload,
    Cli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveStatus {
    Success,
    Failed,
}

macro_rules! text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            fn parse(text: &str) -> Option<Self> {
                match text {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

text_enum!(ItemType { File => "file", Folder => "folder" });
text_enum!(Trigger { Watcher => "watcher", Upload => "upload", Cli => "cli" });
text_enum!(MoveStatus { Success => "success", Failed => "failed" });

/// One row of the move log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveEntry {
    pub created_at: DateTime<Utc>,
    pub source_path: String,
    /// Archive-relative destination, absent when the move failed early
    pub destination_path: Option<String>,
    pub item_type: ItemType,
    pub trigger: Trigger,
    pub status: MoveStatus,
    pub note: Option<String>,
}

impl MoveEntry {
    pub fn success(
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        item_type: ItemType,
        trigger: Trigger,
    ) -> Self {
        Self {
            created_at: Utc::now(),
            source_path: source_path.into(),
            destination_path: Some(destination_path.into()),
            item_type,
            trigger,
            status: MoveStatus::Success,
            note: None,
        }
    }

    pub fn failure(
        source_path: impl Into<String>,
        item_type: ItemType,
        trigger: Trigger,
        note: impl Into<String>,
    ) -> Self {
        Self {
            created_at: Utc::now(),
            source_path: source_path.into(),
            destination_path: None,
            item_type,
            trigger,
            status: MoveStatus::Failed,
            note: Some(note.into()),
        }
    }
}

/// Fixed-width UTC timestamps so text order matches time order
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed move log (thread-safe wrapper)
#[derive(Clone)]
pub struct MoveLog {
    conn: Arc<Mutex<Connection>>,
}

impl MoveLog {
    /// Open or create the move log
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory log (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS move_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                source_path TEXT NOT NULL,
                destination_path TEXT,
                item_type TEXT NOT NULL,
                "trigger" TEXT NOT NULL,
                status TEXT NOT NULL,
                note TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_move_logs_created ON move_logs(created_at);
        "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ArchivistError::Config("Move log lock poisoned".to_string()))
    }

    /// Append an entry
    pub fn record(&self, entry: &MoveEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"INSERT INTO move_logs (created_at, source_path, destination_path, item_type, "trigger", status, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                timestamp(&entry.created_at),
                entry.source_path,
                entry.destination_path,
                entry.item_type.as_str(),
                entry.trigger.as_str(),
                entry.status.as_str(),
                entry.note,
            ],
        )?;
        Ok(())
    }

    /// Newest entries within the last `hours`, clamped to sane bounds
    pub fn list_recent(&self, hours: i64, limit: usize) -> Result<Vec<MoveEntry>> {
        let hours = hours.clamp(1, MAX_HOURS);
        let limit = limit.clamp(1, MAX_LIMIT);
        let since = timestamp(&(Utc::now() - Duration::hours(hours)));

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT created_at, source_path, destination_path, item_type, "trigger", status, note
             FROM move_logs WHERE created_at >= ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2"#,
        )?;

        let rows = stmt.query_map(params![since, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (created_at, source_path, destination_path, item_type, trigger, status, note) = row?;
            let entry = (|| {
                Some(MoveEntry {
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .ok()?
                        .with_timezone(&Utc),
                    source_path,
                    destination_path,
                    item_type: ItemType::parse(&item_type)?,
                    trigger: Trigger::parse(&trigger)?,
                    status: MoveStatus::parse(&status)?,
                    note,
                })
            })();
            match entry {
                Some(entry) => entries.push(entry),
                None => tracing::warn!("Skipping malformed move log row"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_and_lists_newest_first() {
        let log = MoveLog::in_memory().unwrap();
        log.record(&MoveEntry::success(
            "/in/a.pdf",
            "Finance/a.pdf",
            ItemType::File,
            Trigger::Watcher,
        ))
        .unwrap();
        log.record(&MoveEntry::failure(
            "/in/b.pdf",
            ItemType::File,
            Trigger::Upload,
            "timed out",
        ))
        .unwrap();

        let entries = log.list_recent(24, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].source_path, "/in/b.pdf");
        assert_eq!(entries[0].status, MoveStatus::Failed);
        assert_eq!(entries[1].destination_path.as_deref(), Some("Finance/a.pdf"));
    }

    #[test]
    fn limits_are_clamped() {
        let log = MoveLog::in_memory().unwrap();
        for i in 0..3 {
            log.record(&MoveEntry::success(
                format!("/in/{}.txt", i),
                format!("Notes/{}.txt", i),
                ItemType::File,
                Trigger::Cli,
            ))
            .unwrap();
        }
        assert_eq!(log.list_recent(0, 0).unwrap().len(), 1);
        assert_eq!(log.list_recent(-5, usize::MAX).unwrap().len(), 3);
    }

    #[test]
    fn old_entries_fall_outside_the_window() {
        let log = MoveLog::in_memory().unwrap();
        let mut old = MoveEntry::success("/in/old", "Old", ItemType::Folder, Trigger::Watcher);
        old.created_at = Utc::now() - Duration::hours(48);
        log.record(&old).unwrap();

        assert!(log.list_recent(24, 10).unwrap().is_empty());
        assert_eq!(log.list_recent(72, 10).unwrap()[0].item_type, ItemType::Folder);
    }

    #[test]
    fn persists_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".archivist").join("moves.db");
        {
            let log = MoveLog::open(&path).unwrap();
            log.record(&MoveEntry::success("/in/x", "X/x", ItemType::File, Trigger::Cli))
                .unwrap();
        }
        let reopened = MoveLog::open(&path).unwrap();
        assert_eq!(reopened.list_recent(1, 1).unwrap().len(), 1);
    }
}
