// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Incremental index maintenance driven by archive watch events

use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::archive::{is_ignored_relative, Archive};
use crate::extract::ContentExtractor;
use crate::index::{self, VectorIndex};
use crate::placement::ContextBuilder;
use crate::reconcile::{record_from_bytes, Reconciler};
use crate::watcher::{WatchEvent, WatchHandler, WatchKind};
use crate::Result;

/// Concurrent event applications unless configured otherwise
const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Default)]
struct PathState {
    processing: HashSet<String>,
    /// Paths that changed again while being processed
    dirty: HashSet<String>,
}

/// Keeps index records in step with changes made directly in the archive
#[derive(Clone)]
pub struct IndexMaintainer {
    archive: Archive,
    index: Arc<dyn VectorIndex>,
    extractor: Arc<dyn ContentExtractor>,
    context: Arc<ContextBuilder>,
    reconciler: Arc<Reconciler>,
    debounce: Duration,
    workers: Arc<Semaphore>,
    state: Arc<Mutex<PathState>>,
}

impl IndexMaintainer {
    pub fn new(
        archive: Archive,
        index: Arc<dyn VectorIndex>,
        extractor: Arc<dyn ContentExtractor>,
        context: Arc<ContextBuilder>,
        reconciler: Arc<Reconciler>,
        debounce: Duration,
    ) -> Self {
        Self {
            archive,
            index,
            extractor,
            context,
            reconciler,
            debounce,
            workers: Arc::new(Semaphore::new(DEFAULT_WORKERS)),
            state: Arc::new(Mutex::new(PathState::default())),
        }
    }

    /// Cap how many watcher events are applied at once
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.max(1)));
        self
    }

    /// Relative id for a path inside the archive, None when it should be ignored
    fn visible_relative(&self, path: &Path) -> Option<String> {
        let relative = self.archive.relative(path)?;
        if is_ignored_relative(&relative) {
            None
        } else {
            Some(relative)
        }
    }

    /// Apply one event to the index
    pub async fn apply(&self, event: WatchEvent) {
        let source = self.visible_relative(&event.source_path);

        match event.kind {
            WatchKind::Created | WatchKind::Modified => {
                let Some(relative) = source else { return };
                if event.is_directory || event.source_path.is_dir() {
                    if event.kind == WatchKind::Created {
                        self.index_directory(&relative).await;
                    }
                } else {
                    self.reindex(relative).await;
                }
            }

            WatchKind::Moved => {
                let dest = event
                    .dest_path
                    .as_deref()
                    .filter(|d| self.archive.contains(d))
                    .and_then(|d| self.visible_relative(d));
                let dest_is_dir = event
                    .dest_path
                    .as_deref()
                    .map_or(event.is_directory, Path::is_dir);

                match (source, dest) {
                    (Some(from), Some(to)) if dest_is_dir => self.rename_directory(&from, &to).await,
                    (Some(from), Some(to)) => self.move_file(&from, &to).await,
                    (Some(from), None) => self.removed(&from, event.is_directory).await,
                    // Staging directories and hidden files surfacing under a visible name
                    (None, Some(to)) if dest_is_dir => self.index_directory(&to).await,
                    (None, Some(to)) => self.reindex(to).await,
                    (None, None) => {}
                }
            }

            WatchKind::Deleted => {
                if let Some(relative) = source {
                    self.removed(&relative, event.is_directory).await;
                }
            }
        }
    }

    /// Claim a path, or mark it dirty if someone else holds it
    fn claim(&self, relative: &str) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                if state.processing.contains(relative) {
                    state.dirty.insert(relative.to_string());
                    false
                } else {
                    state.processing.insert(relative.to_string());
                    true
                }
            }
            Err(_) => false,
        }
    }

    /// Release a claimed path unless it went dirty, in which case run again
    fn release_or_rerun(&self, relative: &str) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                if state.dirty.remove(relative) {
                    true
                } else {
                    state.processing.remove(relative);
                    false
                }
            }
            Err(_) => false,
        }
    }

    /// Reindex a file, once more if it changed again meanwhile
    async fn reindex(&self, relative: String) {
        if !self.claim(&relative) {
            debug!(id = %relative, "Reindex already running, marked dirty");
            return;
        }
        loop {
            if let Err(e) = self.reindex_once(&relative).await {
                warn!(id = %relative, error = %e, "Reindex failed");
            }
            if !self.release_or_rerun(&relative) {
                break;
            }
        }
    }

    async fn reindex_once(&self, relative: &str) -> Result<()> {
        let Some(bytes) = self.read(relative).await? else {
            debug!(id = relative, "File vanished before reindex");
            return Ok(());
        };

        let fingerprint = index::fingerprint(&bytes);
        if self.index.fingerprint(relative).await?.as_deref() == Some(fingerprint.as_str()) {
            debug!(id = relative, "Content unchanged, skipping reindex");
            return Ok(());
        }

        let record = record_from_bytes(self.extractor.as_ref(), relative, &bytes);
        self.index.upsert(record).await?;
        self.context.invalidate();
        debug!(id = relative, "Reindexed file");
        Ok(())
    }

    /// File bytes, None when the file is already gone
    async fn read(&self, relative: &str) -> Result<Option<Vec<u8>>> {
        let archive = self.archive.clone();
        let id = relative.to_string();
        match tokio::task::spawn_blocking(move || archive.read(&id)).await? {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_source_gone() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn move_file(&self, from: &str, to: &str) {
        if !self.claim(to) {
            return;
        }
        loop {
            match self.move_file_once(from, to).await {
                Ok(()) => info!(from, to, "Index record moved"),
                Err(e) => warn!(from, to, error = %e, "Index move failed"),
            }
            if !self.release_or_rerun(to) {
                break;
            }
        }
    }

    async fn move_file_once(&self, from: &str, to: &str) -> Result<()> {
        match self.read(to).await? {
            Some(bytes) => {
                let record = record_from_bytes(self.extractor.as_ref(), to, &bytes);
                index::rename(self.index.as_ref(), from, record).await?;
            }
            None => self.index.delete(from).await?,
        }
        self.context.invalidate();
        Ok(())
    }

    /// Remap every record under a renamed directory
    ///
    /// Old ids are derived by replacing the new directory prefix with the old
    /// one; files with no matching old record are indexed fresh.
    async fn rename_directory(&self, from: &str, to: &str) {
        if !self.claim(to) {
            return;
        }
        loop {
            if let Err(e) = self.rename_directory_once(from, to).await {
                warn!(from, to, error = %e, "Directory rename remap failed");
            }
            if !self.release_or_rerun(to) {
                break;
            }
        }
    }

    async fn rename_directory_once(&self, from: &str, to: &str) -> Result<()> {
        let archive = self.archive.clone();
        let dir = to.to_string();
        let files = tokio::task::spawn_blocking(move || archive.list_files_under(&dir)).await??;
        let known: BTreeSet<String> = self.index.list_ids().await?.into_iter().collect();

        let mut remapped = 0usize;
        let mut fresh = 0usize;
        let mut failures = 0usize;
        for new_id in &files {
            let old_id = new_id.replacen(to, from, 1);
            match self.remap_file(&old_id, new_id, known.contains(&old_id)).await {
                Ok(Some(true)) => remapped += 1,
                Ok(Some(false)) => fresh += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(from = %old_id, to = %new_id, error = %e, "Failed to remap file");
                    failures += 1;
                }
            }
        }

        let prefix = format!("{}/", from);
        let mapped: HashSet<String> = files.iter().map(|f| f.replacen(to, from, 1)).collect();
        let left_behind = known
            .iter()
            .any(|id| id.starts_with(&prefix) && !mapped.contains(id));
        if left_behind || failures > 0 {
            self.reconciler.schedule("directory rename left records behind", self.debounce);
        }

        self.context.invalidate();
        info!(from, to, remapped, fresh, failures, "Directory rename applied to index");
        Ok(())
    }

    /// Index one file of a renamed directory under its new id
    ///
    /// Some(true) when an old record was replaced, Some(false) when the file was
    /// indexed fresh, None when it vanished.
    async fn remap_file(&self, old_id: &str, new_id: &str, known: bool) -> Result<Option<bool>> {
        let Some(bytes) = self.read(new_id).await? else {
            return Ok(None);
        };
        let record = record_from_bytes(self.extractor.as_ref(), new_id, &bytes);
        if known {
            index::rename(self.index.as_ref(), old_id, record).await?;
        } else {
            self.index.upsert(record).await?;
        }
        Ok(Some(known))
    }

    /// Index files already present in a directory that appeared in the archive
    async fn index_directory(&self, relative: &str) {
        let archive = self.archive.clone();
        let dir = relative.to_string();
        let files = match tokio::task::spawn_blocking(move || archive.list_files_under(&dir)).await
        {
            Ok(Ok(files)) => files,
            Ok(Err(e)) => {
                warn!(dir = relative, error = %e, "Cannot list new directory");
                return;
            }
            Err(e) => {
                warn!(dir = relative, error = %e, "Directory listing task failed");
                return;
            }
        };
        for file in files {
            self.reindex(file).await;
        }
    }

    /// A path left the archive: drop its record, or reconcile for directories
    async fn removed(&self, relative: &str, is_directory: bool) {
        if !is_directory {
            match self.index.delete(relative).await {
                Ok(()) => {
                    self.context.invalidate();
                    debug!(id = relative, "Removed index record");
                }
                Err(e) => warn!(id = relative, error = %e, "Failed to remove index record"),
            }
        }

        // A removed directory cannot be listed any more; let a full pass find its children
        if is_directory || self.has_children(relative).await {
            self.reconciler.schedule("directory removed from archive", self.debounce);
        }
    }

    async fn has_children(&self, relative: &str) -> bool {
        let prefix = format!("{}/", relative);
        match self.index.list_ids().await {
            Ok(ids) => ids.iter().any(|id| id.starts_with(&prefix)),
            Err(_) => true,
        }
    }
}

#[async_trait]
impl WatchHandler for IndexMaintainer {
    async fn handle(&self, event: WatchEvent) {
        let maintainer = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = maintainer.workers.acquire().await else {
                return;
            };
            maintainer.apply(event).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::DefaultExtractor;
    use crate::index::{HashEmbedder, IndexRecord, QueryHit, SqliteIndex};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// SQLite index that can be slowed down and made to reject ids
    struct Instrumented {
        inner: SqliteIndex,
        upsert_delay: Duration,
        reject: Mutex<Option<&'static str>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Instrumented {
        fn reject_ids_containing(&self, marker: Option<&'static str>) {
            *self.reject.lock().unwrap() = marker;
        }
    }

    #[async_trait]
    impl VectorIndex for Instrumented {
        async fn upsert(&self, record: IndexRecord) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.upsert_delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let marker = *self.reject.lock().unwrap();
            if marker.is_some_and(|m| record.id.contains(m)) {
                return Err(crate::ArchivistError::Index("rejected".into()));
            }
            self.inner.upsert(record).await
        }
        async fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id).await
        }
        async fn query(&self, text: &str, k: usize) -> Result<Vec<QueryHit>> {
            self.inner.query(text, k).await
        }
        async fn list_ids(&self) -> Result<Vec<String>> {
            self.inner.list_ids().await
        }
        async fn fingerprint(&self, id: &str) -> Result<Option<String>> {
            self.inner.fingerprint(id).await
        }
    }

    struct Fixture {
        dir: TempDir,
        index: Arc<Instrumented>,
        maintainer: IndexMaintainer,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_upsert_delay(Duration::ZERO)
        }

        fn with_upsert_delay(upsert_delay: Duration) -> Self {
            let dir = TempDir::new().unwrap();
            let archive = Archive::new(dir.path());
            let index = Arc::new(Instrumented {
                inner: SqliteIndex::in_memory(Arc::new(HashEmbedder::default())).unwrap(),
                upsert_delay,
                reject: Mutex::new(None),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            });
            let extractor: Arc<dyn ContentExtractor> = Arc::new(DefaultExtractor::new());
            let context = Arc::new(ContextBuilder::new(
                archive.clone(),
                index.clone(),
                Duration::from_secs(5),
                100,
            ));
            let reconciler = Arc::new(Reconciler::new(
                archive.clone(),
                index.clone(),
                extractor.clone(),
                context.clone(),
                Duration::from_millis(10),
            ));
            let maintainer = IndexMaintainer::new(
                archive,
                index.clone(),
                extractor,
                context,
                reconciler,
                Duration::from_millis(20),
            );
            Self {
                dir,
                index,
                maintainer,
            }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn write(&self, rel: &str, body: &str) {
            let path = self.path(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }

        async fn ids(&self) -> Vec<String> {
            self.index.list_ids().await.unwrap()
        }
    }

    #[tokio::test]
    async fn modify_reindexes_changed_content() {
        let f = Fixture::new();
        f.write("Notes/a.txt", "first draft");
        f.maintainer.apply(WatchEvent::created(f.path("Notes/a.txt"), false)).await;
        assert_eq!(f.index.inner.document("Notes/a.txt").unwrap().as_deref(), Some("first draft"));

        f.write("Notes/a.txt", "second draft");
        f.maintainer.apply(WatchEvent::modified(f.path("Notes/a.txt"), false)).await;
        assert_eq!(f.index.inner.document("Notes/a.txt").unwrap().as_deref(), Some("second draft"));
    }

    #[tokio::test]
    async fn unchanged_content_is_not_rewritten() {
        let f = Fixture::new();
        f.write("a.txt", "same");
        let record = IndexRecord::new("a.txt", "stored text").with_fingerprint(b"same");
        f.index.upsert(record).await.unwrap();

        f.maintainer.apply(WatchEvent::modified(f.path("a.txt"), false)).await;
        assert_eq!(f.index.inner.document("a.txt").unwrap().as_deref(), Some("stored text"));
    }

    #[tokio::test]
    async fn file_move_replaces_the_old_id() {
        let f = Fixture::new();
        f.write("Inbox/r.txt", "report");
        f.maintainer.apply(WatchEvent::created(f.path("Inbox/r.txt"), false)).await;

        std::fs::create_dir_all(f.path("Work")).unwrap();
        std::fs::rename(f.path("Inbox/r.txt"), f.path("Work/r.txt")).unwrap();
        f.maintainer
            .apply(WatchEvent::moved(f.path("Inbox/r.txt"), Some(f.path("Work/r.txt")), false))
            .await;

        assert_eq!(f.ids().await, vec!["Work/r.txt"]);
    }

    #[tokio::test]
    async fn directory_rename_remaps_children() {
        let f = Fixture::new();
        f.write("Trip/day1.txt", "beach");
        f.write("Trip/Photos/p.txt", "sunset");
        f.maintainer.apply(WatchEvent::created(f.path("Trip"), true)).await;
        assert_eq!(f.ids().await, vec!["Trip/Photos/p.txt", "Trip/day1.txt"]);

        std::fs::rename(f.path("Trip"), f.path("Travel")).unwrap();
        f.write("Travel/new.txt", "added during the move");
        f.maintainer
            .apply(WatchEvent::moved(f.path("Trip"), Some(f.path("Travel")), true))
            .await;

        assert_eq!(
            f.ids().await,
            vec!["Travel/Photos/p.txt", "Travel/day1.txt", "Travel/new.txt"]
        );
    }

    #[tokio::test]
    async fn move_out_of_archive_deletes() {
        let f = Fixture::new();
        f.write("a.txt", "x");
        f.maintainer.apply(WatchEvent::created(f.path("a.txt"), false)).await;

        std::fs::remove_file(f.path("a.txt")).unwrap();
        f.maintainer.apply(WatchEvent::moved(f.path("a.txt"), None, false)).await;
        assert!(f.ids().await.is_empty());
    }

    #[tokio::test]
    async fn deleted_directory_triggers_reconcile() {
        let f = Fixture::new();
        f.write("Photos/Hawaii/beach.jpg", "jpeg");
        f.write("Photos/keep.jpg", "jpeg");
        f.maintainer.apply(WatchEvent::created(f.path("Photos"), true)).await;
        assert_eq!(f.ids().await.len(), 2);

        std::fs::remove_dir_all(f.path("Photos/Hawaii")).unwrap();
        f.maintainer
            .apply(WatchEvent::deleted(f.path("Photos/Hawaii"), true))
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.ids().await, vec!["Photos/keep.jpg"]);
    }

    #[tokio::test]
    async fn ignored_paths_are_skipped() {
        let f = Fixture::new();
        f.write(".archivist/index.db", "db");
        f.write("temp_Trip_1700000000/a.txt", "x");
        f.maintainer.apply(WatchEvent::modified(f.path(".archivist/index.db"), false)).await;
        f.maintainer
            .apply(WatchEvent::created(f.path("temp_Trip_1700000000/a.txt"), false))
            .await;
        assert!(f.ids().await.is_empty());
    }

    #[tokio::test]
    async fn staging_rename_indexes_the_final_folder() {
        let f = Fixture::new();
        f.write("Travel/Japan/itinerary.txt", "Tokyo");
        f.maintainer
            .apply(WatchEvent::moved(
                f.path("Travel/temp_Japan_1700000000"),
                Some(f.path("Travel/Japan")),
                true,
            ))
            .await;
        assert_eq!(f.ids().await, vec!["Travel/Japan/itinerary.txt"]);
    }

    #[tokio::test]
    async fn directory_rename_continues_past_failing_files() {
        let f = Fixture::new();
        for name in ["Trip/a.txt", "Trip/bad.txt", "Trip/z.txt"] {
            f.write(name, name);
        }
        f.maintainer.apply(WatchEvent::created(f.path("Trip"), true)).await;
        assert_eq!(f.ids().await.len(), 3);

        f.index.reject_ids_containing(Some("bad"));
        std::fs::rename(f.path("Trip"), f.path("Travel")).unwrap();
        f.maintainer
            .apply(WatchEvent::moved(f.path("Trip"), Some(f.path("Travel")), true))
            .await;
        f.index.reject_ids_containing(None);

        let ids = f.ids().await;
        assert!(ids.contains(&"Travel/z.txt".to_string()), "{:?}", ids);
        assert!(!ids.contains(&"Trip/z.txt".to_string()), "{:?}", ids);

        // The failed file is picked up by the reconcile pass the failure scheduled
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            f.ids().await,
            vec!["Travel/a.txt", "Travel/bad.txt", "Travel/z.txt"]
        );
    }

    #[tokio::test]
    async fn directory_moved_out_of_archive_is_reconciled_away() {
        let f = Fixture::new();
        f.write("Old/Taxes/2019.pdf", "return");
        f.write("Old/Taxes/2020.pdf", "return");
        f.write("Keep/k.txt", "kept");
        f.maintainer.apply(WatchEvent::created(f.path("Old"), true)).await;
        f.maintainer.apply(WatchEvent::created(f.path("Keep"), true)).await;
        assert_eq!(f.ids().await.len(), 3);

        std::fs::remove_dir_all(f.path("Old/Taxes")).unwrap();
        f.maintainer
            .apply(WatchEvent::moved(f.path("Old/Taxes"), None, true))
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.ids().await, vec!["Keep/k.txt"]);
    }

    #[tokio::test]
    async fn watcher_events_are_applied_by_a_bounded_pool() {
        let f = Fixture::with_upsert_delay(Duration::from_millis(30));
        let maintainer = f.maintainer.clone().with_workers(2);
        for i in 0..8 {
            let name = format!("Bulk/file{}.txt", i);
            f.write(&name, &name);
            maintainer.handle(WatchEvent::created(f.path(&name), false)).await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.ids().await.len() < 8 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.ids().await.len(), 8);
        assert!(f.index.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn busy_paths_rerun_exactly_once() {
        let f = Fixture::new();
        let m = &f.maintainer;
        assert!(m.claim("a.txt"));
        assert!(!m.claim("a.txt"));
        assert!(!m.claim("a.txt"));
        assert!(m.release_or_rerun("a.txt"));
        assert!(!m.release_or_rerun("a.txt"));
        assert!(m.claim("a.txt"));
    }
}
