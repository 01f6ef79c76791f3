// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Full diff sync between the archive on disk and the semantic index

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive::Archive;
use crate::extract::{self, ContentExtractor};
use crate::index::{IndexRecord, VectorIndex};
use crate::placement::ContextBuilder;
use crate::Result;

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub add_failures: usize,
    pub remove_failures: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    /// A pass was already running; one follow-up pass will cover this request
    Coalesced,
}

/// Index record for a file's bytes, keyed by its relative path
pub fn record_from_bytes(extractor: &dyn ContentExtractor, relative: &str, bytes: &[u8]) -> IndexRecord {
    let filename = Path::new(relative)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(relative);
    let document = extract::index_document(extractor, filename, bytes);
    IndexRecord::new(relative, document).with_fingerprint(bytes)
}

/// Read an archive file and build the record that indexes it
pub async fn load_record(
    archive: &Archive,
    extractor: &Arc<dyn ContentExtractor>,
    relative: &str,
) -> Result<IndexRecord> {
    let archive = archive.clone();
    let extractor = Arc::clone(extractor);
    let id = relative.to_string();
    tokio::task::spawn_blocking(move || -> Result<IndexRecord> {
        let bytes = archive.read(&id)?;
        Ok(record_from_bytes(extractor.as_ref(), &id, &bytes))
    })
    .await?
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    pending: bool,
}

/// Releases the running flag if a pass is torn down before handing off
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
    armed: bool,
}

impl<'a> RunGuard<'a> {
    fn new(state: &'a Mutex<RunState>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.running = false;
            state.pending = false;
        }
        warn!("Reconcile pass ended early, running flag released");
    }
}

/// Restores `index ids == archive files`, one pass at a time
pub struct Reconciler {
    archive: Archive,
    index: Arc<dyn VectorIndex>,
    extractor: Arc<dyn ContentExtractor>,
    context: Arc<ContextBuilder>,
    follow_up_delay: Duration,
    state: Mutex<RunState>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        archive: Archive,
        index: Arc<dyn VectorIndex>,
        extractor: Arc<dyn ContentExtractor>,
        context: Arc<ContextBuilder>,
        follow_up_delay: Duration,
    ) -> Self {
        Self {
            archive,
            index,
            extractor,
            context,
            follow_up_delay,
            state: Mutex::new(RunState::default()),
            timer: Mutex::new(None),
        }
    }

    /// One diff pass, ignoring the running flag
    ///
    /// Individual add/remove failures are counted and skipped; only failing
    /// to list either side aborts the pass.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let archive = self.archive.clone();
        let files = tokio::task::spawn_blocking(move || archive.list_files()).await??;
        let ids = self.index.list_ids().await?;

        let on_disk: BTreeSet<String> = files.into_iter().collect();
        let indexed: BTreeSet<String> = ids.into_iter().collect();

        let mut report = ReconcileReport::default();

        for id in on_disk.difference(&indexed) {
            let result = match load_record(&self.archive, &self.extractor, id).await {
                Ok(record) => self.index.upsert(record).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => report.added += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "Reconcile failed to index file");
                    report.add_failures += 1;
                }
            }
        }

        for id in indexed.difference(&on_disk) {
            match self.index.delete(id).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "Reconcile failed to remove record");
                    report.remove_failures += 1;
                }
            }
        }

        self.context.invalidate();
        if report.is_noop() {
            debug!("Reconcile found index in sync");
        } else {
            info!(
                added = report.added,
                removed = report.removed,
                add_failures = report.add_failures,
                remove_failures = report.remove_failures,
                "Reconcile pass complete"
            );
        }
        Ok(report)
    }

    /// Run a pass now, or mark one pending if a pass is already running
    ///
    /// When triggers arrive mid-pass exactly one follow-up pass runs after it,
    /// in the background. The pass itself runs on its own task, so dropping
    /// the returned future leaves it to finish and release the running flag.
    pub async fn reconcile_now(self: &Arc<Self>) -> Result<ReconcileOutcome> {
        if !self.try_begin() {
            debug!("Reconcile already running, coalescing request");
            return Ok(ReconcileOutcome::Coalesced);
        }

        let this = Arc::clone(self);
        let pass = tokio::spawn(async move { this.claimed_pass().await });
        pass.await?.map(ReconcileOutcome::Completed)
    }

    /// Run a pass that already holds the running flag, then hand off or release it
    async fn claimed_pass(self: Arc<Self>) -> Result<ReconcileReport> {
        let guard = RunGuard::new(&self.state);
        let result = self.run_once().await;

        let follow_up = self.take_pending();
        guard.disarm();
        if follow_up {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.follow_up().await });
        }
        result
    }

    async fn follow_up(self: Arc<Self>) {
        loop {
            let guard = RunGuard::new(&self.state);
            tokio::time::sleep(self.follow_up_delay).await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Follow-up reconcile failed");
            }
            let again = self.take_pending();
            guard.disarm();
            if !again {
                break;
            }
        }
    }

    /// Claim the running flag
    fn try_begin(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) if state.running => {
                state.pending = true;
                false
            }
            Ok(mut state) => {
                state.running = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Consume the pending flag, releasing the running flag when none is set
    fn take_pending(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                if state.pending {
                    state.pending = false;
                    true
                } else {
                    state.running = false;
                    false
                }
            }
            Err(_) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().map(|s| s.running).unwrap_or(false)
    }

    /// Debounced trigger: restarts the countdown on every call
    pub fn schedule(self: &Arc<Self>, reason: &'static str, delay: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detached so a later schedule() cannot abort a running pass
            tokio::spawn(async move {
                if let Err(e) = this.reconcile_now().await {
                    error!(reason, error = %e, "Scheduled reconcile failed");
                }
            });
        });

        debug!(reason, delay_ms = delay.as_millis() as u64, "Reconcile scheduled");
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(previous) = timer.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Drop any pending scheduled pass
    pub fn cancel_scheduled(&self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::DefaultExtractor;
    use crate::index::{HashEmbedder, QueryHit, SqliteIndex};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Wraps an index to count passes, slow down upserts and reject some ids
    struct Instrumented {
        inner: SqliteIndex,
        list_calls: AtomicUsize,
        upsert_delay: Duration,
    }

    #[async_trait]
    impl VectorIndex for Instrumented {
        async fn upsert(&self, record: IndexRecord) -> Result<()> {
            tokio::time::sleep(self.upsert_delay).await;
            if record.id.contains("reject") {
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
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.list_ids().await
        }
    }

    fn setup(upsert_delay: Duration) -> (TempDir, Arc<Instrumented>, Arc<Reconciler>) {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(Instrumented {
            inner: SqliteIndex::in_memory(Arc::new(HashEmbedder::default())).unwrap(),
            list_calls: AtomicUsize::new(0),
            upsert_delay,
        });
        let archive = Archive::new(dir.path());
        let context = Arc::new(ContextBuilder::new(
            archive.clone(),
            index.clone(),
            Duration::from_secs(5),
            100,
        ));
        let reconciler = Arc::new(Reconciler::new(
            archive,
            index.clone(),
            Arc::new(DefaultExtractor::new()),
            context,
            Duration::from_millis(10),
        ));
        (dir, index, reconciler)
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn adds_missing_and_removes_stale() {
        let (dir, index, reconciler) = setup(Duration::ZERO);
        write(dir.path(), "Work/a.txt", "alpha");
        write(dir.path(), "Work/b.txt", "beta");
        index.upsert(IndexRecord::new("Gone/old.txt", "old")).await.unwrap();

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.removed, 1);

        let mut ids = index.list_ids().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["Work/a.txt", "Work/b.txt"]);
        assert_eq!(
            index.inner.document("Work/a.txt").unwrap().as_deref(),
            Some("alpha")
        );
    }

    #[tokio::test]
    async fn second_pass_is_a_noop() {
        let (dir, _index, reconciler) = setup(Duration::ZERO);
        write(dir.path(), "Notes/n.md", "note");

        assert_eq!(reconciler.run_once().await.unwrap().added, 1);
        assert!(reconciler.run_once().await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn partial_failures_are_counted() {
        let (dir, index, reconciler) = setup(Duration::ZERO);
        write(dir.path(), "ok.txt", "fine");
        write(dir.path(), "reject.txt", "nope");

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.add_failures, 1);
        assert_eq!(index.list_ids().await.unwrap(), vec!["ok.txt"]);
    }

    #[tokio::test]
    async fn ignored_entries_never_reach_the_index() {
        let (dir, index, reconciler) = setup(Duration::ZERO);
        write(dir.path(), ".archivist/index.db", "db");
        write(dir.path(), "temp_Trip_1700000000/a.txt", "staging");
        write(dir.path(), ".hidden.txt", "x");
        write(dir.path(), "Trip/a.txt", "real");

        reconciler.run_once().await.unwrap();
        assert_eq!(index.list_ids().await.unwrap(), vec!["Trip/a.txt"]);
    }

    #[tokio::test]
    async fn overlapping_triggers_coalesce_into_one_follow_up() {
        let (dir, index, reconciler) = setup(Duration::from_millis(150));
        write(dir.path(), "a.txt", "a");

        let first = {
            let r = Arc::clone(&reconciler);
            tokio::spawn(async move { r.reconcile_now().await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(reconciler.is_running());

        for _ in 0..3 {
            assert_eq!(
                reconciler.reconcile_now().await.unwrap(),
                ReconcileOutcome::Coalesced
            );
        }

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed(r) if r.added == 1));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reconciler.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!reconciler.is_running());
        assert_eq!(index.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn aborted_caller_does_not_wedge_the_reconciler() {
        let (dir, index, reconciler) = setup(Duration::from_millis(150));
        write(dir.path(), "a.txt", "a");

        let caller = {
            let r = Arc::clone(&reconciler);
            tokio::spawn(async move { r.reconcile_now().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reconciler.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!reconciler.is_running());
        assert_eq!(index.inner.list_ids().await.unwrap(), vec!["a.txt"]);

        write(dir.path(), "b.txt", "b");
        let outcome = reconciler.reconcile_now().await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Completed(r) if r.added == 1));
    }

    #[tokio::test]
    async fn dropped_pass_releases_the_running_flag() {
        let (_dir, _index, reconciler) = setup(Duration::ZERO);
        assert!(reconciler.try_begin());
        assert!(!reconciler.try_begin());
        drop(RunGuard::new(&reconciler.state));

        assert!(!reconciler.is_running());
        assert!(matches!(
            reconciler.reconcile_now().await.unwrap(),
            ReconcileOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn schedule_debounces_bursts() {
        let (dir, index, reconciler) = setup(Duration::ZERO);
        write(dir.path(), "a.txt", "a");

        for _ in 0..5 {
            reconciler.schedule("test", Duration::from_millis(50));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(index.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(index.inner.list_ids().await.unwrap(), vec!["a.txt"]);
    }
}
