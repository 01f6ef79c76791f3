// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Ingestion: extract, summarize, place, save and index dropped items

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::archive::Archive;
use crate::config::IngestConfig;
use crate::extract::{self, collapse_whitespace, truncate_chars, ContentExtractor};
use crate::history::{ItemType, MoveEntry, MoveLog, Trigger};
use crate::index::VectorIndex;
use crate::placement::{ContextBuilder, PathPlanner, PlacementDecision, PlacementReason};
use crate::reconcile::{load_record, record_from_bytes};
use crate::summarizer::{self, Summarizer};
use crate::watcher::{self, is_hidden_below, Settle, WatchEvent, WatchHandler, WatchKind};
use crate::{ArchivistError, Result};

/// Files sampled when summarizing a dropped folder
const FOLDER_SAMPLE_FILES: usize = 20;

/// Characters of text taken from each sampled file
const FOLDER_SAMPLE_CHARS: usize = 500;

/// Where an item ended up
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// Archive-relative path of the saved file or folder
    pub relative_path: String,
    pub folder: String,
    pub reason: PlacementReason,
    pub summary: String,
}

/// The per-item work: extract → summarize → plan → save → index
pub struct Pipeline {
    archive: Archive,
    index: Arc<dyn VectorIndex>,
    extractor: Arc<dyn ContentExtractor>,
    summarizer: Arc<dyn Summarizer>,
    planner: PathPlanner,
    context: Arc<ContextBuilder>,
    moves: Option<MoveLog>,
}

impl Pipeline {
    pub fn new(
        archive: Archive,
        index: Arc<dyn VectorIndex>,
        extractor: Arc<dyn ContentExtractor>,
        summarizer: Arc<dyn Summarizer>,
        planner: PathPlanner,
        context: Arc<ContextBuilder>,
    ) -> Self {
        Self {
            archive,
            index,
            extractor,
            summarizer,
            planner,
            context,
            moves: None,
        }
    }

    pub fn with_move_log(mut self, moves: MoveLog) -> Self {
        self.moves = Some(moves);
        self
    }

    /// Append to the move log; failures are logged, never propagated
    pub fn record_move(&self, entry: MoveEntry) {
        if let Some(moves) = &self.moves {
            if let Err(e) = moves.record(&entry) {
                warn!(source = %entry.source_path, error = %e, "Failed to record move");
            }
        }
    }

    /// Summary for a file, never failing
    pub async fn summarize(&self, filename: &str, bytes: &[u8]) -> String {
        if extract::is_image(filename) {
            return summarizer::summarize_image_or_fallback(self.summarizer.as_ref(), filename, bytes)
                .await;
        }

        let text = self.extract_text(filename, bytes).await;
        summarizer::summarize_or_fallback(self.summarizer.as_ref(), filename, &text).await
    }

    async fn extract_text(&self, filename: &str, bytes: &[u8]) -> String {
        let extractor = Arc::clone(&self.extractor);
        let name = filename.to_string();
        let owned = bytes.to_vec();
        let extracted =
            tokio::task::spawn_blocking(move || extractor.extract_text(&name, &owned)).await;

        match extracted {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => extract::placeholder_text(filename),
            Ok(Err(e)) => {
                debug!(filename, error = %e, "No text extracted, using placeholder");
                extract::placeholder_text(filename)
            }
            Err(e) => {
                warn!(filename, error = %e, "Extraction task failed");
                extract::placeholder_text(filename)
            }
        }
    }

    /// Choose a folder without writing anything
    pub async fn plan(&self, filename: &str, bytes: &[u8]) -> Result<(String, PlacementDecision)> {
        let summary = self.summarize(filename, bytes).await;
        let context = self.context.get().await?;
        let decision = self.planner.decide(filename, &summary, &context).await;
        Ok((summary, decision))
    }

    /// Place, save and index an in-memory file
    pub async fn ingest_bytes(&self, filename: &str, bytes: &[u8]) -> Result<IngestOutcome> {
        let (summary, decision) = self.plan(filename, bytes).await?;
        let folder = decision.folder();

        let archive = self.archive.clone();
        let (dest_folder, name, owned) = (folder.clone(), filename.to_string(), bytes.to_vec());
        let relative =
            tokio::task::spawn_blocking(move || archive.save(&dest_folder, &name, &owned)).await??;
        self.context.invalidate();

        let record = record_from_bytes(self.extractor.as_ref(), &relative, bytes);
        self.index.upsert(record).await?;
        self.context.invalidate();

        info!(filename, path = %relative, reason = ?decision.reason, "Filed into archive");
        Ok(IngestOutcome {
            relative_path: relative,
            folder,
            reason: decision.reason,
            summary,
        })
    }

    /// Ingest a file from disk; `SourceGone` when it vanished first
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestOutcome> {
        let filename = file_name(path)?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchivistError::SourceGone(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        self.ingest_bytes(&filename, &bytes).await
    }

    /// Ingest a whole folder as one unit, keeping its inner layout
    pub async fn ingest_folder(&self, path: &Path) -> Result<IngestOutcome> {
        if !path.is_dir() {
            return Err(ArchivistError::SourceGone(path.to_path_buf()));
        }
        let name = file_name(path)?;

        let sample = self.folder_sample(path).await?;
        let summary =
            summarizer::summarize_or_fallback(self.summarizer.as_ref(), &name, &sample).await;
        let context = self.context.get().await?;
        let decision = self.planner.decide(&name, &summary, &context).await;
        let folder = decision.folder();

        let archive = self.archive.clone();
        let (dest_folder, dest_name, source) = (folder.clone(), name.clone(), path.to_path_buf());
        let relative = tokio::task::spawn_blocking(move || {
            archive.save_folder(&dest_folder, &dest_name, &source)
        })
        .await??;
        self.context.invalidate();

        let archive = self.archive.clone();
        let dir = relative.clone();
        let files = tokio::task::spawn_blocking(move || archive.list_files_under(&dir)).await??;
        for file in &files {
            let record = load_record(&self.archive, &self.extractor, file).await?;
            self.index.upsert(record).await?;
        }
        self.context.invalidate();

        info!(folder = %name, path = %relative, files = files.len(), "Filed folder into archive");
        Ok(IngestOutcome {
            relative_path: relative,
            folder,
            reason: decision.reason,
            summary,
        })
    }

    /// File names plus a little text from each, for summarizing a folder
    async fn folder_sample(&self, path: &Path) -> Result<String> {
        let root = path.to_path_buf();
        let extractor = Arc::clone(&self.extractor);
        let sample = tokio::task::spawn_blocking(move || {
            let mut names = Vec::new();
            let mut snippets = Vec::new();
            let walker = WalkDir::new(&root)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file());

            for entry in walker.take(FOLDER_SAMPLE_FILES) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Ok(bytes) = std::fs::read(entry.path()) {
                    let text = extract::index_document(extractor.as_ref(), &name, &bytes);
                    let text = collapse_whitespace(&text);
                    snippets.push(truncate_chars(&text, FOLDER_SAMPLE_CHARS).to_string());
                }
                names.push(name);
            }
            format!("Files: {}\n\n{}", names.join(", "), snippets.join("\n"))
        })
        .await?;
        Ok(sample)
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| ArchivistError::Extraction(format!("No file name in {}", path.display())))
}

/// Removes a path from a shared set when dropped
struct InFlightGuard {
    set: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.path);
        }
    }
}

/// Claim `path` in `set`; None when it is already claimed
fn claim(set: &Arc<Mutex<HashSet<PathBuf>>>, path: &Path) -> Option<InFlightGuard> {
    let mut guard = set.lock().ok()?;
    if !guard.insert(path.to_path_buf()) {
        return None;
    }
    Some(InFlightGuard {
        set: Arc::clone(set),
        path: path.to_path_buf(),
    })
}

/// Deduplicates, settles and schedules ingestion of dropped items
#[derive(Clone)]
pub struct IngestionCoordinator {
    input_root: PathBuf,
    pipeline: Arc<Pipeline>,
    config: IngestConfig,
    workers: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    folders: Arc<Mutex<HashSet<PathBuf>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl IngestionCoordinator {
    pub fn new(input_root: impl Into<PathBuf>, pipeline: Arc<Pipeline>, config: IngestConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            input_root: input_root.into(),
            pipeline,
            config,
            workers: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            folders: Arc::new(Mutex::new(HashSet::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    /// Whether `path` lies inside a folder that is being ingested as a unit
    fn inside_folder_in_progress(&self, path: &Path) -> bool {
        match self.folders.lock() {
            Ok(folders) => folders
                .iter()
                .any(|folder| path != folder && path.starts_with(folder)),
            Err(_) => false,
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    /// Number of paths currently settling or ingesting
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Queue a dropped file; false when it is skipped or already queued
    pub fn submit_file(&self, path: PathBuf) -> bool {
        if !watcher::should_process(&path) || is_hidden_below(&self.input_root, &path) {
            return false;
        }
        if self.inside_folder_in_progress(&path) {
            debug!("Skipping {:?}, its folder is being processed", path);
            return false;
        }
        let Some(guard) = claim(&self.in_flight, &path) else {
            debug!("Already processing {:?}", path);
            return false;
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.process_file(path).await;
        });
        self.track(handle);
        true
    }

    async fn process_file(&self, path: PathBuf) {
        match watcher::wait_for_stable(
            &path,
            self.config.settle_interval(),
            self.config.settle_max(),
        )
        .await
        {
            Settle::Gone => {
                debug!("File disappeared while settling: {:?}", path);
                return;
            }
            Settle::Stable | Settle::TimedOut => {}
        }

        if self.inside_folder_in_progress(&path) {
            debug!("Skipping {:?}, its folder is now being processed", path);
            return;
        }

        let Ok(_permit) = self.workers.acquire().await else {
            return;
        };

        let source = path.display().to_string();
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.pipeline.ingest_file(&path)).await {
            Ok(Ok(outcome)) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!("Filed {:?} but could not remove it: {}", path, e);
                }
                self.pipeline.record_move(MoveEntry::success(
                    source,
                    outcome.relative_path,
                    ItemType::File,
                    Trigger::Watcher,
                ));
            }
            Ok(Err(e)) if e.is_source_gone() => {
                debug!("File vanished before ingestion: {:?}", path);
            }
            Ok(Err(e)) => {
                error!("Ingestion failed for {:?}, keeping source: {}", path, e);
                self.pipeline.record_move(MoveEntry::failure(
                    source,
                    ItemType::File,
                    Trigger::Watcher,
                    e.to_string(),
                ));
            }
            Err(_) => {
                let e = ArchivistError::Timeout(timeout.as_secs());
                error!("Ingestion timed out for {:?}, keeping source", path);
                self.pipeline.record_move(MoveEntry::failure(
                    source,
                    ItemType::File,
                    Trigger::Watcher,
                    e.to_string(),
                ));
            }
        }
    }

    /// Queue a dropped folder; false when it is skipped or already queued
    pub fn submit_folder(&self, path: PathBuf) -> bool {
        if is_hidden_below(&self.input_root, &path) || self.inside_folder_in_progress(&path) {
            return false;
        }
        let Some(guard) = claim(&self.folders, &path) else {
            return false;
        };

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.process_folder(path).await;
        });
        self.track(handle);
        true
    }

    async fn process_folder(&self, path: PathBuf) {
        // Let a bulk copy finish
        tokio::time::sleep(self.config.folder_settle()).await;

        if !path.is_dir() {
            warn!("Folder {:?} no longer exists after delay, cannot process", path);
            return;
        }

        let Ok(_permit) = self.workers.acquire().await else {
            return;
        };

        info!("Starting processing of folder: {:?}", path);
        let source = path.display().to_string();
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.pipeline.ingest_folder(&path)).await {
            Ok(Ok(outcome)) => {
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    error!("Error removing folder {:?}: {}", path, e);
                }
                self.pipeline.record_move(MoveEntry::success(
                    source,
                    outcome.relative_path,
                    ItemType::Folder,
                    Trigger::Watcher,
                ));
            }
            Ok(Err(e)) if e.is_source_gone() => {
                debug!("Folder vanished before ingestion: {:?}", path);
            }
            Ok(Err(e)) => {
                error!("Folder processing failed, will not remove original {:?}: {}", path, e);
                self.pipeline.record_move(MoveEntry::failure(
                    source,
                    ItemType::Folder,
                    Trigger::Watcher,
                    e.to_string(),
                ));
            }
            Err(_) => {
                error!("Folder processing timed out: {:?}", path);
                self.pipeline.record_move(MoveEntry::failure(
                    source,
                    ItemType::Folder,
                    Trigger::Watcher,
                    ArchivistError::Timeout(timeout.as_secs()).to_string(),
                ));
            }
        }
    }

    /// Abort queued and running ingestion tasks; sources stay untouched
    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl WatchHandler for IngestionCoordinator {
    async fn handle(&self, event: WatchEvent) {
        let (path, is_directory) = match event.kind {
            WatchKind::Created => (event.source_path, event.is_directory),
            // A download finishing with a rename inside the drop folder
            WatchKind::Moved => match event.dest_path {
                Some(dest) if dest.starts_with(&self.input_root) => {
                    let is_dir = dest.is_dir();
                    (dest, is_dir)
                }
                _ => return,
            },
            WatchKind::Modified | WatchKind::Deleted => return,
        };

        if is_directory {
            self.submit_folder(path);
        } else {
            self.submit_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::DefaultExtractor;
    use crate::history::MoveStatus;
    use crate::index::{HashEmbedder, IndexRecord, QueryHit, SqliteIndex};
    use crate::summarizer::PathRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Scripted {
        folder: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for Scripted {
        async fn summarize(&self, _filename: &str, text: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Summary: {}", truncate_chars(text, 80)))
        }
        async fn summarize_image(&self, filename: &str, _bytes: &[u8]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("A photo called {}", filename))
        }
        async fn suggest_path(&self, _request: &PathRequest<'_>) -> Result<String> {
            Ok(format!("<suggestedpath>{}</suggestedpath>", self.folder))
        }
    }

    struct Fixture {
        _dir: TempDir,
        input: PathBuf,
        archive: PathBuf,
        index: Arc<SqliteIndex>,
        summarizer: Arc<Scripted>,
        coordinator: IngestionCoordinator,
    }

    fn fixture(folder: &'static str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        let archive_root = dir.path().join("archive");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&archive_root).unwrap();

        let archive = Archive::new(&archive_root);
        let index = Arc::new(SqliteIndex::in_memory(Arc::new(HashEmbedder::default())).unwrap());
        let summarizer = Arc::new(Scripted {
            folder,
            calls: AtomicUsize::new(0),
        });
        let context = Arc::new(ContextBuilder::new(
            archive.clone(),
            index.clone(),
            Duration::from_secs(5),
            200,
        ));
        let pipeline = Pipeline::new(
            archive,
            index.clone(),
            Arc::new(DefaultExtractor::new()),
            summarizer.clone(),
            PathPlanner::new(summarizer.clone(), 16_000),
            context,
        )
        .with_move_log(MoveLog::in_memory().unwrap());

        let config = IngestConfig {
            workers: 2,
            settle_interval_ms: 20,
            settle_max_secs: 5,
            folder_settle_secs: 0,
            timeout_secs: 30,
        };
        let coordinator = IngestionCoordinator::new(&input, Arc::new(pipeline), config);
        Fixture {
            _dir: dir,
            input,
            archive: archive_root,
            index,
            summarizer,
            coordinator,
        }
    }

    async fn wait_idle(coordinator: &IngestionCoordinator) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let busy = coordinator.in_flight() > 0
                || coordinator.folders.lock().map(|f| !f.is_empty()).unwrap_or(false);
            if !busy || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn file_is_filed_indexed_and_removed() {
        let f = fixture("Work/Reports");
        let source = f.input.join("q3.txt");
        std::fs::write(&source, "Quarterly numbers").unwrap();

        assert!(f.coordinator.submit_file(source.clone()));
        wait_idle(&f.coordinator).await;

        assert!(!source.exists());
        assert!(f.archive.join("Work/Reports/q3.txt").exists());
        assert_eq!(f.index.list_ids().await.unwrap(), vec!["Work/Reports/q3.txt"]);
    }

    #[tokio::test]
    async fn duplicate_create_events_ingest_once() {
        let f = fixture("Notes");
        let source = f.input.join("idea.md");
        std::fs::write(&source, "an idea").unwrap();

        assert!(f.coordinator.submit_file(source.clone()));
        assert!(!f.coordinator.submit_file(source.clone()));
        f.coordinator
            .handle(WatchEvent::created(source.clone(), false))
            .await;
        wait_idle(&f.coordinator).await;

        assert_eq!(f.summarizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.index.list_ids().await.unwrap(), vec!["Notes/idea.md"]);
    }

    #[tokio::test]
    async fn partial_and_hidden_files_are_ignored() {
        let f = fixture("Notes");
        let partial = f.input.join("movie.mp4.crdownload");
        let hidden = f.input.join(".DS_Store");
        std::fs::write(&partial, "x").unwrap();
        std::fs::write(&hidden, "x").unwrap();

        assert!(!f.coordinator.submit_file(partial.clone()));
        assert!(!f.coordinator.submit_file(hidden));
        assert!(partial.exists());
    }

    #[tokio::test]
    async fn vanished_file_is_dropped_silently() {
        let f = fixture("Notes");
        let source = f.input.join("gone.txt");
        std::fs::write(&source, "x").unwrap();
        assert!(f.coordinator.submit_file(source.clone()));
        std::fs::remove_file(&source).unwrap();
        wait_idle(&f.coordinator).await;

        assert_eq!(f.summarizer.calls.load(Ordering::SeqCst), 0);
        assert!(f.index.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn folder_is_ingested_as_one_unit() {
        let f = fixture("Travel");
        let folder = f.input.join("Japan Trip");
        std::fs::create_dir_all(folder.join("Day1")).unwrap();
        std::fs::write(folder.join("itinerary.txt"), "Tokyo then Kyoto").unwrap();
        std::fs::write(folder.join("Day1/notes.md"), "Shibuya").unwrap();

        assert!(f.coordinator.submit_folder(folder.clone()));
        // Files inside the folder are left to the folder task
        assert!(!f.coordinator.submit_file(folder.join("itinerary.txt")));
        wait_idle(&f.coordinator).await;

        assert!(!folder.exists());
        assert_eq!(
            f.index.list_ids().await.unwrap(),
            vec![
                "Travel/Japan Trip/Day1/notes.md",
                "Travel/Japan Trip/itinerary.txt"
            ]
        );
    }

    #[tokio::test]
    async fn rename_into_the_drop_folder_counts_as_creation() {
        let f = fixture("Notes");
        let done = f.input.join("paper.txt");
        std::fs::write(&done, "finished download").unwrap();

        f.coordinator
            .handle(WatchEvent::moved(
                f.input.join("paper.txt.part"),
                Some(done.clone()),
                false,
            ))
            .await;
        wait_idle(&f.coordinator).await;

        assert_eq!(f.index.list_ids().await.unwrap(), vec!["Notes/paper.txt"]);
    }

    /// Summarizer that never answers within the ingestion timeout
    struct Stalled;

    #[async_trait]
    impl Summarizer for Stalled {
        async fn summarize(&self, _filename: &str, _text: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".to_string())
        }
        async fn summarize_image(&self, _filename: &str, _bytes: &[u8]) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".to_string())
        }
        async fn suggest_path(&self, _request: &PathRequest<'_>) -> Result<String> {
            Ok("<suggestedpath>Notes</suggestedpath>".to_string())
        }
    }

    /// Index whose writes always fail
    struct ReadOnlyIndex(SqliteIndex);

    #[async_trait]
    impl VectorIndex for ReadOnlyIndex {
        async fn upsert(&self, _record: IndexRecord) -> Result<()> {
            Err(ArchivistError::Index("disk full".to_string()))
        }
        async fn delete(&self, id: &str) -> Result<()> {
            self.0.delete(id).await
        }
        async fn query(&self, text: &str, k: usize) -> Result<Vec<QueryHit>> {
            self.0.query(text, k).await
        }
        async fn list_ids(&self) -> Result<Vec<String>> {
            self.0.list_ids().await
        }
    }

    struct Harness {
        _dir: TempDir,
        input: PathBuf,
        moves: MoveLog,
        coordinator: IngestionCoordinator,
    }

    fn harness(
        index: Arc<dyn VectorIndex>,
        summarizer: Arc<dyn Summarizer>,
        timeout_secs: u64,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        let archive_root = dir.path().join("archive");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&archive_root).unwrap();
        let archive = Archive::new(&archive_root);
        let moves = MoveLog::in_memory().unwrap();
        let context = Arc::new(ContextBuilder::new(
            archive.clone(),
            Arc::clone(&index),
            Duration::from_secs(5),
            200,
        ));
        let pipeline = Pipeline::new(
            archive,
            index,
            Arc::new(DefaultExtractor::new()),
            Arc::clone(&summarizer),
            PathPlanner::new(summarizer, 16_000),
            context,
        )
        .with_move_log(moves.clone());

        let config = IngestConfig {
            workers: 1,
            settle_interval_ms: 20,
            settle_max_secs: 5,
            folder_settle_secs: 0,
            timeout_secs,
        };
        let coordinator = IngestionCoordinator::new(&input, Arc::new(pipeline), config);
        Harness {
            _dir: dir,
            input,
            moves,
            coordinator,
        }
    }

    fn only_failure(moves: &MoveLog, source: &Path) -> MoveEntry {
        let entries = moves.list_recent(1, 10).unwrap();
        assert_eq!(entries.len(), 1, "{:?}", entries);
        let entry = entries.into_iter().next().unwrap();
        assert_eq!(entry.status, MoveStatus::Failed);
        assert_eq!(entry.source_path, source.display().to_string());
        assert!(entry.destination_path.is_none());
        entry
    }

    #[tokio::test]
    async fn timed_out_ingestion_keeps_source_and_logs_failure() {
        let index = Arc::new(SqliteIndex::in_memory(Arc::new(HashEmbedder::default())).unwrap());
        let h = harness(index.clone(), Arc::new(Stalled), 1);
        let source = h.input.join("slow.txt");
        std::fs::write(&source, "takes forever").unwrap();

        assert!(h.coordinator.submit_file(source.clone()));
        wait_idle(&h.coordinator).await;

        assert!(source.exists());
        assert!(index.list_ids().await.unwrap().is_empty());
        only_failure(&h.moves, &source);
    }

    #[tokio::test]
    async fn index_write_failure_keeps_source_and_logs_failure() {
        let index = Arc::new(ReadOnlyIndex(
            SqliteIndex::in_memory(Arc::new(HashEmbedder::default())).unwrap(),
        ));
        let summarizer = Arc::new(Scripted {
            folder: "Notes",
            calls: AtomicUsize::new(0),
        });
        let h = harness(index, summarizer, 30);
        let source = h.input.join("memo.txt");
        std::fs::write(&source, "quarterly memo").unwrap();

        assert!(h.coordinator.submit_file(source.clone()));
        wait_idle(&h.coordinator).await;

        assert!(source.exists());
        let entry = only_failure(&h.moves, &source);
        assert!(entry.note.unwrap_or_default().contains("disk full"));
    }
}
