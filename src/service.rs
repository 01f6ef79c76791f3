// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! The long-lived service object tying watchers, ingestion, index and search together

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::archive::{Archive, ArchiveStats};
use crate::config::{AppConfig, EmbedderKind};
use crate::extract::{ContentExtractor, DefaultExtractor};
use crate::history::{ItemType, MoveEntry, MoveLog, Trigger};
use crate::index::embed::{Embedder, HashEmbedder, OllamaEmbedder};
use crate::index::sqlite::SqliteIndex;
use crate::index::VectorIndex;
use crate::ingest::{IngestOutcome, IngestionCoordinator, Pipeline};
use crate::maintain::IndexMaintainer;
use crate::ollama::OllamaClient;
use crate::placement::{ContextBuilder, PathPlanner};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::search::{SearchHit, SearchRanker};
use crate::summarizer::{OllamaSummarizer, Summarizer};
use crate::watcher::DirectoryWatcher;
use crate::{ArchivistError, Result};

/// Counts reported by `/stats` and `archivist status`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub archive: ArchiveStats,
    pub indexed: usize,
    pub in_flight: usize,
    pub reconciling: bool,
}

/// Owns every component and the watcher handles
///
/// Nothing runs until `start`; `stop` (or dropping the service) tears the
/// watchers and timers down again.
pub struct ArchiveService {
    config: AppConfig,
    archive: Archive,
    client: OllamaClient,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<Pipeline>,
    coordinator: IngestionCoordinator,
    maintainer: IndexMaintainer,
    reconciler: Arc<Reconciler>,
    ranker: SearchRanker,
    moves: MoveLog,
    watchers: Mutex<Vec<DirectoryWatcher>>,
}

impl ArchiveService {
    /// Build the production service: SQLite stores under the archive, Ollama oracle
    pub fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let client = OllamaClient::new(
            &config.ai_engine.url,
            Duration::from_secs(config.ai_engine.timeout_secs),
        )?;
        let embedder: Arc<dyn Embedder> = match config.ai_engine.embedder {
            EmbedderKind::Ollama => Arc::new(OllamaEmbedder::new(
                client.clone(),
                config.ai_engine.models.embedding.clone(),
            )),
            EmbedderKind::Hash => Arc::new(HashEmbedder::default()),
        };
        let index = Arc::new(SqliteIndex::open(config.index_path(), embedder)?);
        let summarizer = Arc::new(OllamaSummarizer::new(
            client.clone(),
            config.ai_engine.clone(),
            config.prompts.clone(),
        ));
        let moves = MoveLog::open(config.move_log_path())?;

        info!(
            archive = ?config.archive_dir,
            input = ?config.input_dir,
            index = ?config.index_path(),
            "Archive service opened"
        );
        Ok(Self::with_parts(config, client, index, summarizer, moves))
    }

    /// Assemble a service from explicit collaborators
    pub fn with_parts(
        config: AppConfig,
        client: OllamaClient,
        index: Arc<dyn VectorIndex>,
        summarizer: Arc<dyn Summarizer>,
        moves: MoveLog,
    ) -> Self {
        let archive = Archive::new(&config.archive_dir);
        let extractor: Arc<dyn ContentExtractor> = Arc::new(DefaultExtractor::new());
        let context = Arc::new(ContextBuilder::new(
            archive.clone(),
            Arc::clone(&index),
            Duration::from_secs(config.placement.context_ttl_secs),
            config.placement.max_tree_entries,
        ));
        let planner = PathPlanner::new(
            Arc::clone(&summarizer),
            config.placement.context_budget_chars,
        );
        let pipeline = Arc::new(
            Pipeline::new(
                archive.clone(),
                Arc::clone(&index),
                Arc::clone(&extractor),
                summarizer,
                planner,
                Arc::clone(&context),
            )
            .with_move_log(moves.clone()),
        );
        let coordinator = IngestionCoordinator::new(
            &config.input_dir,
            Arc::clone(&pipeline),
            config.ingest.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            archive.clone(),
            Arc::clone(&index),
            Arc::clone(&extractor),
            Arc::clone(&context),
            Duration::from_millis(config.reconcile.follow_up_delay_ms),
        ));
        let maintainer = IndexMaintainer::new(
            archive.clone(),
            Arc::clone(&index),
            extractor,
            context,
            Arc::clone(&reconciler),
            Duration::from_millis(config.reconcile.debounce_ms),
        )
        .with_workers(config.reconcile.index_workers);
        let ranker = SearchRanker::new(archive.clone(), Arc::clone(&index), config.search.clone());

        Self {
            config,
            archive,
            client,
            index,
            pipeline,
            coordinator,
            maintainer,
            reconciler,
            ranker,
            moves,
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn client(&self) -> &OllamaClient {
        &self.client
    }

    pub fn is_running(&self) -> bool {
        self.watchers.lock().map(|w| !w.is_empty()).unwrap_or(false)
    }

    /// Spawn the watchers and schedule the startup reconciliation
    ///
    /// Calling this on a running service does nothing.
    pub fn start(&self) -> Result<()> {
        let mut watchers = self
            .watchers
            .lock()
            .map_err(|_| ArchivistError::Watch(notify::Error::generic("watcher lock poisoned")))?;
        if !watchers.is_empty() {
            debug!("Service already started");
            return Ok(());
        }

        if self.config.watch_input {
            watchers.push(DirectoryWatcher::spawn(
                &self.config.input_dir,
                "input",
                Arc::new(self.coordinator.clone()),
            )?);
        } else {
            info!("Input watching disabled; uploads and CLI placement only");
        }
        watchers.push(DirectoryWatcher::spawn(
            &self.config.archive_dir,
            "archive",
            Arc::new(self.maintainer.clone()),
        )?);

        self.reconciler.schedule(
            "startup",
            Duration::from_millis(self.config.reconcile.startup_delay_ms),
        );
        info!(watchers = watchers.len(), "Archive service started");
        Ok(())
    }

    /// Stop watchers, pending timers and queued ingestion; safe to call twice
    pub fn stop(&self) {
        let stopped = match self.watchers.lock() {
            Ok(mut watchers) => {
                let count = watchers.len();
                watchers.clear();
                count
            }
            Err(_) => 0,
        };
        self.coordinator.shutdown();
        self.reconciler.cancel_scheduled();
        if stopped > 0 {
            info!(watchers = stopped, "Archive service stopped");
        }
    }

    /// File an uploaded file straight into the archive
    pub async fn ingest_upload(&self, filename: &str, bytes: &[u8]) -> Result<IngestOutcome> {
        let name = upload_name(filename)?;
        let result = self.pipeline.ingest_bytes(&name, bytes).await;
        match &result {
            Ok(outcome) => {
                self.pipeline.record_move(MoveEntry::success(
                    &name,
                    &outcome.relative_path,
                    ItemType::File,
                    Trigger::Upload,
                ));
                self.ranker.invalidate();
            }
            Err(e) => {
                warn!(filename = %name, error = %e, "Upload ingestion failed");
                self.pipeline.record_move(MoveEntry::failure(
                    &name,
                    ItemType::File,
                    Trigger::Upload,
                    e.to_string(),
                ));
            }
        }
        result
    }

    /// File a local file or folder; the source is left where it is
    ///
    /// With `dry_run` nothing is written and the returned path is where the
    /// item would land.
    pub async fn place(&self, path: &Path, dry_run: bool) -> Result<IngestOutcome> {
        if dry_run {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| ArchivistError::Placement(format!("No file name in {:?}", path)))?
                .to_string();
            let bytes = if path.is_dir() {
                Vec::new()
            } else {
                tokio::fs::read(path).await?
            };
            let (summary, decision) = self.pipeline.plan(&filename, &bytes).await?;
            let folder = decision.folder();
            return Ok(IngestOutcome {
                relative_path: format!("{}/{}", folder, filename),
                folder,
                reason: decision.reason,
                summary,
            });
        }

        let item_type = if path.is_dir() { ItemType::Folder } else { ItemType::File };
        let result = match item_type {
            ItemType::Folder => self.pipeline.ingest_folder(path).await,
            ItemType::File => self.pipeline.ingest_file(path).await,
        };
        let source = path.to_string_lossy().to_string();
        match &result {
            Ok(outcome) => {
                self.pipeline.record_move(MoveEntry::success(
                    source,
                    &outcome.relative_path,
                    item_type,
                    Trigger::Cli,
                ));
                self.ranker.invalidate();
            }
            Err(e) => self
                .pipeline
                .record_move(MoveEntry::failure(source, item_type, Trigger::Cli, e.to_string())),
        }
        result
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.ranker.search(query, limit).await
    }

    /// Run a reconciliation pass now, or join the one in progress
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let outcome = self.reconciler.reconcile_now().await?;
        self.ranker.invalidate();
        Ok(outcome)
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let archive = self.archive.clone();
        let archive_stats = tokio::task::spawn_blocking(move || archive.stats()).await??;
        Ok(ServiceStats {
            archive: archive_stats,
            indexed: self.index.count().await?,
            in_flight: self.coordinator.in_flight(),
            reconciling: self.reconciler.is_running(),
        })
    }

    pub fn moves(&self, hours: i64, limit: usize) -> Result<Vec<MoveEntry>> {
        self.moves.list_recent(hours, limit)
    }

    /// Whether the Ollama server answers
    pub async fn ollama_available(&self) -> bool {
        self.client.health_check().await.is_ok()
    }
}

impl Drop for ArchiveService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bare file name of an upload; rejects empty, hidden and path-only names
fn upload_name(filename: &str) -> Result<String> {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() || name == "." || name == ".." || name.starts_with('.') {
        return Err(ArchivistError::Placement(format!(
            "Invalid upload filename: {:?}",
            filename
        )));
    }
    Ok(name.to_string())
}
