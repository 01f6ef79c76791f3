// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! File system watcher for the input and archive roots

use async_trait::async_trait;
use notify::event::{ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    Modified,
    Moved,
    Deleted,
}

/// Normalized filesystem event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub is_directory: bool,
    pub source_path: PathBuf,
    /// Destination of a move; `None` when it left the watched tree
    pub dest_path: Option<PathBuf>,
}

impl WatchEvent {
    pub fn created(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self::single(WatchKind::Created, path, is_directory)
    }

    pub fn modified(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self::single(WatchKind::Modified, path, is_directory)
    }

    pub fn deleted(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self::single(WatchKind::Deleted, path, is_directory)
    }

    pub fn moved(from: impl Into<PathBuf>, to: Option<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind: WatchKind::Moved,
            is_directory,
            source_path: from.into(),
            dest_path: to,
        }
    }

    fn single(kind: WatchKind, path: impl Into<PathBuf>, is_directory: bool) -> Self {
        Self {
            kind,
            is_directory,
            source_path: path.into(),
            dest_path: None,
        }
    }
}

/// Receives normalized events from a watcher's listener task
///
/// Implementations must return quickly and hand long work to their own tasks.
#[async_trait]
pub trait WatchHandler: Send + Sync + 'static {
    async fn handle(&self, event: WatchEvent);
}

/// Map one notify event onto zero or more watch events
pub fn normalize_event(event: Event) -> Vec<WatchEvent> {
    let paths = event.paths;
    match event.kind {
        EventKind::Create(kind) => paths
            .into_iter()
            .map(|p| {
                let is_dir = p.is_dir() || matches!(kind, notify::event::CreateKind::Folder);
                WatchEvent::created(p, is_dir)
            })
            .collect(),

        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),

        EventKind::Modify(ModifyKind::Name(mode)) => normalize_rename(mode, paths),

        EventKind::Modify(_) => paths
            .into_iter()
            .map(|p| {
                let is_dir = p.is_dir();
                WatchEvent::modified(p, is_dir)
            })
            .collect(),

        EventKind::Remove(kind) => paths
            .into_iter()
            .map(|p| WatchEvent::deleted(p, matches!(kind, RemoveKind::Folder)))
            .collect(),

        _ => Vec::new(),
    }
}

fn normalize_rename(mode: RenameMode, paths: Vec<PathBuf>) -> Vec<WatchEvent> {
    let paired = match mode {
        RenameMode::Both => paths.len() >= 2,
        RenameMode::Any => paths.len() == 2,
        _ => false,
    };
    if paired {
        let mut paths = paths.into_iter();
        if let (Some(from), Some(to)) = (paths.next(), paths.next()) {
            let is_dir = to.is_dir();
            return vec![WatchEvent::moved(from, Some(to), is_dir)];
        }
        return Vec::new();
    }

    paths
        .into_iter()
        .map(|p| match mode {
            RenameMode::From => WatchEvent::moved(p, None, false),
            RenameMode::To => {
                let is_dir = p.is_dir();
                WatchEvent::created(p, is_dir)
            }
            _ if p.exists() => {
                let is_dir = p.is_dir();
                WatchEvent::created(p, is_dir)
            }
            _ => WatchEvent::deleted(p, false),
        })
        .collect()
}

/// Recursive watcher over one root with a single listener task
pub struct DirectoryWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    listener: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Start watching `root`, creating it if missing
    pub fn spawn(root: &Path, label: &'static str, handler: Arc<dyn WatchHandler>) -> Result<Self> {
        if !root.exists() {
            std::fs::create_dir_all(root)?;
            info!("Created watch directory: {:?}", root);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let config = Config::default().with_poll_interval(Duration::from_secs(2));
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Receiver gone means the watcher is shutting down
                let _ = tx.send(res);
            },
            config,
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let listener = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => {
                        for normalized in normalize_event(event) {
                            trace!(watcher = label, ?normalized, "Watch event");
                            handler.handle(normalized).await;
                        }
                    }
                    Err(e) => warn!(watcher = label, error = %e, "Watcher error"),
                }
            }
            debug!(watcher = label, "Watch listener finished");
        });

        info!(watcher = label, "Watching: {:?}", root);
        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
            listener,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stop delivering events
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// True when any component of `path` below `root` is hidden
pub fn is_hidden_below(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map_or(false, |name| name.starts_with('.'))
    })
}

/// Check if a dropped file should be ingested
pub fn should_process(path: &Path) -> bool {
    let filename = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };

    // Hidden files
    if filename.starts_with('.') {
        return false;
    }

    // Partial downloads
    let temp_extensions = [".tmp", ".part", ".crdownload", ".partial", ".download"];
    let lowered = filename.to_ascii_lowercase();
    if temp_extensions.iter().any(|ext| lowered.ends_with(ext)) {
        return false;
    }

    // System files
    let skip_names = ["desktop.ini", "thumbs.db"];
    if skip_names.iter().any(|n| filename.eq_ignore_ascii_case(n)) {
        return false;
    }

    true
}

/// Outcome of waiting for a file to stop growing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Stable,
    /// The file disappeared while waiting
    Gone,
    /// Still changing when the cap was hit; processed anyway
    TimedOut,
}

/// Poll a file's size until two consecutive reads agree
pub async fn wait_for_stable(path: &Path, interval: Duration, max_wait: Duration) -> Settle {
    let start = Instant::now();

    let mut last_size = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(_) => return Settle::Gone,
    };

    loop {
        tokio::time::sleep(interval).await;

        let current_size = match tokio::fs::metadata(path).await {
            Ok(m) => m.len(),
            Err(_) => return Settle::Gone,
        };

        if current_size == last_size {
            return Settle::Stable;
        }

        if start.elapsed() > max_wait {
            warn!("File stability check timed out for {:?}", path);
            return Settle::TimedOut;
        }

        last_size = current_size;
        debug!("File {:?} still being written, size: {}", path, current_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind};
    use tempfile::TempDir;

    fn event(kind: EventKind, paths: Vec<PathBuf>) -> Event {
        let mut event = Event::new(kind);
        event.paths = paths;
        event
    }

    #[test]
    fn test_should_process() {
        assert!(should_process(Path::new("/input/invoice.pdf")));
        assert!(should_process(Path::new("/input/photo.JPG")));
        assert!(!should_process(Path::new("/input/.hidden")));
        assert!(!should_process(Path::new("/input/movie.mp4.crdownload")));
        assert!(!should_process(Path::new("/input/data.TMP")));
        assert!(!should_process(Path::new("/input/Thumbs.db")));
    }

    #[test]
    fn hidden_check_ignores_root_ancestors() {
        let root = Path::new("/tmp/.tmpAbc/archive");
        assert!(!is_hidden_below(root, &root.join("Work/a.txt")));
        assert!(is_hidden_below(root, &root.join(".archivist/index.db")));
        assert!(is_hidden_below(root, &root.join("Work/.cache/x")));
    }

    #[test]
    fn rename_both_becomes_move() {
        let events = normalize_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![PathBuf::from("/a/old.txt"), PathBuf::from("/a/new.txt")],
        ));
        assert_eq!(
            events,
            vec![WatchEvent::moved("/a/old.txt", Some(PathBuf::from("/a/new.txt")), false)]
        );
    }

    #[test]
    fn rename_halves_map_to_move_out_and_create() {
        let from = normalize_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            vec![PathBuf::from("/a/x.txt")],
        ));
        assert_eq!(from, vec![WatchEvent::moved("/a/x.txt", None, false)]);

        let to = normalize_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            vec![PathBuf::from("/nonexistent/y.txt")],
        ));
        assert_eq!(to, vec![WatchEvent::created("/nonexistent/y.txt", false)]);
    }

    #[test]
    fn unknown_rename_checks_existence() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("here.txt");
        std::fs::write(&present, "x").unwrap();
        let missing = dir.path().join("gone.txt");

        let events = normalize_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
            vec![present.clone()],
        ));
        assert_eq!(events, vec![WatchEvent::created(present, false)]);

        let events = normalize_event(event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
            vec![missing.clone()],
        ));
        assert_eq!(events, vec![WatchEvent::deleted(missing, false)]);
    }

    #[test]
    fn metadata_changes_are_ignored() {
        let events = normalize_event(event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            vec![PathBuf::from("/a/x.txt")],
        ));
        assert!(events.is_empty());

        let events = normalize_event(event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            vec![PathBuf::from("/a/x.txt")],
        ));
        assert_eq!(events, vec![WatchEvent::modified("/a/x.txt", false)]);
    }

    #[test]
    fn folder_kinds_mark_directories() {
        let created = normalize_event(event(
            EventKind::Create(CreateKind::Folder),
            vec![PathBuf::from("/nonexistent/dir")],
        ));
        assert!(created[0].is_directory);

        let removed = normalize_event(event(
            EventKind::Remove(RemoveKind::Folder),
            vec![PathBuf::from("/nonexistent/dir")],
        ));
        assert_eq!(removed, vec![WatchEvent::deleted("/nonexistent/dir", true)]);
    }

    #[tokio::test]
    async fn settle_reports_stable_and_gone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"12345").unwrap();

        let interval = Duration::from_millis(10);
        assert_eq!(
            wait_for_stable(&path, interval, Duration::from_secs(1)).await,
            Settle::Stable
        );
        assert_eq!(
            wait_for_stable(&dir.path().join("missing"), interval, Duration::from_secs(1)).await,
            Settle::Gone
        );
    }
}
