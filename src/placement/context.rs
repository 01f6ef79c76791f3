// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Size-bounded snapshot of the archive and index handed to the summarizer

use serde::Serialize;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::normalize::MAX_DEPTH;
use crate::archive::{render_tree, Archive};
use crate::index::VectorIndex;
use crate::Result;

/// (tree lines, list entries) tried in order until the JSON fits the budget
const PRESETS: &[(usize, usize)] = &[(1200, 800), (600, 400), (300, 200), (120, 80)];

/// Smallest prompt budget accepted; the empty last-resort payload always fits in it
pub const MIN_CONTEXT_BUDGET: usize = 512;

/// Snapshot of the archive and index at one moment
#[derive(Debug, Clone, Default)]
pub struct PlacementContext {
    pub tree_lines: Vec<String>,
    pub tree_total: usize,
    pub archive_files: Vec<String>,
    pub indexed_files: Vec<String>,
    pub unindexed_files: Vec<String>,
    pub stale_index_records: Vec<String>,
    /// Every directory prefix up to seven levels, as spelled on disk
    pub existing_directories: BTreeSet<String>,
}

#[derive(Serialize)]
struct PromptPayload<'a> {
    archive_tree: String,
    archive_file_count: usize,
    indexed_file_count: usize,
    archive_files: Vec<Cow<'a, str>>,
    indexed_files: Vec<Cow<'a, str>>,
    unindexed_archive_files: Vec<Cow<'a, str>>,
    db_only_index_records: Vec<Cow<'a, str>>,
    existing_directories: Vec<Cow<'a, str>>,
}

impl PlacementContext {
    /// Derive the unindexed/stale lists and directory prefixes
    pub fn new(
        tree_lines: Vec<String>,
        tree_total: usize,
        mut archive_files: Vec<String>,
        directories: Vec<String>,
        mut indexed_files: Vec<String>,
    ) -> Self {
        archive_files.sort();
        archive_files.dedup();
        indexed_files.sort();
        indexed_files.dedup();

        let on_disk: HashSet<&str> = archive_files.iter().map(String::as_str).collect();
        let indexed: HashSet<&str> = indexed_files.iter().map(String::as_str).collect();

        let unindexed_files = archive_files
            .iter()
            .filter(|f| !indexed.contains(f.as_str()))
            .cloned()
            .collect();
        let stale_index_records = indexed_files
            .iter()
            .filter(|f| !on_disk.contains(f.as_str()))
            .cloned()
            .collect();

        let mut existing_directories = BTreeSet::new();
        for dir in &directories {
            add_prefixes(dir, &mut existing_directories);
        }
        for file in &archive_files {
            if let Some((parent, _)) = file.rsplit_once('/') {
                add_prefixes(parent, &mut existing_directories);
            }
        }

        Self {
            tree_lines,
            tree_total,
            archive_files,
            indexed_files,
            unindexed_files,
            stale_index_records,
            existing_directories,
        }
    }

    /// Serialize for the prompt, shrinking until it fits `budget` characters
    pub fn to_prompt_json(&self, budget: usize) -> String {
        for &(tree_cap, list_cap) in PRESETS {
            let payload = self.payload(tree_cap, list_cap, usize::MAX);
            let json = serde_json::to_string(&payload).unwrap_or_default();
            if json.chars().count() <= budget {
                return json;
            }
        }

        // Last resort: no tree, no file lists, as many directories as fit.
        // At a cap of zero nothing but the counts remains.
        let mut dir_cap = self.existing_directories.len();
        loop {
            let payload = self.payload(0, 0, dir_cap);
            let json = serde_json::to_string(&payload).unwrap_or_default();
            if json.chars().count() <= budget || dir_cap == 0 {
                debug!(dir_cap, "Placement context reduced to minimal preset");
                return json;
            }
            dir_cap /= 2;
        }
    }

    fn payload(&self, tree_cap: usize, list_cap: usize, dir_cap: usize) -> PromptPayload<'_> {
        let tree_lines = &self.tree_lines[..tree_cap.min(self.tree_lines.len())];
        let archive_tree = if tree_cap == 0 {
            String::new()
        } else {
            render_tree(tree_lines, self.tree_total)
        };

        // Shallow directories first so trimming drops the deepest ones
        let mut dirs: Vec<&str> = self.existing_directories.iter().map(String::as_str).collect();
        dirs.sort_by_key(|d| (d.matches('/').count(), *d));
        let existing_directories = capped(&dirs, dir_cap);

        PromptPayload {
            archive_tree,
            archive_file_count: self.archive_files.len(),
            indexed_file_count: self.indexed_files.len(),
            archive_files: capped_strings(&self.archive_files, list_cap),
            indexed_files: capped_strings(&self.indexed_files, list_cap),
            unindexed_archive_files: capped_strings(&self.unindexed_files, list_cap),
            db_only_index_records: capped_strings(&self.stale_index_records, list_cap),
            existing_directories,
        }
    }
}

fn add_prefixes(path: &str, out: &mut BTreeSet<String>) {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    for depth in 1..=parts.len().min(MAX_DEPTH) {
        out.insert(parts[..depth].join("/"));
    }
}

fn capped_strings(items: &[String], cap: usize) -> Vec<Cow<'_, str>> {
    let refs: Vec<&str> = items.iter().map(String::as_str).collect();
    capped(&refs, cap)
}

/// First `cap` items plus a `... (N more)` marker when truncated; empty at cap zero
fn capped<'a>(items: &[&'a str], cap: usize) -> Vec<Cow<'a, str>> {
    if cap == 0 {
        return Vec::new();
    }
    let mut out: Vec<Cow<'a, str>> = items.iter().take(cap).map(|s| Cow::Borrowed(*s)).collect();
    if items.len() > cap {
        out.push(Cow::Owned(format!("... ({} more)", items.len() - cap)));
    }
    out
}

/// Builds placement contexts and caches them for a short TTL
pub struct ContextBuilder {
    archive: Archive,
    index: Arc<dyn VectorIndex>,
    ttl: Duration,
    tree_entries: usize,
    cache: Mutex<Option<(Instant, Arc<PlacementContext>)>>,
}

impl ContextBuilder {
    pub fn new(
        archive: Archive,
        index: Arc<dyn VectorIndex>,
        ttl: Duration,
        tree_entries: usize,
    ) -> Self {
        Self {
            archive,
            index,
            ttl,
            tree_entries,
            cache: Mutex::new(None),
        }
    }

    /// Cached context, rebuilt when older than the TTL
    pub async fn get(&self) -> Result<Arc<PlacementContext>> {
        if let Some(context) = self.cached() {
            return Ok(context);
        }

        let context = Arc::new(self.build().await?);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), Arc::clone(&context)));
        }
        Ok(context)
    }

    fn cached(&self) -> Option<Arc<PlacementContext>> {
        let cache = self.cache.lock().ok()?;
        match cache.as_ref() {
            Some((built, context)) if built.elapsed() < self.ttl => Some(Arc::clone(context)),
            _ => None,
        }
    }

    /// Drop the cached context after any archive or index mutation
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    async fn build(&self) -> Result<PlacementContext> {
        let archive = self.archive.clone();
        let tree_entries = self.tree_entries;
        let (tree_lines, tree_total, files, directories) =
            tokio::task::spawn_blocking(move || -> Result<_> {
                let (lines, total) = archive.tree_lines(tree_entries)?;
                let files = archive.list_files()?;
                let directories = archive.list_directories(MAX_DEPTH)?;
                Ok((lines, total, files, directories))
            })
            .await??;

        let indexed = self.index.list_ids().await?;
        debug!(
            files = files.len(),
            indexed = indexed.len(),
            "Built placement context"
        );
        Ok(PlacementContext::new(
            tree_lines,
            tree_total,
            files,
            directories,
            indexed,
        ))
    }
}
