// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Filesystem access to the curated archive tree

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::INDEX_DIR_NAME;
use crate::{ArchivistError, Result};

static STAGING_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^temp_.+_\d+$").unwrap());

/// Highest numeric suffix tried before giving up on a name
const MAX_SUFFIX: u32 = 10_000;

/// `temp_<name>_<unixts>` directories used while moving folders in
pub fn is_staging_name(name: &str) -> bool {
    STAGING_NAME.is_match(name)
}

/// Names never surfaced from the archive: dotfiles, index storage, staging dirs
pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || name == INDEX_DIR_NAME || is_staging_name(name)
}

/// Whether any component of a relative path is ignored
pub fn is_ignored_relative(relative: &str) -> bool {
    relative.split('/').any(is_ignored_name)
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub directories: usize,
}

/// The archive root and the operations the rest of the crate needs on it
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |acc, s| acc.join(s))
    }

    /// `/`-separated path relative to the root, None outside it
    pub fn relative(&self, path: &Path) -> Option<String> {
        let stripped = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = stripped
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.absolute(relative).exists()
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.absolute(relative))?)
    }

    /// Write a file into `folder`, picking `name_2.ext`, `name_3.ext`, ... on collision
    ///
    /// Returns the final relative path.
    pub fn save(&self, folder: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        let dir = self.absolute(folder);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ArchivistError::Placement(format!("Cannot create {}: {}", dir.display(), e))
        })?;

        let (stem, ext) = split_name(filename);
        for n in 1..=MAX_SUFFIX {
            let candidate = suffixed(stem, ext, n);
            let target = dir.join(&candidate);
            match OpenOptions::new().write(true).create_new(true).open(&target) {
                Ok(mut file) => {
                    file.write_all(bytes)?;
                    file.sync_all()?;
                    let relative = join_relative(folder, &candidate);
                    debug!(path = %relative, "Saved file into archive");
                    return Ok(relative);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(ArchivistError::Placement(format!(
            "No free name for {} in {}",
            filename, folder
        )))
    }

    /// Move a whole source directory into `folder` under `name`
    ///
    /// The tree is copied into a `temp_<name>_<unixts>` staging directory next to
    /// the destination and renamed into place once complete. Returns the final
    /// relative directory path.
    pub fn save_folder(&self, folder: &str, name: &str, source: &Path) -> Result<String> {
        let parent = self.absolute(folder);
        std::fs::create_dir_all(&parent).map_err(|e| {
            ArchivistError::Placement(format!("Cannot create {}: {}", parent.display(), e))
        })?;

        let staging = parent.join(format!(
            "temp_{}_{}",
            name,
            chrono::Utc::now().timestamp()
        ));
        std::fs::create_dir_all(&staging)?;

        if let Err(e) = copy_tree(source, &staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        for n in 1..=MAX_SUFFIX {
            let candidate = suffixed(name, "", n);
            let target = parent.join(&candidate);
            if target.exists() {
                continue;
            }
            match std::fs::rename(&staging, &target) {
                Ok(()) => {
                    let relative = join_relative(folder, &candidate);
                    debug!(path = %relative, "Moved folder into archive");
                    return Ok(relative);
                }
                Err(e) if target.exists() => {
                    debug!(error = %e, "Folder name taken during rename, retrying");
                    continue;
                }
                Err(e) => {
                    let _ = std::fs::remove_dir_all(&staging);
                    return Err(e.into());
                }
            }
        }

        let _ = std::fs::remove_dir_all(&staging);
        Err(ArchivistError::Placement(format!(
            "No free folder name for {} in {}",
            name, folder
        )))
    }

    /// Every visible file, sorted
    pub fn list_files(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        self.walk_files(&self.root)
    }

    /// Visible files below a relative directory, sorted
    pub fn list_files_under(&self, relative_dir: &str) -> Result<Vec<String>> {
        let dir = self.absolute(relative_dir);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        self.walk_files(&dir)
    }

    fn walk_files(&self, start: &Path) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(start)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_ignored_name(&e.file_name().to_string_lossy()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Entries can vanish mid-walk
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable archive entry");
                    continue;
                }
            };
            if entry.file_type().is_file() {
                if let Some(relative) = self.relative(entry.path()) {
                    files.push(relative);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Visible directories up to `max_depth` levels, sorted
    pub fn list_directories(&self, max_depth: usize) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<String> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| !is_ignored_name(&e.file_name().to_string_lossy()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| self.relative(e.path()))
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Render the tree with `|-- ` / `` `-- `` connectors, directories ending in `/`
    ///
    /// Stops after `max_entries` lines and appends a `... (N more)` marker.
    pub fn tree(&self, max_entries: usize) -> Result<String> {
        let (lines, total) = self.tree_lines(max_entries)?;
        Ok(render_tree(&lines, total))
    }

    /// Up to `max_entries` rendered tree lines plus the total entry count
    pub fn tree_lines(&self, max_entries: usize) -> Result<(Vec<String>, usize)> {
        let mut root = TreeNode::default();
        let mut total = 0usize;

        if self.root.exists() {
            for entry in WalkDir::new(&self.root)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_ignored_name(&e.file_name().to_string_lossy()))
                .filter_map(|e| e.ok())
            {
                let Some(relative) = self.relative(entry.path()) else {
                    continue;
                };
                let mut node = &mut root;
                for part in relative.split('/') {
                    node = node.children.entry(part.to_string()).or_default();
                }
                node.is_dir = entry.file_type().is_dir();
                total += 1;
            }
        }

        let mut lines = Vec::new();
        render(&root, "", max_entries, &mut lines);
        Ok((lines, total))
    }

    pub fn stats(&self) -> Result<ArchiveStats> {
        Ok(ArchiveStats {
            files: self.list_files()?.len(),
            directories: self.list_directories(usize::MAX)?.len(),
        })
    }
}

#[derive(Default)]
struct TreeNode {
    is_dir: bool,
    children: BTreeMap<String, TreeNode>,
}

fn render(node: &TreeNode, prefix: &str, max_entries: usize, lines: &mut Vec<String>) {
    let count = node.children.len();
    for (i, (name, child)) in node.children.iter().enumerate() {
        if lines.len() >= max_entries {
            return;
        }
        let last = i + 1 == count;
        let connector = if last { "`-- " } else { "|-- " };
        let suffix = if child.is_dir { "/" } else { "" };
        lines.push(format!("{}{}{}{}", prefix, connector, name, suffix));
        if child.is_dir {
            let child_prefix = format!("{}{}", prefix, if last { "    " } else { "|   " });
            render(child, &child_prefix, max_entries, lines);
        }
    }
}

/// Join tree lines, marking how many entries were left out
pub fn render_tree(lines: &[String], total: usize) -> String {
    let mut out = lines.join("\n");
    if total > lines.len() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("... ({} more)", total - lines.len()));
    }
    out
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| ArchivistError::FileSystem(e.into()))?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            continue;
        }
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn split_name(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx + 1..]),
        _ => (filename, ""),
    }
}

fn suffixed(stem: &str, ext: &str, n: u32) -> String {
    let base = if n == 1 {
        stem.to_string()
    } else {
        format!("{}_{}", stem, n)
    };
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

fn join_relative(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}
