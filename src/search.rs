// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Query-time reranking over semantic hits plus a lexical path fallback

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::archive::{is_ignored_relative, Archive};
use crate::config::SearchConfig;
use crate::extract::{extension_of, CODE_EXTENSIONS};
use crate::index::VectorIndex;
use crate::Result;

const SEMANTIC_WEIGHT: f64 = 3.2;
const NAME_WEIGHT: f64 = 1.7;

/// Extensions people usually mean when searching their own files
const PREFERRED_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "txt", "md", "rtf", "xlsx", "xls", "csv", "pptx", "jpg", "jpeg", "png",
    "heic",
];

const CODE_HINTS: &[&str] = &[
    "code", "script", "scripts", "source", "function", "class", "module", "api", "bug", "python",
    "rust", "javascript", "typescript", "golang", "java", "program",
];

/// One ranked result
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Archive-relative path
    pub path: String,
    pub absolute_path: PathBuf,
    pub score: f64,
    pub semantic: f64,
    pub name: f64,
    pub file_type: f64,
}

/// Lowercase, single-spaced query text
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Alphanumeric words of at least two characters
pub fn query_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn semantic_score(distance: Option<f32>) -> f64 {
    match distance {
        Some(d) => 1.0 / (1.0 + f64::from(d.max(0.0))),
        None => 0.0,
    }
}

/// How well the file's name and path match the query
pub fn name_score(query: &str, tokens: &[String], relative: &str) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let path = relative.to_lowercase();
    let filename = path.rsplit('/').next().unwrap_or(&path).to_string();
    let stem = Path::new(&filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&filename)
        .to_string();
    let stem_tokens = query_tokens(&stem);

    let mut score = if stem == query || filename == query {
        1.0
    } else if stem.starts_with(query) {
        0.75
    } else if stem.contains(query) {
        0.55
    } else if path.contains(query) {
        0.35
    } else {
        similarity_ratio(query, &stem) * 0.4
    };

    for token in tokens {
        if stem_tokens.contains(token) {
            score += 0.15;
        } else if stem.contains(token.as_str()) {
            score += 0.08;
        } else if path.contains(token.as_str()) {
            score += 0.04;
        }
    }
    score
}

/// Whether the query is about source code
pub fn is_code_query(tokens: &[String]) -> bool {
    tokens
        .iter()
        .any(|t| CODE_HINTS.contains(&t.as_str()) || CODE_EXTENSIONS.contains(&t.as_str()))
}

/// Extension-based adjustment
pub fn type_score(tokens: &[String], relative: &str, code_query: bool) -> f64 {
    let ext = extension_of(relative);
    if ext.is_empty() {
        return -0.05;
    }

    let mut score = 0.0;
    if tokens.iter().any(|t| *t == ext) {
        score += 0.35;
    }
    if PREFERRED_EXTENSIONS.contains(&ext.as_str()) {
        score += 0.1;
    }
    if CODE_EXTENSIONS.contains(&ext.as_str()) && !code_query {
        score -= 0.45;
    }
    score
}

/// Ratcliff/Obershelp similarity in [0, 1]
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    // Longest common substring, leftmost on ties
    let mut best = (0usize, 0usize, 0usize);
    let mut prev = vec![0usize; b.len() + 1];
    for i in 0..a.len() {
        let mut row = vec![0usize; b.len() + 1];
        for j in 0..b.len() {
            if a[i] == b[j] {
                row[j + 1] = prev[j] + 1;
                if row[j + 1] > best.2 {
                    best = (i + 1 - row[j + 1], j + 1 - row[j + 1], row[j + 1]);
                }
            }
        }
        prev = row;
    }

    let (i, j, len) = best;
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + len..], &b[j + len..])
}

fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.semantic.total_cmp(&a.semantic))
        .then_with(|| b.name.total_cmp(&a.name))
        .then_with(|| b.file_type.total_cmp(&a.file_type))
        .then_with(|| b.path.cmp(&a.path))
}

/// Score and order candidates; `exists` filters out stale paths
pub fn rank_candidates<F>(
    query: &str,
    candidates: &BTreeMap<String, Option<f32>>,
    archive: &Archive,
    exists: F,
) -> Vec<SearchHit>
where
    F: Fn(&Path) -> bool,
{
    let normalized = normalize_query(query);
    let tokens = query_tokens(&normalized);
    let code_query = is_code_query(&tokens);

    let mut hits: Vec<SearchHit> = candidates
        .iter()
        .filter(|(path, _)| !is_ignored_relative(path))
        .filter_map(|(path, distance)| {
            let absolute_path = archive.absolute(path);
            if !exists(&absolute_path) {
                return None;
            }
            let semantic = semantic_score(*distance);
            let name = name_score(&normalized, &tokens, path);
            let file_type = type_score(&tokens, path, code_query);
            Some(SearchHit {
                path: path.clone(),
                absolute_path,
                score: semantic * SEMANTIC_WEIGHT + name * NAME_WEIGHT + file_type,
                semantic,
                name,
                file_type,
            })
        })
        .collect();

    hits.sort_by(rank_order);
    hits
}

/// Reranks index results and backfills lexical path matches
pub struct SearchRanker {
    archive: Archive,
    index: Arc<dyn VectorIndex>,
    config: SearchConfig,
    paths: Mutex<Option<(Instant, Arc<Vec<String>>)>>,
}

impl SearchRanker {
    pub fn new(archive: Archive, index: Arc<dyn VectorIndex>, config: SearchConfig) -> Self {
        Self {
            archive,
            index,
            config,
            paths: Mutex::new(None),
        }
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config.path_cache_ttl_secs)
    }

    /// Archive and index paths, cached for a few seconds
    async fn known_paths(&self) -> Result<Arc<Vec<String>>> {
        if let Ok(cache) = self.paths.lock() {
            if let Some((built, paths)) = cache.as_ref() {
                if built.elapsed() < self.cache_ttl() {
                    return Ok(Arc::clone(paths));
                }
            }
        }

        let archive = self.archive.clone();
        let mut paths = tokio::task::spawn_blocking(move || archive.list_files()).await??;
        paths.extend(self.index.list_ids().await?);
        paths.sort();
        paths.dedup();

        let paths = Arc::new(paths);
        if let Ok(mut cache) = self.paths.lock() {
            *cache = Some((Instant::now(), Arc::clone(&paths)));
        }
        Ok(paths)
    }

    /// Forget cached paths after the archive changes
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.paths.lock() {
            *cache = None;
        }
    }

    /// Top `limit` results for a free-text query
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let normalized = normalize_query(query);
        if normalized.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let k = limit.saturating_mul(self.config.fetch_factor).max(self.config.fetch_floor);

        let mut candidates: BTreeMap<String, Option<f32>> = BTreeMap::new();
        for hit in self.index.query(&normalized, k).await? {
            candidates.insert(hit.id, hit.distance);
        }
        let semantic = candidates.len();

        let tokens = query_tokens(&normalized);
        for path in self.known_paths().await?.iter() {
            let lowered = path.to_lowercase();
            if lowered.contains(&normalized) || tokens.iter().any(|t| lowered.contains(t.as_str())) {
                candidates.entry(path.clone()).or_insert(None);
            }
        }

        let mut hits = rank_candidates(&normalized, &candidates, &self.archive, Path::exists);
        debug!(
            query = %normalized,
            semantic,
            lexical = candidates.len() - semantic,
            returned = hits.len().min(limit),
            "Search ranked"
        );
        hits.truncate(limit);
        Ok(hits)
    }
}
