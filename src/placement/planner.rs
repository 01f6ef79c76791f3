// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Turns a free-text folder suggestion into a stable path that fits the existing tree

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::PlacementContext;
use super::normalize::{
    canonical_token, domain_aliases, domain_folder, domain_of, is_generic_root,
    is_generic_segment, normalize_segments, path_key, raw_segments, sanitize_segment,
    strip_generic_root, tokenize, MAX_DEPTH,
};
use super::parse::parse_suggestion;
use crate::extract::{classify, extension_of, FileKind};
use crate::summarizer::{PathRequest, Summarizer};

/// Minimum score for an existing directory to become the anchor
const ANCHOR_THRESHOLD: f64 = 1.5;

/// Existing directories listed in the prompt
const PROMPT_CANDIDATES: usize = 20;

/// Which rule produced the folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementReason {
    /// Suggestion names an existing directory
    Existing,
    /// Suggestion extends an existing directory
    ExtendsExisting,
    /// Suggestion starts at an existing top-level folder
    ExistingRoot,
    /// Suggestion tail spliced onto the best existing directory
    Anchored,
    /// Suggestion opens a new, non-generic top-level folder
    NewRoot,
    /// No usable suggestion; best existing directory
    Anchor,
    /// Generic suggestion used as-is
    Suggestion,
    /// Extension or keyword bucket
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementDecision {
    pub segments: Vec<String>,
    pub reason: PlacementReason,
}

impl PlacementDecision {
    pub fn folder(&self) -> String {
        self.segments.join("/")
    }
}

/// Existing directories keyed by their normalized, lowercased form
struct ExistingDirs {
    by_key: BTreeMap<String, Vec<String>>,
    roots: BTreeSet<String>,
}

impl ExistingDirs {
    fn new(directories: &BTreeSet<String>) -> Self {
        let mut by_key = BTreeMap::new();
        let mut roots = BTreeSet::new();
        for dir in directories {
            let normalized = normalize_segments(dir);
            if normalized.is_empty() {
                continue;
            }
            roots.insert(normalized[0].to_lowercase());
            let spelled: Vec<String> = raw_segments(dir).into_iter().take(MAX_DEPTH).collect();
            if spelled.len() == normalized.len() {
                by_key.entry(path_key(&normalized)).or_insert(spelled);
            }
        }
        Self { by_key, roots }
    }

    fn normalized(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        self.by_key.values().map(|spelled| {
            spelled.iter().map(|s| sanitize_segment(s)).collect()
        })
    }

    fn contains(&self, segments: &[String]) -> bool {
        !segments.is_empty() && self.by_key.contains_key(&path_key(segments))
    }

    fn has_existing_prefix(&self, segments: &[String]) -> bool {
        (1..=segments.len().min(MAX_DEPTH)).any(|n| self.contains(&segments[..n]))
    }

    fn has_root(&self, segments: &[String]) -> bool {
        segments
            .first()
            .map_or(false, |s| self.roots.contains(&s.to_lowercase()))
    }

    /// Replace the longest existing prefix with its on-disk spelling
    fn spelled(&self, segments: &[String]) -> Vec<String> {
        for n in (1..=segments.len()).rev() {
            if let Some(real) = self.by_key.get(&path_key(&segments[..n])) {
                let mut out = real.clone();
                out.extend_from_slice(&segments[n..]);
                return out;
            }
        }
        segments.to_vec()
    }
}

/// Score every existing directory against the summary and filename
///
/// Sorted best first, ties by path.
fn score_candidates(filename: &str, summary: &str, dirs: &ExistingDirs) -> Vec<(f64, Vec<String>)> {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);

    let mut summary_tokens = tokenize(summary);
    let filename_tokens = tokenize(stem);
    if let Some(domain) = domain_of(summary) {
        summary_tokens.insert(domain.to_string());
        summary_tokens.extend(domain_aliases(domain).iter().map(|a| a.to_string()));
    }
    if summary_tokens.is_empty() && filename_tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(f64, Vec<String>)> = dirs
        .normalized()
        .map(|candidate| {
            let score = score_candidate(&candidate, &summary_tokens, &filename_tokens);
            (score, candidate)
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored
}

fn score_candidate(
    candidate: &[String],
    summary_tokens: &BTreeSet<String>,
    filename_tokens: &BTreeSet<String>,
) -> f64 {
    let tokens = tokenize(&candidate.join(" "));
    if tokens.is_empty() {
        return -1.0;
    }

    let summary_overlap = tokens.intersection(summary_tokens).count() as f64;
    let filename_overlap = tokens.intersection(filename_tokens).count() as f64;

    let mut score = summary_overlap * 2.0 + filename_overlap * 3.0;
    if !is_generic_root(candidate) {
        score += 0.6;
    }
    score -= candidate.iter().filter(|s| is_generic_segment(s)).count() as f64;
    score += candidate.len().min(MAX_DEPTH) as f64 * 0.1;
    score
}

/// Splice a suggestion that invents structure onto the anchor directory
fn anchor_suggestion(model: &[String], anchor: &[String], dirs: &ExistingDirs) -> Vec<String> {
    if anchor.is_empty() {
        return model.to_vec();
    }
    if model.is_empty() {
        return anchor.to_vec();
    }
    if dirs.contains(model) || dirs.has_existing_prefix(model) {
        return model.to_vec();
    }

    let anchor_lower: HashSet<String> = anchor.iter().map(|p| p.to_lowercase()).collect();
    let anchor_canonical: HashSet<String> = anchor
        .iter()
        .map(|p| canonical_token(p))
        .filter(|c| !c.is_empty())
        .collect();

    let mut parts: Vec<String> = model.to_vec();

    // An invented root carries no information the anchor doesn't
    if !dirs.has_root(&parts) {
        parts.remove(0);
    }

    // Start at the first segment the anchor already names
    if let Some(idx) = parts.iter().position(|p| anchor_lower.contains(&p.to_lowercase())) {
        parts.drain(..idx);
    }

    let max_overlap = anchor.len().min(parts.len());
    let overlap = (1..=max_overlap)
        .rev()
        .find(|&size| {
            anchor[anchor.len() - size..]
                .iter()
                .zip(&parts[..size])
                .all(|(a, p)| a.eq_ignore_ascii_case(p))
        })
        .unwrap_or(0);
    parts.drain(..overlap);

    let mut tail: Vec<String> = Vec::new();
    for part in parts {
        let cleaned = sanitize_segment(&part);
        if cleaned.is_empty() {
            continue;
        }
        let lowered = cleaned.to_lowercase();
        let canonical = canonical_token(&cleaned);
        if is_generic_segment(&cleaned)
            || anchor_lower.contains(&lowered)
            || (!canonical.is_empty() && anchor_canonical.contains(&canonical))
            || tail.last().map_or(false, |prev| prev.to_lowercase() == lowered)
        {
            continue;
        }
        tail.push(cleaned);
    }

    if tail.is_empty() {
        return anchor.to_vec();
    }

    let joined: Vec<String> = anchor.iter().chain(tail.iter()).take(MAX_DEPTH).cloned().collect();
    if is_generic_root(&joined) {
        return anchor.to_vec();
    }
    joined
}

/// Extension or keyword bucket for when nothing better is known
pub fn fallback_folder(filename: &str, summary: &str) -> String {
    if let Some(domain) = domain_of(summary) {
        return domain_folder(domain);
    }
    match classify(filename) {
        FileKind::Image => "Images",
        FileKind::Audio => "Audio",
        FileKind::Video => "Video",
        FileKind::Archive => "Archives",
        FileKind::Code => "Code",
        FileKind::Other => "Inbox",
    }
    .to_string()
}

/// Raw suggestion segments that are really the filename get dropped
fn strip_filename_segments(raw: &str, filename: &str) -> String {
    let filename_lower = filename.to_lowercase();
    let ext = extension_of(filename);
    raw_segments(raw)
        .into_iter()
        .filter(|s| {
            let lower = s.to_lowercase();
            lower != filename_lower && (ext.is_empty() || !lower.ends_with(&format!(".{}", ext)))
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Pick the folder for `filename` from a model response and the existing directories
///
/// Pure: identical inputs always give identical output.
pub fn resolve(
    filename: &str,
    summary: &str,
    response: &str,
    directories: &BTreeSet<String>,
) -> PlacementDecision {
    let dirs = ExistingDirs::new(directories);

    let extracted = parse_suggestion(response).unwrap_or_default();
    let suggestion = strip_generic_root(normalize_segments(&strip_filename_segments(
        &extracted, filename,
    )));

    let scored = score_candidates(filename, summary, &dirs);
    let anchor: Option<Vec<String>> = scored
        .first()
        .filter(|(score, _)| *score >= ANCHOR_THRESHOLD)
        .map(|(_, path)| path.clone());

    let (segments, reason) = choose(&suggestion, anchor.as_deref(), &dirs, filename, summary);
    let segments = enforce_invariants(segments, filename, summary);
    let spelled = dirs.spelled(&segments);

    debug!(
        filename,
        suggestion = %suggestion.join("/"),
        anchor = %anchor.as_ref().map(|a| a.join("/")).unwrap_or_default(),
        folder = %spelled.join("/"),
        ?reason,
        "Resolved placement"
    );
    PlacementDecision {
        segments: spelled,
        reason,
    }
}

fn choose(
    suggestion: &[String],
    anchor: Option<&[String]>,
    dirs: &ExistingDirs,
    filename: &str,
    summary: &str,
) -> (Vec<String>, PlacementReason) {
    if !suggestion.is_empty() {
        if dirs.contains(suggestion) {
            return (suggestion.to_vec(), PlacementReason::Existing);
        }
        if dirs.has_existing_prefix(suggestion) {
            return (suggestion.to_vec(), PlacementReason::ExtendsExisting);
        }
        if dirs.has_root(suggestion) {
            return (suggestion.to_vec(), PlacementReason::ExistingRoot);
        }
        if let Some(anchor) = anchor {
            return (anchor_suggestion(suggestion, anchor, dirs), PlacementReason::Anchored);
        }
        if !is_generic_root(suggestion) {
            return (suggestion.to_vec(), PlacementReason::NewRoot);
        }
    }

    if let Some(anchor) = anchor {
        return (anchor.to_vec(), PlacementReason::Anchor);
    }
    if !suggestion.is_empty() {
        return (suggestion.to_vec(), PlacementReason::Suggestion);
    }
    (vec![fallback_folder(filename, summary)], PlacementReason::Fallback)
}

/// No segment may name the file itself; depth stays within bounds
fn enforce_invariants(segments: Vec<String>, filename: &str, summary: &str) -> Vec<String> {
    let forbidden: HashSet<String> = [filename.to_lowercase(), sanitize_segment(filename).to_lowercase()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    let allowed = |s: &String| !forbidden.contains(&s.to_lowercase());

    let kept: Vec<String> = segments
        .into_iter()
        .filter(|s| allowed(s) && s != "." && s != ".." && !s.is_empty())
        .take(MAX_DEPTH)
        .collect();
    if !kept.is_empty() {
        return kept;
    }

    let bucket = [fallback_folder(filename, summary), "Inbox".to_string(), "Unfiled".to_string()]
        .into_iter()
        .find(|b| allowed(b))
        .unwrap_or_else(|| "Unfiled Items".to_string());
    vec![bucket]
}

/// Chooses destination folders by asking the oracle and anchoring its answer
pub struct PathPlanner {
    summarizer: Arc<dyn Summarizer>,
    context_budget: usize,
}

impl PathPlanner {
    pub fn new(summarizer: Arc<dyn Summarizer>, context_budget: usize) -> Self {
        Self {
            summarizer,
            context_budget,
        }
    }

    /// Strongest existing directories for the prompt shortlist
    pub fn candidates(&self, filename: &str, summary: &str, context: &PlacementContext) -> Vec<String> {
        let dirs = ExistingDirs::new(&context.existing_directories);
        score_candidates(filename, summary, &dirs)
            .into_iter()
            .take(PROMPT_CANDIDATES)
            .map(|(_, path)| dirs.spelled(&path).join("/"))
            .collect()
    }

    pub async fn decide(
        &self,
        filename: &str,
        summary: &str,
        context: &PlacementContext,
    ) -> PlacementDecision {
        let candidates = self.candidates(filename, summary, context);
        let context_json = context.to_prompt_json(self.context_budget);

        let request = PathRequest {
            filename,
            summary,
            context_json: &context_json,
            candidates: &candidates,
        };
        let response = match self.summarizer.suggest_path(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(filename, error = %e, "Path suggestion failed, placing from context");
                String::new()
            }
        };

        resolve(filename, summary, &response, &context.existing_directories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tax_suggestion_anchors_under_existing_branch() {
        let existing = dirs(&["Finance", "Finance/Taxes", "Photos"]);
        let decision = resolve(
            "w2_2024.pdf",
            "A W-2 tax form reporting 2024 wages and withheld tax.",
            r#"{"path": "Taxes/2024"}"#,
            &existing,
        );
        assert_eq!(decision.folder(), "Finance/Taxes/2024");
        assert_eq!(decision.reason, PlacementReason::Anchored);
    }

    #[test]
    fn existing_directory_is_reused_with_disk_spelling() {
        let existing = dirs(&["Finance", "Finance/Invoices"]);
        let decision = resolve(
            "invoice_march.pdf",
            "Invoice from Acme Corp for March consulting.",
            "<suggestedpath>finance/invoices</suggestedpath>",
            &existing,
        );
        assert_eq!(decision.folder(), "Finance/Invoices");
        assert_eq!(decision.reason, PlacementReason::Existing);

        let spaced = dirs(&["Tax Returns"]);
        let decision = resolve("a.pdf", "tax", "Tax Returns/2023", &spaced);
        assert_eq!(decision.folder(), "Tax Returns/2023");
        assert_eq!(decision.reason, PlacementReason::ExtendsExisting);
    }

    #[test]
    fn unusable_answer_falls_back_to_anchor() {
        let existing = dirs(&["Finance", "Finance/Invoices", "Travel"]);
        let decision = resolve(
            "invoice_march.pdf",
            "Invoice from Acme Corp for March consulting.",
            "I am not sure where this should go, sorry about that.",
            &existing,
        );
        assert_eq!(decision.folder(), "Finance/Invoices");
        assert_eq!(decision.reason, PlacementReason::Anchor);
    }

    #[test]
    fn new_topical_root_is_accepted_without_anchor() {
        let existing = dirs(&["Photos"]);
        let decision = resolve("soup.md", "A recipe for tomato soup.", "Recipes/Soups", &existing);
        assert_eq!(decision.folder(), "Recipes/Soups");
        assert_eq!(decision.reason, PlacementReason::NewRoot);
    }

    #[test]
    fn generic_suggestions_lose_their_generic_root() {
        let decision = resolve("soup.md", "A recipe.", "Documents/Recipes", &BTreeSet::new());
        assert_eq!(decision.folder(), "Recipes");
    }

    #[test]
    fn fallback_buckets_by_keyword_then_extension() {
        let empty = BTreeSet::new();
        assert_eq!(resolve("x.pdf", "Boarding pass for flight 22", "", &empty).folder(), "Travel");
        assert_eq!(resolve("x.mp3", "", "", &empty).folder(), "Audio");
        assert_eq!(resolve("x.bin", "", "", &empty).folder(), "Inbox");
        assert_eq!(
            resolve("x.jpg", "", "", &empty).reason,
            PlacementReason::Fallback
        );
    }

    #[test]
    fn filename_never_appears_in_the_folder() {
        let existing = dirs(&["Work"]);
        for response in [
            "Work/report.pdf",
            "report.pdf",
            "Work/Reports/report.pdf/",
            "<suggestedpath>../report.pdf</suggestedpath>",
        ] {
            let decision = resolve("report.pdf", "Quarterly report", response, &existing);
            let folder = decision.folder();
            assert!(!folder.to_lowercase().contains("report.pdf"), "{}", folder);
            assert!(!decision.segments.is_empty());
        }

        let decision = resolve("inbox", "", "", &BTreeSet::new());
        assert_ne!(decision.folder().to_lowercase(), "inbox");
    }

    #[test]
    fn output_depth_and_segments_are_bounded() {
        let decision = resolve(
            "a.txt",
            "",
            "One/./Two/../Three/Four/Five/Six/Seven/Eight/Nine",
            &BTreeSet::new(),
        );
        assert!(decision.segments.len() <= MAX_DEPTH);
        assert!(decision.segments.iter().all(|s| s != "." && s != ".." && !s.is_empty()));
    }

    #[test]
    fn resolve_is_deterministic() {
        let existing = dirs(&[
            "Finance", "Finance/Taxes", "Finance/Invoices", "Work", "Work/Reports", "Education",
        ]);
        let first = resolve("q3_budget.xlsx", "Q3 budget and payment plan", "Budgets/Q3", &existing);
        for _ in 0..10 {
            let again =
                resolve("q3_budget.xlsx", "Q3 budget and payment plan", "Budgets/Q3", &existing);
            assert_eq!(again, first);
        }
    }

    #[test]
    fn anchor_trims_overlap_and_synonyms() {
        let existing = dirs(&["School", "School/Physics", "School/Physics/Homework"]);
        let d = ExistingDirs::new(&existing);
        let segs = |p: &str| normalize_segments(p);

        assert_eq!(
            anchor_suggestion(&segs("Courses/Physics/HW/Week3"), &segs("School/Physics/Homework"), &d),
            segs("School/Physics/Homework/Week3")
        );
        assert_eq!(
            anchor_suggestion(&segs("Misc/Physics"), &segs("School/Physics"), &d),
            segs("School/Physics")
        );
    }

    #[test]
    fn candidate_order_is_stable() {
        let existing = dirs(&["Finance/Taxes", "Finance"]);
        let d = ExistingDirs::new(&existing);
        let scored = score_candidates("w2.pdf", "tax document", &d);
        let paths: Vec<String> = scored.iter().map(|(_, p)| p.join("/")).collect();
        assert_eq!(paths, vec!["Finance/Taxes", "Finance"]);
    }
}
