// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Folder path normalization and token matching

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Deepest folder path the planner will produce
pub const MAX_DEPTH: usize = 7;

/// Words kept from one sanitized segment
const MAX_SEGMENT_WORDS: usize = 4;

pub const GENERIC_SEGMENTS: &[&str] = &[
    "documents",
    "document",
    "files",
    "file",
    "misc",
    "miscellaneous",
    "other",
    "general",
    "unsorted",
];

const TOKEN_STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "into", "about", "file", "files",
    "document", "documents", "image", "images", "folder", "folders", "archive",
];

/// Keyword lists per domain, checked in order
pub const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("finance", &["invoice", "receipt", "tax", "w2", "1099", "bank", "payment", "budget"]),
    ("legal", &["contract", "agreement", "nda", "policy", "terms", "compliance", "legal"]),
    ("work", &["meeting", "project", "roadmap", "proposal", "strategy", "report", "brief"]),
    ("education", &["course", "class", "lecture", "assignment", "syllabus", "homework", "research"]),
    ("health", &["medical", "health", "lab", "prescription", "insurance", "doctor"]),
    ("travel", &["flight", "hotel", "itinerary", "trip", "passport", "boarding"]),
    ("personal", &["resume", "cv", "cover letter", "family", "personal", "photo", "journal"]),
];

const DOMAIN_ALIASES: &[(&str, &[&str])] = &[
    ("finance", &["finance", "financial", "money", "billing", "tax"]),
    ("legal", &["legal", "contracts", "compliance", "law"]),
    ("work", &["work", "business", "project", "projects", "client"]),
    ("education", &["education", "school", "course", "class", "university", "study"]),
    ("health", &["health", "medical", "care", "insurance"]),
    ("travel", &["travel", "trip", "flights", "hotel", "itinerary"]),
    ("personal", &["personal", "home", "family"]),
];

static ILLEGAL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9 _-]").unwrap());
static CAMEL_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());
static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").unwrap());

/// Clean one folder name: drop illegal characters, capitalize words, join them
///
/// `"tax returns_2024"` becomes `"TaxReturns2024"`. Only the first letter of
/// each word is touched so existing casing such as `iOS` survives.
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned = ILLEGAL_CHARS.replace_all(segment, "");
    cleaned
        .replace('_', " ")
        .split_whitespace()
        .take(MAX_SEGMENT_WORDS)
        .map(capitalize_first)
        .collect()
}

fn capitalize_first(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Raw segments of a path-like string, without `.`, `..` or empty parts
pub fn raw_segments(path: &str) -> Vec<String> {
    path.replace('\\', "/")
        .split('/')
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .map(str::to_string)
        .collect()
}

/// Split, sanitize and cap a path to at most seven segments
pub fn normalize_segments(path: &str) -> Vec<String> {
    raw_segments(path)
        .into_iter()
        .take(MAX_DEPTH)
        .map(|p| sanitize_segment(&p))
        .filter(|p| !p.is_empty())
        .collect()
}

pub fn normalize_path(path: &str) -> String {
    normalize_segments(path).join("/")
}

pub fn is_generic_segment(segment: &str) -> bool {
    GENERIC_SEGMENTS.contains(&segment.to_lowercase().as_str())
}

/// True for empty paths and paths whose first segment is a generic bucket
pub fn is_generic_root(segments: &[String]) -> bool {
    segments.first().map_or(true, |s| is_generic_segment(s))
}

/// Drop a leading generic segment when something follows it
pub fn strip_generic_root(mut segments: Vec<String>) -> Vec<String> {
    if segments.len() >= 2 && is_generic_segment(&segments[0]) {
        segments.remove(0);
    }
    segments
}

/// Lowercase alphanumeric form with a few folder synonyms folded together
pub fn canonical_token(segment: &str) -> String {
    let cleaned: String = segment
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    match cleaned.as_str() {
        "hw" | "hws" | "homework" | "assignments" | "assignment" => "homework".to_string(),
        "notes" | "lecturenotes" => "notes".to_string(),
        _ => cleaned,
    }
}

/// Match tokens: camelCase split, lowercase, at least three chars, no stopwords or bare numbers
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let spaced = CAMEL_BOUNDARY.replace_all(text, "$1 $2").to_lowercase();
    WORD.find_iter(&spaced)
        .map(|m| m.as_str())
        .filter(|t| t.len() >= 3)
        .filter(|t| !TOKEN_STOPWORDS.contains(t))
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// First domain whose keywords occur in the text, lowercase
pub fn domain_of(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    DOMAIN_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(domain, _)| *domain)
}

pub fn domain_aliases(domain: &str) -> &'static [&'static str] {
    DOMAIN_ALIASES
        .iter()
        .find(|(d, _)| *d == domain)
        .map(|(_, aliases)| *aliases)
        .unwrap_or(&[])
}

/// Folder name for a domain bucket
pub fn domain_folder(domain: &str) -> String {
    capitalize_first(domain)
}

/// Case-insensitive comparison key for a whole folder path
pub fn path_key(segments: &[String]) -> String {
    segments
        .iter()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join("/")
}
