// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Path extraction from free-form model responses
//!
//! The model may answer with a tag, a JSON object, a bare path line or a
//! short phrase. Each strategy below looks for one of those shapes and the
//! first one that matches wins.

use once_cell::sync::Lazy;
use regex::Regex;

static PATH_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<suggestedpath>(.*?)</suggestedpath>").unwrap());
static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[\s\S]*\}").unwrap());
static FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```(?:json)?").unwrap());
static FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```$").unwrap());

/// A single parsing strategy
pub type Strategy = fn(&str) -> Option<String>;

/// Strategies in the order they are tried
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("tag", from_tag as Strategy),
    ("json", from_json as Strategy),
    ("path_line", from_path_line as Strategy),
    ("short_text", from_short_text as Strategy),
];

/// Trim whitespace and a surrounding markdown code fence
pub fn clean_model_output(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let without_open = FENCE_OPEN.replace(trimmed, "");
    let without_open = without_open.trim();
    FENCE_CLOSE.replace(without_open, "").trim().to_string()
}

/// Run the strategy chain over a response
pub fn parse_suggestion(response: &str) -> Option<String> {
    let cleaned = clean_model_output(response);
    if cleaned.is_empty() {
        return None;
    }
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let found = strategy(&cleaned)?;
        tracing::trace!(strategy = *name, path = %found, "Parsed path suggestion");
        Some(found)
    })
}

/// `<suggestedpath>...</suggestedpath>`, case-insensitive
pub fn from_tag(text: &str) -> Option<String> {
    let captured = PATH_TAG.captures(text)?.get(1)?.as_str().trim();
    non_empty(captured)
}

/// A JSON object with a `path` or `suggested_path` string field
pub fn from_json(text: &str) -> Option<String> {
    let block = JSON_BLOCK.find(text)?.as_str();
    let value: serde_json::Value = serde_json::from_str(block).ok()?;
    let object = value.as_object()?;
    ["path", "suggested_path"]
        .iter()
        .filter_map(|key| object.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// First line containing a slash and at most five words, quotes stripped
pub fn from_path_line(text: &str) -> Option<String> {
    text.lines()
        .map(|line| line.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '`'))
        .filter(|line| !line.is_empty())
        .find(|line| line.contains('/') && line.split_whitespace().count() <= 5)
        .map(str::to_string)
}

/// The whole response when it is at most four words
pub fn from_short_text(text: &str) -> Option<String> {
    if text.split_whitespace().count() <= 4 {
        non_empty(text.trim())
    } else {
        None
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_wins_over_everything() {
        let response = r#"{"path": "Other/Place"} <SuggestedPath> Finance/Taxes </SuggestedPath>"#;
        assert_eq!(parse_suggestion(response).as_deref(), Some("Finance/Taxes"));
    }

    #[test]
    fn json_inside_code_fence() {
        let response = "```json\n{\"path\": \"Work/Reports\"}\n```";
        assert_eq!(parse_suggestion(response).as_deref(), Some("Work/Reports"));
    }

    #[test]
    fn json_falls_back_to_suggested_path_field() {
        assert_eq!(
            from_json(r#"Sure: {"suggested_path": "Travel/Japan"}"#).as_deref(),
            Some("Travel/Japan")
        );
        assert_eq!(from_json(r#"{"folder": "Travel"}"#), None);
        assert_eq!(from_json("{not json}"), None);
    }

    #[test]
    fn first_short_slash_line() {
        let response = "I think this belongs in the following place:\n`Education/Physics/Homework`\nThanks";
        assert_eq!(
            parse_suggestion(response).as_deref(),
            Some("Education/Physics/Homework")
        );
    }

    #[test]
    fn long_slash_lines_are_skipped() {
        assert_eq!(
            from_path_line("this line has a slash / but far too many words in it"),
            None
        );
    }

    #[test]
    fn short_bare_answer() {
        assert_eq!(parse_suggestion("Recipes").as_deref(), Some("Recipes"));
        assert_eq!(
            parse_suggestion("I could not decide where this file should go at all"),
            None
        );
        assert_eq!(parse_suggestion("   "), None);
    }
}
