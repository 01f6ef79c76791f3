// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use archivist::placement::normalize::normalize_segments;
use archivist::placement::parse::parse_suggestion;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(path) = parse_suggestion(text) {
        for segment in normalize_segments(&path) {
            assert!(!segment.is_empty());
            assert!(segment != "." && segment != "..");
            assert!(!segment.contains('/'));
        }
    }
});
