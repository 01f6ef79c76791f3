// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

#![no_main]

use arbitrary::Arbitrary;
use archivist::placement::resolve;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeSet;

#[derive(Arbitrary, Debug)]
struct Input {
    filename: String,
    summary: String,
    response: String,
    directories: Vec<String>,
}

fuzz_target!(|input: Input| {
    let directories: BTreeSet<String> = input.directories.into_iter().collect();
    let first = resolve(&input.filename, &input.summary, &input.response, &directories);
    let second = resolve(&input.filename, &input.summary, &input.response, &directories);
    assert_eq!(first, second);

    assert!(!first.segments.is_empty());
    assert!(first.segments.len() <= 7);
    for segment in &first.segments {
        assert!(segment != "." && segment != "..");
        assert!(input.filename.is_empty() || segment.to_lowercase() != input.filename.to_lowercase());
    }
});
