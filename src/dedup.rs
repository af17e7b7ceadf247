//! Reduce OCR text to unique tokens.
//!
//! Video frames sampled a few times per second mostly contain the same text
//! as their neighbours, so we split everything we recognized into short
//! sections and keep the first occurrence of each.

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;

/// Sections are separated by any of `,`, `\r\n`, `\n`, `|`, `(` or `)`.
static SECTION_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r",|\r\n|\n|\||\(|\)").expect("failed to compile regex")
});

/// Split `entries` into sections and return each distinct section once, in
/// the order it was first seen.
///
/// Sections are compared after trimming whitespace and then any leading or
/// trailing `.` characters, so `"Page one."` and `"Page one"` are the same
/// token. An empty section is a token like any other, and is kept once.
pub fn dedup<S>(entries: &[S]) -> Vec<String>
where
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut tokens = vec![];
    for entry in entries {
        for section in SECTION_SEPARATOR.split(entry.as_ref().trim()) {
            let token = section.trim().trim_matches('.');
            if seen.insert(token) {
                tokens.push(token.to_owned());
            }
        }
    }
    tokens
}
