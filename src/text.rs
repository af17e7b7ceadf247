//! Text clean-up and word counting for raw OCR output.

use std::sync::LazyLock;

use regex::Regex;

/// A word is a run of letters, which may contain (but not start with)
/// apostrophes and hyphens. Digits and other punctuation never count.
static WORD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\p{Alphabetic}[\p{Alphabetic}'\-]*").expect("failed to compile regex")
});

/// Clean up raw `tesseract` output.
///
/// Blank lines are collapsed, form feeds (which `tesseract` emits at the end
/// of each page) are removed, and surrounding whitespace is trimmed.
pub fn clean_ocr_text(raw: &str) -> String {
    raw.replace("\n\n", "\n")
        .replace("\n \n", "\n")
        .replace('\x0C', "")
        .trim()
        .to_owned()
}

/// Count the words in `text`.
pub fn count_words(text: &str) -> usize {
    WORD_REGEX.find_iter(text).count()
}
