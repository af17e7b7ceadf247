//! Folding per-page OCR results into a single [`ExtractionResult`].

use schemars::JsonSchema;

use crate::{dedup::dedup, prelude::*, text::count_words};

use super::ExtractOptions;

/// Separator placed between pages when `page_breaks` is requested.
pub const PAGE_BREAK: &str = "\n\x0C\n";

/// How should we combine the text of individual pages?
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Return all pages as a single string.
    #[default]
    Concatenated,
    /// Return a list with one entry per page.
    PerPage,
}

/// The text we extracted, in the shape requested by [`AggregationMode`].
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ExtractedText {
    /// All pages (or all unique tokens) as one string.
    Concatenated(String),
    /// One entry per page (or per unique token).
    PerPage(Vec<String>),
}

#[cfg(test)]
impl ExtractedText {
    /// Get the concatenated text, if that's what we have.
    pub fn as_concatenated(&self) -> Option<&str> {
        match self {
            ExtractedText::Concatenated(text) => Some(text),
            ExtractedText::PerPage(_) => None,
        }
    }

    /// Get the per-page entries, if that's what we have.
    pub fn as_per_page(&self) -> Option<&[String]> {
        match self {
            ExtractedText::Concatenated(_) => None,
            ExtractedText::PerPage(pages) => Some(pages),
        }
    }
}

/// The result of extracting text from a video or document.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractionResult {
    /// Did we find any words at all?
    pub success: bool,

    /// The recognized text. A string, or a list of strings when extracting
    /// page by page.
    pub text: ExtractedText,

    /// The number of words in `text`.
    pub word_count: usize,
}

/// Accumulates page text in page order.
///
/// Only the task driving the OCR batches touches this.
pub struct TextAggregator {
    mode: AggregationMode,
    remove_duplicates: bool,
    separator: &'static str,
    pages: Vec<String>,
    word_count: usize,
}

impl TextAggregator {
    /// Create an empty aggregator.
    pub fn new(options: &ExtractOptions) -> Self {
        Self {
            mode: options.aggregation_mode,
            remove_duplicates: options.remove_duplicates,
            separator: if options.page_breaks { PAGE_BREAK } else { "" },
            pages: vec![],
            word_count: 0,
        }
    }

    /// Fold in the next page, returning the number of pages folded so far.
    pub fn push_page(&mut self, text: String) -> usize {
        // When deduplicating, we recount from the tokens at the end.
        if !self.remove_duplicates {
            self.word_count += count_words(&text);
        }
        self.pages.push(text);
        self.pages.len()
    }

    /// How many pages have we folded?
    pub fn pages_folded(&self) -> usize {
        self.pages.len()
    }

    /// Build our final result.
    pub fn finish(self) -> ExtractionResult {
        let (text, word_count) = if self.remove_duplicates {
            let tokens = dedup(&self.pages);
            let word_count = tokens.iter().map(|token| count_words(token)).sum();
            let text = match self.mode {
                AggregationMode::Concatenated => {
                    ExtractedText::Concatenated(tokens.join("\n"))
                }
                AggregationMode::PerPage => ExtractedText::PerPage(tokens),
            };
            (text, word_count)
        } else {
            let text = match self.mode {
                AggregationMode::Concatenated => {
                    ExtractedText::Concatenated(self.pages.join(self.separator))
                }
                AggregationMode::PerPage => ExtractedText::PerPage(self.pages),
            };
            (text, self.word_count)
        };
        ExtractionResult {
            success: word_count > 0,
            text,
            word_count,
        }
    }
}
