//! HTML parsing for index and detail pages
//!
//! Parsers are pure: they take page text and return domain values. Fetching
//! and counting happen elsewhere.

pub mod config;
pub mod error;
pub mod listing_detail_parser;
pub mod listing_index_parser;

pub use config::{DetailSelectors, IndexSelectors};
pub use error::{ParsingError, ParsingResult};
pub use listing_detail_parser::{DetailPage, ListingDetailParser, parse_phone_response};
pub use listing_index_parser::{IndexPage, ListingIndexParser};

use scraper::{ElementRef, Selector};
use tracing::{debug, warn};

use crate::domain::normalize::clean_text;

/// Compile fallback selector strings, skipping invalid ones.
///
/// Fails only when none of them compile.
pub(crate) fn compile_selectors(selector_strings: &[String]) -> ParsingResult<Vec<Selector>> {
    let mut selectors = Vec::new();
    let mut errors = Vec::new();

    for selector_str in selector_strings {
        match Selector::parse(selector_str) {
            Ok(selector) => selectors.push(selector),
            Err(e) => {
                warn!("Failed to compile selector '{}': {}", selector_str, e);
                errors.push(format!("'{selector_str}': {e}"));
            }
        }
    }

    if selectors.is_empty() {
        return Err(ParsingError::invalid_selector(
            &selector_strings.join(", "),
            if errors.is_empty() {
                "no selectors given".to_string()
            } else {
                errors.join(", ")
            },
        ));
    }
    if !errors.is_empty() {
        debug!("Some selectors failed to compile: {}", errors.join(", "));
    }
    Ok(selectors)
}

/// Whitespace-normalized text of an element
pub(crate) fn element_text(element: &ElementRef) -> Option<String> {
    clean_text(&element.text().collect::<String>())
}

/// Text of the first element matched by any of the selectors
pub(crate) fn first_text(root: &ElementRef, selectors: &[Selector]) -> Option<String> {
    selectors
        .iter()
        .find_map(|selector| root.select(selector).find_map(|e| element_text(&e)))
}

/// Whether any of the selectors matches inside `root`
pub(crate) fn any_match(root: &ElementRef, selectors: &[Selector]) -> bool {
    selectors
        .iter()
        .any(|selector| root.select(selector).next().is_some())
}
