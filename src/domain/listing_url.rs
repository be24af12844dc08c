use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::listing::BadgeFlags;

lazy_static! {
    static ref LISTING_ID_PATTERN: Regex = Regex::new(r"/autos/([0-9]+)").unwrap();
}

/// Extract the numeric listing id from a detail page URL.
///
/// `https://turbo.az/autos/8123456-toyota-prado` → `Some(8123456)`
pub fn extract_listing_id(url: &str) -> Option<i64> {
    LISTING_ID_PATTERN
        .captures(url)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// A listing link found on an index page, together with its position and
/// the badges rendered on its card. Carried from the index parser to the
/// detail extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCandidate {
    pub listing_id: i64,
    /// Absolute detail page URL
    pub url: String,
    pub badges: BadgeFlags,
    /// Index page this card was found on
    pub page: u32,
    /// Position on the page, counted before promoted cards are removed
    pub position: usize,
}

impl ListingCandidate {
    pub fn new(listing_id: i64, url: String, page: u32, position: usize) -> Self {
        Self {
            listing_id,
            url,
            badges: BadgeFlags::default(),
            page,
            position,
        }
    }

    pub fn with_badges(mut self, badges: BadgeFlags) -> Self {
        self.badges = badges;
        self
    }
}

impl fmt::Display for ListingCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (page: {}, position: {})",
            self.url, self.page, self.position
        )
    }
}
