//! Index page parser
//!
//! Every index page opens with a block of pinned, paid listings that repeats
//! on every page. The first `promoted_count` cards are split off into
//! [`IndexPage::excluded`] so they are scraped through their regular position
//! instead of once per page.

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::config::IndexSelectors;
use super::{ParsingError, ParsingResult, any_match, compile_selectors};
use crate::domain::{BadgeFlags, ListingCandidate, extract_listing_id};

/// Parsed index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPage {
    pub page: u32,
    /// Regular listings, in page order
    pub items: Vec<ListingCandidate>,
    /// Pinned block removed from the top of the page
    pub excluded: Vec<ListingCandidate>,
    /// Cards without a usable listing link
    pub mismatches: usize,
    /// False when the page was too short to hold the pinned block
    pub filtered: bool,
}

impl IndexPage {
    pub fn excluded_ids(&self) -> Vec<i64> {
        self.excluded.iter().map(|c| c.listing_id).collect()
    }
}

struct BadgeSelectors {
    vip: Vec<Selector>,
    featured: Vec<Selector>,
    salon: Vec<Selector>,
    credit: Vec<Selector>,
    barter: Vec<Selector>,
    vin: Vec<Selector>,
}

pub struct ListingIndexParser {
    base_url: Url,
    promoted_count: usize,
    card_selectors: Vec<Selector>,
    link_selectors: Vec<Selector>,
    badges: BadgeSelectors,
}

impl ListingIndexParser {
    pub fn new(base_url: &str, promoted_count: usize) -> ParsingResult<Self> {
        Self::with_selectors(base_url, promoted_count, &IndexSelectors::default())
    }

    pub fn with_selectors(
        base_url: &str,
        promoted_count: usize,
        selectors: &IndexSelectors,
    ) -> ParsingResult<Self> {
        let base_url = Url::parse(base_url).map_err(|e| ParsingError::UrlResolutionFailed {
            url: base_url.to_string(),
            reason: format!("Invalid base URL: {e}"),
        })?;

        Ok(Self {
            base_url,
            promoted_count,
            card_selectors: compile_selectors(&selectors.card)?,
            link_selectors: compile_selectors(&selectors.link)?,
            badges: BadgeSelectors {
                vip: compile_selectors(&selectors.vip)?,
                featured: compile_selectors(&selectors.featured)?,
                salon: compile_selectors(&selectors.salon)?,
                credit: compile_selectors(&selectors.credit)?,
                barter: compile_selectors(&selectors.barter)?,
                vin: compile_selectors(&selectors.vin)?,
            },
        })
    }

    /// Extract listing candidates from an index page.
    ///
    /// A page without cards yields an empty, unfiltered result.
    pub fn parse(&self, html: &str, page: u32) -> IndexPage {
        let document = Html::parse_document(html);
        let root = document.root_element();

        let cards: Vec<ElementRef> = self
            .card_selectors
            .iter()
            .map(|selector| root.select(selector).collect::<Vec<_>>())
            .find(|cards| !cards.is_empty())
            .unwrap_or_default();

        let mut candidates = Vec::with_capacity(cards.len());
        let mut mismatches = 0;
        for (position, card) in cards.iter().enumerate() {
            match self.candidate_from_card(card, page, position) {
                Some(candidate) => candidates.push(candidate),
                None => {
                    debug!("Card {} on page {} has no listing link", position, page);
                    mismatches += 1;
                }
            }
        }

        let filtered = !cards.is_empty() && cards.len() >= self.promoted_count;
        let (excluded, items): (Vec<_>, Vec<_>) = if filtered {
            candidates
                .into_iter()
                .partition(|c| c.position < self.promoted_count)
        } else if cards.is_empty() {
            warn!("Page {} has no listing cards", page);
            (Vec::new(), candidates)
        } else {
            warn!(
                "Page {} has {} cards, fewer than the {} pinned slots; keeping all of them",
                page,
                cards.len(),
                self.promoted_count
            );
            (Vec::new(), candidates)
        };

        debug!(
            "Page {}: {} listings, {} pinned excluded, {} mismatched cards",
            page,
            items.len(),
            excluded.len(),
            mismatches
        );

        IndexPage {
            page,
            items,
            excluded,
            mismatches,
            filtered,
        }
    }

    fn candidate_from_card(
        &self,
        card: &ElementRef,
        page: u32,
        position: usize,
    ) -> Option<ListingCandidate> {
        let href = self
            .link_selectors
            .iter()
            .find_map(|selector| card.select(selector).find_map(|a| a.value().attr("href")))?;

        let url = match self.base_url.join(href.trim()) {
            Ok(url) => url.to_string(),
            Err(e) => {
                warn!("Could not resolve listing link {:?}: {}", href, e);
                return None;
            }
        };
        let listing_id = extract_listing_id(&url)?;

        Some(ListingCandidate::new(listing_id, url, page, position).with_badges(self.badges_of(card)))
    }

    fn badges_of(&self, card: &ElementRef) -> BadgeFlags {
        BadgeFlags {
            is_vip: any_match(card, &self.badges.vip),
            is_featured: any_match(card, &self.badges.featured),
            is_salon: any_match(card, &self.badges.salon),
            has_credit: any_match(card, &self.badges.credit),
            has_barter: any_match(card, &self.badges.barter),
            has_vin: any_match(card, &self.badges.vin),
        }
    }
}
