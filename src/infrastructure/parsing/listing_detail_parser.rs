//! Listing detail page parser
//!
//! Turns a detail page into a [`Listing`]. Parsing never fails: attributes
//! that are missing stay `None`, and the names of missing key fields are
//! reported back so the caller can count them.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

use super::config::DetailSelectors;
use super::{ParsingError, ParsingResult, compile_selectors, element_text, first_text};
use crate::domain::normalize::{
    clean_text, normalize_count, normalize_date, normalize_engine_power, normalize_engine_volume,
    normalize_mileage, normalize_price, normalize_yes_no,
};
use crate::domain::{Listing, ListingCandidate};

lazy_static! {
    static ref CSRF_IN_SOURCE: Regex =
        Regex::new(r#"authenticity_token[^>]*?value="([^"]+)""#).unwrap();
}

/// Images kept per listing
pub const MAX_IMAGES: usize = 10;

const IMAGE_HOST: &str = "turbo.azstatic.com";
const THUMBNAIL_SIZES: &[&str] = &["f460x343", "f660x496"];

/// Property rows the parser understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Property {
    City,
    Make,
    Model,
    Year,
    Mileage,
    Engine,
    Transmission,
    Drivetrain,
    BodyType,
    Color,
    Seats,
    Condition,
    Market,
    IsNew,
}

impl Property {
    /// Match a row label in Azerbaijani or English. Order matters: the
    /// checks are substring tests.
    fn from_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        let has = |needle: &str| label.contains(needle);
        if has("Şəhər") || has("City") {
            Some(Self::City)
        } else if has("Marka") || has("Make") {
            Some(Self::Make)
        } else if has("Model") {
            Some(Self::Model)
        } else if has("Buraxılış ili") || lower.contains("year") {
            Some(Self::Year)
        } else if has("Yürüş") || has("Mileage") {
            Some(Self::Mileage)
        } else if has("Mühərrik") || has("Engine") {
            Some(Self::Engine)
        } else if has("Sürətlər qutusu") || has("Transmission") {
            Some(Self::Transmission)
        } else if has("Ötürücü") || has("Drivetrain") {
            Some(Self::Drivetrain)
        } else if has("Ban növü") || has("Body") {
            Some(Self::BodyType)
        } else if has("Rəng") || has("Color") {
            Some(Self::Color)
        } else if has("Yerlərin sayı") || has("Seats") {
            Some(Self::Seats)
        } else if has("Vəziyyəti") || has("Condition") {
            Some(Self::Condition)
        } else if has("bazar üçün yığılıb") || has("Market") {
            Some(Self::Market)
        } else if has("Yeni") || has("New") {
            Some(Self::IsNew)
        } else {
            None
        }
    }
}

/// Result of parsing one detail page
#[derive(Debug, Clone, PartialEq)]
pub struct DetailPage {
    pub listing: Listing,
    /// Token the phone reveal call must echo back
    pub csrf_token: Option<String>,
    /// Key fields the page did not have
    pub missing_fields: Vec<&'static str>,
}

impl DetailPage {
    pub fn is_complete(&self) -> bool {
        self.missing_fields.is_empty()
    }
}

struct CompiledSelectors {
    title: Vec<Selector>,
    price: Vec<Selector>,
    property_row: Vec<Selector>,
    property_name: Vec<Selector>,
    property_value: Vec<Selector>,
    description: Vec<Selector>,
    extras: Vec<Selector>,
    seller_name: Vec<Selector>,
    contact_param: Vec<Selector>,
    contact_param_name: Vec<Selector>,
    contact_param_value: Vec<Selector>,
    statistics: Vec<Selector>,
    images: Vec<Selector>,
    csrf_meta: Vec<Selector>,
    csrf_input: Vec<Selector>,
}

pub struct ListingDetailParser {
    selectors: CompiledSelectors,
}

impl ListingDetailParser {
    pub fn new() -> ParsingResult<Self> {
        Self::with_selectors(&DetailSelectors::default())
    }

    pub fn with_selectors(selectors: &DetailSelectors) -> ParsingResult<Self> {
        Ok(Self {
            selectors: CompiledSelectors {
                title: compile_selectors(&selectors.title)?,
                price: compile_selectors(&selectors.price)?,
                property_row: compile_selectors(&selectors.property_row)?,
                property_name: compile_selectors(&selectors.property_name)?,
                property_value: compile_selectors(&selectors.property_value)?,
                description: compile_selectors(&selectors.description)?,
                extras: compile_selectors(&selectors.extras)?,
                seller_name: compile_selectors(&selectors.seller_name)?,
                contact_param: compile_selectors(&selectors.contact_param)?,
                contact_param_name: compile_selectors(&selectors.contact_param_name)?,
                contact_param_value: compile_selectors(&selectors.contact_param_value)?,
                statistics: compile_selectors(&selectors.statistics)?,
                images: compile_selectors(&selectors.images)?,
                csrf_meta: compile_selectors(&selectors.csrf_meta)?,
                csrf_input: compile_selectors(&selectors.csrf_input)?,
            },
        })
    }

    pub fn parse(
        &self,
        html: &str,
        candidate: &ListingCandidate,
        scraped_at: DateTime<Utc>,
    ) -> DetailPage {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let s = &self.selectors;

        let mut listing = Listing::new(candidate.listing_id, candidate.url.clone(), scraped_at);
        listing.badges = candidate.badges;

        listing.title = first_text(&root, &s.title);
        listing.price_raw = first_text(&root, &s.price);
        listing.price = normalize_price(listing.price_raw.as_deref());

        self.read_properties(&root, &mut listing);

        listing.description = first_text(&root, &s.description);
        listing.extras = all_texts(&root, &s.extras);
        listing.seller_name = first_text(&root, &s.seller_name);
        listing.posted_on = normalize_date(self.posted_date(&root).as_deref());
        self.read_statistics(&root, &mut listing);
        listing.image_urls = self.image_urls(&root);

        let mut missing_fields = Vec::new();
        if listing.title.is_none() {
            missing_fields.push("title");
        }
        if listing.price.is_none() {
            missing_fields.push("price");
        }

        DetailPage {
            csrf_token: self.csrf_token(&root, html),
            listing,
            missing_fields,
        }
    }

    fn read_properties(&self, root: &ElementRef, listing: &mut Listing) {
        let s = &self.selectors;
        for row in s.property_row.iter().flat_map(|sel| root.select(sel)) {
            let (Some(label), Some(value)) =
                (first_text(&row, &s.property_name), first_text(&row, &s.property_value))
            else {
                continue;
            };
            let Some(property) = Property::from_label(&label) else {
                continue;
            };
            match property {
                Property::City => listing.city = Some(value),
                Property::Make => listing.make = Some(value),
                Property::Model => listing.model = Some(value),
                Property::Year => listing.year = normalize_count(Some(value.as_str())),
                Property::Mileage => {
                    listing.mileage_km = normalize_mileage(Some(value.as_str()));
                    listing.mileage_raw = Some(value);
                }
                Property::Engine => apply_engine(listing, &value),
                Property::Transmission => listing.transmission = Some(value),
                Property::Drivetrain => listing.drivetrain = Some(value),
                Property::BodyType => listing.body_type = Some(value),
                Property::Color => listing.color = Some(value),
                Property::Seats => listing.seats = normalize_count(Some(value.as_str())),
                Property::Condition => listing.condition = Some(value),
                Property::Market => listing.market = Some(value),
                Property::IsNew => listing.is_new = normalize_yes_no(Some(value.as_str())),
            }
        }
    }

    /// "Turbo.az-da" row of the contact block
    fn posted_date(&self, root: &ElementRef) -> Option<String> {
        let s = &self.selectors;
        s.contact_param
            .iter()
            .flat_map(|sel| root.select(sel))
            .find_map(|param| {
                let label = first_text(&param, &s.contact_param_name)?;
                if label.to_lowercase().contains("turbo.az-da") {
                    first_text(&param, &s.contact_param_value)
                } else {
                    None
                }
            })
    }

    fn read_statistics(&self, root: &ElementRef, listing: &mut Listing) {
        for text in all_texts(root, &self.selectors.statistics) {
            if text.contains("Yeniləndi") || text.contains("Updated") {
                listing.updated_on = normalize_date(Some(text.as_str()));
            } else if text.contains("Baxışların sayı") || text.contains("Views") {
                listing.view_count = normalize_count(Some(text.as_str())).map(i64::from);
            }
        }
    }

    fn image_urls(&self, root: &ElementRef) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let sources = self
            .selectors
            .images
            .iter()
            .flat_map(|sel| root.select(sel))
            .filter_map(|img| img.value().attr("src"));
        for src in sources {
            if !(src.contains(IMAGE_HOST) && src.contains("uploads")) {
                continue;
            }
            let full = THUMBNAIL_SIZES
                .iter()
                .fold(src.to_string(), |url, size| url.replace(size, "full"));
            if !urls.contains(&full) {
                urls.push(full);
            }
            if urls.len() == MAX_IMAGES {
                break;
            }
        }
        urls
    }

    fn csrf_token(&self, root: &ElementRef, html: &str) -> Option<String> {
        let s = &self.selectors;
        let attr_of = |selectors: &[Selector], attr: &str| {
            selectors
                .iter()
                .flat_map(|sel| root.select(sel))
                .find_map(|e| e.value().attr(attr).map(str::trim).filter(|v| !v.is_empty()))
                .map(str::to_string)
        };
        attr_of(s.csrf_meta.as_slice(), "content")
            .or_else(|| attr_of(s.csrf_input.as_slice(), "value"))
            .or_else(|| {
                let caps = CSRF_IN_SOURCE.captures(html)?;
                Some(caps.get(1)?.as_str().to_string())
            })
    }
}

/// Split "2.0 L / 150 a.g. / Benzin" into volume, power and fuel
fn apply_engine(listing: &mut Listing, value: &str) {
    let mut parts = value.split('/').map(clean_text);
    if let Some(volume) = parts.next().flatten() {
        listing.engine_volume_l = normalize_engine_volume(Some(volume.as_str()));
        listing.engine_volume_raw = Some(volume);
    }
    if let Some(power) = parts.next().flatten() {
        listing.engine_power_hp = normalize_engine_power(Some(power.as_str()));
        listing.engine_power_raw = Some(power);
    }
    if let Some(fuel) = parts.next().flatten() {
        listing.fuel_type = Some(fuel);
    }
}

fn all_texts(root: &ElementRef, selectors: &[Selector]) -> Vec<String> {
    selectors
        .iter()
        .map(|sel| root.select(sel).filter_map(|e| element_text(&e)).collect::<Vec<_>>())
        .find(|texts| !texts.is_empty())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct PhoneResponse {
    #[serde(default)]
    phones: Vec<PhoneEntry>,
}

#[derive(Debug, Deserialize)]
struct PhoneEntry {
    primary: Option<String>,
    raw: Option<String>,
}

/// Read the phone reveal JSON: `{"phones": [{"primary": "...", "raw": "..."}]}`.
///
/// Keeps the order of the response and prefers the formatted number.
pub fn parse_phone_response(body: &str) -> ParsingResult<Vec<String>> {
    let response: PhoneResponse =
        serde_json::from_str(body).map_err(|e| ParsingError::InvalidPhoneResponse {
            reason: e.to_string(),
        })?;
    Ok(response
        .phones
        .into_iter()
        .filter_map(|entry| {
            entry
                .primary
                .and_then(|p| clean_text(&p))
                .or_else(|| entry.raw.and_then(|r| clean_text(&r)))
        })
        .collect())
}
