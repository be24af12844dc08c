use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Promotional badges rendered on an index card
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeFlags {
    pub is_vip: bool,
    pub is_featured: bool,
    pub is_salon: bool,
    pub has_credit: bool,
    pub has_barter: bool,
    pub has_vin: bool,
}

/// A single car listing as parsed from its detail page.
///
/// Free-text numeric attributes keep both the raw text shown on the site and
/// the normalized value. A missing attribute is `None`; `0` and `""` are never
/// used to mean "unknown".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Stable identity taken from the source URL
    pub listing_id: i64,
    pub listing_url: String,
    pub title: Option<String>,

    pub price_raw: Option<String>,
    pub price: Option<i64>,

    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<i32>,

    pub mileage_raw: Option<String>,
    pub mileage_km: Option<i64>,

    pub engine_volume_raw: Option<String>,
    pub engine_volume_l: Option<f64>,
    pub engine_power_raw: Option<String>,
    pub engine_power_hp: Option<i32>,
    pub fuel_type: Option<String>,

    pub transmission: Option<String>,
    pub drivetrain: Option<String>,
    pub body_type: Option<String>,
    pub color: Option<String>,
    pub seats: Option<i32>,
    pub condition: Option<String>,
    pub market: Option<String>,
    pub is_new: Option<bool>,

    pub city: Option<String>,
    pub seller_name: Option<String>,
    /// `None` when the reveal call failed, `Some(vec![])` when it succeeded
    /// without numbers
    pub seller_phones: Option<Vec<String>>,

    pub description: Option<String>,
    pub extras: Vec<String>,
    pub view_count: Option<i64>,
    pub posted_on: Option<NaiveDate>,
    pub updated_on: Option<NaiveDate>,

    pub badges: BadgeFlags,
    pub image_urls: Vec<String>,

    pub scraped_at: DateTime<Utc>,
}

impl Listing {
    /// Create an empty listing carrying only its identity
    pub fn new(listing_id: i64, listing_url: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            listing_id,
            listing_url: listing_url.into(),
            title: None,
            price_raw: None,
            price: None,
            make: None,
            model: None,
            year: None,
            mileage_raw: None,
            mileage_km: None,
            engine_volume_raw: None,
            engine_volume_l: None,
            engine_power_raw: None,
            engine_power_hp: None,
            fuel_type: None,
            transmission: None,
            drivetrain: None,
            body_type: None,
            color: None,
            seats: None,
            condition: None,
            market: None,
            is_new: None,
            city: None,
            seller_name: None,
            seller_phones: None,
            description: None,
            extras: Vec::new(),
            view_count: None,
            posted_on: None,
            updated_on: None,
            badges: BadgeFlags::default(),
            image_urls: Vec::new(),
            scraped_at,
        }
    }

    /// Short label for log lines
    pub fn display_name(&self) -> String {
        match (&self.make, &self.model) {
            (Some(make), Some(model)) => format!("{make} {model}"),
            _ => self.title.clone().unwrap_or_else(|| self.listing_url.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_listing_has_no_attributes() {
        let listing = Listing::new(42, "https://turbo.az/autos/42-bmw", Utc::now());
        assert_eq!(listing.listing_id, 42);
        assert!(listing.price.is_none());
        assert!(listing.seller_phones.is_none());
        assert!(listing.extras.is_empty());
        assert_eq!(listing.badges, BadgeFlags::default());
    }

    #[test]
    fn display_name_prefers_make_and_model() {
        let mut listing = Listing::new(1, "https://turbo.az/autos/1", Utc::now());
        assert_eq!(listing.display_name(), "https://turbo.az/autos/1");

        listing.title = Some("BMW 520, 2015".to_string());
        assert_eq!(listing.display_name(), "BMW 520, 2015");

        listing.make = Some("BMW".to_string());
        listing.model = Some("520".to_string());
        assert_eq!(listing.display_name(), "BMW 520");
    }
}
