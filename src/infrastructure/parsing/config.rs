//! CSS selectors for index and detail pages
//!
//! Each field is a list of fallbacks tried in order; the first selector that
//! matches wins.

use serde::{Deserialize, Serialize};

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// Selectors for index (search result) pages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSelectors {
    /// One element per listing card
    pub card: Vec<String>,
    /// Link to the detail page, relative to the card
    pub link: Vec<String>,
    pub vip: Vec<String>,
    pub featured: Vec<String>,
    pub salon: Vec<String>,
    pub credit: Vec<String>,
    pub barter: Vec<String>,
    pub vin: Vec<String>,
}

impl Default for IndexSelectors {
    fn default() -> Self {
        Self {
            card: strings(&["div.products-i", ".products .products-i"]),
            link: strings(&["a.products-i__link", "a[href*='/autos/']"]),
            vip: strings(&[".products-i__label--vip"]),
            featured: strings(&[".products-i__label--featured"]),
            salon: strings(&[".products-i__label--salon"]),
            credit: strings(&[".products-i__icon--loan"]),
            barter: strings(&[".products-i__icon--barter"]),
            vin: strings(&[".products-i__label--vin"]),
        }
    }
}

/// Selectors for listing detail pages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailSelectors {
    pub title: Vec<String>,
    pub price: Vec<String>,
    /// Property rows holding a label and a value
    pub property_row: Vec<String>,
    pub property_name: Vec<String>,
    pub property_value: Vec<String>,
    pub description: Vec<String>,
    pub extras: Vec<String>,
    pub seller_name: Vec<String>,
    pub contact_param: Vec<String>,
    pub contact_param_name: Vec<String>,
    pub contact_param_value: Vec<String>,
    pub statistics: Vec<String>,
    pub images: Vec<String>,
    pub csrf_meta: Vec<String>,
    pub csrf_input: Vec<String>,
}

impl Default for DetailSelectors {
    fn default() -> Self {
        Self {
            title: strings(&["h1.product-title", ".product-title"]),
            price: strings(&[
                "div.product-price__i--bold",
                ".product-price__i--bold",
                ".product-price__i",
            ]),
            property_row: strings(&["div.product-properties__i"]),
            property_name: strings(&["label.product-properties__i-name", ".product-properties__i-name"]),
            property_value: strings(&["span.product-properties__i-value", ".product-properties__i-value"]),
            description: strings(&["div.product-description__content", ".product-description"]),
            extras: strings(&["ul.product-extras li", ".product-extras__i"]),
            seller_name: strings(&["div.product-owner__info-name", ".product-shop__owner-name"]),
            contact_param: strings(&["div.shop-contact .shop-contact__param"]),
            contact_param_name: strings(&[".shop-contact__param-name"]),
            contact_param_value: strings(&[
                "a.shop-contact__param-value",
                "div.shop-contact__param-value",
            ]),
            statistics: strings(&["ul.product-statistics li", ".product-statistics__i"]),
            images: strings(&["img[src]"]),
            csrf_meta: strings(&["meta[name='csrf-token']"]),
            csrf_input: strings(&["input[name='authenticity_token']"]),
        }
    }
}
