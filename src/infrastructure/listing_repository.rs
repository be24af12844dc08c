//! Listing store
//!
//! Batches are written with a bulk upsert inside one transaction. When the
//! bulk statement trips the `listing_url` uniqueness constraint (the same URL
//! already stored under another id) the transaction is rolled back and the
//! batch is replayed row by row so only the conflicting rows are skipped.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::query_builder::Separated;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::domain::{BadgeFlags, Listing};

/// Rows per multi-row INSERT
const BULK_CHUNK_SIZE: usize = 100;

const INSERT_COLUMNS: &str = "INSERT INTO listings (\
    listing_id, listing_url, title, price_raw, price, make, model, year, \
    mileage_raw, mileage_km, engine_volume_raw, engine_volume_l, engine_power_raw, engine_power_hp, \
    fuel_type, transmission, drivetrain, body_type, color, seats, condition, market, is_new, \
    city, seller_name, seller_phones, description, extras, view_count, posted_on, updated_on, \
    is_vip, is_featured, is_salon, has_credit, has_barter, has_vin, image_urls, scraped_at) ";

// A failed phone reveal keeps previously stored numbers.
const ON_CONFLICT_UPDATE: &str = " ON CONFLICT(listing_id) DO UPDATE SET \
    listing_url = excluded.listing_url, title = excluded.title, \
    price_raw = excluded.price_raw, price = excluded.price, \
    make = excluded.make, model = excluded.model, year = excluded.year, \
    mileage_raw = excluded.mileage_raw, mileage_km = excluded.mileage_km, \
    engine_volume_raw = excluded.engine_volume_raw, engine_volume_l = excluded.engine_volume_l, \
    engine_power_raw = excluded.engine_power_raw, engine_power_hp = excluded.engine_power_hp, \
    fuel_type = excluded.fuel_type, transmission = excluded.transmission, \
    drivetrain = excluded.drivetrain, body_type = excluded.body_type, color = excluded.color, \
    seats = excluded.seats, condition = excluded.condition, market = excluded.market, \
    is_new = excluded.is_new, city = excluded.city, seller_name = excluded.seller_name, \
    seller_phones = excluded.seller_phones, \
    description = excluded.description, extras = excluded.extras, \
    view_count = excluded.view_count, posted_on = excluded.posted_on, \
    updated_on = excluded.updated_on, is_vip = excluded.is_vip, \
    is_featured = excluded.is_featured, is_salon = excluded.is_salon, \
    has_credit = excluded.has_credit, has_barter = excluded.has_barter, \
    has_vin = excluded.has_vin, image_urls = excluded.image_urls, \
    scraped_at = excluded.scraped_at";

/// Outcome of persisting one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistResult {
    pub inserted: u64,
    pub updated: u64,
    /// Rows dropped because their URL belongs to another listing id
    pub skipped: u64,
    /// Repeated ids collapsed inside the batch
    pub deduplicated: u64,
    /// Set when nothing in the batch was made durable
    pub error: Option<String>,
}

impl PersistResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn durable(&self) -> u64 {
        self.inserted + self.updated
    }

    fn failed(deduplicated: u64, error: impl ToString) -> Self {
        Self {
            deduplicated,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Destination for listing batches
#[async_trait]
pub trait ListingSink: Send + Sync {
    /// Persist a batch. Never fails; store errors are reported in the result.
    async fn persist(&self, listings: &[Listing]) -> PersistResult;
}

#[derive(Clone)]
pub struct ListingRepository {
    pool: SqlitePool,
}

impl ListingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a batch in a single transaction.
    ///
    /// Returns `(inserted, updated)`.
    pub async fn bulk_upsert(&self, listings: &[&Listing]) -> Result<(u64, u64), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut existing = 0u64;

        for chunk in listings.chunks(BULK_CHUNK_SIZE) {
            existing += count_existing(&mut tx, chunk).await?;

            let mut builder = QueryBuilder::<Sqlite>::new(INSERT_COLUMNS);
            builder.push_values(chunk.iter().copied(), |mut row, listing| {
                bind_listing(&mut row, listing);
            });
            builder.push(ON_CONFLICT_UPDATE);
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        let total = listings.len() as u64;
        Ok((total - existing, existing))
    }

    /// Write rows one statement at a time, skipping URL conflicts.
    ///
    /// Returns `(inserted, updated, skipped)`.
    pub async fn replay_individually(
        &self,
        listings: &[&Listing],
    ) -> Result<(u64, u64, u64), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let (mut inserted, mut updated, mut skipped) = (0u64, 0u64, 0u64);

        for listing in listings {
            let exists = count_existing(&mut tx, std::slice::from_ref(listing)).await? > 0;

            let mut builder = QueryBuilder::<Sqlite>::new(INSERT_COLUMNS);
            builder.push_values(std::iter::once(*listing), |mut row, listing| {
                bind_listing(&mut row, listing);
            });
            builder.push(ON_CONFLICT_UPDATE);

            match builder.build().execute(&mut *tx).await {
                Ok(_) if exists => updated += 1,
                Ok(_) => inserted += 1,
                Err(e) if is_url_conflict(&e) => {
                    warn!(
                        "Skipping listing {}: URL {} already belongs to another listing",
                        listing.listing_id, listing.listing_url
                    );
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit().await?;
        Ok((inserted, updated, skipped))
    }

    pub async fn find(&self, listing_id: i64) -> Result<Option<Listing>> {
        let row = sqlx::query("SELECT * FROM listings WHERE listing_id = ?")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| listing_from_row(&row)).transpose()?)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Listings whose revealed phones include `phone`
    pub async fn find_by_phone(&self, phone: &str) -> Result<Vec<Listing>> {
        let rows = sqlx::query(
            r"
            SELECT * FROM listings
            WHERE EXISTS (SELECT 1 FROM json_each(listings.seller_phones) WHERE json_each.value = ?)
            ORDER BY listing_id
            ",
        )
        .bind(phone)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| listing_from_row(row).map_err(Into::into))
            .collect()
    }

    /// Number of listings with exactly `phones` revealed numbers
    pub async fn count_by_phone_count(&self, phones: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM listings WHERE json_array_length(seller_phones) = ?",
        )
        .bind(phones)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl ListingSink for ListingRepository {
    async fn persist(&self, listings: &[Listing]) -> PersistResult {
        let batch = dedupe_last_wins(listings);
        let deduplicated = (listings.len() - batch.len()) as u64;
        if deduplicated > 0 {
            debug!("Collapsed {} repeated listing ids in batch", deduplicated);
        }
        if batch.is_empty() {
            return PersistResult {
                deduplicated,
                ..PersistResult::default()
            };
        }

        match self.bulk_upsert(&batch).await {
            Ok((inserted, updated)) => {
                info!("Persisted {} listings ({} new, {} updated)", batch.len(), inserted, updated);
                PersistResult {
                    inserted,
                    updated,
                    deduplicated,
                    ..PersistResult::default()
                }
            }
            Err(e) if is_url_conflict(&e) => {
                warn!("Bulk upsert hit a URL conflict, replaying {} rows individually", batch.len());
                match self.replay_individually(&batch).await {
                    Ok((inserted, updated, skipped)) => {
                        info!(
                            "Replayed batch: {} new, {} updated, {} skipped",
                            inserted, updated, skipped
                        );
                        PersistResult {
                            inserted,
                            updated,
                            skipped,
                            deduplicated,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!("Individual replay failed: {}", e);
                        PersistResult::failed(deduplicated, e)
                    }
                }
            }
            Err(e) => {
                warn!("Bulk upsert failed: {}", e);
                PersistResult::failed(deduplicated, e)
            }
        }
    }
}

/// Keep the last occurrence of each id, in order of those occurrences
fn dedupe_last_wins(listings: &[Listing]) -> Vec<&Listing> {
    let last_index: HashMap<i64, usize> = listings
        .iter()
        .enumerate()
        .map(|(i, l)| (l.listing_id, i))
        .collect();
    listings
        .iter()
        .enumerate()
        .filter(|(i, l)| last_index.get(&l.listing_id) == Some(i))
        .map(|(_, l)| l)
        .collect()
}

async fn count_existing(
    tx: &mut Transaction<'_, Sqlite>,
    listings: &[&Listing],
) -> Result<u64, sqlx::Error> {
    let mut builder =
        QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM listings WHERE listing_id IN (");
    let mut ids = builder.separated(", ");
    for listing in listings {
        ids.push_bind(listing.listing_id);
    }
    ids.push_unseparated(")");
    let count: i64 = builder.build_query_scalar().fetch_one(&mut **tx).await?;
    Ok(count as u64)
}

fn is_url_conflict(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() && db.message().contains("listings.listing_url")
        }
        _ => false,
    }
}

fn json_list(values: &[String]) -> String {
    serde_json::Value::from(values.to_vec()).to_string()
}

fn bind_listing(row: &mut Separated<'_, '_, Sqlite, &'static str>, l: &Listing) {
    row.push_bind(l.listing_id)
        .push_bind(l.listing_url.clone())
        .push_bind(l.title.clone())
        .push_bind(l.price_raw.clone())
        .push_bind(l.price)
        .push_bind(l.make.clone())
        .push_bind(l.model.clone())
        .push_bind(l.year)
        .push_bind(l.mileage_raw.clone())
        .push_bind(l.mileage_km)
        .push_bind(l.engine_volume_raw.clone())
        .push_bind(l.engine_volume_l)
        .push_bind(l.engine_power_raw.clone())
        .push_bind(l.engine_power_hp)
        .push_bind(l.fuel_type.clone())
        .push_bind(l.transmission.clone())
        .push_bind(l.drivetrain.clone())
        .push_bind(l.body_type.clone())
        .push_bind(l.color.clone())
        .push_bind(l.seats)
        .push_bind(l.condition.clone())
        .push_bind(l.market.clone())
        .push_bind(l.is_new)
        .push_bind(l.city.clone())
        .push_bind(l.seller_name.clone())
        .push_bind(l.seller_phones.as_deref().map(json_list))
        .push_bind(l.description.clone())
        .push_bind(json_list(&l.extras))
        .push_bind(l.view_count)
        .push_bind(l.posted_on)
        .push_bind(l.updated_on)
        .push_bind(l.badges.is_vip)
        .push_bind(l.badges.is_featured)
        .push_bind(l.badges.is_salon)
        .push_bind(l.badges.has_credit)
        .push_bind(l.badges.has_barter)
        .push_bind(l.badges.has_vin)
        .push_bind(json_list(&l.image_urls))
        .push_bind(l.scraped_at);
}

fn listing_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Listing, sqlx::Error> {
    let json_vec = |column: &str| -> Result<Option<Vec<String>>, sqlx::Error> {
        let text: Option<String> = row.try_get(column)?;
        Ok(text.and_then(|t| serde_json::from_str(&t).ok()))
    };

    Ok(Listing {
        listing_id: row.try_get("listing_id")?,
        listing_url: row.try_get("listing_url")?,
        title: row.try_get("title")?,
        price_raw: row.try_get("price_raw")?,
        price: row.try_get("price")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        year: row.try_get("year")?,
        mileage_raw: row.try_get("mileage_raw")?,
        mileage_km: row.try_get("mileage_km")?,
        engine_volume_raw: row.try_get("engine_volume_raw")?,
        engine_volume_l: row.try_get("engine_volume_l")?,
        engine_power_raw: row.try_get("engine_power_raw")?,
        engine_power_hp: row.try_get("engine_power_hp")?,
        fuel_type: row.try_get("fuel_type")?,
        transmission: row.try_get("transmission")?,
        drivetrain: row.try_get("drivetrain")?,
        body_type: row.try_get("body_type")?,
        color: row.try_get("color")?,
        seats: row.try_get("seats")?,
        condition: row.try_get("condition")?,
        market: row.try_get("market")?,
        is_new: row.try_get("is_new")?,
        city: row.try_get("city")?,
        seller_name: row.try_get("seller_name")?,
        seller_phones: json_vec("seller_phones")?,
        description: row.try_get("description")?,
        extras: json_vec("extras")?.unwrap_or_default(),
        view_count: row.try_get("view_count")?,
        posted_on: row.try_get("posted_on")?,
        updated_on: row.try_get("updated_on")?,
        badges: BadgeFlags {
            is_vip: row.try_get("is_vip")?,
            is_featured: row.try_get("is_featured")?,
            is_salon: row.try_get("is_salon")?,
            has_credit: row.try_get("has_credit")?,
            has_barter: row.try_get("has_barter")?,
            has_vin: row.try_get("has_vin")?,
        },
        image_urls: json_vec("image_urls")?.unwrap_or_default(),
        scraped_at: row.try_get("scraped_at")?,
    })
}
