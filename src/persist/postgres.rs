use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::engine::types::{AmountBounds, Listing, PaymentMethod, Side};
use crate::persist::{ListingStore, PersistError, PersistResult};

pub struct PostgresListingStore {
    connection_pool: PgPool,
}

impl PostgresListingStore {
    pub async fn connect(database_url: &str) -> PersistResult<Self> {
        let pool = PgPoolOptions::new().max_connections(4).connect(database_url).await?;
        info!("Connected listing store");
        Ok(Self { connection_pool: pool })
    }
}

fn side_from_db(s: &str) -> PersistResult<Side> {
    match s {
        "BUY" => Ok(Side::BUY),
        "SELL" => Ok(Side::SELL),
        other => Err(PersistError::Format(format!("unknown side {other:?}"))),
    }
}

fn listing_from_row(row: &PgRow) -> PersistResult<Listing> {
    let side: String = row.try_get("side")?;
    // stored as a JSON array of snake_case names
    let methods_json: String = row.try_get("payment_methods")?;
    let payment_methods: Vec<PaymentMethod> =
        serde_json::from_str(&methods_json).map_err(|e| PersistError::Format(e.to_string()))?;
    let target_rank: i32 = row.try_get("target_rank")?;

    Ok(Listing {
        id: row.try_get("id")?,
        side: side_from_db(&side)?,
        asset: row.try_get("asset")?,
        fiat: row.try_get("fiat")?,
        price: row.try_get("price")?,
        ratio: row.try_get("ratio")?,
        target_rank: target_rank.max(1) as u32,
        bounds: AmountBounds { min: row.try_get("min_amount")?, max: row.try_get("max_amount")? },
        payment_methods,
        group_key: row.try_get::<Option<String>, _>("group_key")?.unwrap_or_default(),
        active: row.try_get("active")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

#[async_trait::async_trait]
impl ListingStore for PostgresListingStore {
    async fn get_all(&self) -> PersistResult<Vec<Listing>> {
        let rows = sqlx::query(
            r#"
            SELECT id, side, asset, fiat, price, ratio, target_rank, min_amount, max_amount,
                   payment_methods, group_key, active, updated_at_ms
            FROM p2p_listings
            WHERE active
            ORDER BY id
            "#,
        )
        .fetch_all(&self.connection_pool)
        .await?;

        let listings = rows.iter().map(listing_from_row).collect::<PersistResult<Vec<_>>>()?;
        debug!(count = listings.len(), "Loaded listings");
        Ok(listings)
    }

    async fn update_one(&self, listing: &Listing) -> PersistResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE p2p_listings
            SET price = $2, ratio = $3, active = $4, updated_at_ms = $5
            WHERE id = $1
            "#,
        )
        .bind(&listing.id)
        .bind(listing.price)
        .bind(listing.ratio)
        .bind(listing.active)
        .bind(listing.updated_at_ms)
        .execute(&self.connection_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistError::NotFound(listing.id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_from_db() {
        assert_eq!(side_from_db("BUY").unwrap(), Side::BUY);
        assert_eq!(side_from_db("SELL").unwrap(), Side::SELL);
        assert!(matches!(side_from_db("buy"), Err(PersistError::Format(_))));
    }
}
