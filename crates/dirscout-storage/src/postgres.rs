//! Postgres-backed [`ListingStore`]. Tables are owned and migrated elsewhere.

use async_trait::async_trait;
use dirscout_core::{
    CategoryDefinition, CustomFieldDefinition, CustomFieldValue, FieldType, Listing, Location,
    LocationLevel, NewListing, NewLocation,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::{ListingKey, ListingQuery, ListingStore, LocationQuery, StoreError};

const LOCATION_COLUMNS: &str = "id, name, slug, level, parent_id, latitude, longitude";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    let level: String = row.try_get("level")?;
    let level = LocationLevel::parse(&level).ok_or_else(|| StoreError::Corrupt {
        table: "locations",
        reason: format!("unknown level {level:?}"),
    })?;
    Ok(Location {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        level,
        parent_id: row.try_get("parent_id")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
    })
}

fn custom_field_from_row(row: &PgRow) -> Result<CustomFieldDefinition, StoreError> {
    let field_type: String = row.try_get("field_type")?;
    let field_type = FieldType::parse(&field_type).ok_or_else(|| StoreError::Corrupt {
        table: "custom_fields",
        reason: format!("unknown field_type {field_type:?}"),
    })?;
    let options: Option<JsonValue> = row.try_get("options")?;
    let options = options
        .as_ref()
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Ok(CustomFieldDefinition {
        id: row.try_get("id")?,
        category_id: row.try_get("category_id")?,
        field_name: row.try_get("field_name")?,
        field_type,
        options,
    })
}

/// Candidate rows for a duplicate key: `SELECT <column> ... WHERE <filter>`.
///
/// The filter is a loose containment test against the normalized value
/// bound as `$2`; [`ListingKey::matches_stored`] decides, so Postgres
/// `lower()` never disagrees with the in-memory store.
fn candidate_query(key: &ListingKey) -> String {
    let (column, filter) = match key {
        ListingKey::Website(_) => ("website", "strpos(lower(website), lower($2)) > 0"),
        ListingKey::Phone(_) => ("phone", "strpos(regexp_replace(phone, '[^0-9]', '', 'g'), $2) > 0"),
        ListingKey::BusinessName(_) => (
            "business_name",
            "strpos(lower(regexp_replace(business_name, '\\s+', ' ', 'g')), lower($2)) > 0",
        ),
    };
    format!("SELECT {column} FROM listings WHERE category_id = $1 AND {column} IS NOT NULL AND {filter}")
}

#[async_trait]
impl ListingStore for PgStore {
    async fn category_by_slug(&self, slug: &str) -> Result<Option<CategoryDefinition>, StoreError> {
        let row = sqlx::query("SELECT id, slug, name FROM categories WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CategoryDefinition {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            name: row.try_get("name")?,
        }))
    }

    async fn custom_fields(&self, category_id: Uuid) -> Result<Vec<CustomFieldDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, category_id, field_name, field_type, options
              FROM custom_fields
             WHERE category_id = $1
             ORDER BY field_name
            "#,
        )
        .bind(category_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(custom_field_from_row).collect()
    }

    async fn listing_exists(&self, query: &ListingQuery) -> Result<bool, StoreError> {
        let Some(value) = query.key.normalized() else {
            return Ok(false);
        };
        let sql = candidate_query(&query.key);
        let candidates: Vec<Option<String>> = sqlx::query_scalar(&sql)
            .bind(query.category_id)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        Ok(candidates
            .iter()
            .flatten()
            .any(|stored| query.key.matches_stored(stored)))
    }

    async fn insert_listing(&self, listing: &NewListing) -> Result<Listing, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO listings (
                business_name, slug, description, address, location_id, phone, email,
                website, latitude, longitude, category_id, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id, created_at
            "#,
        )
        .bind(&listing.business_name)
        .bind(&listing.slug)
        .bind(&listing.description)
        .bind(&listing.address)
        .bind(listing.location_id)
        .bind(&listing.phone)
        .bind(&listing.email)
        .bind(&listing.website)
        .bind(listing.latitude)
        .bind(listing.longitude)
        .bind(listing.category_id)
        .bind(listing.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(Listing {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            data: listing.clone(),
        })
    }

    async fn insert_custom_field_values(&self, values: &[CustomFieldValue]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for value in values {
            sqlx::query(
                r#"
                INSERT INTO listing_custom_fields (listing_id, custom_field_id, value)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(value.listing_id)
            .bind(value.custom_field_id)
            .bind(&value.value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_location(&self, query: &LocationQuery) -> Result<Option<Location>, StoreError> {
        let sql = format!(
            r#"
            SELECT {LOCATION_COLUMNS}
              FROM locations
             WHERE lower(name) = lower($1)
               AND level = $2
               AND ($3::uuid IS NULL OR parent_id = $3)
             LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&query.name)
            .bind(query.level.as_str())
            .bind(query.parent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn location(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn all_locations(&self) -> Result<Vec<Location>, StoreError> {
        let sql = format!("SELECT {LOCATION_COLUMNS} FROM locations ORDER BY level, name");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(location_from_row).collect()
    }

    async fn insert_location(&self, location: &NewLocation) -> Result<Location, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO locations (name, slug, level, parent_id, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&location.name)
        .bind(&location.slug)
        .bind(location.level.as_str())
        .bind(location.parent_id)
        .bind(location.latitude)
        .bind(location.longitude)
        .fetch_one(&self.pool)
        .await?;

        Ok(Location {
            id: row.try_get("id")?,
            name: location.name.clone(),
            slug: location.slug.clone(),
            level: location.level,
            parent_id: location.parent_id,
            latitude: location.latitude,
            longitude: location.longitude,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirscout_core::ListingStatus;

    #[test]
    fn status_and_level_use_lowercase_column_values() {
        assert_eq!(ListingStatus::Active.as_str(), "active");
        assert_eq!(LocationLevel::Region.as_str(), "region");
    }

    #[test]
    fn candidate_queries_select_the_keyed_column() {
        for (key, column) in [
            (ListingKey::Website(String::new()), "website"),
            (ListingKey::Phone(String::new()), "phone"),
            (ListingKey::BusinessName(String::new()), "business_name"),
        ] {
            let sql = candidate_query(&key);
            assert!(sql.starts_with(&format!("SELECT {column} FROM listings")), "{sql}");
            assert!(sql.contains("category_id = $1"));
            assert!(sql.contains("strpos("));
            assert!(!sql.contains("= $2"), "exact comparison belongs in Rust: {sql}");
        }
    }
}
