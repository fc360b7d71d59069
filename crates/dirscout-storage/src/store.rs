//! Persistence contract used by the pipeline, plus an in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dirscout_core::{
    normalize_name, normalize_phone, normalize_website, CategoryDefinition, CustomFieldDefinition,
    CustomFieldValue, FieldType, Listing, Location, LocationLevel, NewListing, NewLocation,
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("unreadable {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Identity used by the duplicate check, compared in normalized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingKey {
    Website(String),
    Phone(String),
    BusinessName(String),
}

impl ListingKey {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Website(_) => "website",
            Self::Phone(_) => "phone",
            Self::BusinessName(_) => "business_name",
        }
    }

    /// The normalized comparison value, or `None` when it normalizes to nothing.
    pub fn normalized(&self) -> Option<String> {
        let value = match self {
            Self::Website(v) => normalize_website(v),
            Self::Phone(v) => normalize_phone(v),
            Self::BusinessName(v) => normalize_name(v),
        };
        (!value.is_empty()).then_some(value)
    }

    /// Whether a stored value of this key's column is the same identity.
    ///
    /// Every store makes the final call here, so case folding and whitespace
    /// handling never depend on the backend.
    pub fn matches_stored(&self, stored: &str) -> bool {
        let Some(wanted) = self.normalized() else {
            return false;
        };
        let stored = match self {
            Self::Website(_) => normalize_website(stored),
            Self::Phone(_) => normalize_phone(stored),
            Self::BusinessName(_) => normalize_name(stored),
        };
        stored == wanted
    }

    fn matches(&self, listing: &NewListing) -> bool {
        let stored = match self {
            Self::Website(_) => &listing.website,
            Self::Phone(_) => &listing.phone,
            Self::BusinessName(_) => &listing.business_name,
        };
        self.matches_stored(stored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    pub category_id: Uuid,
    pub key: ListingKey,
}

/// Location lookup; name comparison is case-insensitive and `parent_id`
/// narrows the match only when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationQuery {
    pub name: String,
    pub level: LocationLevel,
    pub parent_id: Option<Uuid>,
}

impl LocationQuery {
    fn matches(&self, location: &Location) -> bool {
        location.level == self.level
            && location.name.to_lowercase() == self.name.to_lowercase()
            && self.parent_id.map_or(true, |p| location.parent_id == Some(p))
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn category_by_slug(&self, slug: &str) -> Result<Option<CategoryDefinition>, StoreError>;

    async fn custom_fields(&self, category_id: Uuid) -> Result<Vec<CustomFieldDefinition>, StoreError>;

    async fn listing_exists(&self, query: &ListingQuery) -> Result<bool, StoreError>;

    async fn insert_listing(&self, listing: &NewListing) -> Result<Listing, StoreError>;

    async fn insert_custom_field_values(&self, values: &[CustomFieldValue]) -> Result<(), StoreError>;

    async fn find_location(&self, query: &LocationQuery) -> Result<Option<Location>, StoreError>;

    async fn location(&self, id: Uuid) -> Result<Option<Location>, StoreError>;

    async fn all_locations(&self) -> Result<Vec<Location>, StoreError>;

    async fn insert_location(&self, location: &NewLocation) -> Result<Location, StoreError>;

    /// Look the location up by `(name, level[, parent])` and create it when absent.
    ///
    /// Returns the row and whether it was created.
    async fn get_or_create_location(
        &self,
        query: &LocationQuery,
        new: &NewLocation,
    ) -> Result<(Location, bool), StoreError> {
        if let Some(existing) = self.find_location(query).await? {
            return Ok((existing, false));
        }
        Ok((self.insert_location(new).await?, true))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    categories: Vec<CategoryDefinition>,
    custom_fields: Vec<CustomFieldDefinition>,
    listings: Vec<Listing>,
    custom_values: Vec<CustomFieldValue>,
    locations: Vec<Location>,
    reject_listing_inserts: bool,
}

/// Process-local store; used for dry runs and as the test double.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_category(&self, slug: &str, name: &str) -> CategoryDefinition {
        let category = CategoryDefinition {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: name.to_string(),
        };
        self.state.lock().await.categories.push(category.clone());
        category
    }

    pub async fn add_custom_field(
        &self,
        category_id: Uuid,
        field_name: &str,
        field_type: FieldType,
        options: Vec<String>,
    ) -> CustomFieldDefinition {
        let def = CustomFieldDefinition {
            id: Uuid::new_v4(),
            category_id,
            field_name: field_name.to_string(),
            field_type,
            options,
        };
        self.state.lock().await.custom_fields.push(def.clone());
        def
    }

    /// Make every subsequent listing insert fail, to exercise persistence failures.
    pub async fn reject_listing_inserts(&self, reject: bool) {
        self.state.lock().await.reject_listing_inserts = reject;
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.state.lock().await.listings.clone()
    }

    pub async fn custom_values(&self) -> Vec<CustomFieldValue> {
        self.state.lock().await.custom_values.clone()
    }

    pub async fn locations(&self) -> Vec<Location> {
        self.state.lock().await.locations.clone()
    }

    pub async fn listing_count(&self) -> usize {
        self.state.lock().await.listings.len()
    }

    pub async fn location_count(&self) -> usize {
        self.state.lock().await.locations.len()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn category_by_slug(&self, slug: &str) -> Result<Option<CategoryDefinition>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.categories.iter().find(|c| c.slug == slug).cloned())
    }

    async fn custom_fields(&self, category_id: Uuid) -> Result<Vec<CustomFieldDefinition>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .custom_fields
            .iter()
            .filter(|f| f.category_id == category_id)
            .cloned()
            .collect())
    }

    async fn listing_exists(&self, query: &ListingQuery) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .listings
            .iter()
            .any(|l| l.data.category_id == query.category_id && query.key.matches(&l.data)))
    }

    async fn insert_listing(&self, listing: &NewListing) -> Result<Listing, StoreError> {
        let mut state = self.state.lock().await;
        if state.reject_listing_inserts {
            return Err(StoreError::Rejected(format!(
                "listing inserts disabled ({})",
                listing.business_name
            )));
        }
        let row = Listing {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            data: listing.clone(),
        };
        state.listings.push(row.clone());
        Ok(row)
    }

    async fn insert_custom_field_values(&self, values: &[CustomFieldValue]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.custom_values.extend_from_slice(values);
        Ok(())
    }

    async fn find_location(&self, query: &LocationQuery) -> Result<Option<Location>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.locations.iter().find(|l| query.matches(l)).cloned())
    }

    async fn location(&self, id: Uuid) -> Result<Option<Location>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.locations.iter().find(|l| l.id == id).cloned())
    }

    async fn all_locations(&self) -> Result<Vec<Location>, StoreError> {
        Ok(self.state.lock().await.locations.clone())
    }

    async fn insert_location(&self, location: &NewLocation) -> Result<Location, StoreError> {
        let row = Location {
            id: Uuid::new_v4(),
            name: location.name.clone(),
            slug: location.slug.clone(),
            level: location.level,
            parent_id: location.parent_id,
            latitude: location.latitude,
            longitude: location.longitude,
        };
        self.state.lock().await.locations.push(row.clone());
        Ok(row)
    }
}
