use std::sync::Arc;

use dirscout_storage::{ListingKey, ListingQuery, ListingStore, StoreError};
use uuid::Uuid;

/// Checks a candidate against stored listings of the same category.
///
/// Keys are tried in order website, phone, business name; the first match
/// wins and blank keys are skipped. Comparison is on normalized values, so
/// two distinct businesses sharing a name inside one category collide.
#[derive(Clone)]
pub struct DeduplicationGuard {
    store: Arc<dyn ListingStore>,
}

impl DeduplicationGuard {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    /// Name of the field that matched an existing listing, if any.
    pub async fn find_match(
        &self,
        website: &str,
        phone: &str,
        business_name: &str,
        category_id: Uuid,
    ) -> Result<Option<&'static str>, StoreError> {
        let keys = [
            ListingKey::Website(website.to_string()),
            ListingKey::Phone(phone.to_string()),
            ListingKey::BusinessName(business_name.to_string()),
        ];
        for key in keys {
            if key.normalized().is_none() {
                continue;
            }
            let field = key.field();
            if self.store.listing_exists(&ListingQuery { category_id, key }).await? {
                return Ok(Some(field));
            }
        }
        Ok(None)
    }

    pub async fn is_duplicate(
        &self,
        website: &str,
        phone: &str,
        business_name: &str,
        category_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .find_match(website, phone, business_name, category_id)
            .await?
            .is_some())
    }
}
