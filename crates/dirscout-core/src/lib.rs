//! Core listing, location and custom-field model for dirscout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dirscout-core";

/// Name of the singleton root of the location tree.
pub const GLOBAL_LOCATION_NAME: &str = "Global";

/// Maximum number of parent hops between any location and the global root.
pub const MAX_HIERARCHY_DEPTH: usize = 10;

const MAX_LISTING_SLUG_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Active,
    Pending,
    Deleted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "pending" => Some(Self::Pending),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Canonical attributes every extractor produces.
///
/// All keys are always present; a value that could not be found is an empty
/// string (or `None` for coordinates), never a missing key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StandardFields {
    pub business_name: String,
    pub description: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub website: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl StandardFields {
    /// Collapse runs of whitespace in every text field.
    pub fn tidy(mut self) -> Self {
        for field in [
            &mut self.business_name,
            &mut self.description,
            &mut self.address,
            &mut self.phone,
            &mut self.email,
            &mut self.website,
        ] {
            *field = collapse_whitespace(field);
        }
        self
    }

    pub fn has_identity(&self) -> bool {
        !self.business_name.is_empty()
    }
}

/// Listing row as handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListing {
    pub business_name: String,
    pub slug: String,
    pub description: String,
    pub address: String,
    pub location_id: Option<Uuid>,
    pub phone: String,
    pub email: String,
    pub website: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub category_id: Uuid,
    pub status: ListingStatus,
}

impl NewListing {
    pub fn from_fields(fields: &StandardFields, category_id: Uuid, location_id: Option<Uuid>) -> Self {
        Self {
            business_name: fields.business_name.clone(),
            slug: listing_slug(&fields.business_name),
            description: fields.description.clone(),
            address: fields.address.clone(),
            location_id,
            phone: fields.phone.clone(),
            email: fields.email.clone(),
            website: fields.website.trim().to_string(),
            latitude: fields.latitude,
            longitude: fields.longitude,
            category_id,
            status: ListingStatus::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: NewListing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationLevel {
    Global,
    Region,
    Country,
    City,
}

impl LocationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Region => "region",
            Self::Country => "country",
            Self::City => "city",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Some(Self::Global),
            "region" => Some(Self::Region),
            "country" => Some(Self::Country),
            "city" => Some(Self::City),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub level: LocationLevel,
    pub parent_id: Option<Uuid>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    pub name: String,
    pub slug: String,
    pub level: LocationLevel,
    pub parent_id: Option<Uuid>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NewLocation {
    pub fn new(name: &str, level: LocationLevel, parent_id: Option<Uuid>) -> Self {
        Self {
            name: name.to_string(),
            slug: slugify(name),
            level,
            parent_id,
            latitude: None,
            longitude: None,
        }
    }

    pub fn with_coordinates(mut self, latitude: Option<f64>, longitude: Option<f64>) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }
}

/// Directory category; owned outside the pipeline and only read here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Boolean,
    Select,
    MultiSelect,
    Number,
    Date,
    Url,
    Email,
    Phone,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Select => "select",
            Self::MultiSelect => "multi_select",
            Self::Number => "number",
            Self::Date => "date",
            Self::Url => "url",
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "boolean" => Some(Self::Boolean),
            "select" => Some(Self::Select),
            "multi_select" => Some(Self::MultiSelect),
            "number" => Some(Self::Number),
            "date" => Some(Self::Date),
            "url" => Some(Self::Url),
            "email" => Some(Self::Email),
            "phone" => Some(Self::Phone),
            _ => None,
        }
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, Self::Select | Self::MultiSelect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    pub id: Uuid,
    pub category_id: Uuid,
    pub field_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Raw classifier output for one custom field, before type coercion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    List(Vec<String>),
    Text(String),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Bool(_) => false,
            Self::List(items) => items.is_empty(),
            Self::Text(text) => text.trim().is_empty(),
        }
    }

    /// Convert into the stored JSON shape for `field_type`.
    ///
    /// Returns `None` for empty values, which are never persisted.
    pub fn coerce(&self, field_type: FieldType) -> Option<JsonValue> {
        if self.is_empty() {
            return None;
        }
        let value = match (field_type, self) {
            (t, Self::List(items)) if t.is_choice() => JsonValue::from(items.clone()),
            (t, Self::Text(text)) if t.is_choice() => JsonValue::from(vec![text.clone()]),
            (t, Self::Bool(flag)) if t.is_choice() => JsonValue::from(vec![flag.to_string()]),
            (FieldType::Boolean, Self::Bool(flag)) => JsonValue::Bool(*flag),
            (FieldType::Boolean, Self::Text(text)) => JsonValue::Bool(!text.trim().is_empty()),
            (FieldType::Boolean, Self::List(items)) => JsonValue::Bool(!items.is_empty()),
            (_, Self::Bool(flag)) => JsonValue::String(flag.to_string()),
            (_, Self::Text(text)) => JsonValue::String(text.clone()),
            (_, Self::List(items)) => JsonValue::String(items.join(", ")),
        };
        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    pub listing_id: Uuid,
    pub custom_field_id: Uuid,
    pub value: JsonValue,
}

/// Counters owned by a single orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeStatistics {
    pub listings_fetched: u64,
    pub listings_saved: u64,
    pub listings_skipped_duplicate: u64,
    pub listings_failed: u64,
    pub parse_failures: u64,
    pub locations_unresolved: u64,
    pub custom_fields_populated: u64,
    pub rate_limit_delays: u64,
    pub robots_blocked: u64,
    pub deadline_exceeded: bool,
}

/// Kebab-case slug: lowercase alphanumerics separated by single dashes.
pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn listing_slug(business_name: &str) -> String {
    let slug = slugify(business_name);
    if slug.is_empty() {
        return "listing".to_string();
    }
    let truncated: String = slug.chars().take(MAX_LISTING_SLUG_LEN).collect();
    truncated.trim_end_matches('-').to_string()
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison form of a website: trimmed, lowercased, without trailing slashes.
pub fn normalize_website(website: &str) -> String {
    website.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Comparison form of a phone number: digits only.
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Comparison form of a business name: whitespace-collapsed and lowercased.
pub fn normalize_name(name: &str) -> String {
    collapse_whitespace(name).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_kebab_case() {
        assert_eq!(slugify("United States"), "united-states");
        assert_eq!(slugify("  St. John's  "), "st-john-s");
        assert_eq!(slugify("Washington, D.C."), "washington-d-c");
    }

    #[test]
    fn listing_slug_falls_back_and_truncates() {
        assert_eq!(listing_slug(""), "listing");
        assert_eq!(listing_slug("Acme Labs, Inc."), "acme-labs-inc");
        let long = "word ".repeat(60);
        let slug = listing_slug(&long);
        assert!(slug.len() <= 100);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn choice_fields_coerce_to_arrays() {
        let single = FieldValue::Text("1 Week".into());
        assert_eq!(
            single.coerce(FieldType::Select),
            Some(serde_json::json!(["1 Week"]))
        );
        let many = FieldValue::List(vec!["Metals".into(), "Ceramics".into()]);
        assert_eq!(
            many.coerce(FieldType::MultiSelect),
            Some(serde_json::json!(["Metals", "Ceramics"]))
        );
    }

    #[test]
    fn boolean_and_text_fields_coerce_to_scalars() {
        assert_eq!(
            FieldValue::Bool(false).coerce(FieldType::Boolean),
            Some(serde_json::json!(false))
        );
        assert_eq!(
            FieldValue::Text("SEM, XRF".into()).coerce(FieldType::Text),
            Some(serde_json::json!("SEM, XRF"))
        );
    }

    #[test]
    fn empty_values_are_not_coerced() {
        assert_eq!(FieldValue::List(vec![]).coerce(FieldType::MultiSelect), None);
        assert_eq!(FieldValue::Text("  ".into()).coerce(FieldType::Text), None);
    }

    #[test]
    fn dedup_normal_forms() {
        assert_eq!(normalize_website(" HTTPS://Acme.com/ "), "https://acme.com");
        assert_eq!(normalize_phone("(713) 555-0100"), "7135550100");
        assert_eq!(normalize_name("  Acme   LABS "), "acme labs");
    }

    #[test]
    fn field_values_round_trip_untagged() {
        let json = serde_json::json!({"a": true, "b": ["x"], "c": "text"});
        let parsed: std::collections::BTreeMap<String, FieldValue> =
            serde_json::from_value(json).unwrap();
        assert_eq!(parsed["a"], FieldValue::Bool(true));
        assert_eq!(parsed["b"], FieldValue::List(vec!["x".into()]));
        assert_eq!(parsed["c"], FieldValue::Text("text".into()));
    }
}
