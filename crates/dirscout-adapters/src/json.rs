//! JSON API sources whose collection response already carries every record.
//!
//! The collection is fetched once during URL enumeration. Each record gets a
//! synthetic `<collection-url>#<record-id>` URL and loading it returns the
//! cached record without touching the network.

use std::collections::HashMap;

use async_trait::async_trait;
use dirscout_core::StandardFields;
use dirscout_storage::{Document, DocumentKind, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{AdapterError, SourceAdapter};

#[derive(Debug, Clone, Deserialize)]
pub struct JsonApiConfig {
    pub collection_url: String,
    /// JSON pointer to the record array; empty for a top-level array.
    #[serde(default)]
    pub records_pointer: String,
    /// JSON pointer, relative to a record, of its stable id.
    pub id_pointer: String,
    #[serde(default)]
    pub fields: JsonFieldPointers,
}

/// Record-relative JSON pointers. Unset fields use the conventional key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonFieldPointers {
    pub business_name: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    /// Joined with `", "` when `address` is unset, e.g. street, city, state, zip.
    #[serde(default)]
    pub address_parts: Vec<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

pub struct JsonApiAdapter {
    source_id: String,
    config: JsonApiConfig,
    records: Mutex<HashMap<String, JsonValue>>,
}

impl JsonApiAdapter {
    pub fn new(source_id: &str, config: JsonApiConfig) -> Self {
        Self {
            source_id: source_id.to_string(),
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    fn record_url(&self, id: &str) -> String {
        let base = self
            .config
            .collection_url
            .split('#')
            .next()
            .unwrap_or(&self.config.collection_url);
        format!("{base}#{id}")
    }

    fn fields_from_record(&self, record: &JsonValue) -> StandardFields {
        let p = &self.config.fields;
        let text = |pointer: &Option<String>, key: &str| match pointer {
            Some(pointer) => json_text(record, pointer),
            None => json_text(record, &format!("/{key}")),
        };

        let mut address = match &p.address {
            Some(pointer) => json_text(record, pointer),
            None => String::new(),
        };
        if address.is_empty() && !p.address_parts.is_empty() {
            address = p
                .address_parts
                .iter()
                .map(|ptr| json_text(record, ptr))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
        }
        if address.is_empty() && p.address.is_none() {
            address = json_text(record, "/address");
        }

        let number = |pointer: &Option<String>, key: &str| {
            let pointer = pointer.clone().unwrap_or_else(|| format!("/{key}"));
            json_f64(record, &pointer)
        };

        StandardFields {
            business_name: text(&p.business_name, "name"),
            description: text(&p.description, "description"),
            address,
            phone: text(&p.phone, "phone"),
            email: text(&p.email, "email"),
            website: text(&p.website, "website"),
            latitude: number(&p.latitude, "latitude"),
            longitude: number(&p.longitude, "longitude"),
        }
        .tidy()
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn listing_urls(&self, fetcher: &HttpFetcher) -> Result<Vec<String>, AdapterError> {
        let doc = fetcher.fetch(&self.config.collection_url).await?;
        let value: JsonValue = serde_json::from_str(&doc.body).map_err(|err| {
            AdapterError::Message(format!(
                "collection {} is not JSON: {err}",
                self.config.collection_url
            ))
        })?;

        let records = if self.config.records_pointer.is_empty() {
            value.as_array()
        } else {
            value.pointer(&self.config.records_pointer).and_then(JsonValue::as_array)
        };
        let Some(records) = records else {
            return Err(AdapterError::Message(format!(
                "no record array at {:?} in {}",
                self.config.records_pointer, self.config.collection_url
            )));
        };

        let mut cache = self.records.lock().await;
        let mut urls = Vec::with_capacity(records.len());
        for record in records {
            let Some(id) = record.pointer(&self.config.id_pointer).and_then(scalar_string) else {
                warn!(source_id = %self.source_id, "record without id skipped");
                continue;
            };
            let url = self.record_url(&id);
            if cache.insert(url.clone(), record.clone()).is_none() {
                urls.push(url);
            }
        }
        debug!(source_id = %self.source_id, records = urls.len(), "cached collection records");
        Ok(urls)
    }

    async fn load(&self, fetcher: &HttpFetcher, url: &str) -> Result<Document, AdapterError> {
        if let Some(record) = self.records.lock().await.get(url) {
            return Ok(Document::json(url, record));
        }
        Ok(fetcher.fetch(url).await?)
    }

    fn extract_standard_fields(&self, doc: &Document, _source_url: &str) -> StandardFields {
        match doc.kind {
            DocumentKind::Json => doc
                .json_value()
                .map(|record| self.fields_from_record(&record))
                .unwrap_or_default(),
            DocumentKind::Html => crate::default_standard_fields(doc),
        }
    }
}

/// Standard fields read from conventional top-level keys.
pub fn conventional_fields(record: &JsonValue) -> StandardFields {
    StandardFields {
        business_name: json_text(record, "/name"),
        description: json_text(record, "/description"),
        address: json_text(record, "/address"),
        phone: json_text(record, "/phone"),
        email: json_text(record, "/email"),
        website: json_text(record, "/website"),
        latitude: json_f64(record, "/latitude"),
        longitude: json_f64(record, "/longitude"),
    }
    .tidy()
}

fn json_text(value: &JsonValue, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(scalar_string)
        .unwrap_or_default()
}

fn json_f64(value: &JsonValue, pointer: &str) -> Option<f64> {
    match value.pointer(pointer)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
