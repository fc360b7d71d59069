//! Source adapter contract, default field extraction and the adapter registry.

pub mod classify;
pub mod html;
pub mod json;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use dirscout_core::{FieldValue, StandardFields};
use dirscout_storage::{Document, DocumentKind, FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use classify::{CategoryInfo, FieldRule, RulesError, TaxonomyRules};
pub use html::{HtmlDirectoryAdapter, HtmlDirectoryConfig};
pub use json::{JsonApiAdapter, JsonApiConfig, JsonFieldPointers};

pub const CRATE_NAME: &str = "dirscout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Per-source extraction strategy.
///
/// Only URL enumeration is source specific by necessity; loading, field
/// extraction and classification have defaults a source may override.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Detail URLs to ingest. May fetch index pages through `fetcher`.
    async fn listing_urls(&self, fetcher: &HttpFetcher) -> Result<Vec<String>, AdapterError>;

    async fn load(&self, fetcher: &HttpFetcher, url: &str) -> Result<Document, AdapterError> {
        Ok(fetcher.fetch(url).await?)
    }

    /// Never fails: anything not found is left empty.
    fn extract_standard_fields(&self, doc: &Document, _source_url: &str) -> StandardFields {
        default_standard_fields(doc)
    }

    fn extract_custom_fields(
        &self,
        doc: &Document,
        _source_url: &str,
        rules: &TaxonomyRules,
    ) -> BTreeMap<String, FieldValue> {
        rules.classify(&document_text(doc))
    }
}

/// Adapter configuration as it appears in `sources.yaml`, tagged by `kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    HtmlDirectory(HtmlDirectoryConfig),
    JsonApi(JsonApiConfig),
}

impl AdapterConfig {
    pub fn build(&self, source_id: &str) -> Result<Box<dyn SourceAdapter>, AdapterError> {
        let adapter: Box<dyn SourceAdapter> = match self {
            Self::HtmlDirectory(cfg) => Box::new(HtmlDirectoryAdapter::new(source_id, cfg.clone())?),
            Self::JsonApi(cfg) => Box::new(JsonApiAdapter::new(source_id, cfg.clone())),
        };
        Ok(adapter)
    }
}

/// Plain text of a document: visible HTML text, or every JSON string value.
pub fn document_text(doc: &Document) -> String {
    match doc.kind {
        DocumentKind::Html => visible_text(&Html::parse_document(&doc.body)),
        DocumentKind::Json => {
            let mut parts = Vec::new();
            if let Some(value) = doc.json_value() {
                collect_json_strings(&value, &mut parts);
            }
            parts.join(". ")
        }
    }
}

/// Body text nodes, skipping non-rendered elements, one per line.
pub fn visible_text(document: &Html) -> String {
    let mut lines = Vec::new();
    push_visible_text(document.root_element(), &mut lines);
    lines.join("\n")
}

fn push_visible_text(element: ElementRef<'_>, lines: &mut Vec<String>) {
    if matches!(
        element.value().name(),
        "script" | "style" | "noscript" | "template" | "head"
    ) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    lines.push(text.to_string());
                }
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    push_visible_text(child, lines);
                }
            }
            _ => {}
        }
    }
}

fn collect_json_strings(value: &JsonValue, out: &mut Vec<String>) {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => out.push(s.trim().to_string()),
        JsonValue::Array(items) => items.iter().for_each(|v| collect_json_strings(v, out)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_json_strings(v, out)),
        _ => {}
    }
}

/// Heuristic extraction shared by every source.
///
/// HTML: schema.org microdata first, then common tags (`h1`, meta
/// description, `address`, `tel:`/`mailto:` links), then regexes over the
/// visible text. JSON: conventional top-level keys.
pub fn default_standard_fields(doc: &Document) -> StandardFields {
    match doc.kind {
        DocumentKind::Html => html_standard_fields(&Html::parse_document(&doc.body)),
        DocumentKind::Json => doc
            .json_value()
            .map(|v| json::conventional_fields(&v))
            .unwrap_or_default(),
    }
}

fn html_standard_fields(document: &Html) -> StandardFields {
    let text = visible_text(document);

    let business_name = first_of(&[
        select_first_text(document, "[itemprop=name]"),
        select_first_text(document, "h1"),
        select_first_attr(document, "meta[property='og:title']", "content"),
        select_first_text(document, "title"),
    ]);
    let description = first_of(&[
        select_first_text(document, "[itemprop=description]"),
        select_first_attr(document, "meta[name=description]", "content"),
        select_first_attr(document, "meta[property='og:description']", "content"),
    ]);
    let address = first_of(&[
        select_first_text(document, "[itemprop=address]"),
        select_first_text(document, "address"),
    ]);
    let phone = first_of(&[
        select_first_text(document, "[itemprop=telephone]"),
        select_first_attr(document, "a[href^='tel:']", "href")
            .map(|href| href.trim_start_matches("tel:").to_string()),
        find_phone(&text),
    ]);
    let email = first_of(&[
        select_first_text(document, "[itemprop=email]"),
        select_first_attr(document, "a[href^='mailto:']", "href").map(|href| {
            let addr = href.trim_start_matches("mailto:");
            addr.split('?').next().unwrap_or(addr).to_string()
        }),
        find_email(&text),
    ]);
    let website = first_of(&[
        select_first_attr(document, "a[itemprop=url]", "href"),
        select_first_attr(document, "link[itemprop=url]", "href"),
    ]);

    let (latitude, longitude) = html_coordinates(document);

    StandardFields {
        business_name,
        description,
        address,
        phone,
        email,
        website,
        latitude,
        longitude,
    }
    .tidy()
}

fn html_coordinates(document: &Html) -> (Option<f64>, Option<f64>) {
    let parse = |v: Option<String>| v.and_then(|s| s.trim().parse::<f64>().ok());

    let lat = parse(select_first_attr(document, "[itemprop=latitude]", "content"))
        .or_else(|| parse(select_first_attr(document, "meta[property='place:location:latitude']", "content")));
    let lon = parse(select_first_attr(document, "[itemprop=longitude]", "content"))
        .or_else(|| parse(select_first_attr(document, "meta[property='place:location:longitude']", "content")));
    if lat.is_some() && lon.is_some() {
        return (lat, lon);
    }

    // <meta name="geo.position" content="29.76;-95.36">
    select_first_attr(document, "meta[name='geo.position']", "content")
        .and_then(|pos| {
            let (a, b) = pos.split_once(';')?;
            Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
        })
        .map(|(a, b)| (Some(a), Some(b)))
        .unwrap_or((None, None))
}

fn first_of(candidates: &[Option<String>]) -> String {
    candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Compile a CSS selector, reporting failures as [`AdapterError::Selector`].
pub fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

fn select_first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn find_email(text: &str) -> Option<String> {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL
        .get_or_init(|| {
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
        })
        .find(text)
        .map(|m| m.as_str().to_string())
}

fn find_phone(text: &str) -> Option<String> {
    static PHONE: OnceLock<Regex> = OnceLock::new();
    PHONE
        .get_or_init(|| {
            Regex::new(r"(?:\+?\d{1,3}[\s.-]?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}").expect("phone regex")
        })
        .find(text)
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> Document {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(name);
        let body = std::fs::read_to_string(&path).expect("fixture");
        Document::html(format!("https://directory.example.test/{name}"), body)
    }

    #[test]
    fn microdata_page_yields_every_field() {
        let fields = default_standard_fields(&fixture("lab_detail.html"));
        assert_eq!(fields.business_name, "Gulf Coast Materials Lab");
        assert_eq!(fields.address, "123 Main St, Houston, TX 77001, United States");
        assert_eq!(fields.phone, "(713) 555-0100");
        assert_eq!(fields.email, "info@gulfcoastlab.test");
        assert_eq!(fields.website, "https://gulfcoastlab.test/");
        assert_eq!(fields.latitude, Some(29.7604));
        assert_eq!(fields.longitude, Some(-95.3698));
        assert!(fields.description.starts_with("Accredited metals"));
    }

    #[test]
    fn malformed_documents_produce_empty_fields() {
        let doc = Document::html("https://x.test/", "<div><p>unclosed <b>tags");
        let fields = default_standard_fields(&doc);
        assert_eq!(fields.business_name, "");
        assert_eq!(fields.website, "");
        assert_eq!(fields.latitude, None);

        let broken_json = Document {
            kind: DocumentKind::Json,
            ..Document::html("https://x.test/api", "{not json")
        };
        assert_eq!(default_standard_fields(&broken_json), StandardFields::default());
    }

    #[test]
    fn text_falls_back_to_regexes() {
        let doc = Document::html(
            "https://x.test/",
            "<h1>Acme</h1><p>Call 713.555.0199 or write lab@acme.test today.</p>",
        );
        let fields = default_standard_fields(&doc);
        assert_eq!(fields.phone, "713.555.0199");
        assert_eq!(fields.email, "lab@acme.test");
    }

    #[test]
    fn visible_text_skips_scripts_and_styles() {
        let doc = Document::html(
            "https://x.test/",
            "<html><head><title>T</title><style>.a{}</style></head>\
             <body><p>Steel testing.</p><script>var metal = 1;</script></body></html>",
        );
        let text = document_text(&doc);
        assert!(text.contains("Steel testing."));
        assert!(!text.contains("var metal"));
        assert!(!text.contains(".a{}"));
    }

    #[test]
    fn json_text_collects_string_values() {
        let doc = Document::json(
            "https://x.test/api#1",
            &serde_json::json!({"name": "Lab", "scope": ["Drinking Water", "Air"], "n": 3}),
        );
        let text = document_text(&doc);
        assert!(text.contains("Lab"));
        assert!(text.contains("Drinking Water"));
    }
}
