//! Directory sites: paginated index pages linking to one detail page per business.

use std::collections::HashSet;

use async_trait::async_trait;
use dirscout_core::StandardFields;
use dirscout_storage::{Document, DocumentKind, HttpFetcher};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{default_standard_fields, parse_selector, AdapterError, SourceAdapter};

fn default_max_pages() -> usize {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HtmlDirectoryConfig {
    /// Detail pages known up front, ingested before anything discovered.
    #[serde(default)]
    pub seed_urls: Vec<String>,
    #[serde(default)]
    pub index_urls: Vec<String>,
    #[serde(default)]
    pub detail_link_selector: Option<String>,
    #[serde(default)]
    pub next_page_selector: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Per-field overrides, `"css"` for element text or `"css@attr"` for an attribute.
    #[serde(default)]
    pub fields: FieldSelectors,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldSelectors {
    pub business_name: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
}

#[derive(Debug, Clone)]
struct FieldSelector {
    selector: Selector,
    attr: Option<String>,
}

impl FieldSelector {
    fn parse(spec: &str) -> Result<Self, AdapterError> {
        let (css, attr) = match spec.rsplit_once('@') {
            Some((css, attr)) if !attr.contains(|c: char| c.is_whitespace() || c == ']') => {
                (css, Some(attr.trim().to_string()))
            }
            _ => (spec, None),
        };
        Ok(Self {
            selector: parse_selector(css.trim())?,
            attr,
        })
    }

    fn extract(&self, document: &Html) -> Option<String> {
        let element = document.select(&self.selector).next()?;
        let raw = match &self.attr {
            Some(attr) => element.value().attr(attr)?.to_string(),
            None => element.text().collect::<Vec<_>>().join(" "),
        };
        let raw = raw.trim();
        (!raw.is_empty()).then(|| raw.to_string())
    }
}

#[derive(Debug, Default)]
struct CompiledFields {
    business_name: Option<FieldSelector>,
    description: Option<FieldSelector>,
    address: Option<FieldSelector>,
    phone: Option<FieldSelector>,
    email: Option<FieldSelector>,
    website: Option<FieldSelector>,
}

pub struct HtmlDirectoryAdapter {
    source_id: String,
    config: HtmlDirectoryConfig,
    detail_link: Option<Selector>,
    next_page: Option<Selector>,
    fields: CompiledFields,
}

impl HtmlDirectoryAdapter {
    /// Compile every configured selector; a bad selector is a setup error.
    pub fn new(source_id: &str, config: HtmlDirectoryConfig) -> Result<Self, AdapterError> {
        let compile = |spec: &Option<String>| spec.as_deref().map(FieldSelector::parse).transpose();
        let fields = CompiledFields {
            business_name: compile(&config.fields.business_name)?,
            description: compile(&config.fields.description)?,
            address: compile(&config.fields.address)?,
            phone: compile(&config.fields.phone)?,
            email: compile(&config.fields.email)?,
            website: compile(&config.fields.website)?,
        };
        let detail_link = config
            .detail_link_selector
            .as_deref()
            .map(parse_selector)
            .transpose()?;
        let next_page = config
            .next_page_selector
            .as_deref()
            .map(parse_selector)
            .transpose()?;

        Ok(Self {
            source_id: source_id.to_string(),
            config,
            detail_link,
            next_page,
            fields,
        })
    }

    /// Detail links and the next index page found on one index page.
    fn scan_index(&self, page_url: &str, body: &str) -> (Vec<String>, Option<String>) {
        let Ok(base) = Url::parse(page_url) else {
            return (Vec::new(), None);
        };
        let document = Html::parse_document(body);
        let resolve = |href: &str| {
            base.join(href.trim()).ok().map(|mut u| {
                // Fragment-only differences are the same page for detail URLs.
                u.set_fragment(None);
                u.to_string()
            })
        };

        let links = self
            .detail_link
            .as_ref()
            .map(|sel| {
                document
                    .select(sel)
                    .filter_map(|a| a.value().attr("href"))
                    .filter_map(resolve)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let next = self.next_page.as_ref().and_then(|sel| {
            document
                .select(sel)
                .filter_map(|a| a.value().attr("href"))
                .find_map(resolve)
        });

        (links, next)
    }
}

#[async_trait]
impl SourceAdapter for HtmlDirectoryAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn listing_urls(&self, fetcher: &HttpFetcher) -> Result<Vec<String>, AdapterError> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for url in &self.config.seed_urls {
            if seen.insert(url.clone()) {
                urls.push(url.clone());
            }
        }

        for index_url in &self.config.index_urls {
            let mut visited_pages = HashSet::new();
            let mut next = Some(index_url.clone());
            while let Some(page_url) = next.take() {
                if visited_pages.len() >= self.config.max_pages.max(1) || !visited_pages.insert(page_url.clone()) {
                    break;
                }
                let doc = match fetcher.fetch(&page_url).await {
                    Ok(doc) => doc,
                    Err(err) => {
                        warn!(source_id = %self.source_id, url = %page_url, error = %err, "index page unavailable");
                        break;
                    }
                };
                let (links, next_page) = self.scan_index(&page_url, &doc.body);
                debug!(
                    source_id = %self.source_id,
                    url = %page_url,
                    links = links.len(),
                    has_next = next_page.is_some(),
                    "scanned index page"
                );
                for link in links {
                    if seen.insert(link.clone()) {
                        urls.push(link);
                    }
                }
                next = next_page;
            }
        }

        Ok(urls)
    }

    fn extract_standard_fields(&self, doc: &Document, _source_url: &str) -> StandardFields {
        let mut fields = default_standard_fields(doc);
        if doc.kind != DocumentKind::Html {
            return fields;
        }

        let document = Html::parse_document(&doc.body);
        let overrides = [
            (&self.fields.business_name, &mut fields.business_name),
            (&self.fields.description, &mut fields.description),
            (&self.fields.address, &mut fields.address),
            (&self.fields.phone, &mut fields.phone),
            (&self.fields.email, &mut fields.email),
            (&self.fields.website, &mut fields.website),
        ];
        for (selector, slot) in overrides {
            if let Some(value) = selector.as_ref().and_then(|s| s.extract(&document)) {
                *slot = value;
            }
        }
        if let Some(email) = fields.email.strip_prefix("mailto:") {
            fields.email = email.split('?').next().unwrap_or(email).to_string();
        }
        if let Some(phone) = fields.phone.strip_prefix("tel:") {
            fields.phone = phone.to_string();
        }
        fields.tidy()
    }
}
