//! Record extraction from rendered markup
//!
//! A pure function of the markup snapshot: given the same HTML, it produces
//! the same record sequence in document order. Field lookups that find
//! nothing yield empty strings; an item is dropped only when its display
//! name (the identity field) is missing. One malformed item never aborts
//! the rest of the batch.

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Invalid selector {name}: {message}")]
    InvalidSelector { name: &'static str, message: String },
}

/// One scraped profile entity. Absent fields are empty strings, not errors.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExtractedRecord {
    pub name: String,
    pub headline: String,
    pub location: String,
    pub profile_link: String,
    /// 1-based position of the source item in the DOM list. Dropped items
    /// still occupy their slot, so this can run ahead of the record index;
    /// anything addressing list items (invite buttons) must use it.
    #[serde(skip)]
    pub item_index: usize,
}

/// Field locators for the search-results view
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorConfig {
    /// Single outer results container
    pub container_selector: String,
    /// Item nodes within the container, in document order
    pub item_selector: String,
    /// Identity field; items without it are dropped
    pub name_selector: String,
    pub headline_selector: String,
    pub location_selector: String,
    pub link_selector: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            container_selector: "div.search-results-container".to_string(),
            item_selector: "ul.reusable-search__entity-result-list > li".to_string(),
            name_selector: "span.entity-result__title-text".to_string(),
            headline_selector: "div.entity-result__primary-subtitle".to_string(),
            location_selector: "div.entity-result__secondary-subtitle".to_string(),
            link_selector: "a.app-aware-link".to_string(),
        }
    }
}

/// Converts a markup snapshot into a sequence of [`ExtractedRecord`]s.
/// Performs no navigation and no mutation.
pub struct RecordExtractor {
    container: Selector,
    item: Selector,
    name: Selector,
    headline: Selector,
    location: Selector,
    link: Selector,
}

fn parse_selector(name: &'static str, raw: &str) -> Result<Selector, ExtractError> {
    Selector::parse(raw).map_err(|e| ExtractError::InvalidSelector {
        name,
        message: e.to_string(),
    })
}

/// Concatenated text of an element with whitespace collapsed
fn text_of(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

impl RecordExtractor {
    pub fn new(config: &ExtractorConfig) -> Result<Self, ExtractError> {
        Ok(Self {
            container: parse_selector("container", &config.container_selector)?,
            item: parse_selector("item", &config.item_selector)?,
            name: parse_selector("name", &config.name_selector)?,
            headline: parse_selector("headline", &config.headline_selector)?,
            location: parse_selector("location", &config.location_selector)?,
            link: parse_selector("link", &config.link_selector)?,
        })
    }

    /// Extract records from a raw HTML snapshot.
    ///
    /// A missing container is a valid "no results" state and yields an
    /// empty sequence.
    pub fn extract(&self, html: &str) -> Vec<ExtractedRecord> {
        let document = Html::parse_document(html);

        let container = match document.select(&self.container).next() {
            Some(c) => c,
            None => {
                debug!("No results container in snapshot");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        let mut dropped = 0usize;

        for (pos, item) in container.select(&self.item).enumerate() {
            let name = item.select(&self.name).next().map(text_of).unwrap_or_default();
            if name.is_empty() {
                // No identity field: drop this item, keep going
                dropped += 1;
                continue;
            }

            let headline = item.select(&self.headline).next().map(text_of).unwrap_or_default();
            let location = item.select(&self.location).next().map(text_of).unwrap_or_default();
            let profile_link = item
                .select(&self.link)
                .next()
                .and_then(|a| a.value().attr("href"))
                .unwrap_or_default()
                .to_string();

            records.push(ExtractedRecord {
                name,
                headline,
                location,
                profile_link,
                item_index: pos + 1,
            });
        }

        if dropped > 0 {
            debug!("Extraction dropped {} items without a name field", dropped);
        }

        records
    }
}
