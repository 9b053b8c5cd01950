use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::LinkSourceConfig;
use crate::fetcher::{Fetch, FetchError};

/// One numbered entry of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub no: u32,
    pub title: String,
    #[serde(rename = "url")]
    pub source_url: String,
}

#[derive(Debug, Error)]
pub enum LinkSourceError {
    #[error("Failed to fetch listing page: {0}")]
    Fetch(#[from] FetchError),

    #[error("Invalid URL {url}: {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },

    #[error("Failed to read link file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse link file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid listing pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Link source returned no items")]
    Empty,
}

/// Enumerates every item of the batch, ascending by number.
pub trait LinkSource {
    fn load_items(&self) -> Result<Vec<Item>, LinkSourceError>;
}

/// Build the configured link source. The listing variant borrows the fetcher.
pub fn from_config<'a>(
    config: &LinkSourceConfig,
    fetcher: &'a dyn Fetch,
) -> Result<Box<dyn LinkSource + 'a>, LinkSourceError> {
    let source: Box<dyn LinkSource + 'a> = match config {
        LinkSourceConfig::Listing {
            url,
            item_marker,
            unit_marker,
            action_marker,
        } => Box::new(ListingPage::new(
            fetcher,
            parse_url(url)?,
            item_marker,
            unit_marker,
            action_marker,
        )?),
        LinkSourceConfig::File { path } => Box::new(LinkFile::new(path.clone())),
        LinkSourceConfig::Template {
            url_template,
            count,
            item_marker,
            unit_marker,
        } => Box::new(UrlTemplate {
            url_template: url_template.clone(),
            count: *count,
            item_marker: item_marker.clone(),
            unit_marker: unit_marker.clone(),
        }),
    };
    Ok(source)
}

fn parse_url(url: &str) -> Result<Url, LinkSourceError> {
    Url::parse(url).map_err(|source| LinkSourceError::Url {
        url: url.to_string(),
        source,
    })
}

fn fallback_title(item_marker: &str, no: u32, unit_marker: &str) -> String {
    format!("{} {}{}", item_marker, no, unit_marker)
}

fn sorted_non_empty(map: BTreeMap<u32, Item>) -> Result<Vec<Item>, LinkSourceError> {
    if map.is_empty() {
        return Err(LinkSourceError::Empty);
    }
    Ok(map.into_values().collect())
}

/// Scrapes one listing page for anchors like `찬송가 7장 ... 바로가기`.
pub struct ListingPage<'a> {
    fetcher: &'a dyn Fetch,
    url: Url,
    action_marker: String,
    number_regex: Regex,
    slug_regex: Regex,
    item_marker: String,
    unit_marker: String,
}

impl<'a> ListingPage<'a> {
    pub fn new(
        fetcher: &'a dyn Fetch,
        url: Url,
        item_marker: &str,
        unit_marker: &str,
        action_marker: &str,
    ) -> Result<Self, LinkSourceError> {
        let item = regex::escape(item_marker);
        let unit = regex::escape(unit_marker);
        Ok(ListingPage {
            fetcher,
            url,
            action_marker: action_marker.to_string(),
            number_regex: Regex::new(&format!(r"{}\s*(\d+)\s*{}", item, unit))?,
            // Slug shape: .../새찬송가-7장-<title words>-가사악보NWC
            slug_regex: Regex::new(&format!(r"\d+{}-(.+?)-가사", unit))?,
            item_marker: item_marker.to_string(),
            unit_marker: unit_marker.to_string(),
        })
    }

    /// Pull `{no, title, url}` triples out of listing markup. The first entry
    /// for a number wins.
    pub fn parse_listing(&self, html: &str) -> Vec<Item> {
        let document = Html::parse_document(html);
        let mut items: BTreeMap<u32, Item> = BTreeMap::new();
        let selector = match Selector::parse("a[href]") {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };

        for anchor in document.select(&selector) {
            let text = anchor.text().collect::<String>();
            let text = text.trim();
            if !text.contains(&self.action_marker) {
                continue;
            }
            let Some(no) = self
                .number_regex
                .captures(text)
                .and_then(|cap| cap.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
            else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let url = match self.url.join(href) {
                Ok(u) => u,
                Err(e) => {
                    warn!("Skipping {} with unusable link {:?}: {}", no, href, e);
                    continue;
                }
            };

            let title = self
                .title_from_href(href)
                .unwrap_or_else(|| fallback_title(&self.item_marker, no, &self.unit_marker));

            items.entry(no).or_insert(Item {
                no,
                title,
                source_url: url.to_string(),
            });
        }

        items.into_values().collect()
    }

    fn title_from_href(&self, href: &str) -> Option<String> {
        let decoded = urlencoding::decode(href).ok()?;
        let slug = self.slug_regex.captures(&decoded)?.get(1)?.as_str();
        let title = slug.replace('-', " ").trim().to_string();
        (!title.is_empty()).then_some(title)
    }
}

impl LinkSource for ListingPage<'_> {
    fn load_items(&self) -> Result<Vec<Item>, LinkSourceError> {
        info!("Extracting item links from listing page {}", self.url);
        let html = self.fetcher.fetch_page(&self.url)?;
        let items = self.parse_listing(&html);
        info!("Extracted {} item links", items.len());
        sorted_non_empty(items.into_iter().map(|i| (i.no, i)).collect())
    }
}

/// A saved JSON array of items.
pub struct LinkFile {
    path: PathBuf,
}

impl LinkFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        LinkFile { path: path.into() }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl LinkSource for LinkFile {
    fn load_items(&self) -> Result<Vec<Item>, LinkSourceError> {
        let path_str = self.path().display().to_string();
        let content = fs::read_to_string(self.path()).map_err(|source| LinkSourceError::Read {
            path: path_str.clone(),
            source,
        })?;
        let items: Vec<Item> =
            serde_json::from_str(&content).map_err(|source| LinkSourceError::Parse {
                path: path_str,
                source,
            })?;
        info!("Loaded {} item links from {:?}", items.len(), self.path());

        let mut map = BTreeMap::new();
        for item in items {
            if map.contains_key(&item.no) {
                warn!("Duplicate entry for item {} in link file; keeping the first.", item.no);
                continue;
            }
            map.insert(item.no, item);
        }
        sorted_non_empty(map)
    }
}

/// Items `1..=count` addressed by a `{no}` URL template.
pub struct UrlTemplate {
    pub url_template: String,
    pub count: u32,
    pub item_marker: String,
    pub unit_marker: String,
}

impl LinkSource for UrlTemplate {
    fn load_items(&self) -> Result<Vec<Item>, LinkSourceError> {
        let mut map = BTreeMap::new();
        for no in 1..=self.count {
            let url = parse_url(&self.url_template.replace("{no}", &no.to_string()))?;
            map.insert(
                no,
                Item {
                    no,
                    title: fallback_title(&self.item_marker, no, &self.unit_marker),
                    source_url: url.to_string(),
                },
            );
        }
        sorted_non_empty(map)
    }
}
