use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("Invalid media pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid selector {0}")]
    Selector(String),
}

/// The heuristics tried, in this order, to find a media link in a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `<audio src="...">`
    AudioSrc,
    /// `<audio><source src="..."></audio>`
    AudioSourceChild,
    /// Absolute URL containing the media marker anywhere in the raw text.
    RawPattern,
    /// `href="..."` containing the media marker.
    HrefPattern,
}

impl Strategy {
    pub const ORDER: [Strategy; 4] = [
        Strategy::AudioSrc,
        Strategy::AudioSourceChild,
        Strategy::RawPattern,
        Strategy::HrefPattern,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionResult {
    Found { url: Url, strategy: Strategy },
    NotFound,
}

impl ExtractionResult {
    pub fn url(&self) -> Option<&Url> {
        match self {
            ExtractionResult::Found { url, .. } => Some(url),
            ExtractionResult::NotFound => None,
        }
    }
}

pub struct Extractor {
    audio_selector: Selector,
    source_selector: Selector,
    raw_regex: Regex,
    href_regex: Regex,
}

impl Extractor {
    /// `marker` is the filename token every media link carries, e.g. `tfile.mp3`.
    pub fn new(marker: &str) -> Result<Self, ExtractorError> {
        let marker = regex::escape(marker);
        Ok(Extractor {
            audio_selector: parse_selector("audio")?,
            source_selector: parse_selector("audio source")?,
            raw_regex: Regex::new(&format!(r#"https?://[^"'\s<>]+{}[^"'\s<>]*"#, marker))?,
            href_regex: Regex::new(&format!(r#"href\s*=\s*["']([^"']*{}[^"']*)["']"#, marker))?,
        })
    }

    /// Run the strategies in order; the first that yields a resolvable URL wins.
    pub fn extract(&self, html: &str, page_url: &Url) -> ExtractionResult {
        let document = Html::parse_document(html);

        for strategy in Strategy::ORDER {
            let candidate = match strategy {
                Strategy::AudioSrc => self.audio_src(&document),
                Strategy::AudioSourceChild => self.audio_source_child(&document),
                Strategy::RawPattern => self.raw_pattern(html),
                Strategy::HrefPattern => self.href_pattern(html),
            };

            if let Some(url) = candidate.and_then(|c| resolve(page_url, &c)) {
                return ExtractionResult::Found { url, strategy };
            }
        }

        ExtractionResult::NotFound
    }

    fn audio_src(&self, document: &Html) -> Option<String> {
        // Only the first <audio> element counts.
        let audio = document.select(&self.audio_selector).next()?;
        non_empty(audio.value().attr("src"))
    }

    fn audio_source_child(&self, document: &Html) -> Option<String> {
        document
            .select(&self.source_selector)
            .find_map(|source| non_empty(source.value().attr("src")))
    }

    fn raw_pattern(&self, html: &str) -> Option<String> {
        self.raw_regex.find(html).map(|m| m.as_str().to_string())
    }

    fn href_pattern(&self, html: &str) -> Option<String> {
        self.href_regex
            .captures(html)
            .and_then(|cap| non_empty(cap.get(1).map(|m| m.as_str())))
    }
}

fn parse_selector(css: &str) -> Result<Selector, ExtractorError> {
    Selector::parse(css).map_err(|e| ExtractorError::Selector(format!("{}: {:?}", css, e)))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve `candidate` against the page URL. Raw-text matches may carry
/// HTML-escaped ampersands.
fn resolve(page_url: &Url, candidate: &str) -> Option<Url> {
    let candidate = candidate.replace("&amp;", "&");
    page_url.join(&candidate).ok()
}
