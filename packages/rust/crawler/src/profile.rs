//! Compiled form of a [`SourceProfile`] and the extraction routines that use it.
//!
//! Every function here is synchronous and takes a parsed [`Html`]; callers
//! parse, extract owned values, and drop the document before awaiting.

use std::collections::HashSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use storysync_shared::{FieldStrategy, ListingOrder, Result, SourceProfile, StorySyncError};

/// Elements considered when looking for a labeled field.
const LABEL_CONTAINERS: &str = "p, li, dd, dt, td, span, div";

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum CompiledStrategy {
    Text(Selector),
    Attr(Selector, Vec<String>),
    Meta(Selector),
    LabeledLink(String),
}

impl CompiledStrategy {
    fn compile(strategy: &FieldStrategy) -> Result<Self> {
        Ok(match strategy {
            FieldStrategy::Text { selector } => Self::Text(selector_from(selector)?),
            FieldStrategy::Attr { selector, attrs } => {
                Self::Attr(selector_from(selector)?, attrs.clone())
            }
            FieldStrategy::Meta { name } => Self::Meta(selector_from(&format!(
                r#"meta[property="{name}"], meta[name="{name}"]"#
            ))?),
            FieldStrategy::LabeledLink { label } => Self::LabeledLink(label.clone()),
        })
    }

    fn resolve(&self, doc: &Html) -> Option<String> {
        let value = match self {
            Self::Text(sel) => doc.select(sel).next().map(element_text),
            Self::Attr(sel, attrs) => doc.select(sel).next().and_then(|el| {
                attrs
                    .iter()
                    .filter_map(|a| el.value().attr(a))
                    .map(str::trim)
                    .find(|v| !v.is_empty())
                    .map(String::from)
            }),
            Self::Meta(sel) => doc
                .select(sel)
                .next()
                .and_then(|el| el.value().attr("content"))
                .map(|v| v.trim().to_string()),
            Self::LabeledLink(label) => labeled_value(doc, label),
        };
        value.filter(|v| !v.is_empty())
    }
}

/// Collapse whitespace in an element's text.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Smallest container whose text mentions `label`; prefer its first link's
/// text, else whatever follows the label.
fn labeled_value(doc: &Html, label: &str) -> Option<String> {
    let containers = Selector::parse(LABEL_CONTAINERS).ok()?;
    let anchors = Selector::parse("a").ok()?;

    let mut blocks: Vec<(String, ElementRef<'_>)> = doc
        .select(&containers)
        .map(|el| (element_text(el), el))
        .filter(|(text, _)| text.contains(label))
        .collect();
    // A bare `<span>Label:</span>` yields nothing; widen until something does.
    blocks.sort_by_key(|(text, _)| text.len());

    blocks.into_iter().find_map(|(text, el)| {
        if let Some(link) = el.select(&anchors).map(element_text).find(|t| !t.is_empty()) {
            return Some(link);
        }
        let (_, rest) = text.split_once(label)?;
        let rest = rest.trim_start_matches([':', ' ', '-']).trim();
        (!rest.is_empty()).then(|| rest.to_string())
    })
}

fn selector_from(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| StorySyncError::config(format!("invalid selector `{css}`: {e}")))
}

fn selectors_from(list: &[String]) -> Result<Vec<Selector>> {
    list.iter().map(|s| selector_from(s)).collect()
}

fn regex_from(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| StorySyncError::config(format!("invalid pattern `{pattern}`: {e}")))
}

// ---------------------------------------------------------------------------
// CompiledProfile
// ---------------------------------------------------------------------------

/// A unit anchor found on an entry page, in page order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLink {
    pub name: String,
    pub url: Url,
}

/// [`SourceProfile`] with every selector and pattern compiled once.
#[derive(Debug)]
pub struct CompiledProfile {
    entry_anchors: Vec<Selector>,
    entry_path: Regex,
    title: Vec<CompiledStrategy>,
    author: Vec<CompiledStrategy>,
    description: Vec<CompiledStrategy>,
    thumbnail: Vec<CompiledStrategy>,
    latest_unit: Vec<CompiledStrategy>,
    unit_links: Vec<Selector>,
    unit_path: Regex,
    all_links: Selector,
    images: Vec<Selector>,
    asset_attrs: Vec<String>,
    asset_blacklist: Vec<String>,
    listing_order: ListingOrder,
    unit_url_template: String,
    unit_name_template: String,
}

impl CompiledProfile {
    /// Compile the profile. Any bad selector or regex is a config error.
    pub fn compile(profile: &SourceProfile) -> Result<Self> {
        let strategies = |list: &[FieldStrategy]| -> Result<Vec<CompiledStrategy>> {
            list.iter().map(CompiledStrategy::compile).collect()
        };

        if !profile.unit_url_template.contains("{n}") {
            return Err(StorySyncError::config(
                "profile.unit_url_template must contain {n}",
            ));
        }

        Ok(Self {
            entry_anchors: selectors_from(&profile.entry_anchor_selectors)?,
            entry_path: regex_from(&profile.entry_path_pattern)?,
            title: strategies(&profile.title)?,
            author: strategies(&profile.author)?,
            description: strategies(&profile.description)?,
            thumbnail: strategies(&profile.thumbnail)?,
            latest_unit: strategies(&profile.latest_unit)?,
            unit_links: selectors_from(&profile.unit_link_selectors)?,
            unit_path: regex_from(&profile.unit_path_pattern)?,
            all_links: selector_from("a[href]")?,
            images: selectors_from(&profile.asset_selectors)?,
            asset_attrs: profile.asset_attrs.clone(),
            asset_blacklist: profile
                .asset_blacklist
                .iter()
                .map(|b| b.trim_matches('/').to_lowercase())
                .filter(|b| !b.is_empty())
                .collect(),
            listing_order: profile.unit_listing_order,
            unit_url_template: profile.unit_url_template.clone(),
            unit_name_template: profile.unit_name_template.clone(),
        })
    }

    pub fn listing_order(&self) -> ListingOrder {
        self.listing_order
    }

    // -- descriptor fields --------------------------------------------------

    pub fn title(&self, doc: &Html) -> Option<String> {
        first_resolved(&self.title, doc)
    }

    pub fn author(&self, doc: &Html) -> Option<String> {
        first_resolved(&self.author, doc)
    }

    pub fn description(&self, doc: &Html) -> Option<String> {
        first_resolved(&self.description, doc)
    }

    /// Thumbnail resolved to an absolute URL against `base`.
    pub fn thumbnail(&self, doc: &Html, base: &Url) -> Option<String> {
        self.thumbnail
            .iter()
            .filter_map(|s| s.resolve(doc))
            .find_map(|raw| absolute_http(base, &raw))
            .map(String::from)
    }

    /// Highest unit number the page advertises, if any strategy finds one.
    pub fn latest_unit_hint(&self, doc: &Html) -> Option<u32> {
        self.latest_unit
            .iter()
            .filter_map(|s| s.resolve(doc))
            .find_map(|text| last_number(&text))
    }

    // -- listing pages ------------------------------------------------------

    /// Entry anchors on a listing page, normalized, in page order.
    ///
    /// Selectors are tried in priority order and the first one that yields
    /// anything wins; with no selector hits, every link whose path matches
    /// the entry pattern is taken instead.
    pub fn entry_links(&self, doc: &Html, base: &Url) -> Vec<Url> {
        for sel in &self.entry_anchors {
            let found = collect_hrefs(doc, sel, base, |_| true);
            if !found.is_empty() {
                return dedup_urls(found.into_iter().map(|(_, u)| normalize_entry_url(u)));
            }
        }

        let found = collect_hrefs(doc, &self.all_links, base, |u| {
            self.entry_path.is_match(u.path())
        });
        dedup_urls(found.into_iter().map(|(_, u)| normalize_entry_url(u)))
    }

    // -- entry pages --------------------------------------------------------

    /// Unit anchors on an entry page, in page order, deduplicated by URL.
    pub fn unit_links(&self, doc: &Html, base: &Url) -> Vec<UnitLink> {
        let is_unit = |u: &Url| self.unit_path.is_match(u.path());

        let mut found = Vec::new();
        for sel in &self.unit_links {
            found = collect_hrefs(doc, sel, base, is_unit);
            if !found.is_empty() {
                break;
            }
        }
        if found.is_empty() {
            found = collect_hrefs(doc, &self.all_links, base, is_unit);
        }

        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter(|(_, url)| seen.insert(url.as_str().to_string()))
            .map(|(name, url)| UnitLink { name, url })
            .collect()
    }

    // -- unit pages ---------------------------------------------------------

    /// Ordered, deduplicated asset URLs from a unit page.
    ///
    /// Selectors are tried in priority order; the first selector that yields
    /// at least one acceptable asset wins.
    pub fn assets(&self, doc: &Html, base: &Url) -> Vec<String> {
        for sel in &self.images {
            let mut seen = HashSet::new();
            let assets: Vec<String> = doc
                .select(sel)
                .filter_map(|img| {
                    self.asset_attrs
                        .iter()
                        .filter_map(|a| img.value().attr(a))
                        .find_map(|raw| absolute_http(base, raw))
                })
                .map(String::from)
                .filter(|url| !self.is_blacklisted(url))
                .filter(|url| seen.insert(url.clone()))
                .collect();
            if !assets.is_empty() {
                return assets;
            }
        }
        Vec::new()
    }

    /// Blacklist entries match whole words of the URL path (`logo`, `icons`),
    /// never fragments of a longer word such as a slug.
    fn is_blacklisted(&self, url: &str) -> bool {
        let path = Url::parse(url)
            .map(|u| u.path().to_lowercase())
            .unwrap_or_else(|_| url.to_lowercase());
        path.split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .any(|word| {
                self.asset_blacklist.iter().any(|b| {
                    word == b || word.strip_suffix('s').is_some_and(|stem| stem == b)
                })
            })
    }

    // -- synthesized units --------------------------------------------------

    /// Candidate URL for unit `n` of the entry at `entry_url` with slug `slug`.
    pub fn synthesized_unit_url(&self, entry_url: &Url, slug: &str, n: u32) -> Result<Url> {
        let entry = entry_url.as_str().trim_end_matches('/');
        let raw = self
            .unit_url_template
            .replace("{entry}", entry)
            .replace("{slug}", slug)
            .replace("{n}", &n.to_string());
        entry_url
            .join(&raw)
            .map_err(|e| StorySyncError::validation(format!("bad unit URL `{raw}`: {e}")))
    }

    pub fn synthesized_unit_name(&self, n: u32) -> String {
        self.unit_name_template.replace("{n}", &n.to_string())
    }
}

fn first_resolved(strategies: &[CompiledStrategy], doc: &Html) -> Option<String> {
    strategies.iter().find_map(|s| s.resolve(doc))
}

/// `(text, absolute url)` for every `href` under `sel` that passes `keep`.
fn collect_hrefs(
    doc: &Html,
    sel: &Selector,
    base: &Url,
    keep: impl Fn(&Url) -> bool,
) -> Vec<(String, Url)> {
    doc.select(sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?.trim();
            if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
                return None;
            }
            let mut url = absolute_http(base, href)?;
            url.set_fragment(None);
            keep(&url).then(|| (element_text(el), url))
        })
        .collect()
}

fn dedup_urls(urls: impl Iterator<Item = Url>) -> Vec<Url> {
    let mut seen = HashSet::new();
    urls.filter(|u| seen.insert(u.as_str().to_string())).collect()
}

/// Resolve `raw` against `base`, keeping only http(s) results.
fn absolute_http(base: &Url, raw: &str) -> Option<Url> {
    let url = base.join(raw.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Strip fragment, query, and trailing slash so one entry has one URL.
pub fn normalize_entry_url(mut url: Url) -> Url {
    url.set_fragment(None);
    url.set_query(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url
}

fn last_number(text: &str) -> Option<u32> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .last()
        .and_then(|s| s.parse().ok())
}
