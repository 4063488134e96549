//! Catalog discovery: paginated listing pages → entry reference URLs.
//!
//! Listing templates are scanned page by page. Each page's entry anchors are
//! extracted through the source profile; scanning a template stops at the
//! first page that contributes nothing new, or once the result cap is hit.

use std::collections::HashSet;
use std::sync::Arc;

use scraper::Html;
use tracing::{debug, info, instrument, warn};
use url::Url;

use storysync_crawler::{CompiledProfile, PageFetcher, normalize_entry_url};
use storysync_shared::{CatalogEntry, Result, StorySyncError, SyncConfig};

/// Placeholder replaced by the page number in listing templates.
const PAGE_PLACEHOLDER: &str = "{page}";

// ---------------------------------------------------------------------------
// Discovery options
// ---------------------------------------------------------------------------

/// Configuration for one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Listing URL templates, scanned in order.
    pub listing_templates: Vec<String>,
    /// First page number substituted for `{page}`.
    pub first_page: u32,
    /// Pages scanned per template at most.
    pub max_listing_pages: u32,
    /// Stop once this many entries are known.
    pub max_entries: Option<usize>,
    /// Entries placed ahead of everything discovered.
    pub priority_entries: Vec<String>,
    /// Base for relative priority entries.
    pub base_url: Option<String>,
}

impl From<&SyncConfig> for DiscoveryOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            listing_templates: config.listing_templates.clone(),
            first_page: config.first_page,
            max_listing_pages: config.max_listing_pages,
            max_entries: config.max_catalog_entries,
            priority_entries: config.priority_entries.clone(),
            base_url: config.base_url.clone(),
        }
    }
}

/// Summary of a discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub priority_entries: usize,
}

// ---------------------------------------------------------------------------
// CatalogDiscoverer
// ---------------------------------------------------------------------------

/// Enumerates entry references from paginated listings.
pub struct CatalogDiscoverer {
    fetcher: PageFetcher,
    profile: Arc<CompiledProfile>,
    opts: DiscoveryOptions,
}

/// Accumulates entries in first-seen order.
struct Seen {
    entries: Vec<CatalogEntry>,
    keys: HashSet<String>,
    cap: Option<usize>,
}

impl Seen {
    fn new(cap: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            keys: HashSet::new(),
            cap,
        }
    }

    fn full(&self) -> bool {
        self.cap.is_some_and(|cap| self.entries.len() >= cap)
    }

    /// Insert if unseen and there is room. Returns whether it was new.
    fn insert(&mut self, url: Url) -> bool {
        if self.full() || !self.keys.insert(url.as_str().to_string()) {
            return false;
        }
        self.entries.push(CatalogEntry { ref_url: url });
        true
    }
}

impl CatalogDiscoverer {
    pub fn new(fetcher: PageFetcher, profile: Arc<CompiledProfile>, opts: DiscoveryOptions) -> Self {
        Self {
            fetcher,
            profile,
            opts,
        }
    }

    /// Run discovery. Priority entries come first, then listing results,
    /// deduplicated by normalized URL.
    ///
    /// Page failures are logged and skipped; discovery itself only fails on
    /// an unparseable priority entry or template.
    #[instrument(skip_all, fields(templates = self.opts.listing_templates.len()))]
    pub async fn discover(&self) -> Result<(Vec<CatalogEntry>, DiscoveryStats)> {
        let mut seen = Seen::new(self.opts.max_entries);
        let mut stats = DiscoveryStats::default();

        for raw in &self.opts.priority_entries {
            let url = self.resolve_priority(raw)?;
            if seen.insert(normalize_entry_url(url)) {
                stats.priority_entries += 1;
            }
        }

        'templates: for template in &self.opts.listing_templates {
            let paged = template.contains(PAGE_PLACEHOLDER);
            let pages = if paged { self.opts.max_listing_pages } else { 1 };

            for offset in 0..pages {
                if seen.full() {
                    break 'templates;
                }
                let page = self.opts.first_page.saturating_add(offset);
                let url = listing_url(template, page)?;

                let body = match self.fetcher.get(&url).await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(%url, error = %e, "listing page failed, skipping");
                        stats.pages_failed += 1;
                        continue;
                    }
                };
                stats.pages_fetched += 1;

                let links = {
                    let doc = Html::parse_document(&body);
                    self.profile.entry_links(&doc, &url)
                };
                let found = links.len();
                let fresh = links.into_iter().filter(|u| seen.insert(u.clone())).count();
                debug!(%url, page, found, fresh, "listing page scanned");

                if fresh == 0 {
                    debug!(%url, "no new entries, end of template");
                    break;
                }
            }
        }

        info!(
            entries = seen.entries.len(),
            pages_fetched = stats.pages_fetched,
            pages_failed = stats.pages_failed,
            "catalog discovery finished"
        );
        Ok((seen.entries, stats))
    }

    fn resolve_priority(&self, raw: &str) -> Result<Url> {
        let raw = raw.trim();
        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.opts.base_url.as_deref().ok_or_else(|| {
                    StorySyncError::config(format!(
                        "relative priority entry `{raw}` needs [source] base_url"
                    ))
                })?;
                Url::parse(base)
                    .and_then(|b| b.join(raw))
                    .map_err(|e| StorySyncError::config(format!("bad priority entry `{raw}`: {e}")))
            }
            Err(e) => Err(StorySyncError::config(format!(
                "bad priority entry `{raw}`: {e}"
            ))),
        }
    }
}

/// Substitute `page` into a listing template.
pub fn listing_url(template: &str, page: u32) -> Result<Url> {
    let raw = template.replace(PAGE_PLACEHOLDER, &page.to_string());
    Url::parse(&raw).map_err(|e| StorySyncError::config(format!("bad listing URL `{raw}`: {e}")))
}

/// Read a priority file: one entry URL per line, `#` comments and blanks ignored.
pub fn read_priority_file(path: &std::path::Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| StorySyncError::io(path, e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}
