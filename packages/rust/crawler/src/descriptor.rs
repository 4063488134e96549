//! Entry page inspection: descriptor extraction and unit listing detection.

use std::sync::Arc;

use scraper::Html;
use tracing::{debug, instrument};
use url::Url;

use storysync_shared::{
    EntityDescriptor, EntityId, EnumerationStrategy, Result, StorySyncError, UNKNOWN,
};

use crate::http::PageFetcher;
use crate::profile::{CompiledProfile, UnitLink};

/// What an entry page exposes about its units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitListing {
    /// Unit anchors in page order.
    Explicit(Vec<UnitLink>),
    /// No anchors; only an (untrusted) ceiling hint, if any.
    Synthesized { ceiling_hint: Option<u32> },
}

impl UnitListing {
    /// Strategy selection is a pure function of the page: anchors win.
    pub fn strategy(&self) -> EnumerationStrategy {
        match self {
            Self::Explicit(_) => EnumerationStrategy::ExplicitLinks,
            Self::Synthesized { .. } => EnumerationStrategy::SynthesizedNumeric,
        }
    }
}

/// Everything extracted from one entry page.
#[derive(Debug, Clone)]
pub struct EntryPage {
    pub ref_url: Url,
    pub descriptor: EntityDescriptor,
    pub listing: UnitListing,
}

/// Extract the descriptor and unit listing from an entry page body.
///
/// The id comes from the URL slug. A missing title is a structure error;
/// the other fields fall back to [`UNKNOWN`] or an empty string.
pub fn inspect_entry(html: &str, ref_url: &Url, profile: &CompiledProfile) -> Result<EntryPage> {
    let id = EntityId::from_ref_url(ref_url)?;
    let doc = Html::parse_document(html);

    let title = profile
        .title(&doc)
        .ok_or_else(|| StorySyncError::structure(ref_url.as_str(), "no title found"))?;

    let descriptor = EntityDescriptor {
        id,
        title,
        author: profile.author(&doc).unwrap_or_else(|| UNKNOWN.into()),
        description: profile.description(&doc).unwrap_or_default(),
        thumbnail_url: profile.thumbnail(&doc, ref_url).unwrap_or_default(),
    };

    let links = profile.unit_links(&doc, ref_url);
    let listing = if links.is_empty() {
        UnitListing::Synthesized {
            ceiling_hint: profile.latest_unit_hint(&doc),
        }
    } else {
        UnitListing::Explicit(links)
    };

    Ok(EntryPage {
        ref_url: ref_url.clone(),
        descriptor,
        listing,
    })
}

/// Fetches entry pages and inspects them.
#[derive(Clone)]
pub struct DescriptorExtractor {
    fetcher: PageFetcher,
    profile: Arc<CompiledProfile>,
}

impl DescriptorExtractor {
    pub fn new(fetcher: PageFetcher, profile: Arc<CompiledProfile>) -> Self {
        Self { fetcher, profile }
    }

    /// Fetch and inspect one entry. Any error means the entry is skipped this run.
    #[instrument(skip_all, fields(url = %ref_url))]
    pub async fn extract(&self, ref_url: &Url) -> Result<EntryPage> {
        let body = self.fetcher.get(ref_url).await?;
        let page = inspect_entry(&body, ref_url, &self.profile)?;
        debug!(
            entity_id = %page.descriptor.id,
            strategy = page.listing.strategy().as_str(),
            "entry inspected"
        );
        Ok(page)
    }
}
