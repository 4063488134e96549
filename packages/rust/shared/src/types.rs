//! Core domain types: entities, descriptors, units, and persisted records.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StorySyncError};

/// Sentinel for an optional text field no strategy could resolve.
pub const UNKNOWN: &str = "unknown";

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Stable identifier of a cataloged entity, derived from its reference URL slug.
///
/// Never derived from the title, which can collide or change between runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Derive the id from the last non-empty path segment of `ref_url`.
    pub fn from_ref_url(ref_url: &Url) -> Result<Self> {
        let segment = ref_url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .ok_or_else(|| {
                StorySyncError::validation(format!("entry URL has no path slug: {ref_url}"))
            })?;

        let slug = slugify(segment);
        if slug.is_empty() {
            return Err(StorySyncError::validation(format!(
                "entry URL slug is empty after normalization: {ref_url}"
            )));
        }
        Ok(Self(slug))
    }

    /// Wrap an already-normalized id (e.g. read back from storage).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, keep alphanumerics, collapse everything else into single dashes.
pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------------------
// CatalogEntry / EntityDescriptor
// ---------------------------------------------------------------------------

/// One entry reference produced by catalog discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Normalized absolute URL of the entry page.
    pub ref_url: Url,
}

/// Per-entity metadata, re-extracted on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub id: EntityId,
    pub title: String,
    /// [`UNKNOWN`] when unresolved.
    pub author: String,
    /// Empty when unresolved.
    pub description: String,
    /// Empty when unresolved.
    pub thumbnail_url: String,
}

impl EntityDescriptor {
    /// Overwrite fields with freshly extracted values, keeping any field the
    /// fresh extraction failed to resolve.
    pub fn refresh(&mut self, fresh: &EntityDescriptor) {
        if !fresh.title.trim().is_empty() {
            self.title = fresh.title.clone();
        }
        if !fresh.author.is_empty() && fresh.author != UNKNOWN {
            self.author = fresh.author.clone();
        }
        if !fresh.description.is_empty() {
            self.description = fresh.description.clone();
        }
        if !fresh.thumbnail_url.is_empty() {
            self.thumbnail_url = fresh.thumbnail_url.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// How an entity's units were enumerated. Decides the merge identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationStrategy {
    /// Units listed as anchors on the entry page; identity is the normalized name.
    ExplicitLinks,
    /// Units probed by numeric URL template; identity is the ordinal.
    SynthesizedNumeric,
}

impl EnumerationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitLinks => "explicit_links",
            Self::SynthesizedNumeric => "synthesized_numeric",
        }
    }
}

/// A unit reference before its assets are fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRef {
    /// 1-based position, oldest first.
    pub ordinal: u32,
    pub name: String,
    pub url: Url,
}

/// A fetched unit with its ordered asset list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub ordinal: u32,
    pub name: String,
    #[serde(rename = "images")]
    pub asset_urls: Vec<String>,
}

impl Unit {
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

/// Case- and whitespace-insensitive form of a unit name.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// Persisted state of one entity: descriptor plus ordinal-ascending units.
///
/// Invariant: `units` is strictly ascending by ordinal and holds no duplicate
/// ordinal or normalized name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub descriptor: EntityDescriptor,
    pub units: Vec<Unit>,
}

impl EntityRecord {
    pub fn new(descriptor: EntityDescriptor) -> Self {
        Self {
            descriptor,
            units: Vec::new(),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.descriptor.id
    }

    /// Highest ordinal held, or 0 when empty.
    pub fn last_ordinal(&self) -> u32 {
        self.units.last().map(|u| u.ordinal).unwrap_or(0)
    }

    /// Check the ordering and uniqueness invariant.
    pub fn is_well_formed(&self) -> bool {
        let ascending = self.units.windows(2).all(|w| w[0].ordinal < w[1].ordinal);
        let mut names: Vec<String> = self.units.iter().map(Unit::normalized_name).collect();
        names.sort();
        let before = names.len();
        names.dedup();
        ascending && names.len() == before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_from_slug_segment() {
        let url = Url::parse("https://example.com/manga/One-Piece/").unwrap();
        assert_eq!(EntityId::from_ref_url(&url).unwrap().as_str(), "one-piece");

        let url = Url::parse("https://example.com/manga/dao_hai_tac?x=1").unwrap();
        assert_eq!(EntityId::from_ref_url(&url).unwrap().as_str(), "dao-hai-tac");
    }

    #[test]
    fn entity_id_rejects_root() {
        let url = Url::parse("https://example.com/").unwrap();
        assert!(EntityId::from_ref_url(&url).is_err());
    }

    #[test]
    fn entity_id_ignores_title_changes() {
        let url = Url::parse("https://example.com/manga/solo-leveling").unwrap();
        let a = EntityId::from_ref_url(&url).unwrap();
        let b = EntityId::from_ref_url(&url).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_name_collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  Chapter   12 "), "chapter 12");
        assert_eq!(normalize_name("CHAPTER 12"), normalize_name("chapter 12"));
    }

    #[test]
    fn refresh_keeps_previous_fields_on_soft_failure() {
        let id = EntityId::new("abc");
        let mut current = EntityDescriptor {
            id: id.clone(),
            title: "Old Title".into(),
            author: "Oda".into(),
            description: "Pirates.".into(),
            thumbnail_url: "https://cdn.example.com/a.jpg".into(),
        };
        let fresh = EntityDescriptor {
            id,
            title: "New Title".into(),
            author: UNKNOWN.into(),
            description: String::new(),
            thumbnail_url: "https://cdn.example.com/b.jpg".into(),
        };
        current.refresh(&fresh);
        assert_eq!(current.title, "New Title");
        assert_eq!(current.author, "Oda");
        assert_eq!(current.description, "Pirates.");
        assert_eq!(current.thumbnail_url, "https://cdn.example.com/b.jpg");
    }

    #[test]
    fn well_formed_detects_disorder_and_duplicates() {
        let descriptor = EntityDescriptor {
            id: EntityId::new("x"),
            title: "X".into(),
            author: UNKNOWN.into(),
            description: String::new(),
            thumbnail_url: String::new(),
        };
        let unit = |ordinal: u32, name: &str| Unit {
            ordinal,
            name: name.into(),
            asset_urls: vec![],
        };

        let mut record = EntityRecord::new(descriptor);
        record.units = vec![unit(1, "Chapter 1"), unit(2, "Chapter 2")];
        assert!(record.is_well_formed());

        record.units = vec![unit(2, "Chapter 2"), unit(1, "Chapter 1")];
        assert!(!record.is_well_formed());

        record.units = vec![unit(1, "Chapter 1"), unit(2, "chapter  1")];
        assert!(!record.is_well_formed());
    }
}
