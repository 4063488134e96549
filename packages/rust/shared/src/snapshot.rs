//! Serialized form of the store (`stories.json`).
//!
//! Wire shape per record: `id, title, author, description, thumbnail,
//! units: [{ordinal, name, images}]`. Older files written without `ordinal`,
//! with `slug` instead of `id`, or with `chapters` instead of `units` still
//! load; missing ordinals are assigned by position.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StorySyncError};
use crate::types::{EntityDescriptor, EntityId, EntityRecord, UNKNOWN, Unit};

/// An ordered collection of entity records at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub records: Vec<EntityRecord>,
}

impl Snapshot {
    pub fn new(records: Vec<EntityRecord>) -> Self {
        Self { records }
    }

    /// Parse a snapshot file body.
    pub fn from_json(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(body)
            .map_err(|e| StorySyncError::validation(format!("malformed snapshot: {e}")))
    }

    /// Pretty-printed JSON, the exact bytes written to disk and published.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StorySyncError::validation(format!("failed to serialize snapshot: {e}")))
    }

    /// SHA-256 of the serialized snapshot, hex-encoded.
    pub fn content_hash(&self) -> Result<String> {
        let json = self.to_json()?;
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn unit_count(&self) -> usize {
        self.records.iter().map(|r| r.units.len()).sum()
    }

    /// Load a snapshot file. A missing file is an empty snapshot.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(body) => Self::from_json(&body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StorySyncError::io(path, e)),
        }
    }

    /// Write the snapshot via a sibling temp file and a rename, so readers
    /// see either the old file or the new one.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorySyncError::io(parent, e))?;
        }

        let mut tmp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot.json".into());
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        std::fs::write(&tmp, json.as_bytes()).map_err(|e| StorySyncError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorySyncError::io(path, e))
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordWire {
    #[serde(alias = "slug")]
    id: EntityId,
    title: String,
    #[serde(default = "unknown_author")]
    author: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    thumbnail: String,
    #[serde(default, alias = "chapters")]
    units: Vec<UnitWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnitWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ordinal: Option<u32>,
    name: String,
    #[serde(default)]
    images: Vec<String>,
}

fn unknown_author() -> String {
    UNKNOWN.into()
}

impl Serialize for EntityRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire = RecordWire {
            id: self.descriptor.id.clone(),
            title: self.descriptor.title.clone(),
            author: self.descriptor.author.clone(),
            description: self.descriptor.description.clone(),
            thumbnail: self.descriptor.thumbnail_url.clone(),
            units: self
                .units
                .iter()
                .map(|u| UnitWire {
                    ordinal: Some(u.ordinal),
                    name: u.name.clone(),
                    images: u.asset_urls.clone(),
                })
                .collect(),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EntityRecord {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = RecordWire::deserialize(deserializer)?;
        Ok(record_from_wire(wire))
    }
}

/// Rebuild a record, assigning positional ordinals where missing and
/// dropping anything that would break the ordering/uniqueness invariant.
fn record_from_wire(wire: RecordWire) -> EntityRecord {
    let mut previous = 0u32;
    let mut units: Vec<Unit> = wire
        .units
        .into_iter()
        .map(|u| {
            let ordinal = u.ordinal.unwrap_or(previous.saturating_add(1));
            previous = ordinal;
            Unit {
                ordinal,
                name: u.name,
                asset_urls: u.images,
            }
        })
        .collect();

    units.sort_by_key(|u| u.ordinal);

    let mut seen_names = std::collections::HashSet::new();
    let mut last_ordinal = 0u32;
    units.retain(|u| {
        let keep = u.ordinal > last_ordinal && seen_names.insert(u.normalized_name());
        if keep {
            last_ordinal = u.ordinal;
        }
        keep
    });

    EntityRecord {
        descriptor: EntityDescriptor {
            id: wire.id,
            title: wire.title,
            author: wire.author,
            description: wire.description,
            thumbnail_url: wire.thumbnail,
        },
        units,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, units: Vec<Unit>) -> EntityRecord {
        EntityRecord {
            descriptor: EntityDescriptor {
                id: EntityId::new(id),
                title: format!("Title {id}"),
                author: "Author".into(),
                description: "Desc".into(),
                thumbnail_url: "https://cdn.example.com/t.jpg".into(),
            },
            units,
        }
    }

    #[test]
    fn serializes_wire_field_names() {
        let snapshot = Snapshot::new(vec![record(
            "one",
            vec![Unit {
                ordinal: 1,
                name: "Chapter 1".into(),
                asset_urls: vec!["https://cdn.example.com/1.jpg".into()],
            }],
        )]);
        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        let first = &json[0];
        assert_eq!(first["id"], "one");
        assert_eq!(first["thumbnail"], "https://cdn.example.com/t.jpg");
        assert_eq!(first["units"][0]["name"], "Chapter 1");
        assert_eq!(first["units"][0]["images"][0], "https://cdn.example.com/1.jpg");
        assert_eq!(first["units"][0]["ordinal"], 1);
    }

    #[test]
    fn positional_ordinal_after_maximal_value_does_not_overflow() {
        let mixed = format!(
            r#"[{{"id": "edge", "title": "Edge", "units": [
                 {{"name": "Last", "ordinal": {max}, "images": ["a"]}},
                 {{"name": "After", "images": ["b"]}}
               ]}}]"#,
            max = u32::MAX
        );
        let snapshot = Snapshot::from_json(&mixed).unwrap();
        let rec = &snapshot.records[0];
        assert_eq!(rec.units.len(), 1);
        assert_eq!(rec.units[0].ordinal, u32::MAX);
        assert!(rec.is_well_formed());
    }

    #[test]
    fn loads_legacy_snapshot_without_ordinals() {
        let legacy = r#"[
          {"slug": "legacy", "title": "Legacy", "author": "A", "description": "",
           "thumbnail": "", "last_chapter_scraped": 2,
           "chapters": [
             {"name": "Chapter 1", "images": ["a"]},
             {"name": "Chapter 2", "images": ["b"]},
             {"name": "chapter 2", "images": ["dup"]}
           ]}
        ]"#;
        let snapshot = Snapshot::from_json(legacy).unwrap();
        let rec = &snapshot.records[0];
        assert_eq!(rec.id().as_str(), "legacy");
        let ordinals: Vec<u32> = rec.units.iter().map(|u| u.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert!(rec.is_well_formed());
    }

    #[test]
    fn empty_body_is_empty_snapshot() {
        assert!(Snapshot::from_json("  \n").unwrap().records.is_empty());
    }

    #[test]
    fn content_hash_tracks_changes() {
        let a = Snapshot::new(vec![record("a", vec![])]);
        let b = Snapshot::new(vec![record("b", vec![])]);
        assert_eq!(a.content_hash().unwrap().len(), 64);
        assert_eq!(a.content_hash().unwrap(), a.clone().content_hash().unwrap());
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn write_atomic_then_load() {
        let dir = std::env::temp_dir().join(format!("storysync_snap_{}", std::process::id()));
        let path = dir.join("nested").join("stories.json");
        assert!(Snapshot::load(&path).unwrap().records.is_empty());

        let snapshot = Snapshot::new(vec![record("a", vec![])]);
        snapshot.write_atomic(&path).unwrap();
        assert_eq!(Snapshot::load(&path).unwrap(), snapshot);
        assert!(!path.with_file_name("stories.json.tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
