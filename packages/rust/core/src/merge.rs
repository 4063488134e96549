//! Merging a fetched unit batch into an entity record.
//!
//! Pure and synchronous; the [`Store`](crate::Store) provides atomicity by
//! running it under the entity's slot lock.

use std::collections::HashSet;

use storysync_shared::{EntityDescriptor, EntityRecord, EnumerationStrategy, Unit};

/// Result of one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub record: EntityRecord,
    /// Ordinals of the units that were inserted, ascending.
    pub added: Vec<u32>,
    /// Incoming units already present under the identity key.
    pub already_present: usize,
    /// Incoming units refused because they would break the ordinal/name
    /// uniqueness invariant under a different key, ascending.
    pub conflicts: Vec<Unit>,
    /// Whether the record differs from `existing`.
    pub changed: bool,
}

/// Merge `batch` into `existing` (or a fresh record built from `descriptor`).
///
/// The identity key is the normalized name for explicit listings and the
/// ordinal for synthesized ones. A unit whose key is already present is
/// skipped; a unit that would duplicate another unit's ordinal or normalized
/// name is refused. Accepted units are inserted at their ordinal position,
/// so the record stays strictly ascending. Re-applying the same batch adds
/// nothing.
pub fn merge(
    existing: Option<&EntityRecord>,
    descriptor: &EntityDescriptor,
    batch: &[Unit],
    strategy: EnumerationStrategy,
) -> MergeOutcome {
    let mut record = match existing {
        Some(current) => {
            let mut record = current.clone();
            record.descriptor.refresh(descriptor);
            record
        }
        None => EntityRecord::new(descriptor.clone()),
    };

    let mut ordinals: HashSet<u32> = record.units.iter().map(|u| u.ordinal).collect();
    let mut names: HashSet<String> = record.units.iter().map(Unit::normalized_name).collect();

    let mut incoming: Vec<&Unit> = batch.iter().filter(|u| !u.asset_urls.is_empty()).collect();
    incoming.sort_by_key(|u| u.ordinal);

    let mut added = Vec::new();
    let mut already_present = 0;
    let mut conflicts = Vec::new();

    for unit in incoming {
        let name = unit.normalized_name();
        let key_present = match strategy {
            EnumerationStrategy::ExplicitLinks => names.contains(&name),
            EnumerationStrategy::SynthesizedNumeric => ordinals.contains(&unit.ordinal),
        };
        if key_present {
            already_present += 1;
            continue;
        }
        if unit.ordinal == 0 || ordinals.contains(&unit.ordinal) || names.contains(&name) {
            conflicts.push(unit.clone());
            continue;
        }

        let pos = record
            .units
            .binary_search_by_key(&unit.ordinal, |u| u.ordinal)
            .unwrap_or_else(|pos| pos);
        record.units.insert(pos, unit.clone());
        ordinals.insert(unit.ordinal);
        names.insert(name);
        added.push(unit.ordinal);
    }

    let changed = match existing {
        Some(current) => *current != record,
        None => true,
    };

    MergeOutcome {
        record,
        added,
        already_present,
        conflicts,
        changed,
    }
}
