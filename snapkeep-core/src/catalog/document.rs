/*!
On-disk shape of the catalog.
*/

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::snapshot::Snapshot;
use crate::{Result, SnapkeepError};

/// Newest catalog document format this build understands
pub const CATALOG_FORMAT_VERSION: u32 = 1;

/// A recorded snapshot plus its insertion sequence number
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub seq: u64,
    pub snapshot: Snapshot,
}

/// The whole catalog as persisted by a document store
///
/// Entries for each instance are kept sorted by `(created_at, seq)`, so two
/// snapshots with the same timestamp stay in insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CatalogDocument {
    pub format_version: u32,
    pub next_seq: u64,
    #[serde(default)]
    pub instances: BTreeMap<String, Vec<CatalogEntry>>,
}

impl Default for CatalogDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogDocument {
    pub fn new() -> Self {
        Self {
            format_version: CATALOG_FORMAT_VERSION,
            next_seq: 1,
            instances: BTreeMap::new(),
        }
    }

    /// Parse a stored document
    ///
    /// Documents written by a newer format version are rejected rather than
    /// silently rewritten.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut document: CatalogDocument = serde_json::from_slice(data)
            .map_err(|e| SnapkeepError::invalid_format(format!("unreadable catalog: {e}")))?;

        if document.format_version > CATALOG_FORMAT_VERSION {
            return Err(SnapkeepError::invalid_format(format!(
                "catalog format version {} is newer than supported version {}",
                document.format_version, CATALOG_FORMAT_VERSION
            )));
        }

        document.instances.retain(|_, entries| !entries.is_empty());
        let mut highest_seq = 0;
        for entries in document.instances.values_mut() {
            entries.sort_by(|a, b| {
                a.snapshot
                    .created_at
                    .cmp(&b.snapshot.created_at)
                    .then(a.seq.cmp(&b.seq))
            });
            if let Some(max) = entries.iter().map(|entry| entry.seq).max() {
                highest_seq = highest_seq.max(max);
            }
        }
        document.next_seq = document.next_seq.max(highest_seq + 1);
        document.format_version = CATALOG_FORMAT_VERSION;

        Ok(document)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Record a snapshot
    ///
    /// Returns `false` when the same snapshot id is already recorded for the
    /// same instance. An id recorded under another instance is rejected.
    pub fn append(&mut self, snapshot: Snapshot) -> Result<bool> {
        snapshot.validate()?;

        if let Some(existing) = self.get(&snapshot.id) {
            if existing.instance_id == snapshot.instance_id {
                return Ok(false);
            }
            return Err(SnapkeepError::validation(format!(
                "snapshot {} is already recorded for instance {}",
                snapshot.id, existing.instance_id
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let entries = self
            .instances
            .entry(snapshot.instance_id.clone())
            .or_default();
        let position = entries.partition_point(|entry| {
            (entry.snapshot.created_at, entry.seq) <= (snapshot.created_at, seq)
        });
        entries.insert(position, CatalogEntry { seq, snapshot });

        Ok(true)
    }

    /// Snapshots of one instance, oldest first
    pub fn list(&self, instance_id: &str) -> Vec<Snapshot> {
        self.instances
            .get(instance_id)
            .map(|entries| entries.iter().map(|entry| entry.snapshot.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, snapshot_id: &str) -> Option<&Snapshot> {
        self.instances
            .values()
            .flatten()
            .map(|entry| &entry.snapshot)
            .find(|snapshot| snapshot.id == snapshot_id)
    }

    /// Remove a snapshot, dropping the instance key once it has no entries
    pub fn remove(&mut self, snapshot_id: &str) -> Option<Snapshot> {
        let (instance_id, position) = self.instances.iter().find_map(|(instance_id, entries)| {
            entries
                .iter()
                .position(|entry| entry.snapshot.id == snapshot_id)
                .map(|position| (instance_id.clone(), position))
        })?;

        let entries = self.instances.get_mut(&instance_id)?;
        let removed = entries.remove(position);
        if entries.is_empty() {
            self.instances.remove(&instance_id);
        }
        Some(removed.snapshot)
    }

    /// Every instance with its snapshots, oldest first
    pub fn all(&self) -> BTreeMap<String, Vec<Snapshot>> {
        self.instances
            .iter()
            .map(|(instance_id, entries)| {
                (
                    instance_id.clone(),
                    entries.iter().map(|entry| entry.snapshot.clone()).collect(),
                )
            })
            .collect()
    }

    /// Total number of recorded snapshots
    pub fn len(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
