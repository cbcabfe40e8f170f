//! Title-keyed embedding index with snapshot persistence.
//!
//! The index maps an event title to its embedding and the IDs of the stored
//! events filed under that title. Lookup is a linear scan, which is fine for
//! the few tens of thousands of titles a mailing-list archive produces.
//!
//! # Snapshot format
//!
//! A JSON object in insertion order:
//!
//! ```json
//! { "Cookie decorating": { "vector": [0.12, -0.03], "eventIds": [4, 9] } }
//! ```
//!
//! Every flush first copies the current snapshot to the backup path, so the
//! backup always lags one flush behind the primary.

use crate::models::EventId;
use crate::{Error, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// One title and the events filed under it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Event title.
    pub key: String,
    /// Embedding of the title at first insertion.
    pub vector: Vec<f32>,
    /// Stored events filed under this title.
    pub event_ids: BTreeSet<EventId>,
}

/// A KNN result.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    /// Title of the neighboring entry.
    pub key: String,
    /// Squared Euclidean distance to the query vector.
    pub distance: f32,
}

/// Where the snapshot and its backup live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    /// Primary snapshot file.
    pub primary: PathBuf,
    /// One-generation backup of the primary.
    pub backup: PathBuf,
}

impl SnapshotPaths {
    /// Uses `<primary>.bak` as the backup path.
    #[must_use]
    pub fn with_default_backup(primary: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        let mut backup = primary.clone().into_os_string();
        backup.push(".bak");
        Self {
            primary,
            backup: PathBuf::from(backup),
        }
    }
}

/// In-memory similarity index.
///
/// Not synchronized. Callers serialize mutations (the deduplication engine
/// holds its exclusion gate around every read-modify-write).
#[derive(Debug, Clone, Default)]
pub struct SimilarityIndex {
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
    dimensions: Option<usize>,
    paths: Option<SnapshotPaths>,
}

impl SimilarityIndex {
    /// Creates an empty index that is never persisted.
    ///
    /// When `dimensions` is set, vectors of any other length are rejected.
    #[must_use]
    pub fn in_memory(dimensions: Option<usize>) -> Self {
        Self {
            dimensions,
            ..Self::default()
        }
    }

    /// Creates an empty index persisted at `paths`.
    ///
    /// Nothing is read until [`load`](Self::load) is called.
    #[must_use]
    pub fn new(paths: SnapshotPaths, dimensions: Option<usize>) -> Self {
        Self {
            dimensions,
            paths: Some(paths),
            ..Self::default()
        }
    }

    /// Creates an index at `paths` and loads it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexLoad`] if neither the snapshot nor its backup loads.
    pub fn open(paths: SnapshotPaths, dimensions: Option<usize>) -> Result<Self> {
        let mut index = Self::new(paths, dimensions);
        index.load()?;
        Ok(index)
    }

    /// Returns the snapshot paths, if persisted.
    #[must_use]
    pub const fn paths(&self) -> Option<&SnapshotPaths> {
        self.paths.as_ref()
    }

    /// Returns the configured vector dimension.
    #[must_use]
    pub const fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Titles in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Total number of event IDs across all entries.
    #[must_use]
    pub fn event_id_count(&self) -> usize {
        self.entries.iter().map(|e| e.event_ids.len()).sum()
    }

    /// Looks up an entry by title.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.positions.get(key).map(|&pos| &self.entries[pos])
    }

    /// Inserts `key`, or unions `event_ids` into the existing entry.
    ///
    /// An existing entry keeps its original vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the vector has the wrong dimension
    /// or contains non-finite values.
    pub fn upsert(
        &mut self,
        key: &str,
        vector: Vec<f32>,
        event_ids: impl IntoIterator<Item = EventId>,
    ) -> Result<()> {
        self.check_vector(&vector)?;

        if let Some(&pos) = self.positions.get(key) {
            self.entries[pos].event_ids.extend(event_ids);
            return Ok(());
        }

        self.positions.insert(key.to_string(), self.entries.len());
        self.entries.push(IndexEntry {
            key: key.to_string(),
            vector,
            event_ids: event_ids.into_iter().collect(),
        });
        Ok(())
    }

    /// Removes `key`. Returns the removed entry.
    pub fn delete(&mut self, key: &str) -> Option<IndexEntry> {
        let pos = self.positions.remove(key)?;
        let entry = self.entries.remove(pos);
        for shifted in &self.entries[pos..] {
            if let Some(p) = self.positions.get_mut(&shifted.key) {
                *p -= 1;
            }
        }
        Some(entry)
    }

    /// Removes `key` if it has no event IDs.
    pub fn delete_if_empty(&mut self, key: &str) -> bool {
        if self.get(key).is_some_and(|e| e.event_ids.is_empty()) {
            self.delete(key);
            return true;
        }
        false
    }

    /// Adds an event ID to an existing entry. Returns false if `key` is absent.
    pub fn add_event_id(&mut self, key: &str, id: EventId) -> bool {
        match self.positions.get(key) {
            Some(&pos) => {
                self.entries[pos].event_ids.insert(id);
                true
            },
            None => false,
        }
    }

    /// Refiles `id` from `from` to `to`, deleting `from` if it empties.
    ///
    /// `to` must exist. Moving within one entry is a no-op.
    pub fn move_event_id(&mut self, id: EventId, from: &str, to: &str) {
        if from == to {
            return;
        }
        if let Some(&pos) = self.positions.get(from) {
            self.entries[pos].event_ids.remove(&id);
            self.delete_if_empty(from);
        }
        self.add_event_id(to, id);
    }

    /// Removes `id` from every entry, deleting entries that empty.
    ///
    /// Returns the titles the ID was removed from.
    pub fn remove_event_id(&mut self, id: EventId) -> Vec<String> {
        let touched: Vec<String> = self
            .entries
            .iter_mut()
            .filter_map(|e| e.event_ids.remove(&id).then(|| e.key.clone()))
            .collect();
        for key in &touched {
            self.delete_if_empty(key);
        }
        touched
    }

    /// Returns the `k` entries closest to `target`, closest first.
    ///
    /// Distance is squared Euclidean. Equal distances keep insertion order.
    #[must_use]
    pub fn knn(&self, target: &[f32], k: usize) -> Vec<Neighbor> {
        let mut neighbors: Vec<Neighbor> = self
            .entries
            .iter()
            .map(|e| Neighbor {
                key: e.key.clone(),
                distance: squared_distance(&e.vector, target),
            })
            .collect();
        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        neighbors.truncate(k);
        neighbors
    }

    /// Checks that `vector` is finite and matches the index's dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the mismatch.
    pub fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if let Some(dimensions) = self.dimensions
            && vector.len() != dimensions
        {
            return Err(Error::InvalidInput(format!(
                "embedding has {} dimensions, index expects {dimensions}",
                vector.len()
            )));
        }
        if let Some(first) = self.entries.first()
            && first.vector.len() != vector.len()
        {
            return Err(Error::InvalidInput(format!(
                "embedding has {} dimensions, index holds {}",
                vector.len(),
                first.vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput(
                "embedding contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    /// Replaces the in-memory state with the snapshot on disk.
    ///
    /// If the primary is missing or unreadable, the backup is copied over it
    /// and loading is retried once. With neither file present the index
    /// starts empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexLoad`] if the retry fails too.
    #[instrument(skip(self), fields(primary = ?self.paths.as_ref().map(|p| &p.primary)))]
    pub fn load(&mut self) -> Result<()> {
        let Some(paths) = self.paths.clone() else {
            return Ok(());
        };

        let first_failure = match self.read_snapshot(&paths.primary) {
            Ok(Some(entries)) => {
                self.install(entries);
                tracing::info!(entries = self.len(), "Loaded similarity index");
                return Ok(());
            },
            Ok(None) => None,
            Err(cause) => Some(cause),
        };

        if !paths.backup.exists() {
            return match first_failure {
                None => {
                    tracing::info!("No similarity snapshot found, starting empty");
                    self.install(Vec::new());
                    Ok(())
                },
                Some(cause) => Err(load_error(&paths.primary, cause)),
            };
        }

        tracing::warn!(
            cause = first_failure.as_deref().unwrap_or("primary snapshot missing"),
            backup = %paths.backup.display(),
            "Restoring similarity index from backup"
        );
        metrics::counter!("index_backup_restore_total").increment(1);

        fs::copy(&paths.backup, &paths.primary)
            .map_err(|e| load_error(&paths.primary, format!("restoring backup: {e}")))?;

        match self.read_snapshot(&paths.primary) {
            Ok(Some(entries)) => {
                self.install(entries);
                tracing::info!(entries = self.len(), "Loaded similarity index from backup");
                Ok(())
            },
            Ok(None) => Err(load_error(&paths.primary, "snapshot vanished during restore")),
            Err(cause) => Err(load_error(&paths.primary, cause)),
        }
    }

    /// Writes the in-memory state, after copying the previous snapshot to the backup.
    ///
    /// A non-persisted index flushes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be written.
    #[instrument(skip(self), fields(entries = self.len()))]
    pub fn flush(&self) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };

        let result = self.write_snapshot(paths);
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("index_flush_total", "status" => status).increment(1);
        result
    }

    fn write_snapshot(&self, paths: &SnapshotPaths) -> Result<()> {
        let content = serde_json::to_string(&SnapshotRef(&self.entries))
            .map_err(|e| Error::operation("serialize_index", e))?;

        if let Some(parent) = paths.primary.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::operation("create_index_dir", e))?;
        }

        if paths.primary.exists() {
            fs::copy(&paths.primary, &paths.backup)
                .map_err(|e| Error::operation("backup_index", e))?;
        }

        fs::write(&paths.primary, content).map_err(|e| Error::operation("write_index", e))
    }

    /// Reads and validates a snapshot. `Ok(None)` means the file does not exist.
    fn read_snapshot(&self, path: &Path) -> std::result::Result<Option<Vec<IndexEntry>>, String> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let OrderedRecords(records) =
            serde_json::from_str(&content).map_err(|e| e.to_string())?;

        let mut seen = HashSet::with_capacity(records.len());
        let mut entries = Vec::with_capacity(records.len());
        let expected = self.dimensions.or_else(|| records.first().map(|(_, r)| r.vector.len()));

        for (key, record) in records {
            if let Some(dimensions) = expected
                && record.vector.len() != dimensions
            {
                return Err(format!(
                    "entry {key:?} has {} dimensions, expected {dimensions}",
                    record.vector.len()
                ));
            }
            if !seen.insert(key.clone()) {
                return Err(format!("duplicate entry {key:?}"));
            }
            if record.event_ids.is_empty() {
                tracing::warn!(key = %key, "Dropping snapshot entry without events");
                continue;
            }
            entries.push(IndexEntry {
                key,
                vector: record.vector,
                event_ids: record.event_ids,
            });
        }

        Ok(Some(entries))
    }

    fn install(&mut self, entries: Vec<IndexEntry>) {
        self.positions = entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.key.clone(), pos))
            .collect();
        self.entries = entries;
    }
}

fn load_error(path: &Path, cause: impl ToString) -> Error {
    Error::IndexLoad {
        path: path.display().to_string(),
        cause: cause.to_string(),
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordRef<'a> {
    vector: &'a [f32],
    event_ids: &'a BTreeSet<EventId>,
}

/// Serializes entries as a JSON object in insertion order.
struct SnapshotRef<'a>(&'a [IndexEntry]);

impl Serialize for SnapshotRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|e| {
            (
                &e.key,
                RecordRef {
                    vector: &e.vector,
                    event_ids: &e.event_ids,
                },
            )
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Record {
    vector: Vec<f32>,
    event_ids: BTreeSet<EventId>,
}

/// Deserializes a JSON object keeping its key order.
struct OrderedRecords(Vec<(String, Record)>);

impl<'de> Deserialize<'de> for OrderedRecords {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RecordsVisitor;

        impl<'de> Visitor<'de> for RecordsVisitor {
            type Value = OrderedRecords;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of title to index entry")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut records = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(record) = map.next_entry::<String, Record>()? {
                    records.push(record);
                }
                Ok(OrderedRecords(records))
            }
        }

        deserializer.deserialize_map(RecordsVisitor)
    }
}
