use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::graph::indices::LabelPropertyKey;
use crate::types::{Gid, PropertyValue, Timestamp};

// Entries and catalog records live in separate column families.
const CF_LABEL_PROPERTY_INDEX: &str = "label_property_index";
const CF_LABEL_PROPERTY_INDEX_CATALOG: &str = "label_property_index_catalog";

/// One stored index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub gid: Gid,
    pub commit_timestamp: Timestamp,
    pub values: Vec<PropertyValue>,
}

/// Outcome of pruning one vertex's entries in one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pruned {
    pub deleted: usize,
    /// Entries of the vertex the delete leaves behind.
    pub remaining: usize,
}

/// RocksDB-based storage for the disk label-property index.
///
/// Entry keys are `label | n | property * n | gid | commit_ts`, all
/// integers big-endian so an index's entries sort by gid, then by commit
/// timestamp. The value is the bincode-encoded list of indexed values.
#[derive(Debug)]
pub struct RocksBackend {
    db: Arc<DB>, // Shared by every thread touching the index.
}

impl RocksBackend {
    /// Create a new or open an existing RocksDB database with optimized settings.
    pub fn new(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.increase_parallelism(num_cpus::get() as i32); // Use all available CPU cores

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_LABEL_PROPERTY_INDEX, Options::default()),
            ColumnFamilyDescriptor::new(CF_LABEL_PROPERTY_INDEX_CATALOG, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Catalog(format!("missing column family {}", name)))
    }

    pub fn index_prefix(key: &LabelPropertyKey) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(9 + key.properties.len() * 8);
        prefix.extend_from_slice(&key.label.as_u64().to_be_bytes());
        // `LabelPropertyKey::validate` caps the count at MAX_INDEX_PROPERTIES.
        prefix.push(key.properties.len() as u8);
        for property in &key.properties {
            prefix.extend_from_slice(&property.as_u64().to_be_bytes());
        }
        prefix
    }

    fn vertex_prefix(key: &LabelPropertyKey, gid: Gid) -> Vec<u8> {
        let mut prefix = Self::index_prefix(key);
        prefix.extend_from_slice(&gid.as_u64().to_be_bytes());
        prefix
    }

    fn entry_key(key: &LabelPropertyKey, gid: Gid, commit_timestamp: Timestamp) -> Vec<u8> {
        let mut bytes = Self::vertex_prefix(key, gid);
        bytes.extend_from_slice(&commit_timestamp.to_be_bytes());
        bytes
    }

    fn decode_suffix(prefix_len: usize, key: &[u8]) -> Result<(Gid, Timestamp)> {
        let suffix = key
            .get(prefix_len..prefix_len + 16)
            .ok_or_else(|| StorageError::Catalog(format!("malformed index key of {} bytes", key.len())))?;
        let mut gid = [0u8; 8];
        let mut timestamp = [0u8; 8];
        gid.copy_from_slice(&suffix[..8]);
        timestamp.copy_from_slice(&suffix[8..]);
        Ok((Gid(u64::from_be_bytes(gid)), u64::from_be_bytes(timestamp)))
    }

    /// Adds a `put` of one entry to `batch`.
    pub fn put_entry(
        &self,
        batch: &mut WriteBatch,
        key: &LabelPropertyKey,
        gid: Gid,
        commit_timestamp: Timestamp,
        values: &[PropertyValue],
    ) -> Result<()> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX)?;
        let value = bincode::serialize(values)?;
        batch.put_cf(&cf, Self::entry_key(key, gid, commit_timestamp), value);
        Ok(())
    }

    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }

    /// Every entry of one index, sorted by gid then commit timestamp.
    pub fn scan_index(&self, key: &LabelPropertyKey) -> Result<Vec<StoredEntry>> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX)?;
        let prefix = Self::index_prefix(key);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (raw_key, value) = item?;
            // Past the last key of this index.
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let (gid, commit_timestamp) = Self::decode_suffix(prefix.len(), &raw_key)?;
            entries.push(StoredEntry {
                gid,
                commit_timestamp,
                values: bincode::deserialize(&value)?,
            });
        }
        Ok(entries)
    }

    /// Adds deletes for the vertex's entries whose commit timestamp passes `obsolete`.
    pub fn delete_vertex_entries(
        &self,
        batch: &mut WriteBatch,
        key: &LabelPropertyKey,
        gid: Gid,
        obsolete: impl Fn(Timestamp) -> bool,
    ) -> Result<Pruned> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX)?;
        let prefix = Self::vertex_prefix(key, gid);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut pruned = Pruned::default();
        for item in iter {
            let (raw_key, _) = item?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let (_, commit_timestamp) = Self::decode_suffix(prefix.len() - 8, &raw_key)?;
            if obsolete(commit_timestamp) {
                batch.delete_cf(&cf, &raw_key);
                pruned.deleted += 1;
            } else {
                pruned.remaining += 1;
            }
        }
        Ok(pruned)
    }

    /// Whether the vertex has any stored entry in the index. One seek.
    pub fn has_vertex_entries(&self, key: &LabelPropertyKey, gid: Gid) -> Result<bool> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX)?;
        let prefix = Self::vertex_prefix(key, gid);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        match iter.next() {
            Some(item) => Ok(item?.0.starts_with(&prefix)),
            None => Ok(false),
        }
    }

    /// Distinct vertices with stored entries in one index. Reads keys only.
    pub fn count_vertices(&self, key: &LabelPropertyKey) -> Result<u64> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX)?;
        let prefix = Self::index_prefix(key);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut count = 0;
        let mut last = None;
        for item in iter {
            let (raw_key, _) = item?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let (gid, _) = Self::decode_suffix(prefix.len(), &raw_key)?;
            if last != Some(gid) {
                count += 1;
                last = Some(gid);
            }
        }
        Ok(count)
    }

    /// Adds deletes for every entry of one index.
    pub fn delete_index_entries(&self, batch: &mut WriteBatch, key: &LabelPropertyKey) -> Result<()> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX)?;
        let prefix = Self::index_prefix(key);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (raw_key, _) = item?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf, &raw_key);
        }
        Ok(())
    }

    pub fn put_catalog_entry(&self, batch: &mut WriteBatch, key: &LabelPropertyKey) -> Result<()> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX_CATALOG)?;
        batch.put_cf(&cf, Self::index_prefix(key), bincode::serialize(key)?);
        Ok(())
    }

    pub fn delete_catalog_entry(&self, batch: &mut WriteBatch, key: &LabelPropertyKey) -> Result<()> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX_CATALOG)?;
        batch.delete_cf(&cf, Self::index_prefix(key));
        Ok(())
    }

    /// The persisted index catalog.
    pub fn load_catalog(&self) -> Result<Vec<LabelPropertyKey>> {
        let cf = self.cf(CF_LABEL_PROPERTY_INDEX_CATALOG)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            keys.push(bincode::deserialize(&value)?);
        }
        Ok(keys)
    }

    /// Deletes every entry and catalog record.
    pub fn clear(&self) -> Result<()> {
        let mut batch = WriteBatch::default();
        for name in [CF_LABEL_PROPERTY_INDEX, CF_LABEL_PROPERTY_INDEX_CATALOG] {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (raw_key, _) = item?;
                batch.delete_cf(&cf, &raw_key);
            }
        }
        self.write(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LabelId, PropertyId};
    use tempfile::tempdir;

    #[test]
    fn test_entries_are_scoped_to_their_index() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend::new(dir.path()).unwrap();
        let age = LabelPropertyKey::new(LabelId(1), vec![PropertyId(2)]);
        let name = LabelPropertyKey::new(LabelId(1), vec![PropertyId(3)]);

        let mut batch = WriteBatch::default();
        backend.put_entry(&mut batch, &age, Gid(7), 4, &[PropertyValue::Int(30)]).unwrap();
        backend.put_entry(&mut batch, &age, Gid(7), 9, &[PropertyValue::Int(31)]).unwrap();
        backend.put_entry(&mut batch, &name, Gid(7), 4, &[PropertyValue::from("ann")]).unwrap();
        backend.put_catalog_entry(&mut batch, &age).unwrap();
        backend.write(batch).unwrap();

        let entries = backend.scan_index(&age).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].commit_timestamp, 4);
        assert_eq!(entries[1].values, vec![PropertyValue::Int(31)]);
        assert_eq!(backend.load_catalog().unwrap(), vec![age.clone()]);

        let mut batch = WriteBatch::default();
        let pruned = backend.delete_vertex_entries(&mut batch, &age, Gid(7), |ts| ts < 9).unwrap();
        backend.write(batch).unwrap();
        assert_eq!(pruned, Pruned { deleted: 1, remaining: 1 });
        assert_eq!(backend.scan_index(&age).unwrap().len(), 1);
        assert_eq!(backend.scan_index(&name).unwrap().len(), 1);
    }

    #[test]
    fn test_vertex_presence_and_counts() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend::new(dir.path()).unwrap();
        let age = LabelPropertyKey::new(LabelId(1), vec![PropertyId(2)]);
        let wider = LabelPropertyKey::new(LabelId(1), vec![PropertyId(2), PropertyId(3)]);

        let mut batch = WriteBatch::default();
        backend.put_entry(&mut batch, &age, Gid(1), 4, &[PropertyValue::Int(30)]).unwrap();
        backend.put_entry(&mut batch, &age, Gid(1), 6, &[PropertyValue::Int(31)]).unwrap();
        backend.put_entry(&mut batch, &age, Gid(2), 4, &[PropertyValue::Int(30)]).unwrap();
        backend
            .put_entry(&mut batch, &wider, Gid(3), 4, &[PropertyValue::Int(30), PropertyValue::Null])
            .unwrap();
        backend.write(batch).unwrap();

        assert_eq!(backend.count_vertices(&age).unwrap(), 2);
        assert_eq!(backend.count_vertices(&wider).unwrap(), 1);
        assert!(backend.has_vertex_entries(&age, Gid(2)).unwrap());
        assert!(!backend.has_vertex_entries(&age, Gid(3)).unwrap());

        let mut batch = WriteBatch::default();
        let pruned = backend.delete_vertex_entries(&mut batch, &age, Gid(2), |_| true).unwrap();
        backend.write(batch).unwrap();
        assert_eq!(pruned, Pruned { deleted: 1, remaining: 0 });
        assert!(!backend.has_vertex_entries(&age, Gid(2)).unwrap());
        assert_eq!(backend.count_vertices(&age).unwrap(), 1);
    }
}
