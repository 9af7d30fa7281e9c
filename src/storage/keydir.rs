//! The keydir: an in-memory map from each live key to the location of its
//! most recent record on disk. It is rebuilt from the datafiles when the
//! database is opened.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::error::Result;

use super::directory::{DatafileId, Directory};

/// The location of a record within a datafile. Locators are immutable; a
/// key's locator is replaced, never mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordLoc {
    /// The id of the datafile holding the record.
    pub id: DatafileId,
    /// The byte offset of the record within the datafile.
    pub pos: u64,
    /// The encoded size of the record in bytes.
    pub sz: u32,
    /// The record's timestamp.
    pub tstamp: u64,
}

/// Maps keys to the location of their most recent record. Deleted keys are
/// absent; their tombstone records remain on disk until merged away.
pub struct KeyDir(HashMap<Vec<u8>, RecordLoc>);

impl KeyDir {
    /// Creates an empty keydir.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Rebuilds the keydir by scanning every read-only datafile in ascending
    /// id order. For each key the newest record wins (largest timestamp, with
    /// later-scanned records winning ties); keys whose newest record is a
    /// tombstone are dropped once the scan completes.
    pub fn rebuild(directory: &Directory) -> Result<Self> {
        let mut newest: HashMap<Vec<u8>, (bool, RecordLoc)> = HashMap::new();
        for id in directory.readonly_ids() {
            let datafile = directory.readonly_datafile(id)?;
            for entry in datafile.scan()? {
                let (record, pos) = entry?;
                let loc = RecordLoc { id, pos, sz: record.size(), tstamp: record.tstamp };
                let tombstone = record.is_tombstone();
                match newest.entry(record.key) {
                    Entry::Occupied(mut entry) if loc.tstamp >= entry.get().1.tstamp => {
                        entry.insert((tombstone, loc));
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(entry) => {
                        entry.insert((tombstone, loc));
                    }
                }
            }
        }
        let live = newest
            .into_iter()
            .filter(|(_, (tombstone, _))| !tombstone)
            .map(|(key, (_, loc))| (key, loc))
            .collect();
        Ok(Self(live))
    }

    /// Returns the locator for a key, if present.
    pub fn get(&self, key: &[u8]) -> Option<RecordLoc> {
        self.0.get(key).copied()
    }

    /// Inserts or replaces the locator for a key.
    pub fn put(&mut self, key: Vec<u8>, loc: RecordLoc) {
        self.0.insert(key, loc);
    }

    /// Removes a key, if present.
    pub fn remove(&mut self, key: &[u8]) {
        self.0.remove(key);
    }

    /// The number of live keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all live keys and their locators, in no particular
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &RecordLoc)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::super::record::Record;
    use super::*;

    fn loc(id: DatafileId, tstamp: u64) -> RecordLoc {
        RecordLoc { id, pos: 0, sz: 25, tstamp }
    }

    #[test]
    fn put_get_remove() {
        let mut keydir = KeyDir::new();
        assert_eq!(keydir.get(b"key"), None);

        keydir.put(b"key".to_vec(), loc(1, 1));
        assert_eq!(keydir.get(b"key"), Some(loc(1, 1)));
        assert_eq!(keydir.len(), 1);

        keydir.put(b"key".to_vec(), loc(2, 2));
        assert_eq!(keydir.get(b"key"), Some(loc(2, 2)));
        assert_eq!(keydir.len(), 1);

        keydir.remove(b"key");
        assert_eq!(keydir.get(b"key"), None);
        assert!(keydir.is_empty());

        // Removing an absent key is a no-op.
        keydir.remove(b"key");
    }

    /// Rebuilds a keydir from datafiles holding several records per key,
    /// including equal timestamps, which the later datafile must win.
    #[test]
    fn rebuild() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let mut directory = Directory::open(dir.path())?;

        let mut active = directory.active_datafile()?;
        active.append_record(&Record { tstamp: 10, key: b"a".to_vec(), value: Some(b"1".to_vec()) })?;
        active.append_record(&Record { tstamp: 10, key: b"b".to_vec(), value: Some(b"1".to_vec()) })?;
        active.append_record(&Record { tstamp: 11, key: b"c".to_vec(), value: Some(b"1".to_vec()) })?;

        let mut active = directory.rollover_to_next()?;
        // Same timestamp as the first record for "a": the later datafile wins.
        active.append_record(&Record { tstamp: 10, key: b"a".to_vec(), value: Some(b"2".to_vec()) })?;
        // Older than the existing record for "c": ignored.
        active.append_record(&Record { tstamp: 9, key: b"c".to_vec(), value: Some(b"2".to_vec()) })?;
        // Deletes "b".
        active.append_record(&Record { tstamp: 12, key: b"b".to_vec(), value: None })?;

        // Seal the second datafile so the rebuild sees it.
        drop(directory.rollover_to_next()?);

        let keydir = KeyDir::rebuild(&directory)?;
        assert_eq!(keydir.len(), 2);

        let a = keydir.get(b"a").expect("a must be present");
        assert_eq!((a.id, a.tstamp), (2, 10));
        assert_eq!(keydir.get(b"b"), None);
        let c = keydir.get(b"c").expect("c must be present");
        assert_eq!((c.id, c.tstamp), (1, 11));
        Ok(())
    }
}
