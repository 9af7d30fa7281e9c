//! The database: the public face of the storage engine. A very simple
//! variant of BitCask, itself a very simple log-structured key-value engine
//! used e.g. by the Riak database. See:
//! https://riak.com/assets/bitcask-intro.pdf
//!
//! Writes append a record to the active datafile and update the in-memory
//! keydir, which maps every live key to the on-disk location of its most
//! recent value. All live keys must fit in memory. Once the active datafile
//! reaches a size threshold it is sealed and a fresh one is opened. Deletes
//! append a tombstone record and drop the key from the keydir. Reads look the
//! key up in the keydir and fetch the record from the active or a read-only
//! datafile with a single positional read.
//!
//! To remove old garbage, a background worker periodically merges the
//! read-only datafiles: it rewrites the newest surviving record of every key
//! into a single fresh datafile, skipping replaced values and tombstones, and
//! deletes the datafiles it replaced.
//!
//! The keydir is rebuilt from the datafiles on open; there are no hint files.
//! A reader-writer lock guards the shared state: writes, rollover, and merge
//! take the exclusive half, reads the shared half.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use itertools::Itertools;

use crate::config::Config;
use crate::error::Result;

use super::datafile::ActiveDatafile;
use super::directory::{DatafileId, Directory};
use super::keydir::{KeyDir, RecordLoc};
use super::record::{Record, RECORD_HEADER_SIZE};

/// An embedded BitCask-style key-value database.
pub struct Database {
    /// The shared engine state, behind the engine's reader-writer lock.
    shared: Arc<RwLock<Shared>>,
    config: Config,
    /// The background merge worker, when auto-merge is enabled.
    merger: Option<MergeWorker>,
}

/// Engine state guarded by the lock: the directory of datafiles, the open
/// active datafile, and the keydir.
struct Shared {
    directory: Directory,
    active: ActiveDatafile,
    keydir: KeyDir,
}

/// Database size statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// The number of live keys.
    pub keys: u64,
    /// The logical size of live keys and values in bytes.
    pub size: u64,
    /// The id of the active datafile.
    pub active_datafile: DatafileId,
    /// The number of read-only datafiles.
    pub readonly_datafiles: u64,
    /// The on-disk size of all datafiles.
    pub total_disk_size: u64,
    /// The on-disk size of live records.
    pub live_disk_size: u64,
    /// The on-disk size of superseded records and tombstones, i.e. the bytes
    /// a merge would reclaim.
    pub garbage_disk_size: u64,
}

impl Database {
    /// Opens or creates a database in the given folder: takes the folder
    /// lock, opens the active datafile, rebuilds the keydir from disk, and
    /// spawns the merge worker if enabled.
    pub fn open(folder: &Path, config: Config) -> Result<Self> {
        log::info!("Opening database {}", folder.display());
        let directory = Directory::open(folder)?;
        let active = directory.active_datafile()?;
        let keydir = KeyDir::rebuild(&directory)?;
        log::info!("Indexed {} live keys in {}", keydir.len(), folder.display());

        let shared = Arc::new(RwLock::new(Shared { directory, active, keydir }));
        let merger = config
            .enable_auto_merge
            .then(|| MergeWorker::spawn(Arc::clone(&shared), &config));
        Ok(Self { shared, config, merger })
    }

    fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.shared.read().expect("lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, Shared> {
        self.shared.write().expect("lock poisoned")
    }

    /// Sets a key to a value, rolling the active datafile over first if it
    /// has reached the size threshold.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut shared = self.write();
        shared.maybe_rollover(self.config.datafile_threshold)?;
        let loc = shared.active.append(key, Some(value))?;
        shared.keydir.put(key.to_vec(), loc);
        Ok(())
    }

    /// Deletes a key: appends a tombstone record (making the deletion durable
    /// across a rebuild) and removes the key from the keydir. Deleting an
    /// absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut shared = self.write();
        shared.maybe_rollover(self.config.datafile_threshold)?;
        shared.active.append(key, None)?;
        shared.keydir.remove(key);
        Ok(())
    }

    /// Gets the value of a key, or None if it does not exist. The read is
    /// routed to the active datafile when the locator points there (its
    /// handle is always open), and otherwise opens the read-only datafile on
    /// demand. A resolved tombstone reads as absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let shared = self.read();
        let Some(loc) = shared.keydir.get(key) else { return Ok(None) };
        let record = if loc.id == shared.active.id() {
            shared.active.read_at(&loc)?
        } else {
            shared.directory.readonly_datafile(loc.id)?.read_at(&loc)?
        };
        Ok(record.value)
    }

    /// Merges all read-only datafiles into a single fresh one, reclaiming the
    /// space of superseded records and tombstones. The merge worker invokes
    /// this on its own; it only needs to be called explicitly when auto-merge
    /// is disabled.
    pub fn merge(&self) -> Result<()> {
        self.write().merge()
    }

    /// Returns database size statistics.
    pub fn status(&self) -> Result<Status> {
        self.read().status()
    }

    /// Closes the database: stops the merge worker (waiting for it to
    /// acknowledge, with any in-progress merge completing first) and flushes
    /// the active datafile.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(merger) = self.merger.take() {
            merger.stop();
        }
        // Don't fsync in tests, to speed them up.
        #[cfg(not(test))]
        self.read().active.sync()?;
        Ok(())
    }
}

/// Attempt to stop the worker and flush the file when the database is
/// dropped without an explicit close().
impl Drop for Database {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::error!("failed to close database: {error}");
        }
    }
}

impl Shared {
    /// Seals the active datafile and opens a fresh one once the size
    /// threshold is reached. Never splits a record across datafiles.
    fn maybe_rollover(&mut self, threshold: u64) -> Result<()> {
        if self.active.size() >= threshold {
            self.active = self.directory.rollover_to_next()?;
            log::debug!("Rolled over to datafile {}", self.active.id());
        }
        Ok(())
    }

    /// Compacts every read-only datafile into a single fresh one. Collects
    /// the newest record per key, rewrites the surviving (non-tombstone)
    /// records with their original timestamps into an unregistered output
    /// datafile, swaps the keydir entries that still reference the merged
    /// records, registers the output, and deletes the merged datafiles. On
    /// failure nothing is swapped or deleted; the output file is left behind
    /// and absorbed as a read-only datafile at next open.
    fn merge(&mut self) -> Result<()> {
        let merge_ids = self.directory.readonly_ids();
        if merge_ids.is_empty() {
            return Ok(());
        }

        // The newest record per key with its current locator. Later-scanned
        // datafiles win timestamp ties, as in the keydir rebuild.
        let mut newest: HashMap<Vec<u8>, (Record, RecordLoc)> = HashMap::new();
        for &id in &merge_ids {
            let datafile = self.directory.readonly_datafile(id)?;
            for entry in datafile.scan()? {
                let (record, pos) = entry?;
                let loc = RecordLoc { id, pos, sz: record.size(), tstamp: record.tstamp };
                match newest.entry(record.key.clone()) {
                    Entry::Occupied(mut entry) if loc.tstamp >= entry.get().1.tstamp => {
                        entry.insert((record, loc));
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(entry) => {
                        entry.insert((record, loc));
                    }
                }
            }
        }

        let (live, dead): (Vec<_>, Vec<_>) =
            newest.into_values().partition(|(record, _)| !record.is_tombstone());

        // Rewrite the live records in (key, timestamp) order.
        let mut output = self.directory.temp_active_datafile()?;
        let output_id = output.id();
        let mut rewritten = Vec::with_capacity(live.len());
        for (record, old_loc) in live
            .into_iter()
            .sorted_by(|(a, _), (b, _)| a.key.cmp(&b.key).then(a.tstamp.cmp(&b.tstamp)))
        {
            let new_loc = output.append_record(&record)?;
            rewritten.push((record.key, old_loc, new_loc));
        }

        // Swap the keydir entries, guarded against staleness: only touch
        // entries that still reference the exact locator that was merged.
        // Anything else was superseded by a newer write.
        for (record, old_loc) in &dead {
            if self.keydir.get(&record.key) == Some(*old_loc) {
                self.keydir.remove(&record.key);
            }
        }
        for (key, old_loc, new_loc) in rewritten {
            if self.keydir.get(&key) == Some(old_loc) {
                self.keydir.put(key, new_loc);
            }
        }

        self.directory.register_readonly_datafile(output_id);
        drop(output);
        for id in &merge_ids {
            self.directory.remove_readonly_datafile(*id)?;
        }
        log::info!("Merged {} datafiles into datafile {output_id}", merge_ids.len());
        Ok(())
    }

    /// Returns true if the read-only datafile count calls for a merge.
    fn should_merge(readonly_count: usize, num_readonly_files: usize) -> bool {
        readonly_count > num_readonly_files
    }

    fn status(&self) -> Result<Status> {
        let keys = self.keydir.len() as u64;
        let mut size = 0;
        let mut live_disk_size = 0;
        for (_, loc) in self.keydir.iter() {
            size += loc.sz as u64 - RECORD_HEADER_SIZE as u64;
            live_disk_size += loc.sz as u64;
        }
        let readonly_ids = self.directory.readonly_ids();
        let mut total_disk_size = self.active.size();
        for &id in &readonly_ids {
            total_disk_size += self.directory.datafile_size(id)?;
        }
        Ok(Status {
            keys,
            size,
            active_datafile: self.active.id(),
            readonly_datafiles: readonly_ids.len() as u64,
            total_disk_size,
            live_disk_size,
            garbage_disk_size: total_disk_size - live_disk_size,
        })
    }
}

/// The background merge worker: a thread that checks the merge condition at
/// a fixed interval and merges when the read-only datafile count exceeds the
/// configured bound.
struct MergeWorker {
    /// Dropped to ask the worker to stop at its next tick.
    shutdown: crossbeam::channel::Sender<()>,
    handle: JoinHandle<()>,
}

impl MergeWorker {
    fn spawn(shared: Arc<RwLock<Shared>>, config: &Config) -> Self {
        let (shutdown, shutdown_rx) = crossbeam::channel::bounded(1);
        let ticker = crossbeam::channel::tick(config.merge_interval());
        let num_readonly_files = config.num_readonly_files;
        let handle = std::thread::spawn(move || loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    let mut shared = shared.write().expect("lock poisoned");
                    if Shared::should_merge(shared.directory.readonly_ids().len(), num_readonly_files) {
                        if let Err(error) = shared.merge() {
                            log::error!("merge failed: {error}");
                        }
                    }
                }
                recv(shutdown_rx) -> _ => return,
            }
        });
        Self { shutdown, handle }
    }

    /// Signals the worker to stop and waits for it to finish. A merge
    /// already in progress completes first.
    fn stop(self) {
        drop(self.shutdown);
        if self.handle.join().is_err() {
            log::error!("merge worker panicked");
        }
    }
}
