//! The directory: the on-disk container of the database. It owns the folder,
//! names and enumerates the segment files within it, tracks which ids are
//! sealed (read-only) and which is active, and holds an exclusive lock on the
//! folder for its lifetime.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use regex::Regex;

use crate::errinput;
use crate::error::Result;

use super::datafile::{ActiveDatafile, ReadonlyDatafile};

/// A datafile (segment) id. Strictly positive; 0 is reserved as invalid. Ids
/// are allocated monotonically and never reused.
pub type DatafileId = u64;

/// Datafile name prefix; the full name is the prefix followed by the decimal
/// id zero-padded to 10 digits.
const DATAFILE_PREFIX: &str = "DATAFILE_";

/// The lock file taken out exclusively while the database is open.
const LOCK_FILE: &str = "LOCK";

/// A database folder: a set of read-only datafiles, one active datafile, and
/// the lock guarding them. Files not matching the datafile name template are
/// ignored.
pub struct Directory {
    folder: PathBuf,
    readonly_ids: BTreeSet<DatafileId>,
    active_id: DatafileId,
    /// Held until the directory is dropped.
    _lock: File,
}

impl Directory {
    /// Opens a database folder, creating it if it does not exist. Takes out
    /// an exclusive lock on the folder until the directory is dropped, or
    /// errors if the lock is already held. Scans the folder for existing
    /// datafiles (all of which become read-only, including any left behind by
    /// an interrupted merge) and claims a fresh active id above every known
    /// one.
    pub fn open(folder: &Path) -> Result<Self> {
        fs::create_dir_all(folder)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(folder.join(LOCK_FILE))?;
        lock.try_lock_exclusive()?;

        let pattern =
            Regex::new(&format!("^{DATAFILE_PREFIX}([0-9]{{10}})$")).expect("invalid regex");
        let mut readonly_ids = BTreeSet::new();
        for entry in fs::read_dir(folder)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(captures) = pattern.captures(name) else { continue };
            let id: DatafileId = captures[1].parse().expect("datafile id must be numeric");
            if id == 0 {
                errinput!("datafile id 0 is reserved ({name})");
            }
            readonly_ids.insert(id);
        }

        let mut dir = Self { folder: folder.to_path_buf(), readonly_ids, active_id: 0, _lock: lock };
        dir.active_id = dir.claim_next_id()?;
        Ok(dir)
    }

    /// The folder this directory manages.
    pub fn path(&self) -> &Path {
        &self.folder
    }

    /// The id of the current active datafile.
    pub fn active_id(&self) -> DatafileId {
        self.active_id
    }

    /// The read-only datafile ids, in ascending order.
    pub fn readonly_ids(&self) -> Vec<DatafileId> {
        self.readonly_ids.iter().copied().collect()
    }

    fn datafile_path(&self, id: DatafileId) -> PathBuf {
        self.folder.join(format!("{DATAFILE_PREFIX}{id:010}"))
    }

    /// The size of a datafile in bytes.
    pub fn datafile_size(&self, id: DatafileId) -> Result<u64> {
        Ok(fs::metadata(self.datafile_path(id))?.len())
    }

    /// Claims the next unused datafile id, above every id this directory
    /// knows of, by creating its file exclusively. Exclusive creation skips
    /// files the directory does not track (e.g. an unregistered merge
    /// output).
    fn claim_next_id(&self) -> Result<DatafileId> {
        let max_known = self.readonly_ids.iter().next_back().copied().unwrap_or(0);
        let mut id = max_known.max(self.active_id) + 1;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(self.datafile_path(id)) {
                Ok(_) => return Ok(id),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => id += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Opens the current active datafile for appends and reads, initializing
    /// its size counter from the file length.
    pub fn active_datafile(&self) -> Result<ActiveDatafile> {
        self.open_active(self.active_id)
    }

    fn open_active(&self, id: DatafileId) -> Result<ActiveDatafile> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(self.datafile_path(id))?;
        let size = file.metadata()?.len();
        Ok(ActiveDatafile::new(file, id, size))
    }

    /// Opens a registered read-only datafile.
    pub fn readonly_datafile(&self, id: DatafileId) -> Result<ReadonlyDatafile> {
        if !self.readonly_ids.contains(&id) {
            errinput!("unknown read-only datafile {id}");
        }
        let file = File::open(self.datafile_path(id))?;
        Ok(ReadonlyDatafile::new(file, id))
    }

    /// Seals the current active datafile into the read-only set and opens a
    /// freshly-claimed one in its place.
    pub fn rollover_to_next(&mut self) -> Result<ActiveDatafile> {
        let id = self.claim_next_id()?;
        self.readonly_ids.insert(self.active_id);
        self.active_id = id;
        self.active_datafile()
    }

    /// Claims and opens a fresh datafile without registering it, leaving the
    /// current active datafile in place. Used for the merge output, which is
    /// registered only once the merge completes.
    pub fn temp_active_datafile(&self) -> Result<ActiveDatafile> {
        let id = self.claim_next_id()?;
        self.open_active(id)
    }

    /// Adds a datafile to the read-only set.
    pub fn register_readonly_datafile(&mut self, id: DatafileId) {
        self.readonly_ids.insert(id);
    }

    /// Deletes a registered read-only datafile and drops it from the set.
    pub fn remove_readonly_datafile(&mut self, id: DatafileId) -> Result<()> {
        if !self.readonly_ids.contains(&id) {
            errinput!("unknown read-only datafile {id}");
        }
        fs::remove_file(self.datafile_path(id))?;
        self.readonly_ids.remove(&id);
        Ok(())
    }
}
