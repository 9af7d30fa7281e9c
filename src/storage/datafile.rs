//! Datafiles: the append-only segment files that make up the log. Exactly
//! one datafile is active (accepting appends) at any time; sealed datafiles
//! are read-only and only ever opened for positional reads.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;

use crate::error::Result;

use super::directory::DatafileId;
use super::keydir::RecordLoc;
use super::record::{self, Record, RECORD_HEADER_SIZE};

/// The active datafile: holds an append+read handle and a running size
/// counter, which always equals the file length.
pub struct ActiveDatafile {
    file: File,
    id: DatafileId,
    size: u64,
}

impl ActiveDatafile {
    pub(crate) fn new(file: File, id: DatafileId, size: u64) -> Self {
        Self { file, id, size }
    }

    /// The id of this datafile.
    pub fn id(&self) -> DatafileId {
        self.id
    }

    /// The current size of this datafile in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends a key/value record, using a None value for tombstones, and
    /// returns its locator.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<RecordLoc> {
        self.append_record(&Record::new(key, value))
    }

    /// Appends an already-built record, preserving its timestamp. If the
    /// write fails the file is rolled back to the last complete record before
    /// the error is surfaced.
    pub fn append_record(&mut self, record: &Record) -> Result<RecordLoc> {
        let buf = record.encode();
        if let Err(err) = self.file.write_all(&buf) {
            if let Err(truncate_err) = self.file.set_len(self.size) {
                log::error!("failed to roll back partial append: {truncate_err}");
            }
            return Err(err.into());
        }
        let loc =
            RecordLoc { id: self.id, pos: self.size, sz: buf.len() as u32, tstamp: record.tstamp };
        self.size += buf.len() as u64;
        Ok(loc)
    }

    /// Reads the record at the given locator.
    pub fn read_at(&self, loc: &RecordLoc) -> Result<Record> {
        read_record(&self.file, loc)
    }

    /// Flushes buffered writes to disk.
    pub fn sync(&self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }
}

/// A sealed datafile, opened read-only.
pub struct ReadonlyDatafile {
    file: File,
    id: DatafileId,
}

impl ReadonlyDatafile {
    pub(crate) fn new(file: File, id: DatafileId) -> Self {
        Self { file, id }
    }

    pub fn id(&self) -> DatafileId {
        self.id
    }

    /// Reads the record at the given locator.
    pub fn read_at(&self, loc: &RecordLoc) -> Result<Record> {
        read_record(&self.file, loc)
    }

    /// Iterates over all records in the datafile, from offset 0 forward,
    /// yielding each record with its offset. The scan ends cleanly at the end
    /// of the file, or early at a truncated or corrupt trailing record (the
    /// crash-recovery policy: an interrupted write discards that record and
    /// everything after it). Genuine I/O errors are surfaced.
    pub fn scan(&self) -> Result<ScanIter<'_>> {
        let len = self.file.metadata()?.len();
        Ok(ScanIter { file: &self.file, id: self.id, len, pos: 0, done: false })
    }
}

/// Reads and decodes exactly `loc.sz` bytes at `loc.pos`.
fn read_record(file: &File, loc: &RecordLoc) -> Result<Record> {
    let mut buf = vec![0; loc.sz as usize];
    file.read_exact_at(&mut buf, loc.pos)?;
    Record::decode(&buf)
}

/// An iterator over all records in a datafile. See [`ReadonlyDatafile::scan`].
pub struct ScanIter<'a> {
    file: &'a File,
    id: DatafileId,
    len: u64,
    pos: u64,
    done: bool,
}

impl Iterator for ScanIter<'_> {
    type Item = Result<(Record, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.pos == self.len {
            self.done = true;
            return None;
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        if self.pos + RECORD_HEADER_SIZE as u64 > self.len {
            return self.truncated();
        }
        if let Err(err) = self.file.read_exact_at(&mut header, self.pos) {
            self.done = true;
            return Some(Err(err.into()));
        }

        let (key_len, value_len) = record::body_sizes(&header);
        let size = RECORD_HEADER_SIZE as u64 + key_len as u64 + value_len as u64;
        if self.pos + size > self.len {
            return self.truncated();
        }

        let mut buf = vec![0; size as usize];
        buf[..RECORD_HEADER_SIZE].copy_from_slice(&header);
        if let Err(err) = self.file.read_exact_at(&mut buf[RECORD_HEADER_SIZE..], self.pos + RECORD_HEADER_SIZE as u64) {
            self.done = true;
            return Some(Err(err.into()));
        }

        match Record::decode(&buf) {
            Ok(record) => {
                let pos = self.pos;
                self.pos += size;
                Some(Ok((record, pos)))
            }
            // A corrupt record ends the scan: everything from here on is
            // unreadable, and for a trailing record this is the expected
            // remnant of an interrupted write.
            Err(err) => {
                log::warn!(
                    "Found corrupt record at offset {} in datafile {}, ignoring remainder: {err}",
                    self.pos,
                    self.id
                );
                self.done = true;
                None
            }
        }
    }
}

impl ScanIter<'_> {
    fn truncated(&mut self) -> Option<<Self as Iterator>::Item> {
        log::warn!(
            "Found incomplete record at offset {} in datafile {}, ignoring remainder",
            self.pos,
            self.id
        );
        self.done = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use super::super::directory::Directory;
    use super::*;

    /// Opens a directory in the tempdir and returns its active datafile.
    fn setup(dir: &tempfile::TempDir) -> Result<ActiveDatafile> {
        let directory = Directory::open(dir.path())?;
        directory.active_datafile()
    }

    fn readonly(dir: &tempfile::TempDir, id: DatafileId) -> Result<ReadonlyDatafile> {
        let file = File::open(dir.path().join(format!("DATAFILE_{id:010}")))?;
        Ok(ReadonlyDatafile::new(file, id))
    }

    #[test]
    fn append_and_read() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let mut active = setup(&dir)?;

        let pairs: Vec<(&[u8], &[u8])> = vec![
            (b"key1", b"value1"),
            (b"key2", b"value2"),
            (b"", b""),
            (b"this is a long key", b"this is a long value"),
        ];

        let mut locs = Vec::new();
        for (key, value) in &pairs {
            let loc = active.append(key, Some(value))?;
            assert_eq!(loc.pos + loc.sz as u64, active.size());
            locs.push(loc);
        }

        for ((key, value), loc) in pairs.iter().zip(&locs) {
            let record = active.read_at(loc)?;
            assert_eq!(record.key, *key);
            assert_eq!(record.value.as_deref(), Some(*value));
        }

        // Tombstones read back as valueless records.
        let loc = active.append(b"key1", None)?;
        let record = active.read_at(&loc)?;
        assert_eq!(record.key, b"key1");
        assert!(record.is_tombstone());
        Ok(())
    }

    #[test]
    fn scan_yields_insertion_order() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let mut active = setup(&dir)?;

        let mut locs = Vec::new();
        locs.push(active.append(b"a", Some(b"1"))?);
        locs.push(active.append(b"b", None)?);
        locs.push(active.append(b"a", Some(b"2"))?);

        let scanned: Vec<(Record, u64)> =
            readonly(&dir, active.id())?.scan()?.collect::<Result<_>>()?;
        assert_eq!(scanned.len(), 3);
        for ((record, pos), loc) in scanned.iter().zip(&locs) {
            assert_eq!(*pos, loc.pos);
            assert_eq!(record.tstamp, loc.tstamp);
        }
        assert_eq!(scanned[0].0.value.as_deref(), Some(b"1".as_slice()));
        assert!(scanned[1].0.is_tombstone());
        assert_eq!(scanned[2].0.value.as_deref(), Some(b"2".as_slice()));
        Ok(())
    }

    /// A file truncated at any byte boundary must yield the longest prefix of
    /// complete records and no error.
    #[test]
    fn scan_recovers_truncated_tail() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let mut active = setup(&dir)?;

        let mut ends = Vec::new();
        for record in [
            Record::new(b"deleted", Some(&[1, 2, 3])),
            Record::new(b"deleted", None),
            Record::new(b"", Some(&[])),
            Record::new(b"key", Some(&[1, 2, 3, 4, 5])),
        ] {
            let loc = active.append_record(&record)?;
            ends.push((loc.pos + loc.sz as u64, record));
        }

        let path = dir.path().join(format!("DATAFILE_{:010}", active.id()));
        let size = std::fs::metadata(&path)?.len();
        let truncated_path = dir.path().join("truncated");
        for pos in 0..=size {
            std::fs::copy(&path, &truncated_path)?;
            let file = OpenOptions::new().write(true).open(&truncated_path)?;
            file.set_len(pos)?;
            drop(file);

            let expect: Vec<&Record> =
                ends.iter().filter(|(end, _)| pos >= *end).map(|(_, r)| r).collect();

            let datafile = ReadonlyDatafile::new(File::open(&truncated_path)?, active.id());
            let scanned: Vec<Record> =
                datafile.scan()?.map(|entry| entry.map(|(r, _)| r)).collect::<Result<_>>()?;
            assert_eq!(scanned.iter().collect::<Vec<_>>(), expect, "truncated at {pos}");
        }
        Ok(())
    }

    /// A corrupt record mid-file ends the scan at that record.
    #[test]
    fn scan_stops_at_corrupt_record() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let mut active = setup(&dir)?;

        active.append(b"a", Some(b"1"))?;
        let second = active.append(b"b", Some(b"2"))?;
        active.append(b"c", Some(b"3"))?;

        // Flip a byte in the second record's value.
        let path = dir.path().join(format!("DATAFILE_{:010}", active.id()));
        let file = OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(&[0xff], second.pos + second.sz as u64 - 1)?;
        drop(file);

        let scanned: Vec<(Record, u64)> =
            readonly(&dir, active.id())?.scan()?.collect::<Result<_>>()?;
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0.key, b"a");
        Ok(())
    }

    /// Reading at a locator must verify the record checksum.
    #[test]
    fn read_at_surfaces_corruption() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("caskdb")?;
        let mut active = setup(&dir)?;
        let loc = active.append(b"key", Some(b"value"))?;

        let path = dir.path().join(format!("DATAFILE_{:010}", active.id()));
        let file = OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(&[0xff], loc.pos + loc.sz as u64 - 1)?;
        drop(file);

        assert!(matches!(
            readonly(&dir, active.id())?.read_at(&loc),
            Err(crate::error::Error::Corrupt(_))
        ));
        Ok(())
    }
}
