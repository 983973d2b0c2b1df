//! Payload file directory (§4.2, §6): one file per bundle, named
//! `bundle_<id>.dat`, outside the sqlite store proper.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use dtn_core::BundleId;

use crate::error::StoreError;

pub struct PayloadStore {
    dir: PathBuf,
}

impl PayloadStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(PayloadStore { dir })
    }

    pub fn path_for(&self, id: BundleId) -> PathBuf {
        self.dir.join(format!("bundle_{id}.dat"))
    }

    /// Creates (or truncates) the backing file for `id` and writes `bytes`.
    pub fn write_complete(&self, id: BundleId, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.path_for(id);
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        file.write_all(bytes)?;
        Ok(path)
    }

    /// Appends `bytes` at `offset`, for streaming receives that grow a
    /// payload file incrementally as blocks arrive (§4.5).
    pub fn write_at(&self, id: BundleId, offset: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(id);
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Random-access read, for a CL that needs to resume sending a block
    /// range after reconnecting.
    pub fn read_range(&self, id: BundleId, offset: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(id);
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Verifies the on-disk file exists and has exactly `expected_len`
    /// bytes, per the load-time check in §4.2.
    pub fn verify(&self, id: BundleId, expected_len: u64) -> Result<(), StoreError> {
        let path = self.path_for(id);
        let found = fs::metadata(&path).ok().map(|m| m.len());
        if found != Some(expected_len) {
            return Err(StoreError::PayloadMismatch { bundle_id: id, expected: expected_len, found });
        }
        Ok(())
    }

    pub fn remove(&self, id: BundleId) -> Result<(), StoreError> {
        let path = self.path_for(id);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_verify_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::open(dir.path()).unwrap();
        store.write_complete(1, b"hello world").unwrap();
        store.verify(1, 11).unwrap();
        assert_eq!(store.read_range(1, 6, 5).unwrap(), b"world");
    }

    #[test]
    fn verify_fails_on_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::open(dir.path()).unwrap();
        store.write_complete(1, b"short").unwrap();
        let err = store.verify(1, 100).unwrap_err();
        assert!(matches!(err, StoreError::PayloadMismatch { bundle_id: 1, .. }));
    }

    #[test]
    fn streamed_writes_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::open(dir.path()).unwrap();
        store.write_at(2, 0, b"AAAA").unwrap();
        store.write_at(2, 4, b"BBBB").unwrap();
        store.verify(2, 8).unwrap();
        assert_eq!(store.read_range(2, 0, 8).unwrap(), b"AAAABBBB");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PayloadStore::open(dir.path()).unwrap();
        store.write_complete(3, b"x").unwrap();
        store.remove(3).unwrap();
        store.remove(3).unwrap();
    }
}
