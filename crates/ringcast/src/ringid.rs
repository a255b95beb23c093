// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringcast.dev

//! Persistence of the ring-sequence counter.
//!
//! Each processor remembers the highest ring sequence it has installed in a
//! small file so that a restarted processor proposes ring ids above anything
//! it took part in before. The file lives under a configurable directory
//! (one file per local address) and is created with owner-only permissions.
//!
//! A missing file is a first boot and reads as zero. A failed store is
//! logged and otherwise ignored: the in-memory counter still advances, so
//! the ring installs; the accepted risk is that a later restart may propose
//! an already-used sequence, which the join exchange then raises past the
//! highest sequence any peer has seen.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::member::ProcessorId;

/// Handle to one processor's persisted ring-sequence counter.
#[derive(Debug, Clone)]
pub struct RingIdStore {
    path: PathBuf,
}

impl RingIdStore {
    /// Store for `id` under `dir`; the file name embeds the address so
    /// several processors may share a host.
    #[must_use]
    pub fn new(dir: &Path, id: &ProcessorId) -> Self {
        let file = format!("ringid_{}", id.addr).replace(':', "_");
        Self {
            path: dir.join(file),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted sequence; zero on first boot or unreadable file.
    #[must_use]
    pub fn load(&self) -> u64 {
        let mut buf = [0u8; 8];
        match fs::File::open(&self.path) {
            Ok(mut file) => match file.read_exact(&mut buf) {
                Ok(()) => u64::from_be_bytes(buf),
                Err(e) => {
                    log::warn!(
                        "[ringid] {} is corrupt ({}), starting from 0",
                        self.path.display(),
                        e
                    );
                    0
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                log::warn!(
                    "[ringid] cannot read {} ({}), starting from 0",
                    self.path.display(),
                    e
                );
                0
            }
        }
    }

    /// Persist `seq`, overwriting any previous value. Failure is logged,
    /// not fatal: the ring installs either way.
    pub fn store(&self, seq: u64) {
        if let Err(e) = self.write_file(seq) {
            log::warn!(
                "[ringid] cannot store ring sequence {} to {}: {}",
                seq,
                self.path.display(),
                e
            );
        }
    }

    fn write_file(&self, seq: u64) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(&seq.to_be_bytes())?;
        file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn pid(last: u8) -> ProcessorId {
        ProcessorId::new(
            u32::from(last),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
        )
    }

    #[test]
    fn test_first_boot_reads_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RingIdStore::new(dir.path(), &pid(1));
        assert_eq!(store.load(), 0);
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RingIdStore::new(dir.path(), &pid(1));
        store.store(44);
        assert_eq!(store.load(), 44);
        store.store(48);
        assert_eq!(store.load(), 48);
    }

    #[test]
    fn test_per_address_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = RingIdStore::new(dir.path(), &pid(1));
        let b = RingIdStore::new(dir.path(), &pid(2));
        a.store(4);
        b.store(8);
        assert_eq!(a.load(), 4);
        assert_eq!(b.load(), 8);
    }

    #[test]
    fn test_v6_address_file_name_is_sane() {
        let dir = tempfile::tempdir().expect("tempdir");
        let v6 = ProcessorId::new(9, IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 9)));
        let store = RingIdStore::new(dir.path(), &v6);
        assert!(!store.path().to_string_lossy().contains(':'));
        store.store(12);
        assert_eq!(store.load(), 12);
    }

    #[test]
    fn test_corrupt_file_reads_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RingIdStore::new(dir.path(), &pid(1));
        fs::write(store.path(), b"abc").expect("write");
        assert_eq!(store.load(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RingIdStore::new(dir.path(), &pid(1));
        store.store(4);
        let mode = fs::metadata(store.path()).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
