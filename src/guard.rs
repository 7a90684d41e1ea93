//! Integrity guard for the index file
//!
//! The guard stores the SHA-256 digest of the index file's bytes in a
//! sidecar file next to it (64 lowercase hex characters and a newline).
//! Opening an archive verifies the sidecar; every commit regenerates it.
//!
//! ## Known limitation
//!
//! [`IntegrityGuard::refresh`] deletes the sidecar and writes a new one. A
//! crash between the two leaves no sidecar, which the next
//! [`IntegrityGuard::verify`] reports as [`ArchiveError::NotFound`]; the
//! index itself is untouched in that case.

use crate::error::{ArchiveError, Result};
use crate::types::ContentDigest;
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Sidecar digest protecting one index file
#[derive(Debug, Clone)]
pub struct IntegrityGuard {
    sidecar: PathBuf,
    index: PathBuf,
}

impl IntegrityGuard {
    /// Guard for `index`, stored at `sidecar`
    pub fn new(sidecar: impl Into<PathBuf>, index: impl Into<PathBuf>) -> Self {
        Self {
            sidecar: sidecar.into(),
            index: index.into(),
        }
    }

    /// Sidecar file path
    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar
    }

    /// Protected index file path
    pub fn index_path(&self) -> &Path {
        &self.index
    }

    /// Digest the index and write a new sidecar
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::NotFound`] if the index file is missing
    /// - [`ArchiveError::AlreadyExists`] if the sidecar already exists
    pub fn initialize(&self) -> Result<ContentDigest> {
        if !self.index.exists() {
            return Err(ArchiveError::NotFound(self.index.clone()));
        }
        if utils::entry_exists(&self.sidecar) {
            return Err(ArchiveError::AlreadyExists(self.sidecar.clone()));
        }

        let digest = utils::digest_file(&self.index)?;
        utils::atomic_write(&self.sidecar, format!("{}\n", digest.to_hex()).as_bytes())?;
        debug!("Wrote index digest {} to {:?}", digest.short(), self.sidecar);
        Ok(digest)
    }

    /// Check the index bytes against the sidecar
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::NotFound`] if either file is missing
    /// - [`ArchiveError::IndexCorrupted`] if the digests differ or the sidecar
    ///   does not hold a digest
    pub fn verify(&self) -> Result<ContentDigest> {
        if !self.index.exists() {
            return Err(ArchiveError::NotFound(self.index.clone()));
        }
        if !self.sidecar.exists() {
            return Err(ArchiveError::NotFound(self.sidecar.clone()));
        }

        let stored = fs::read(&self.sidecar)?;
        let actual = utils::digest_file(&self.index)?;

        match std::str::from_utf8(&stored).ok().and_then(ContentDigest::from_hex) {
            Some(expected) if expected == actual => {
                debug!("Index digest verified: {}", actual.short());
                Ok(actual)
            }
            _ => {
                error!("Index {:?} does not match sidecar {:?}", self.index, self.sidecar);
                Err(ArchiveError::IndexCorrupted {
                    index: self.index.clone(),
                    expected: String::from_utf8_lossy(&stored).trim().to_string(),
                    actual: actual.to_hex(),
                })
            }
        }
    }

    /// Delete the sidecar, if any, and initialize a fresh one
    pub fn refresh(&self) -> Result<ContentDigest> {
        match fs::remove_file(&self.sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.initialize()
    }
}
