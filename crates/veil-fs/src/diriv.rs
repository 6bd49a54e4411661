//! Per-directory IV store
//!
//! Every cipher directory carries a random 16-byte tweak in
//! `gocryptfs.diriv`, written when the directory is created and removed only
//! with the directory. The tweak makes identical plaintext names encrypt
//! differently across directories.
//!
//! Reads are cached per cipher path for the mount lifetime; rmdir and rename
//! invalidate the affected subtree. A directory that exists but has no IV
//! file is unreadable — that is surfaced as a hard error, never papered
//! over with a synthetic IV.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use rand::RngCore;
use tracing::warn;
use veil_core::{FsError, FsResult};
use veil_crypto::{DIRIV_NAME, DIRIV_SIZE};

#[derive(Default)]
pub struct DirIvStore {
    cache: RwLock<HashMap<PathBuf, [u8; DIRIV_SIZE]>>,
}

impl DirIvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The IV of a cipher directory, reading and caching it on first use.
    pub fn get(&self, cipher_dir: &Path) -> FsResult<[u8; DIRIV_SIZE]> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(iv) = cache.get(cipher_dir) {
                return Ok(*iv);
            }
        }

        let iv = read_diriv(cipher_dir)?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cipher_dir.to_path_buf(), iv);
        Ok(iv)
    }

    /// Sample a fresh IV for a newly created cipher directory and flush it
    /// to disk before the caller reports the mkdir as successful.
    pub fn create(&self, cipher_dir: &Path) -> FsResult<[u8; DIRIV_SIZE]> {
        let mut iv = [0u8; DIRIV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        write_diriv(cipher_dir, &iv)?;

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cipher_dir.to_path_buf(), iv);
        Ok(iv)
    }

    /// Drop cached IVs for `cipher_dir` and everything below it
    /// (rmdir, rename).
    pub fn forget(&self, cipher_dir: &Path) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.retain(|path, _| !path.starts_with(cipher_dir));
    }
}

fn read_diriv(cipher_dir: &Path) -> FsResult<[u8; DIRIV_SIZE]> {
    let path = cipher_dir.join(DIRIV_NAME);
    let data = fs::read(&path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            warn!(dir = %cipher_dir.display(), "directory has no IV file, contents are unreadable");
        }
        FsError::Io(e)
    })?;
    if data.len() != DIRIV_SIZE {
        return Err(FsError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{} has length {} (expected {DIRIV_SIZE})",
                path.display(),
                data.len()
            ),
        )));
    }
    let mut iv = [0u8; DIRIV_SIZE];
    iv.copy_from_slice(&data);
    Ok(iv)
}

/// Initialise the IV of a brand-new cipher directory (used by `init` for
/// the root directory, before any facade exists).
pub fn init_dir_iv(cipher_dir: &Path) -> FsResult<[u8; DIRIV_SIZE]> {
    let mut iv = [0u8; DIRIV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    write_diriv(cipher_dir, &iv)?;
    Ok(iv)
}

/// Write the IV file and fsync it so the directory is usable once visible.
pub(crate) fn write_diriv(cipher_dir: &Path, iv: &[u8; DIRIV_SIZE]) -> FsResult<()> {
    let path = cipher_dir.join(DIRIV_NAME);
    let mut file = fs::File::create(&path)?;
    file.write_all(iv)?;
    file.sync_all()?;
    Ok(())
}
