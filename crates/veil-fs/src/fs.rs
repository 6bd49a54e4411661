//! Filesystem facade
//!
//! Composes the block codec, the filename transform, the directory IV store
//! and the per-file engine into the operation set the kernel adapter needs:
//! create/open/read/write/truncate/unlink/mkdir/rmdir/rename/readdir/stat.
//!
//! All paths taken here are plaintext paths relative to the mount root;
//! every side effect lands in the cipher directory.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use veil_core::{FsError, FsResult, MountOptions};
use veil_crypto::names::{is_long_name, long_name_companion, long_name_stub};
use veil_crypto::{
    is_reserved_name, ContentCrypter, KeyStore, NameTransform, CONF_NAME, DIRIV_NAME,
    LONGNAME_PREFIX, LONGNAME_SUFFIX,
};

use crate::diriv::{self, DirIvStore};
use crate::file::EncryptedFile;
use crate::layout;
use crate::lock::InodeLocks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Stat result: backing metadata with the size corrected from ciphertext
/// to plaintext arithmetic. `kind` is explicit because reverse mode
/// synthesizes entries that have no backing file of their own.
#[derive(Debug)]
pub struct Attr {
    pub size: u64,
    pub kind: EntryKind,
    pub meta: fs::Metadata,
}

impl Attr {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

pub struct CryptFs {
    cipher_root: PathBuf,
    crypter: Arc<ContentCrypter>,
    /// `None` in plaintext-names mode.
    names: Option<NameTransform>,
    dirivs: DirIvStore,
    locks: InodeLocks,
}

impl CryptFs {
    pub fn new(cipher_root: PathBuf, keys: &KeyStore, opts: &MountOptions) -> FsResult<Self> {
        let crypter = Arc::new(ContentCrypter::new(keys.content_key(), opts.backend)?);
        let names = if opts.plaintext_names {
            None
        } else {
            Some(NameTransform::new(keys.name_key()))
        };
        Ok(Self {
            cipher_root,
            crypter,
            names,
            dirivs: DirIvStore::new(),
            locks: InodeLocks::new(),
        })
    }

    // ── file operations ──────────────────────────────────────────────────

    /// Create (or open, if it exists) the backing file for `rel`.
    pub fn create(&self, rel: &Path) -> FsResult<EncryptedFile> {
        let backing = self.resolve(rel, true)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&backing)?;
        debug!(path = %rel.display(), "created file");
        self.wrap_file(file)
    }

    /// Open the backing file for `rel`. Falls back to read-only when the
    /// backing permissions do not allow writing.
    pub fn open(&self, rel: &Path) -> FsResult<EncryptedFile> {
        let backing = self.resolve(rel, false)?;
        let file = match OpenOptions::new().read(true).write(true).open(&backing) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                OpenOptions::new().read(true).open(&backing)?
            }
            Err(e) => return Err(e.into()),
        };
        self.wrap_file(file)
    }

    pub fn unlink(&self, rel: &Path) -> FsResult<()> {
        let (parent, base) = self.resolve_parent(rel)?;
        let stored = self.stored_name(&parent, &base, false)?;
        fs::remove_file(parent.join(&stored))?;
        self.remove_companion(&parent, &stored);
        Ok(())
    }

    pub fn stat(&self, rel: &Path) -> FsResult<Attr> {
        let backing = self.resolve(rel, false)?;
        let meta = fs::symlink_metadata(&backing)?;
        let (size, kind) = if meta.is_dir() {
            (meta.len(), EntryKind::Dir)
        } else {
            (layout::plain_size(meta.len()), EntryKind::File)
        };
        Ok(Attr { size, kind, meta })
    }

    // ── directory operations ─────────────────────────────────────────────

    pub fn mkdir(&self, rel: &Path, mode: u32) -> FsResult<()> {
        let backing = self.resolve(rel, true)?;
        fs::create_dir(&backing)?;
        if self.names.is_some() {
            // The IV must be durable before the mkdir is reported done;
            // without it the new directory is unreadable.
            if let Err(e) = self.dirivs.create(&backing) {
                let _ = fs::remove_dir(&backing);
                return Err(e);
            }
        }
        fs::set_permissions(&backing, fs::Permissions::from_mode(mode))?;
        debug!(path = %rel.display(), "created directory");
        Ok(())
    }

    pub fn rmdir(&self, rel: &Path) -> FsResult<()> {
        let (parent, base) = self.resolve_parent(rel)?;
        let stored = self.stored_name(&parent, &base, false)?;
        let backing = parent.join(&stored);

        if self.names.is_none() {
            fs::remove_dir(&backing)?;
            return Ok(());
        }

        // The backing dir always holds the IV file, so a bare remove_dir
        // would report ENOTEMPTY for a logically empty directory. Take the
        // IV out, remove, and put the same bytes back if the host refuses.
        if !self.is_logically_empty(&backing)? {
            return Err(FsError::Io(io::Error::from_raw_os_error(libc::ENOTEMPTY)));
        }
        let iv = self.dirivs.get(&backing)?;
        fs::remove_file(backing.join(DIRIV_NAME))?;
        if let Err(e) = fs::remove_dir(&backing) {
            let _ = diriv::write_diriv(&backing, &iv);
            return Err(e.into());
        }
        self.dirivs.forget(&backing);
        self.remove_companion(&parent, &stored);
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let (from_parent, from_base) = self.resolve_parent(from)?;
        let from_stored = self.stored_name(&from_parent, &from_base, false)?;
        let from_backing = from_parent.join(&from_stored);

        let (to_parent, to_base) = self.resolve_parent(to)?;
        let to_stored = self.stored_name(&to_parent, &to_base, true)?;
        let to_backing = to_parent.join(&to_stored);

        // Overwriting an empty directory: its IV file makes the host see a
        // non-empty target. Move the IV aside for the duration.
        let mut stashed_iv = None;
        if self.names.is_some() {
            if let Ok(meta) = fs::symlink_metadata(&to_backing) {
                if meta.is_dir() && self.is_logically_empty(&to_backing)? {
                    let iv = self.dirivs.get(&to_backing)?;
                    fs::remove_file(to_backing.join(DIRIV_NAME))?;
                    stashed_iv = Some(iv);
                }
            }
        }

        if let Err(e) = fs::rename(&from_backing, &to_backing) {
            if let Some(iv) = stashed_iv {
                let _ = diriv::write_diriv(&to_backing, &iv);
            }
            return Err(e.into());
        }

        // A renamed directory keeps its own IV file; only the caches and
        // the long-name companion of the old entry go away.
        self.dirivs.forget(&from_backing);
        self.dirivs.forget(&to_backing);
        self.remove_companion(&from_parent, &from_stored);
        Ok(())
    }

    pub fn readdir(&self, rel: &Path) -> FsResult<Vec<DirEntry>> {
        let backing = self.resolve(rel, false)?;
        let at_root = self.is_root(rel)?;
        // A directory without its IV is unreadable, even when it happens to
        // hold no entries right now.
        let dir_iv = match &self.names {
            Some(_) => Some(self.dirivs.get(&backing)?),
            None => None,
        };

        let mut out = Vec::new();
        for entry in fs::read_dir(&backing)? {
            let entry = entry?;
            let stored = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                continue;
            };

            let Some(names) = &self.names else {
                // Plaintext names: only the root config record is hidden.
                if at_root && stored == CONF_NAME {
                    continue;
                }
                out.push(DirEntry { name: stored, kind });
                continue;
            };

            let encrypted = if stored.starts_with(LONGNAME_PREFIX) {
                if stored.ends_with(LONGNAME_SUFFIX) {
                    // Companion files are metadata for their stub entry.
                    continue;
                }
                match fs::read_to_string(backing.join(long_name_companion(&stored))) {
                    Ok(full) => full,
                    Err(e) => {
                        warn!(entry = %stored, "long name without companion: {e}");
                        continue;
                    }
                }
            } else if is_reserved_name(&stored) {
                continue;
            } else {
                stored.clone()
            };

            let iv = dir_iv.expect("encrypted mode always resolves the dir IV");
            match names.decrypt_name(&encrypted, &iv) {
                Ok(name) => out.push(DirEntry { name, kind }),
                Err(e) => {
                    warn!(entry = %stored, "skipping undecryptable name: {e}");
                }
            }
        }
        Ok(out)
    }

    // ── path translation ─────────────────────────────────────────────────

    fn wrap_file(&self, file: File) -> FsResult<EncryptedFile> {
        let ino = file.metadata()?.ino();
        EncryptedFile::new(file, self.crypter.clone(), self.locks.lock_for(ino))
    }

    fn is_root(&self, rel: &Path) -> FsResult<bool> {
        Ok(split_rel(rel)?.is_empty())
    }

    /// Translate a plaintext relative path into its backing path.
    /// `create` materialises long-name companions for the final component.
    fn resolve(&self, rel: &Path, create: bool) -> FsResult<PathBuf> {
        let comps = split_rel(rel)?;
        self.check_reserved(&comps)?;

        let mut cur = self.cipher_root.clone();
        for (i, comp) in comps.iter().enumerate() {
            let is_last = i + 1 == comps.len();
            let stored = self.stored_name(&cur, comp, create && is_last)?;
            cur.push(stored);
        }
        Ok(cur)
    }

    /// Backing directory of `rel`'s parent plus the plaintext basename.
    fn resolve_parent(&self, rel: &Path) -> FsResult<(PathBuf, String)> {
        let comps = split_rel(rel)?;
        self.check_reserved(&comps)?;
        let Some((base, parents)) = comps.split_last() else {
            return Err(FsError::Io(io::Error::from_raw_os_error(libc::EINVAL)));
        };

        let mut cur = self.cipher_root.clone();
        for comp in parents {
            let stored = self.stored_name(&cur, comp, false)?;
            cur.push(stored);
        }
        Ok((cur, base.to_string()))
    }

    /// The on-disk name for one plaintext component inside `dir_abs`.
    /// Over-long encrypted names collapse to their hash stub; with `create`
    /// the companion file holding the full name is written as well.
    fn stored_name(&self, dir_abs: &Path, name: &str, create: bool) -> FsResult<String> {
        let Some(names) = &self.names else {
            return Ok(name.to_string());
        };
        let iv = self.dirivs.get(dir_abs)?;
        let encrypted = names.encrypt_name(name, &iv)?;
        if !is_long_name(&encrypted) {
            return Ok(encrypted);
        }

        let stub = long_name_stub(&encrypted);
        if create {
            fs::write(dir_abs.join(long_name_companion(&stub)), &encrypted)?;
        }
        Ok(stub)
    }

    fn remove_companion(&self, parent: &Path, stored: &str) {
        if self.names.is_some() && stored.starts_with(LONGNAME_PREFIX) {
            let _ = fs::remove_file(parent.join(long_name_companion(stored)));
        }
    }

    /// In plaintext-names mode the root-level config record name is
    /// reserved: it cannot be created, removed, renamed or even looked up
    /// through the plain view.
    fn check_reserved(&self, comps: &[&str]) -> FsResult<()> {
        if self.names.is_none() && comps == [CONF_NAME] {
            return Err(FsError::NameReserved(CONF_NAME.to_string()));
        }
        Ok(())
    }

    /// True when the backing directory contains nothing but its IV file.
    fn is_logically_empty(&self, backing: &Path) -> FsResult<bool> {
        for entry in fs::read_dir(backing)? {
            let name = entry?.file_name();
            if name.to_string_lossy() != DIRIV_NAME {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn split_rel(rel: &Path) -> FsResult<Vec<&str>> {
    let mut out = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(os) => {
                let s = os
                    .to_str()
                    .ok_or_else(|| FsError::Io(io::Error::from_raw_os_error(libc::EINVAL)))?;
                out.push(s);
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(FsError::Io(io::Error::from_raw_os_error(libc::EINVAL)));
            }
        }
    }
    Ok(out)
}
