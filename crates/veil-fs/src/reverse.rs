//! Reverse mode: a read-only synthesized ciphertext view
//!
//! The plaintext directory is the real data; this module presents what the
//! cipher directory *would* contain, computed on demand. So the view is
//! stable across mounts, everything random in forward mode is derived
//! deterministically here via HKDF from the master key:
//!
//! - each directory's IV from its relative path,
//! - each file's id from its relative path,
//! - each block's nonce from the file id and block number.
//!
//! Forward mode's fresh-CSPRNG-nonce rule binds writes; reverse mode never
//! writes, and a (file id, block number) pair is only ever sealed over the
//! same plaintext within one view.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;
use veil_core::{FsError, FsResult, MountOptions};
use veil_crypto::names::is_long_name;
use veil_crypto::{
    ContentCrypter, KeyStore, NameTransform, CONF_NAME, DIRIV_NAME, DIRIV_SIZE, FID_SIZE,
    HEADER_SIZE, HEADER_VERSION, NONCE_SIZE, REVERSE_CONF_NAME,
};

use crate::file;
use crate::fs::{Attr, DirEntry, EntryKind};
use crate::layout;

pub struct ReverseFs {
    plain_root: PathBuf,
    crypter: Arc<ContentCrypter>,
    names: Option<NameTransform>,
    keys: KeyStore,
}

impl ReverseFs {
    pub fn new(plain_root: PathBuf, keys: KeyStore, opts: &MountOptions) -> FsResult<Self> {
        let crypter = Arc::new(ContentCrypter::new(keys.content_key(), opts.backend)?);
        let names = if opts.plaintext_names {
            None
        } else {
            Some(NameTransform::new(keys.name_key()))
        };
        Ok(Self {
            plain_root,
            crypter,
            names,
            keys,
        })
    }

    /// List the synthesized cipher directory at ciphertext path `rel`.
    pub fn readdir(&self, rel: &Path) -> FsResult<Vec<DirEntry>> {
        let plain_rel = self.decrypt_path(rel)?;
        let dir = self.plain_root.join(&plain_rel);
        let at_root = plain_rel.is_empty();

        let mut out = Vec::new();
        if let Some(names) = &self.names {
            out.push(DirEntry {
                name: DIRIV_NAME.to_string(),
                kind: EntryKind::File,
            });
            if at_root {
                out.push(DirEntry {
                    name: CONF_NAME.to_string(),
                    kind: EntryKind::File,
                });
            }

            let iv = self.dir_iv_for(&plain_rel)?;
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if at_root && name == REVERSE_CONF_NAME {
                    continue;
                }
                let Some(kind) = entry_kind(&entry)? else {
                    continue;
                };
                let encrypted = names.encrypt_name(&name, &iv)?;
                if is_long_name(&encrypted) {
                    warn!(name = %name, "name too long for the synthesized view, skipping");
                    continue;
                }
                out.push(DirEntry {
                    name: encrypted,
                    kind,
                });
            }
        } else {
            if at_root {
                out.push(DirEntry {
                    name: CONF_NAME.to_string(),
                    kind: EntryKind::File,
                });
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if at_root && name == REVERSE_CONF_NAME {
                    continue;
                }
                let Some(kind) = entry_kind(&entry)? else {
                    continue;
                };
                out.push(DirEntry { name, kind });
            }
        }
        Ok(out)
    }

    /// Attributes of one synthesized entry.
    pub fn stat(&self, rel: &Path) -> FsResult<Attr> {
        match self.classify(rel)? {
            Entry::DirIv { dir_rel } => {
                let meta = fs::symlink_metadata(self.plain_root.join(&dir_rel))?;
                Ok(Attr {
                    size: DIRIV_SIZE as u64,
                    kind: EntryKind::File,
                    meta,
                })
            }
            Entry::Conf => {
                let meta = fs::symlink_metadata(self.conf_path())?;
                Ok(Attr {
                    size: meta.len(),
                    kind: EntryKind::File,
                    meta,
                })
            }
            Entry::Real { plain_rel } => {
                let meta = fs::symlink_metadata(self.plain_root.join(&plain_rel))?;
                let (size, kind) = if meta.is_dir() {
                    (meta.len(), EntryKind::Dir)
                } else {
                    (layout::cipher_size(meta.len()), EntryKind::File)
                };
                Ok(Attr { size, kind, meta })
            }
        }
    }

    /// Read `len` bytes of synthesized ciphertext at offset `off`.
    pub fn read(&self, rel: &Path, off: u64, len: usize) -> FsResult<Vec<u8>> {
        match self.classify(rel)? {
            Entry::DirIv { dir_rel } => {
                let iv = self.dir_iv_for(&dir_rel)?;
                Ok(slice_range(&iv, off, len))
            }
            Entry::Conf => {
                let data = fs::read(self.conf_path())?;
                Ok(slice_range(&data, off, len))
            }
            Entry::Real { plain_rel } => self.read_file(&plain_rel, off, len),
        }
    }

    // ── synthesis internals ──────────────────────────────────────────────

    fn read_file(&self, plain_rel: &str, off: u64, len: usize) -> FsResult<Vec<u8>> {
        let plain = fs::File::open(self.plain_root.join(plain_rel))?;
        let plain_len = plain.metadata()?.len();
        let total = layout::cipher_size(plain_len);
        if off >= total || len == 0 {
            return Ok(Vec::new());
        }
        let end = total.min(off + len as u64);
        let fid = self.fid_for(plain_rel)?;

        let mut out = Vec::with_capacity((end - off) as usize);
        let mut pos = off;

        if pos < HEADER_SIZE as u64 {
            let mut header = [0u8; HEADER_SIZE];
            header[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
            header[2..].copy_from_slice(&fid);
            let stop = end.min(HEADER_SIZE as u64);
            out.extend_from_slice(&header[pos as usize..stop as usize]);
            pos = stop;
        }

        while pos < end {
            let block_no = layout::block_no_of_cipher_offset(pos);
            let block_start = layout::block_offset(block_no);

            let mut plain_block = vec![0u8; veil_crypto::BLOCK_SIZE];
            let n = file::read_full_at(
                &plain,
                &mut plain_block,
                block_no * veil_crypto::BLOCK_SIZE as u64,
            )?;
            plain_block.truncate(n);

            let nonce = self.nonce_for(&fid, block_no)?;
            let sealed = self
                .crypter
                .seal_block_at(&nonce, block_no, &fid, &plain_block)?;

            let from = (pos - block_start) as usize;
            let to = sealed.len().min((end - block_start) as usize);
            if from >= to {
                break;
            }
            out.extend_from_slice(&sealed[from..to]);
            pos = block_start + to as u64;
            if to < sealed.len() {
                break;
            }
        }
        Ok(out)
    }

    /// Classify a ciphertext path into diriv / conf / real entry.
    fn classify(&self, rel: &Path) -> FsResult<Entry> {
        let comps = cipher_components(rel)?;
        if self.names.is_some() {
            if let Some((last, parents)) = comps.split_last() {
                if *last == DIRIV_NAME {
                    return Ok(Entry::DirIv {
                        dir_rel: self.decrypt_components(parents)?,
                    });
                }
            }
        }
        if comps == [CONF_NAME] {
            return Ok(Entry::Conf);
        }
        Ok(Entry::Real {
            plain_rel: self.decrypt_components(&comps)?,
        })
    }

    fn decrypt_path(&self, rel: &Path) -> FsResult<String> {
        let comps = cipher_components(rel)?;
        self.decrypt_components(&comps)
    }

    /// Walk ciphertext components down the plaintext tree, decrypting each
    /// under its directory's derived IV.
    fn decrypt_components(&self, comps: &[&str]) -> FsResult<String> {
        let Some(names) = &self.names else {
            return Ok(comps.join("/"));
        };
        let mut plain_rel = String::new();
        for comp in comps {
            let iv = self.dir_iv_for(&plain_rel)?;
            let plain = names.decrypt_name(comp, &iv)?;
            if !plain_rel.is_empty() {
                plain_rel.push('/');
            }
            plain_rel.push_str(&plain);
        }
        Ok(plain_rel)
    }

    fn conf_path(&self) -> PathBuf {
        self.plain_root.join(REVERSE_CONF_NAME)
    }

    fn dir_iv_for(&self, plain_rel: &str) -> FsResult<[u8; DIRIV_SIZE]> {
        let mut iv = [0u8; DIRIV_SIZE];
        let info = [b"veilfs reverse dir iv\0".as_ref(), plain_rel.as_bytes()].concat();
        self.keys.expand_into(&info, &mut iv)?;
        Ok(iv)
    }

    fn fid_for(&self, plain_rel: &str) -> FsResult<[u8; FID_SIZE]> {
        let mut fid = [0u8; FID_SIZE];
        let info = [b"veilfs reverse file id\0".as_ref(), plain_rel.as_bytes()].concat();
        self.keys.expand_into(&info, &mut fid)?;
        Ok(fid)
    }

    fn nonce_for(&self, fid: &[u8; FID_SIZE], block_no: u64) -> FsResult<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        let info = [
            b"veilfs reverse block nonce\0".as_ref(),
            fid,
            &block_no.to_be_bytes(),
        ]
        .concat();
        self.keys.expand_into(&info, &mut nonce)?;
        Ok(nonce)
    }
}

enum Entry {
    DirIv { dir_rel: String },
    Conf,
    Real { plain_rel: String },
}

fn entry_kind(entry: &fs::DirEntry) -> FsResult<Option<EntryKind>> {
    let file_type = entry.file_type()?;
    if file_type.is_dir() {
        Ok(Some(EntryKind::Dir))
    } else if file_type.is_file() {
        Ok(Some(EntryKind::File))
    } else {
        Ok(None)
    }
}

fn cipher_components(rel: &Path) -> FsResult<Vec<&str>> {
    let mut out = Vec::new();
    for comp in rel.components() {
        match comp {
            std::path::Component::Normal(os) => {
                let s = os
                    .to_str()
                    .ok_or_else(|| FsError::Io(io::Error::from_raw_os_error(libc::EINVAL)))?;
                out.push(s);
            }
            std::path::Component::RootDir | std::path::Component::CurDir => {}
            _ => return Err(FsError::Io(io::Error::from_raw_os_error(libc::EINVAL))),
        }
    }
    Ok(out)
}

fn slice_range(data: &[u8], off: u64, len: usize) -> Vec<u8> {
    if off >= data.len() as u64 {
        return Vec::new();
    }
    let start = off as usize;
    let end = data.len().min(start + len);
    data[start..end].to_vec()
}
