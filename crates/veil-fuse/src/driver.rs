//! FUSE drivers: forward (read-write plain view) and reverse (read-only
//! ciphertext view).
//!
//! Both implement `fuse3::path::PathFilesystem` over an `Arc` of the
//! corresponding facade. Every facade call goes through
//! `tokio::task::spawn_blocking`: the engine does synchronous disk I/O and
//! CPU-bound crypto, neither of which belongs on the async dispatcher.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::{Errno, FileType, MountOptions};
use futures_util::stream;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use veil_core::FsError;
use veil_fs::{Attr, CryptFs, EncryptedFile, EntryKind, ReverseFs};

/// TTL for dentry/attr entries in the kernel cache.
const ATTR_TTL: Duration = Duration::from_secs(1);

fn errno(err: FsError) -> Errno {
    Errno::from(err.to_errno())
}

/// Join a FUSE parent path and entry name into a mount-relative path.
fn child_path(parent: &OsStr, name: &OsStr) -> PathBuf {
    Path::new(parent).join(name)
}

fn rel_of(path: &OsStr) -> PathBuf {
    PathBuf::from(path)
}

/// Map facade attributes onto a FUSE `FileAttr`, passing the backing
/// uid/gid/permissions and timestamps through.
fn file_attr(attr: &Attr) -> FileAttr {
    use std::os::unix::fs::MetadataExt;

    let kind = match attr.kind {
        EntryKind::Dir => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
    };
    let meta = &attr.meta;
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let atime = meta.accessed().unwrap_or(mtime);

    FileAttr {
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: 0,
        blksize: 4096,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

// ── Forward driver ─────────────────────────────────────────────────────────

/// The read-write plain view over a cipher directory.
pub struct VeilFs {
    fs: Arc<CryptFs>,
    /// Open file handles: fh → engine file.
    handles: Mutex<HashMap<u64, Arc<EncryptedFile>>>,
    next_fh: AtomicU64,
}

impl VeilFs {
    pub fn new(fs: Arc<CryptFs>) -> Self {
        VeilFs {
            fs,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    async fn stat(&self, rel: PathBuf) -> fuse3::Result<Attr> {
        let fs = self.fs.clone();
        spawn_blocking(move || fs.stat(&rel))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)
    }

    async fn register(&self, file: EncryptedFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().await.insert(fh, Arc::new(file));
        fh
    }

    async fn handle(&self, fh: u64) -> fuse3::Result<Arc<EncryptedFile>> {
        self.handles
            .lock()
            .await
            .get(&fh)
            .cloned()
            .ok_or_else(|| Errno::from(libc::EBADF))
    }

    async fn listing(&self, rel: PathBuf) -> fuse3::Result<Vec<(String, FileType, Attr)>> {
        let fs = self.fs.clone();
        spawn_blocking(move || -> Result<Vec<(String, FileType, Attr)>, FsError> {
            let mut out = Vec::new();
            for entry in fs.readdir(&rel)? {
                let kind = match entry.kind {
                    EntryKind::Dir => FileType::Directory,
                    EntryKind::File => FileType::RegularFile,
                };
                match fs.stat(&rel.join(&entry.name)) {
                    Ok(attr) => out.push((entry.name, kind, attr)),
                    Err(e) => warn!(name = %entry.name, "stat during readdir failed: {e}"),
                }
            }
            Ok(out)
        })
        .await
        .map_err(|_| Errno::from(libc::EIO))?
        .map_err(errno)
    }
}

impl PathFilesystem for VeilFs {
    async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
        debug!("veilfs forward mount initialised");
        Ok(ReplyInit {
            max_write: NonZeroU32::new(128 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!("veilfs unmounted");
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<ReplyEntry> {
        let attr = self.stat(child_path(parent, name)).await?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: file_attr(&attr),
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        _flags: u32,
    ) -> fuse3::Result<ReplyAttr> {
        let path = path.ok_or_else(|| Errno::from(libc::ENOENT))?;
        let attr = self.stat(rel_of(path)).await?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: file_attr(&attr),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> fuse3::Result<ReplyAttr> {
        if let Some(size) = set_attr.size {
            let file = match fh {
                Some(fh) => self.handle(fh).await?,
                None => {
                    let path = path.ok_or_else(|| Errno::from(libc::ENOENT))?;
                    let fs = self.fs.clone();
                    let rel = rel_of(path);
                    Arc::new(
                        spawn_blocking(move || fs.open(&rel))
                            .await
                            .map_err(|_| Errno::from(libc::EIO))?
                            .map_err(errno)?,
                    )
                }
            };
            spawn_blocking(move || file.truncate(size))
                .await
                .map_err(|_| Errno::from(libc::EIO))?
                .map_err(errno)?;
        }

        let path = path.ok_or_else(|| Errno::from(libc::ENOENT))?;
        let attr = self.stat(rel_of(path)).await?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: file_attr(&attr),
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> fuse3::Result<ReplyEntry> {
        let rel = child_path(parent, name);
        let fs = self.fs.clone();
        let mkdir_rel = rel.clone();
        spawn_blocking(move || fs.mkdir(&mkdir_rel, mode))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)?;

        let attr = self.stat(rel).await?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: file_attr(&attr),
        })
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
        let rel = child_path(parent, name);
        let fs = self.fs.clone();
        spawn_blocking(move || fs.unlink(&rel))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
        let rel = child_path(parent, name);
        let fs = self.fs.clone();
        spawn_blocking(move || fs.rmdir(&rel))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> fuse3::Result<()> {
        let from = child_path(origin_parent, origin_name);
        let to = child_path(parent, name);
        let fs = self.fs.clone();
        spawn_blocking(move || fs.rename(&from, &to))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> fuse3::Result<ReplyCreated> {
        let rel = child_path(parent, name);
        let fs = self.fs.clone();
        let create_rel = rel.clone();
        let file = spawn_blocking(move || fs.create(&create_rel))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)?;
        let fh = self.register(file).await;

        let attr = self.stat(rel).await?;
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr: file_attr(&attr),
            generation: 0,
            fh,
            flags,
        })
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> fuse3::Result<ReplyOpen> {
        let rel = rel_of(path);
        let fs = self.fs.clone();
        let file = spawn_blocking(move || fs.open(&rel))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)?;
        let fh = self.register(file).await;

        if flags & libc::O_TRUNC as u32 != 0 {
            let file = self.handle(fh).await?;
            spawn_blocking(move || file.truncate(0))
                .await
                .map_err(|_| Errno::from(libc::EIO))?
                .map_err(errno)?;
        }

        Ok(ReplyOpen { fh, flags })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> fuse3::Result<ReplyData> {
        let file = self.handle(fh).await?;
        let data = spawn_blocking(move || file.read_at(offset, size as usize))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyWrite> {
        let file = self.handle(fh).await?;
        let buf = data.to_vec();
        let written = spawn_blocking(move || file.write_at(offset, &buf))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        _fh: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<()> {
        Ok(())
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _datasync: bool,
    ) -> fuse3::Result<()> {
        let file = self.handle(fh).await?;
        spawn_blocking(move || file.sync())
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> fuse3::Result<()> {
        self.handles.lock().await.remove(&fh);
        Ok(())
    }

    type DirEntryStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let listing = self.listing(rel_of(path)).await?;

        let mut entries = dot_entries(offset);
        let mut next_offset = 3i64;
        for (name, kind, _attr) in listing {
            if next_offset > offset {
                entries.push(Ok(DirectoryEntry {
                    kind,
                    name: name.into(),
                    offset: next_offset,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let dir_attr = self.stat(rel_of(path)).await?;
        let listing = self.listing(rel_of(path)).await?;
        let offset = offset as i64;

        let mut entries = dot_entries_plus(offset, file_attr(&dir_attr));
        let mut next_offset = 3i64;
        for (name, kind, attr) in listing {
            if next_offset > offset {
                entries.push(Ok(DirectoryEntryPlus {
                    kind,
                    name: name.into(),
                    offset: next_offset,
                    attr: file_attr(&attr),
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectoryPlus {
            entries: stream::iter(entries),
        })
    }

    async fn opendir(&self, _req: Request, _path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
        Ok(fake_statfs())
    }
}

// ── Reverse driver ─────────────────────────────────────────────────────────

/// The read-only synthesized ciphertext view.
pub struct VeilReverseFs {
    fs: Arc<ReverseFs>,
}

impl VeilReverseFs {
    pub fn new(fs: Arc<ReverseFs>) -> Self {
        VeilReverseFs { fs }
    }

    async fn stat(&self, rel: PathBuf) -> fuse3::Result<Attr> {
        let fs = self.fs.clone();
        spawn_blocking(move || fs.stat(&rel))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)
    }
}

impl PathFilesystem for VeilReverseFs {
    async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
        debug!("veilfs reverse mount initialised");
        Ok(ReplyInit {
            max_write: NonZeroU32::new(128 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!("veilfs reverse view unmounted");
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<ReplyEntry> {
        let attr = self.stat(child_path(parent, name)).await?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: file_attr(&attr),
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        _flags: u32,
    ) -> fuse3::Result<ReplyAttr> {
        let path = path.ok_or_else(|| Errno::from(libc::ENOENT))?;
        let attr = self.stat(rel_of(path)).await?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: file_attr(&attr),
        })
    }

    async fn open(&self, _req: Request, _path: &OsStr, flags: u32) -> fuse3::Result<ReplyOpen> {
        if flags & (libc::O_WRONLY | libc::O_RDWR) as u32 != 0 {
            return Err(Errno::from(libc::EROFS));
        }
        Ok(ReplyOpen { fh: 0, flags })
    }

    async fn read(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> fuse3::Result<ReplyData> {
        let path = path.ok_or_else(|| Errno::from(libc::ENOENT))?;
        let rel = rel_of(path);
        let fs = self.fs.clone();
        let data = spawn_blocking(move || fs.read(&rel, offset, size as usize))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    type DirEntryStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let rel = rel_of(path);
        let fs = self.fs.clone();
        let listing = spawn_blocking(move || fs.readdir(&rel))
            .await
            .map_err(|_| Errno::from(libc::EIO))?
            .map_err(errno)?;

        let mut entries = dot_entries(offset);
        let mut next_offset = 3i64;
        for entry in listing {
            if next_offset > offset {
                let kind = match entry.kind {
                    EntryKind::Dir => FileType::Directory,
                    EntryKind::File => FileType::RegularFile,
                };
                entries.push(Ok(DirectoryEntry {
                    kind,
                    name: entry.name.into(),
                    offset: next_offset,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let base = rel_of(path);
        let dir_attr = self.stat(base.clone()).await?;
        let fs = self.fs.clone();
        let list_rel = base.clone();
        let listing = spawn_blocking(move || -> Result<Vec<(String, Attr)>, FsError> {
            let mut out = Vec::new();
            for entry in fs.readdir(&list_rel)? {
                match fs.stat(&list_rel.join(&entry.name)) {
                    Ok(attr) => out.push((entry.name, attr)),
                    Err(e) => warn!(name = %entry.name, "stat during readdir failed: {e}"),
                }
            }
            Ok(out)
        })
        .await
        .map_err(|_| Errno::from(libc::EIO))?
        .map_err(errno)?;

        let offset = offset as i64;
        let mut entries = dot_entries_plus(offset, file_attr(&dir_attr));
        let mut next_offset = 3i64;
        for (name, attr) in listing {
            if next_offset > offset {
                let kind = match attr.kind {
                    EntryKind::Dir => FileType::Directory,
                    EntryKind::File => FileType::RegularFile,
                };
                entries.push(Ok(DirectoryEntryPlus {
                    kind,
                    name: name.into(),
                    offset: next_offset,
                    attr: file_attr(&attr),
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectoryPlus {
            entries: stream::iter(entries),
        })
    }

    async fn opendir(&self, _req: Request, _path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
        Ok(fake_statfs())
    }
}

// ── shared bits ────────────────────────────────────────────────────────────

fn dot_entries(offset: i64) -> Vec<fuse3::Result<DirectoryEntry>> {
    let mut entries = Vec::new();
    if offset == 0 {
        entries.push(Ok(DirectoryEntry {
            kind: FileType::Directory,
            name: ".".into(),
            offset: 1,
        }));
    }
    if offset <= 1 {
        entries.push(Ok(DirectoryEntry {
            kind: FileType::Directory,
            name: "..".into(),
            offset: 2,
        }));
    }
    entries
}

fn dot_entries_plus(offset: i64, attr: FileAttr) -> Vec<fuse3::Result<DirectoryEntryPlus>> {
    let mut entries = Vec::new();
    if offset == 0 {
        entries.push(Ok(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: ".".into(),
            offset: 1,
            attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        }));
    }
    if offset <= 1 {
        entries.push(Ok(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: "..".into(),
            offset: 2,
            attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        }));
    }
    entries
}

fn fake_statfs() -> ReplyStatFs {
    ReplyStatFs {
        blocks: 1 << 30,
        bfree: 1 << 29,
        bavail: 1 << 29,
        files: 1 << 20,
        ffree: 1 << 19,
        bsize: 4096,
        namelen: 255,
        frsize: 4096,
    }
}

/// Mount configuration shared by both directions.
pub struct MountConfig {
    pub mountpoint: PathBuf,
    pub read_only: bool,
    pub allow_other: bool,
}

fn mount_options(cfg: &MountConfig, fs_name: &str) -> MountOptions {
    let mut opts = MountOptions::default();
    opts.fs_name(fs_name);
    opts.read_only(cfg.read_only);
    opts.force_readdir_plus(true);
    if cfg.allow_other {
        opts.allow_other(true);
    }
    opts
}

/// Mount the plain view and block until it is unmounted.
pub async fn mount_forward(fs: Arc<CryptFs>, cfg: MountConfig) -> std::io::Result<()> {
    let opts = mount_options(&cfg, "veilfs");
    info!(mountpoint = %cfg.mountpoint.display(), "mounting veilfs (unprivileged via fusermount3)");
    let handle = Session::new(opts)
        .mount_with_unprivileged(VeilFs::new(fs), &cfg.mountpoint)
        .await?;
    handle.await
}

/// Mount the reverse (ciphertext) view and block until it is unmounted.
pub async fn mount_reverse(fs: Arc<ReverseFs>, cfg: MountConfig) -> std::io::Result<()> {
    let mut cfg = cfg;
    cfg.read_only = true;
    let opts = mount_options(&cfg, "veilfs-reverse");
    info!(mountpoint = %cfg.mountpoint.display(), "mounting reverse view (read-only)");
    let handle = Session::new(opts)
        .mount_with_unprivileged(VeilReverseFs::new(fs), &cfg.mountpoint)
        .await?;
    handle.await
}
