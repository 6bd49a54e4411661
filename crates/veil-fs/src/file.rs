//! Per-file content engine
//!
//! Owns one ciphertext backing file and exposes plaintext-addressed
//! operations. The stored layout is `header || blocks`; the header
//! (`version || file id`) is written exactly once, when the file first goes
//! from empty to non-empty, and discarded by truncate-to-zero.
//!
//! Writes that start or end mid-block read the affected edge block, splice
//! the new bytes in, and re-encrypt under a fresh nonce; fully covered
//! blocks are written without a prior read. Sparse regions of the backing
//! file read back as all-zero stored blocks, which the codec treats as
//! holes.
//!
//! All operations lock the backing inode: writes and truncates exclusively,
//! reads shared. The lock is shared between every open handle of the same
//! file, so no read-modify-write can interleave with another write.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::RngCore;
use tracing::trace;
use veil_core::{FsError, FsResult};
use veil_crypto::{
    ContentCrypter, BLOCK_SIZE, CIPHER_BLOCK_SIZE, FID_SIZE, HEADER_SIZE, HEADER_VERSION,
};

use crate::layout::{self, BlockSpan};

/// An open plaintext view of one ciphertext backing file.
pub struct EncryptedFile {
    backing: File,
    crypter: Arc<ContentCrypter>,
    lock: Arc<RwLock<()>>,
    /// Cached file id, valid for the life of the handle (dropped when this
    /// handle truncates the file to zero).
    fid: Mutex<Option<[u8; FID_SIZE]>>,
}

impl EncryptedFile {
    /// Wrap an already opened backing file.
    ///
    /// Parses the header eagerly when one exists so a version mismatch
    /// surfaces at open time, not on first read.
    pub fn new(
        backing: File,
        crypter: Arc<ContentCrypter>,
        lock: Arc<RwLock<()>>,
    ) -> FsResult<Self> {
        let file = Self {
            backing,
            crypter,
            lock,
            fid: Mutex::new(None),
        };
        if file.cipher_len()? >= HEADER_SIZE as u64 {
            file.read_fid()?;
        }
        Ok(file)
    }

    /// Logical file size.
    pub fn size(&self) -> FsResult<u64> {
        let _g = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(layout::plain_size(self.cipher_len()?))
    }

    /// Read up to `len` bytes at plaintext offset `off`. Returns fewer bytes
    /// only at end of file. Any covered block that fails authentication
    /// fails the whole read; no unverified bytes are returned.
    pub fn read_at(&self, off: u64, len: usize) -> FsResult<Vec<u8>> {
        let _g = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        let size = layout::plain_size(self.cipher_len()?);
        if len == 0 || off >= size {
            return Ok(Vec::new());
        }
        let want = len.min((size - off) as usize);
        let fid = self.read_fid()?;

        let mut out = Vec::with_capacity(want);
        for span in layout::spans(off, want) {
            let Some(block) = self.read_block(span.block_no, &fid)? else {
                break;
            };
            if span.offset >= block.len() {
                break;
            }
            let end = block.len().min(span.offset + span.len);
            out.extend_from_slice(&block[span.offset..end]);
            if end < span.offset + span.len {
                break;
            }
        }
        Ok(out)
    }

    /// Write `data` at plaintext offset `off`, growing the file as needed.
    pub fn write_at(&self, off: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let _g = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let fid = self.ensure_header()?;
        let size = layout::plain_size(self.cipher_len()?);

        // Writing past the end: the current last block must become a full
        // block first, otherwise its slot would carry trailing garbage.
        // Whole missing blocks in between stay sparse and read as holes.
        if off > size && !is_aligned(size) && layout::block_no(off) != layout::block_no(size) {
            self.fill_last_block(size, &fid)?;
        }

        for span in layout::spans(off, data.len()) {
            let chunk_start = (span.block_no * BLOCK_SIZE as u64 + span.offset as u64 - off) as usize;
            let chunk = &data[chunk_start..chunk_start + span.len];

            if span.is_full() {
                self.write_block(span.block_no, &fid, chunk)?;
            } else {
                self.rmw_block(&span, &fid, chunk)?;
            }
        }
        Ok(data.len())
    }

    /// Set the logical file length to exactly `size`.
    pub fn truncate(&self, size: u64) -> FsResult<()> {
        let _g = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let old = layout::plain_size(self.cipher_len()?);
        if size == old {
            return Ok(());
        }
        if size == 0 {
            self.backing.set_len(0)?;
            *self.fid.lock().unwrap_or_else(PoisonError::into_inner) = None;
            trace!("truncated to zero, header discarded");
            return Ok(());
        }
        if size < old {
            self.shrink(size, old)
        } else {
            self.grow(size, old)
        }
    }

    /// Flush backing data and metadata to disk.
    pub fn sync(&self) -> FsResult<()> {
        self.backing.sync_all()?;
        Ok(())
    }

    // ── truncate internals (write lock held) ─────────────────────────────

    fn shrink(&self, size: u64, _old: u64) -> FsResult<()> {
        let fid = self.read_fid()?;
        let keep = size / BLOCK_SIZE as u64;
        let rem = (size % BLOCK_SIZE as u64) as usize;

        if rem == 0 {
            self.backing.set_len(layout::block_offset(keep))?;
            return Ok(());
        }

        // The new final block is a shortened rewrite of the old block at
        // that position. All fallible decryption happens before any
        // mutation, so a failure leaves the old state intact.
        let mut block = self
            .read_block(keep, &fid)?
            .ok_or(FsError::AuthenticationFailure)?;
        block.truncate(rem);
        self.write_block(keep, &fid, &block)?;
        self.backing.set_len(layout::cipher_size(size))?;
        Ok(())
    }

    fn grow(&self, size: u64, old: u64) -> FsResult<()> {
        let fid = self.ensure_header()?;
        let rem = (size % BLOCK_SIZE as u64) as usize;

        // Growing within the current final block: just extend it.
        if rem != 0 && !is_aligned(old) && layout::block_no(old) == layout::block_no(size - 1) {
            let no = layout::block_no(old);
            let mut block = self.read_block(no, &fid)?.unwrap_or_default();
            block.resize(rem, 0);
            self.write_block(no, &fid, &block)?;
            return Ok(());
        }

        if !is_aligned(old) {
            self.fill_last_block(old, &fid)?;
        }

        let full = size / BLOCK_SIZE as u64;
        // Intermediate full blocks extend as sparse holes.
        self.backing.set_len(layout::block_offset(full))?;
        if rem != 0 {
            // Partial final block: explicitly written encrypted zeros.
            self.write_block(full, &fid, &vec![0u8; rem])?;
        }
        Ok(())
    }

    /// Extend the partial final block at `size` to a full block of zeros.
    fn fill_last_block(&self, size: u64, fid: &[u8; FID_SIZE]) -> FsResult<()> {
        let no = layout::block_no(size);
        let mut block = self.read_block(no, fid)?.unwrap_or_default();
        block.resize(BLOCK_SIZE, 0);
        self.write_block(no, fid, &block)
    }

    // ── block access (lock held) ─────────────────────────────────────────

    /// Read and decrypt block `no`. `None` when the block lies beyond the
    /// end of the ciphertext file.
    fn read_block(&self, no: u64, fid: &[u8; FID_SIZE]) -> FsResult<Option<Vec<u8>>> {
        let mut buf = vec![0u8; CIPHER_BLOCK_SIZE];
        let n = read_full_at(&self.backing, &mut buf, layout::block_offset(no))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(self.crypter.decrypt_block(no, fid, &buf)?))
    }

    /// Encrypt and store block `no`.
    fn write_block(&self, no: u64, fid: &[u8; FID_SIZE], plaintext: &[u8]) -> FsResult<()> {
        let block = self.crypter.encrypt_block(no, fid, plaintext)?;
        write_full_at(&self.backing, &block, layout::block_offset(no))?;
        Ok(())
    }

    /// Read-modify-write one edge block: decrypt (or assume zeros for a
    /// missing block), splice the new bytes in, re-encrypt.
    fn rmw_block(&self, span: &BlockSpan, fid: &[u8; FID_SIZE], chunk: &[u8]) -> FsResult<()> {
        let mut block = self.read_block(span.block_no, fid)?.unwrap_or_default();
        let end = span.offset + span.len;
        if block.len() < end {
            block.resize(end, 0);
        }
        block[span.offset..end].copy_from_slice(chunk);
        self.write_block(span.block_no, fid, &block)
    }

    // ── header handling ──────────────────────────────────────────────────

    fn cipher_len(&self) -> io::Result<u64> {
        Ok(self.backing.metadata()?.len())
    }

    /// The file id, creating the header when the file is still empty.
    /// Caller must hold the write lock.
    fn ensure_header(&self) -> FsResult<[u8; FID_SIZE]> {
        if self.cipher_len()? >= HEADER_SIZE as u64 {
            return self.read_fid();
        }

        let mut fid = [0u8; FID_SIZE];
        rand::thread_rng().fill_bytes(&mut fid);

        let mut header = [0u8; HEADER_SIZE];
        header[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        header[2..].copy_from_slice(&fid);
        write_full_at(&self.backing, &header, 0)?;

        *self.fid.lock().unwrap_or_else(PoisonError::into_inner) = Some(fid);
        trace!(fid = ?fid, "wrote file header");
        Ok(fid)
    }

    /// The cached file id, reading the header on first use.
    fn read_fid(&self) -> FsResult<[u8; FID_SIZE]> {
        let mut cached = self.fid.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fid) = *cached {
            return Ok(fid);
        }

        let mut header = [0u8; HEADER_SIZE];
        let n = read_full_at(&self.backing, &mut header, 0)?;
        if n < HEADER_SIZE {
            return Err(FsError::AuthenticationFailure);
        }
        let version = u16::from_be_bytes([header[0], header[1]]);
        if version != HEADER_VERSION {
            return Err(FsError::UnsupportedConfig(format!(
                "file header version {version} (expected {HEADER_VERSION})"
            )));
        }

        let mut fid = [0u8; FID_SIZE];
        fid.copy_from_slice(&header[2..]);
        *cached = Some(fid);
        Ok(fid)
    }
}

fn is_aligned(off: u64) -> bool {
    off % BLOCK_SIZE as u64 == 0
}

/// Read at `off` until `buf` is full or end of file. Returns bytes read.
pub(crate) fn read_full_at(file: &File, buf: &mut [u8], mut off: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], off) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                off += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Write all of `buf` at `off`. A zero-length write from the OS is an error,
/// never silently ignored.
fn write_full_at(file: &File, buf: &[u8], mut off: u64) -> io::Result<()> {
    let mut remaining = buf;
    while !remaining.is_empty() {
        match file.write_at(remaining, off) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                remaining = &remaining[n..];
                off += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;
    use veil_core::AeadBackend;

    fn open_file(dir: &TempDir, name: &str) -> EncryptedFile {
        let crypter =
            Arc::new(ContentCrypter::new(&[0x13u8; 32], AeadBackend::RustCrypto).unwrap());
        let backing = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.path().join(name))
            .unwrap();
        EncryptedFile::new(backing, crypter, Arc::new(RwLock::new(()))).unwrap()
    }

    #[test]
    fn empty_file_reads_nothing() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        assert_eq!(f.size().unwrap(), 0);
        assert!(f.read_at(0, 100).unwrap().is_empty());
    }

    #[test]
    fn write_then_read_small() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, b"hello world").unwrap();
        assert_eq!(f.size().unwrap(), 11);
        assert_eq!(f.read_at(0, 11).unwrap(), b"hello world");
        assert_eq!(f.read_at(6, 100).unwrap(), b"world");
    }

    #[test]
    fn header_written_once() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, b"x").unwrap();
        let hdr1 = std::fs::read(dir.path().join("a")).unwrap()[..HEADER_SIZE].to_vec();
        f.write_at(4096, b"y").unwrap();
        let hdr2 = std::fs::read(dir.path().join("a")).unwrap()[..HEADER_SIZE].to_vec();
        assert_eq!(hdr1, hdr2);
        assert_eq!(u16::from_be_bytes([hdr1[0], hdr1[1]]), HEADER_VERSION);
    }

    #[test]
    fn unaligned_overwrite_preserves_neighbours() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, &vec![b'a'; 8192]).unwrap();
        f.write_at(4000, &vec![b'b'; 200]).unwrap();

        let data = f.read_at(0, 8192).unwrap();
        assert_eq!(&data[..4000], &vec![b'a'; 4000][..]);
        assert_eq!(&data[4000..4200], &vec![b'b'; 200][..]);
        assert_eq!(&data[4200..], &vec![b'a'; 8192 - 4200][..]);
    }

    #[test]
    fn sparse_hole_reads_zero() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, b"foo").unwrap();
        f.write_at(4096, b"foo").unwrap();

        assert_eq!(f.size().unwrap(), 4099);
        let data = f.read_at(0, 4099).unwrap();
        assert_eq!(&data[..3], b"foo");
        assert_eq!(&data[3..4096], &vec![0u8; 4093][..]);
        assert_eq!(&data[4096..], b"foo");
    }

    #[test]
    fn gap_spanning_multiple_blocks() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, b"start").unwrap();
        f.write_at(3 * 4096 + 10, b"end").unwrap();

        let size = 3 * 4096 + 13;
        assert_eq!(f.size().unwrap(), size);
        let data = f.read_at(0, size as usize).unwrap();
        assert_eq!(&data[..5], b"start");
        assert!(data[5..3 * 4096 + 10].iter().all(|&b| b == 0));
        assert_eq!(&data[3 * 4096 + 10..], b"end");
    }

    #[test]
    fn truncate_shrink_and_grow() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, &vec![7u8; 9000]).unwrap();

        f.truncate(5000).unwrap();
        assert_eq!(f.size().unwrap(), 5000);
        assert_eq!(f.read_at(0, 5000).unwrap(), vec![7u8; 5000]);

        f.truncate(9000).unwrap();
        assert_eq!(f.size().unwrap(), 9000);
        let data = f.read_at(0, 9000).unwrap();
        assert_eq!(&data[..5000], &vec![7u8; 5000][..]);
        assert_eq!(&data[5000..], &vec![0u8; 4000][..]);
    }

    #[test]
    fn truncate_to_zero_discards_header() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, b"data").unwrap();
        f.truncate(0).unwrap();

        assert_eq!(f.size().unwrap(), 0);
        assert_eq!(std::fs::metadata(dir.path().join("a")).unwrap().len(), 0);

        // Writable again with a fresh header.
        f.write_at(0, b"new").unwrap();
        assert_eq!(f.read_at(0, 3).unwrap(), b"new");
    }

    #[test]
    fn tampering_fails_read() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, &vec![1u8; 5000]).unwrap();

        let path = dir.path().join("a");
        let mut raw = std::fs::read(&path).unwrap();
        let victim = HEADER_SIZE + 100; // inside block 0
        raw[victim] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        assert!(matches!(
            f.read_at(0, 5000),
            Err(FsError::AuthenticationFailure)
        ));
        // Block 1 is untouched and still readable.
        assert_eq!(f.read_at(4096, 904).unwrap(), vec![1u8; 904]);
    }

    #[test]
    fn bad_header_version_fails_open() {
        let dir = TempDir::new().unwrap();
        {
            let f = open_file(&dir, "a");
            f.write_at(0, b"data").unwrap();
        }
        let path = dir.path().join("a");
        let mut raw = std::fs::read(&path).unwrap();
        raw[1] = 9; // header version 2 → 9
        std::fs::write(&path, &raw).unwrap();

        let crypter =
            Arc::new(ContentCrypter::new(&[0x13u8; 32], AeadBackend::RustCrypto).unwrap());
        let backing = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(matches!(
            EncryptedFile::new(backing, crypter, Arc::new(RwLock::new(()))),
            Err(FsError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn idempotent_overwrite_same_plaintext() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        f.write_at(0, &vec![3u8; 6000]).unwrap();
        let first = f.read_at(0, 6000).unwrap();
        f.write_at(0, &vec![3u8; 6000]).unwrap();
        assert_eq!(f.read_at(0, 6000).unwrap(), first);
        assert_eq!(f.size().unwrap(), 6000);
    }

    #[test]
    fn cipher_file_layout_matches_arithmetic() {
        let dir = TempDir::new().unwrap();
        let f = open_file(&dir, "a");
        for n in [1u64, 4095, 4096, 4097, 7000] {
            f.truncate(0).unwrap();
            f.write_at(0, &vec![9u8; n as usize]).unwrap();
            let disk = std::fs::metadata(dir.path().join("a")).unwrap().len();
            assert_eq!(disk, layout::cipher_size(n), "n={n}");
        }
    }
}
