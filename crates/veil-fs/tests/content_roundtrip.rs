//! Content round-trip tests against the facade: zero-fill writes of several
//! sizes with pinned digests, append behaviour, and sparse files.

use md5::{Digest, Md5};
use std::path::Path;
use tempfile::TempDir;
use veil_core::{AeadBackend, MountOptions};
use veil_crypto::{KeyStore, MasterKey};
use veil_fs::{diriv, CryptFs};

fn md5hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn mount(dir: &TempDir) -> CryptFs {
    diriv::init_dir_iv(dir.path()).unwrap();
    let keys = KeyStore::new(MasterKey::zero()).unwrap();
    let opts = MountOptions {
        plaintext_names: false,
        reverse: false,
        backend: AeadBackend::RustCrypto,
    };
    CryptFs::new(dir.path().to_path_buf(), &keys, &opts).unwrap()
}

/// Write `n` zero bytes, read them back, compare digests.
fn write_n_zeros(fs: &CryptFs, name: &str, n: usize) {
    let f = fs.create(Path::new(name)).unwrap();
    let data = vec![0u8; n];
    assert_eq!(f.write_at(0, &data).unwrap(), n);
    assert_eq!(f.size().unwrap(), n as u64);

    let read = f.read_at(0, n).unwrap();
    assert_eq!(read.len(), n);
    assert_eq!(md5hex(&read), md5hex(&data), "content mismatch at n={n}");
}

#[test]
fn write_10() {
    let dir = TempDir::new().unwrap();
    write_n_zeros(&mount(&dir), "10", 10);
}

#[test]
fn write_100() {
    let dir = TempDir::new().unwrap();
    write_n_zeros(&mount(&dir), "100", 100);
}

#[test]
fn write_1m() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("1M")).unwrap();
    let n = 1024 * 1024;
    f.write_at(0, &vec![0u8; n]).unwrap();

    let read = f.read_at(0, n).unwrap();
    assert_eq!(read.len(), n);
    assert_eq!(md5hex(&read), "b6d81b360a5672d80c27430f39153e2c");
}

#[test]
fn repeated_reads_are_stable() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("stable")).unwrap();
    f.write_at(0, &vec![0u8; 1024 * 1024]).unwrap();

    let want = md5hex(&f.read_at(0, 1024 * 1024).unwrap());
    for i in 0..100 {
        let got = md5hex(&f.read_at(0, 1024 * 1024).unwrap());
        assert_eq!(got, want, "read corruption in loop #{i}");
    }
}

#[test]
fn append_chain_matches_in_memory_buffer() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("append")).unwrap();

    let data = b"testdata123456789"; // length 17
    let mut buf = Vec::new();
    let mut want = String::new();

    for _ in 0..=500 {
        let off = f.size().unwrap();
        f.write_at(off, data).unwrap();
        buf.extend_from_slice(data);
        want = md5hex(&buf);

        let got = md5hex(&f.read_at(0, buf.len()).unwrap());
        assert_eq!(got, want);
    }

    // Overwriting with the same bytes must not change the digest.
    let mut off = 0u64;
    for _ in 0..=500 {
        f.write_at(off, data).unwrap();
        off += data.len() as u64;
        let got = md5hex(&f.read_at(0, buf.len()).unwrap());
        assert_eq!(got, want);
    }
}

#[test]
fn file_holes_roundtrip() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("fileholes")).unwrap();

    f.write_at(0, b"foo").unwrap();
    f.write_at(4096, b"foo").unwrap();

    assert_eq!(f.size().unwrap(), 4099);
    let data = f.read_at(0, 4099).unwrap();
    assert_eq!(data.len(), 4099);
    assert_eq!(&data[..3], b"foo");
    assert!(data[3..4096].iter().all(|&b| b == 0), "gap must read as zeros");
    assert_eq!(&data[4096..], b"foo");
}

#[test]
fn random_offset_writes_read_back() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("offsets")).unwrap();

    // Straddle every interesting alignment.
    for (off, len) in [
        (0u64, 1usize),
        (4095, 2),
        (4096, 4096),
        (5000, 10_000),
        (12_287, 1),
    ] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        f.write_at(off, &payload).unwrap();
        assert_eq!(f.read_at(off, len).unwrap(), payload, "off={off} len={len}");
        assert!(f.size().unwrap() >= off + len as u64);
    }
}
