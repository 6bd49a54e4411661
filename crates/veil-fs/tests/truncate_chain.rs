//! Truncate semantics: the grow/shrink digest chain, size reporting, and
//! zero-fill of regions exposed by growing.

use md5::{Digest, Md5};
use std::path::Path;
use tempfile::TempDir;
use veil_core::{AeadBackend, MountOptions};
use veil_crypto::{KeyStore, MasterKey};
use veil_fs::{diriv, CryptFs, EncryptedFile};

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

fn digest_of(f: &EncryptedFile) -> String {
    let size = f.size().unwrap() as usize;
    let data = f.read_at(0, size).unwrap();
    assert_eq!(data.len(), size);
    md5hex(&data)
}

#[test]
fn truncate_digest_chain() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("truncate")).unwrap();

    // Grow to two blocks.
    f.truncate(7000).unwrap();
    assert_eq!(f.size().unwrap(), 7000);
    assert_eq!(digest_of(&f), "95d4ec7038e3e4fdbd5f15c34c3f0b34");

    // Shrink by one byte: read-modify-write of the final block.
    f.truncate(6999).unwrap();
    assert_eq!(f.size().unwrap(), 6999);
    assert_eq!(digest_of(&f), "35fd15873ec6c35380064a41b9b9683b");

    // Shrink to one partial block.
    f.truncate(465).unwrap();
    assert_eq!(f.size().unwrap(), 465);
    assert_eq!(digest_of(&f), "a1534d6e98a6b21386456a8f66c55260");

    // Grow to exactly one block.
    f.truncate(4096).unwrap();
    assert_eq!(f.size().unwrap(), 4096);
    assert_eq!(digest_of(&f), "620f0b67a91f7f74151bc5be745b7110");
}

#[test]
fn truncate_grow_exposes_zeros_over_data() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("t")).unwrap();

    f.write_at(0, &vec![0xEEu8; 6000]).unwrap();
    f.truncate(2000).unwrap();
    f.truncate(10_000).unwrap();

    let data = f.read_at(0, 10_000).unwrap();
    assert_eq!(&data[..2000], &vec![0xEEu8; 2000][..]);
    assert!(data[2000..].iter().all(|&b| b == 0));
}

#[test]
fn truncate_to_zero_then_rewrite() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("t")).unwrap();

    f.write_at(0, &vec![1u8; 5000]).unwrap();
    f.truncate(0).unwrap();
    assert_eq!(f.size().unwrap(), 0);
    assert!(f.read_at(0, 100).unwrap().is_empty());

    f.write_at(0, b"fresh").unwrap();
    assert_eq!(f.read_at(0, 5).unwrap(), b"fresh");
}

#[test]
fn truncate_is_exact_for_many_lengths() {
    let dir = TempDir::new().unwrap();
    let fs = mount(&dir);
    let f = fs.create(Path::new("t")).unwrap();

    for n in [1u64, 465, 4095, 4096, 4097, 6999, 7000, 8192, 12_288, 100] {
        f.truncate(n).unwrap();
        assert_eq!(f.size().unwrap(), n, "size after truncate({n})");
        let data = f.read_at(0, n as usize + 16).unwrap();
        assert_eq!(data.len() as u64, n, "read length after truncate({n})");
    }
}
