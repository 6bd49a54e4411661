//! Key store: master key → content and filename subkeys via HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;
use veil_core::{FsError, FsResult};
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::KEY_SIZE;

const CONTENT_KEY_INFO: &[u8] = b"AES-GCM file content encryption";
const NAME_KEY_INFO: &[u8] = b"CBC filename encryption";

/// The per-mount key material. Immutable after mount, freely shared across
/// threads; all key bytes are zeroized on drop.
pub struct KeyStore {
    master: MasterKey,
    content_key: [u8; KEY_SIZE],
    name_key: [u8; KEY_SIZE],
}

impl KeyStore {
    pub fn new(master: MasterKey) -> FsResult<Self> {
        let content_key = hkdf_derive(master.as_bytes(), CONTENT_KEY_INFO)?;
        let name_key = hkdf_derive(master.as_bytes(), NAME_KEY_INFO)?;
        Ok(Self {
            master,
            content_key,
            name_key,
        })
    }

    /// Key for the block codec.
    pub fn content_key(&self) -> &[u8; KEY_SIZE] {
        &self.content_key
    }

    /// Key for the filename transform.
    pub fn name_key(&self) -> &[u8; KEY_SIZE] {
        &self.name_key
    }

    /// Expand additional key material under a caller-chosen domain.
    /// Used by reverse mode to derive stable per-path IVs and file ids.
    pub fn expand_into(&self, info: &[u8], out: &mut [u8]) -> FsResult<()> {
        let hkdf = Hkdf::<Sha256>::new(None, self.master.as_bytes());
        hkdf.expand(info, out)
            .map_err(|e| FsError::Crypto(format!("HKDF expand failed: {e}")))
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        self.content_key.zeroize();
        self.name_key.zeroize();
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore").finish_non_exhaustive()
    }
}

fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> FsResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| FsError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkeys_differ_per_domain() {
        let store = KeyStore::new(MasterKey::from_bytes([42u8; KEY_SIZE])).unwrap();
        assert_ne!(store.content_key(), store.name_key());
    }

    #[test]
    fn subkeys_stable_for_same_master() {
        let a = KeyStore::new(MasterKey::from_bytes([7u8; KEY_SIZE])).unwrap();
        let b = KeyStore::new(MasterKey::from_bytes([7u8; KEY_SIZE])).unwrap();
        assert_eq!(a.content_key(), b.content_key());
        assert_eq!(a.name_key(), b.name_key());
    }

    #[test]
    fn subkeys_differ_per_master() {
        let a = KeyStore::new(MasterKey::from_bytes([1u8; KEY_SIZE])).unwrap();
        let b = KeyStore::new(MasterKey::from_bytes([2u8; KEY_SIZE])).unwrap();
        assert_ne!(a.content_key(), b.content_key());
    }

    #[test]
    fn expand_is_domain_separated() {
        let store = KeyStore::new(MasterKey::from_bytes([3u8; KEY_SIZE])).unwrap();
        let mut x = [0u8; 16];
        let mut y = [0u8; 16];
        store.expand_into(b"domain-x", &mut x).unwrap();
        store.expand_into(b"domain-y", &mut y).unwrap();
        assert_ne!(x, y);
    }
}
