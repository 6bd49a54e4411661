//! Filename transform: per-directory tweaked encryption of basenames
//!
//! `encrypted = base64url_nopad( AES-256-CBC(key=name_key, iv=dir_iv, pkcs7(name)) )`
//!
//! The IV is the containing directory's random 16-byte tweak, so the same
//! plaintext name encrypts identically within one directory (lookups stay
//! deterministic) but differently across directories.
//!
//! Encrypted names longer than the host's 255-byte limit are stored hashed:
//! the backing entry is `gocryptfs.longname.<sha256-b64>` and the full
//! encrypted name lives in a `<stub>.name` companion file.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use veil_core::{FsError, FsResult};
use zeroize::Zeroize;

use crate::{DIRIV_SIZE, KEY_SIZE, LONGNAME_PREFIX, LONGNAME_SUFFIX};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Longest backing basename most host filesystems accept.
pub const NAME_MAX: usize = 255;

/// Decoded encrypted names beyond this are rejected as garbage.
const MAX_DECODED_NAME: usize = 2048;

pub struct NameTransform {
    key: [u8; KEY_SIZE],
}

impl NameTransform {
    pub fn new(name_key: &[u8; KEY_SIZE]) -> Self {
        Self { key: *name_key }
    }

    /// Encrypt one basename under the containing directory's IV.
    pub fn encrypt_name(&self, name: &str, dir_iv: &[u8; DIRIV_SIZE]) -> FsResult<String> {
        validate_plain_name(name)?;
        let ct = Aes256CbcEnc::new(&self.key.into(), dir_iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(name.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(ct))
    }

    /// Decrypt one encrypted basename. Fails on anything that is not a
    /// well-formed ciphertext name for this directory.
    pub fn decrypt_name(&self, encoded: &str, dir_iv: &[u8; DIRIV_SIZE]) -> FsResult<String> {
        let ct = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| FsError::Crypto(format!("name is not valid base64: {encoded:?}")))?;
        if ct.is_empty() || ct.len() % 16 != 0 || ct.len() > MAX_DECODED_NAME {
            return Err(FsError::Crypto(format!(
                "encrypted name has invalid length {}",
                ct.len()
            )));
        }

        let padded = Aes256CbcDec::new(&self.key.into(), dir_iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ct)
            .map_err(|_| FsError::Crypto("name has invalid padding".into()))?;

        let name = String::from_utf8(padded)
            .map_err(|_| FsError::Crypto("decrypted name is not UTF-8".into()))?;
        validate_plain_name(&name)?;
        Ok(name)
    }
}

impl Drop for NameTransform {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// True when an encrypted basename exceeds the host limit and must be
/// stored through the long-name indirection.
pub fn is_long_name(encrypted: &str) -> bool {
    encrypted.len() > NAME_MAX
}

/// `gocryptfs.longname.<base64url(sha256(encrypted_name))>`
pub fn long_name_stub(encrypted: &str) -> String {
    let digest = Sha256::digest(encrypted.as_bytes());
    format!("{LONGNAME_PREFIX}{}", URL_SAFE_NO_PAD.encode(digest))
}

/// Name of the companion file holding the full encrypted name.
pub fn long_name_companion(stub: &str) -> String {
    format!("{stub}{LONGNAME_SUFFIX}")
}

fn validate_plain_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid file name: {name:?}"),
        )));
    }
    Ok(())
}
