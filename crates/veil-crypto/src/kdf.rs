//! Key derivation: scrypt passphrase → key-encryption key

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use veil_core::{FsError, FsResult};
use zeroize::{Zeroize, Zeroizing};

use crate::KEY_SIZE;

/// A 256-bit master key.
///
/// Created once at init, lives decrypted in memory for the duration of a
/// mount. Zeroized on drop so it does not linger after unmount.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Sample a fresh random master key (init time).
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// The all-zero key used by `--zerokey` test mounts.
    pub fn zero() -> Self {
        Self {
            bytes: [0u8; KEY_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// scrypt cost parameters as stored in the config record.
///
/// `r` and `p` are fixed at the standard 8/1; only the cost exponent is
/// tunable (`--scryptn`).
#[derive(Debug, Clone, Copy)]
pub struct ScryptParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

/// Lowest accepted cost exponent. Below this, brute-forcing the passphrase
/// becomes too cheap to be worth the config record's protection.
pub const SCRYPT_LOG_N_MIN: u8 = 10;

/// Default cost exponent (N = 65536).
pub const SCRYPT_LOG_N_DEFAULT: u8 = 16;

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            log_n: SCRYPT_LOG_N_DEFAULT,
            r: 8,
            p: 1,
        }
    }
}

impl ScryptParams {
    pub fn with_log_n(log_n: u8) -> FsResult<Self> {
        if !(SCRYPT_LOG_N_MIN..=28).contains(&log_n) {
            return Err(FsError::UnsupportedConfig(format!(
                "scrypt cost exponent {log_n} out of range [{SCRYPT_LOG_N_MIN}, 28]"
            )));
        }
        Ok(Self {
            log_n,
            ..Self::default()
        })
    }

    pub fn n(&self) -> u64 {
        1u64 << self.log_n
    }
}

/// Derive the 256-bit key-encryption key from a passphrase and salt.
pub fn derive_kek(
    passphrase: &SecretString,
    salt: &[u8],
    params: &ScryptParams,
) -> FsResult<Zeroizing<[u8; KEY_SIZE]>> {
    let scrypt_params = scrypt::Params::new(params.log_n, params.r, params.p, KEY_SIZE)
        .map_err(|e| FsError::UnsupportedConfig(format!("invalid scrypt parameters: {e}")))?;

    let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
    scrypt::scrypt(
        passphrase.expose_secret().as_bytes(),
        salt,
        &scrypt_params,
        kek.as_mut(),
    )
    .map_err(|e| FsError::Crypto(format!("scrypt failed: {e}")))?;

    Ok(kek)
}
