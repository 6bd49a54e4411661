//! Config record: the scrypt-wrapped master key
//!
//! `gocryptfs.conf` is a small JSON record binding the random master key to
//! the user's passphrase:
//!
//! ```json
//! {
//!   "Creator": "veilfs 0.4.0",
//!   "EncryptedKey": "<base64 of nonce||ciphertext||tag over the master key>",
//!   "ScryptObject": { "Salt": "<base64>", "N": 65536, "R": 8, "P": 1, "KeyLen": 32 },
//!   "Version": 2,
//!   "FeatureFlags": ["GCMIV128", "DirIV"]
//! }
//! ```
//!
//! The master key is wrapped with AES-256-GCM under the scrypt-derived KEK,
//! with the fixed AAD `"KEYSLOT\0"` as a domain separator. A tag mismatch on
//! load means the passphrase is wrong; a version or flag mismatch means the
//! record was written by an incompatible implementation.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;
use veil_core::{FsError, FsResult};
use zeroize::Zeroize;

use crate::kdf::{derive_kek, MasterKey, ScryptParams};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Config record version we read and write.
pub const CONF_VERSION: u32 = 2;

/// Domain separator for the key-wrap AAD.
const KEYSLOT_AAD: &[u8] = b"KEYSLOT\0";

/// scrypt salt length stored in the record.
const SALT_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// File names are stored unencrypted.
    PlaintextNames,
    /// A per-directory IV file tweaks filename encryption.
    DirIV,
    /// EME wide-block filename encryption (not produced by us; rejected).
    EMENames,
    /// 128-bit GCM initialisation (the v2 block layout).
    GCMIV128,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CryptConf {
    #[serde(rename = "Creator")]
    pub creator: String,
    #[serde(rename = "EncryptedKey")]
    pub encrypted_key: String,
    #[serde(rename = "ScryptObject")]
    pub scrypt_object: ScryptObject,
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "FeatureFlags")]
    pub feature_flags: Vec<FeatureFlag>,
}

impl CryptConf {
    pub fn has_flag(&self, flag: FeatureFlag) -> bool {
        self.feature_flags.contains(&flag)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScryptObject {
    #[serde(rename = "Salt")]
    pub salt: String,
    #[serde(rename = "N")]
    pub n: u64,
    #[serde(rename = "R")]
    pub r: u32,
    #[serde(rename = "P")]
    pub p: u32,
    #[serde(rename = "KeyLen")]
    pub key_len: u32,
}

impl ScryptObject {
    fn params(&self) -> FsResult<ScryptParams> {
        if !self.n.is_power_of_two() || self.key_len as usize != KEY_SIZE {
            return Err(FsError::UnsupportedConfig(format!(
                "bad scrypt parameters: N={} KeyLen={}",
                self.n, self.key_len
            )));
        }
        Ok(ScryptParams {
            log_n: self.n.trailing_zeros() as u8,
            r: self.r,
            p: self.p,
        })
    }
}

/// Initialise a config record: sample a fresh master key, wrap it under the
/// passphrase, and write the record atomically (temp file + rename).
///
/// Returns the new master key so init can continue without re-reading.
pub fn create_conf(
    path: &Path,
    passphrase: &SecretString,
    plaintext_names: bool,
    params: &ScryptParams,
    creator: &str,
) -> FsResult<MasterKey> {
    let master = MasterKey::random();

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let kek = derive_kek(passphrase, &salt, params)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let wrapped = wrap_master_key(&kek, &nonce, &master)?;

    let mut feature_flags = vec![FeatureFlag::GCMIV128];
    if plaintext_names {
        feature_flags.push(FeatureFlag::PlaintextNames);
    } else {
        feature_flags.push(FeatureFlag::DirIV);
    }

    let conf = CryptConf {
        creator: creator.to_string(),
        encrypted_key: B64.encode(wrapped),
        scrypt_object: ScryptObject {
            salt: B64.encode(salt),
            n: params.n(),
            r: params.r,
            p: params.p,
            key_len: KEY_SIZE as u32,
        },
        version: CONF_VERSION,
        feature_flags,
    };

    let json = serde_json::to_string_pretty(&conf)
        .map_err(|e| FsError::Crypto(format!("config serialization: {e}")))?;

    // Atomic write: the record either exists complete or not at all.
    let tmp = tmp_sibling(path);
    fs::write(&tmp, json.as_bytes())?;
    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), "wrote config record");

    Ok(master)
}

/// Load a config record and unwrap the master key.
pub fn load_conf(path: &Path, passphrase: &SecretString) -> FsResult<(MasterKey, CryptConf)> {
    let raw = fs::read_to_string(path)?;
    let conf: CryptConf = serde_json::from_str(&raw)
        .map_err(|e| FsError::UnsupportedConfig(format!("cannot parse config record: {e}")))?;

    if conf.version != CONF_VERSION {
        return Err(FsError::UnsupportedConfig(format!(
            "config version {} (expected {CONF_VERSION})",
            conf.version
        )));
    }
    if conf.has_flag(FeatureFlag::EMENames) {
        return Err(FsError::UnsupportedConfig(
            "EME filename encryption is not supported".into(),
        ));
    }

    let salt = B64
        .decode(&conf.scrypt_object.salt)
        .map_err(|e| FsError::UnsupportedConfig(format!("bad salt encoding: {e}")))?;
    let kek = derive_kek(passphrase, &salt, &conf.scrypt_object.params()?)?;

    let wrapped = B64
        .decode(&conf.encrypted_key)
        .map_err(|e| FsError::UnsupportedConfig(format!("bad key encoding: {e}")))?;
    let master = unwrap_master_key(&kek, &wrapped)?;

    Ok((master, conf))
}

/// Wrap the master key: `nonce || AES-256-GCM(kek, nonce, aad=KEYSLOT, master)`.
fn wrap_master_key(
    kek: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    master: &MasterKey,
) -> FsResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(kek.into());
    let ciphertext = cipher
        .encrypt(
            nonce.into(),
            Payload {
                msg: master.as_bytes(),
                aad: KEYSLOT_AAD,
            },
        )
        .map_err(|_| FsError::Crypto("master key wrapping failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Unwrap the master key. A tag mismatch means the passphrase is wrong.
fn unwrap_master_key(kek: &[u8; KEY_SIZE], wrapped: &[u8]) -> FsResult<MasterKey> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(FsError::UnsupportedConfig(format!(
            "wrapped key has length {} (expected {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        )));
    }

    let (nonce, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(kek.into());
    let mut plaintext = cipher
        .decrypt(
            aes_gcm::Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: KEYSLOT_AAD,
            },
        )
        .map_err(|_| FsError::BadPassword)?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(MasterKey::from_bytes(key_bytes))
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "conf".into());
    path.with_file_name(format!("{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_params() -> ScryptParams {
        ScryptParams::with_log_n(10).unwrap()
    }

    #[test]
    fn create_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gocryptfs.conf");
        let pass = SecretString::from("correct horse battery staple");

        let created = create_conf(&path, &pass, false, &fast_params(), "veilfs test").unwrap();
        let (loaded, conf) = load_conf(&path, &pass).unwrap();

        assert_eq!(created.as_bytes(), loaded.as_bytes());
        assert_eq!(conf.version, CONF_VERSION);
        assert_eq!(conf.creator, "veilfs test");
        assert!(conf.has_flag(FeatureFlag::GCMIV128));
        assert!(conf.has_flag(FeatureFlag::DirIV));
        assert!(!conf.has_flag(FeatureFlag::PlaintextNames));
        assert!(!path.with_file_name("gocryptfs.conf.tmp").exists());
    }

    #[test]
    fn wrong_passphrase_is_bad_password() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gocryptfs.conf");

        create_conf(
            &path,
            &SecretString::from("right"),
            false,
            &fast_params(),
            "veilfs test",
        )
        .unwrap();

        assert!(matches!(
            load_conf(&path, &SecretString::from("wrong")),
            Err(FsError::BadPassword)
        ));
    }

    #[test]
    fn plaintext_names_flag_recorded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gocryptfs.conf");
        let pass = SecretString::from("pw");

        create_conf(&path, &pass, true, &fast_params(), "veilfs test").unwrap();
        let (_, conf) = load_conf(&path, &pass).unwrap();

        assert!(conf.has_flag(FeatureFlag::PlaintextNames));
        assert!(!conf.has_flag(FeatureFlag::DirIV));
    }

    #[test]
    fn version_mismatch_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gocryptfs.conf");
        let pass = SecretString::from("pw");

        create_conf(&path, &pass, false, &fast_params(), "veilfs test").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\"Version\": 2", "\"Version\": 3")).unwrap();

        assert!(matches!(
            load_conf(&path, &pass),
            Err(FsError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn unknown_flag_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gocryptfs.conf");
        let pass = SecretString::from("pw");

        create_conf(&path, &pass, false, &fast_params(), "veilfs test").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\"GCMIV128\"", "\"FIDO2\"")).unwrap();

        assert!(matches!(
            load_conf(&path, &pass),
            Err(FsError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn record_is_json_with_expected_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gocryptfs.conf");
        let pass = SecretString::from("pw");

        create_conf(&path, &pass, false, &fast_params(), "veilfs test").unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

        for field in ["Creator", "EncryptedKey", "ScryptObject", "Version", "FeatureFlags"] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(value["ScryptObject"]["N"], 1024);
        assert_eq!(value["ScryptObject"]["R"], 8);
        assert_eq!(value["ScryptObject"]["P"], 1);
        assert_eq!(value["ScryptObject"]["KeyLen"], 32);

        let wrapped = B64
            .decode(value["EncryptedKey"].as_str().unwrap())
            .unwrap();
        assert_eq!(wrapped.len(), NONCE_SIZE + KEY_SIZE + TAG_SIZE);
    }
}
