//! veil-crypto: the on-disk crypto format of veilfs
//!
//! Implements the gocryptfs v2 wire format:
//!
//! ```text
//! ciphertext file = HEADER(18) || BLOCK_0 || BLOCK_1 || ...
//! HEADER          = version (2 bytes BE, = 2) || file id (16 bytes random)
//! BLOCK           = nonce (12) || AES-256-GCM ciphertext || tag (16)
//! AAD             = block number (8 bytes BE) || file id (16 bytes)
//! ```
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, random at init, scrypt-wrapped in gocryptfs.conf)
//!   ├── Content Key (HKDF-SHA256, info="AES-GCM file content encryption")
//!   └── Name Key    (HKDF-SHA256, info="CBC filename encryption", AES-CBC + dir IV)
//! ```

pub mod block;
pub mod conffile;
pub mod kdf;
pub mod keys;
pub mod names;

pub use block::ContentCrypter;
pub use conffile::{create_conf, load_conf, CryptConf, FeatureFlag};
pub use kdf::{derive_kek, MasterKey, ScryptParams};
pub use keys::KeyStore;
pub use names::NameTransform;

/// Size of the master key and of every derived key (256-bit).
pub const KEY_SIZE: usize = 32;

/// Size of a GCM nonce (96-bit).
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Size of the random per-file id stored in the file header.
pub const FID_SIZE: usize = 16;

/// Per-block overhead: nonce + tag.
pub const BLOCK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Plaintext bytes per block.
pub const BLOCK_SIZE: usize = 4096;

/// Stored bytes per full block.
pub const CIPHER_BLOCK_SIZE: usize = BLOCK_SIZE + BLOCK_OVERHEAD;

/// Ciphertext file header: version (2) + file id (16).
pub const HEADER_SIZE: usize = 2 + FID_SIZE;

/// The only header version we read or write.
pub const HEADER_VERSION: u16 = 2;

/// Size of a per-directory filename-encryption IV.
pub const DIRIV_SIZE: usize = 16;

/// Config record filename inside a forward-mode cipher directory.
pub const CONF_NAME: &str = "gocryptfs.conf";

/// Config record filename next to a reverse-mode plaintext directory.
pub const REVERSE_CONF_NAME: &str = ".veilfs.reverse.conf";

/// Per-directory IV filename.
pub const DIRIV_NAME: &str = "gocryptfs.diriv";

/// Prefix for hashed over-long encrypted names; the full encrypted name
/// lives in a companion `<stub>.name` file.
pub const LONGNAME_PREFIX: &str = "gocryptfs.longname.";

/// Suffix of the long-name companion file.
pub const LONGNAME_SUFFIX: &str = ".name";

/// True for backing names that belong to the format, not to user data.
/// These never appear in a decrypted directory listing.
pub fn is_reserved_name(name: &str) -> bool {
    name == CONF_NAME || name == DIRIV_NAME || name.starts_with(LONGNAME_PREFIX)
}
