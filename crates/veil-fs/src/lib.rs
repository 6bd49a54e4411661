//! veil-fs: the block-oriented I/O engine and filesystem facade
//!
//! Sits between filesystem operations (read, write, truncate, create,
//! rename, mkdir) and the ciphertext backing store:
//!
//! - [`layout`] — plaintext offset → ciphertext block arithmetic
//! - [`file`] — per-file engine: header handling, read-modify-write,
//!   truncate, sparse holes
//! - [`diriv`] — per-directory filename-encryption IVs
//! - [`fs`] — the facade composing codec, names and engine
//! - [`reverse`] — read-only synthesized ciphertext view
//! - [`lock`] — per-inode write serialisation

pub mod diriv;
pub mod file;
pub mod fs;
pub mod layout;
pub mod lock;
pub mod reverse;

pub use file::EncryptedFile;
pub use fs::{Attr, CryptFs, DirEntry, EntryKind};
pub use reverse::ReverseFs;
