/// Which AEAD implementation backs the block codec.
///
/// Both produce byte-identical AES-256-GCM output; `Ring` uses the
/// hardware-accelerated native path, `RustCrypto` the portable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadBackend {
    Ring,
    RustCrypto,
}

impl Default for AeadBackend {
    fn default() -> Self {
        AeadBackend::Ring
    }
}

/// Options fixed for the lifetime of a mount.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Do not encrypt file names (recorded in the config at init time).
    pub plaintext_names: bool,
    /// Synthesize a ciphertext view over a plaintext directory.
    pub reverse: bool,
    /// AEAD backend selector.
    pub backend: AeadBackend,
}
