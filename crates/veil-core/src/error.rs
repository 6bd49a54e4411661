use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// A block (or the file header) failed authentication. Never retried;
    /// the caller sees an I/O error, never partial plaintext.
    #[error("ciphertext authentication failed")]
    AuthenticationFailure,

    #[error("wrong passphrase")]
    BadPassword,

    #[error("unsupported filesystem config: {0}")]
    UnsupportedConfig(String),

    #[error("name is reserved: {0:?}")]
    NameReserved(String),

    #[error("filesystem is read-only")]
    ReadOnly,

    /// Unexpected failure inside a crypto primitive. These do not occur for
    /// well-formed inputs; they are kept as errors rather than panics so the
    /// mount survives a misbehaving backend.
    #[error("crypto backend error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Map to the errno the kernel adapter reports for this failure.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::AuthenticationFailure => libc::EIO,
            FsError::BadPassword => libc::EACCES,
            FsError::UnsupportedConfig(_) => libc::EIO,
            FsError::NameReserved(_) => libc::EACCES,
            FsError::ReadOnly => libc::EROFS,
            FsError::Crypto(_) => libc::EIO,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errno_passes_through() {
        let err = FsError::from(std::io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn reserved_name_is_permission_denied() {
        let err = FsError::NameReserved("gocryptfs.conf".into());
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn auth_failure_is_eio() {
        assert_eq!(FsError::AuthenticationFailure.to_errno(), libc::EIO);
    }
}
