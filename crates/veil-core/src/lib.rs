pub mod error;
pub mod options;

pub use error::{FsError, FsResult};
pub use options::{AeadBackend, MountOptions};
