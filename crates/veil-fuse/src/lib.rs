//! veil-fuse: the kernel-interface adapter
//!
//! Translates FUSE callbacks into calls on the veil-fs facade. This layer
//! owns no crypto and no filesystem semantics: it maps paths, shuttles
//! buffers, and converts errors into errnos. Engine calls run on the
//! blocking thread pool so block encryption never stalls the FUSE
//! dispatcher.

pub mod driver;

pub use driver::{mount_forward, mount_reverse, MountConfig};
