//! The filesystem-watch contract.

use std::path::Path;

use crate::error::Result;

/// Watching local directories for out-of-band changes.
///
/// The cache watches the canonical local path of every directory that has
/// interested auto-update listers (or sits in the snapshot cache), and
/// expects [`WatchEvent`](crate::event::WatchEvent)s for watched paths on
/// its watch channel. Directories without a local path are silently not
/// watched.
pub trait DirectoryWatch {
    /// Start watching one directory, non-recursively.
    fn watch(&mut self, path: &Path) -> Result<()>;

    /// Stop watching one directory. Unwatching an unknown path is a no-op.
    fn unwatch(&mut self, path: &Path);
}

/// Watch implementation for hosts that do not watch anything.
#[derive(Debug, Default)]
pub struct NullWatch;

impl DirectoryWatch for NullWatch {
    fn watch(&mut self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn unwatch(&mut self, _path: &Path) {}
}
