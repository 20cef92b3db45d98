//! # dirview-local
//!
//! Local filesystem collaborators for the listing cache: an enumeration
//! backend streaming `read_dir` results from the blocking thread pool,
//! and a notify-based watcher reporting out-of-band changes.
//!
//! ```no_run
//! use dirview_listing::{CacheConfig, ListingCache};
//! use dirview_local::{FsWatcher, LocalBackend};
//!
//! # fn main() -> dirview_listing::Result<()> {
//! let (watcher, watch_events) = FsWatcher::new()?;
//! let cache = ListingCache::new(
//!     Box::new(LocalBackend::new()),
//!     Box::new(watcher),
//!     CacheConfig::new(),
//! )
//! .with_watch_events(watch_events);
//! # let _ = cache;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod watcher;

pub use backend::LocalBackend;
pub use watcher::FsWatcher;
