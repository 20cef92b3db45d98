//! # dirview-listing
//!
//! Shared directory-listing cache with job deduplication: the engine
//! behind directory views that lets any number of observers watch the
//! same directories while at most one enumeration job per directory ever
//! runs.
//!
//! ## Features
//!
//! - **Job Deduplication**: at most one listing and one update job per
//!   directory; late observers replay the stream already received
//! - **Bounded Snapshot Cache**: complete, unreferenced listings stay
//!   available in a small LRU cache
//! - **Reconciliation**: updates diff against the cached entries and
//!   notify only real changes
//! - **Change Propagation**: filesystem-watch and cross-process change
//!   notices feed one unified update path
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Listing Cache                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ListBackend ──► JobEvent ──► ListingCache ──► ListerEvent      │
//! │       │                           │                  │          │
//! │       ▼                           ▼                  ▼          │
//! │  DirectoryWatch ──► WatchEvent   DirState LRU    per-lister     │
//! │                                  + coordination    channels     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod diff;
pub mod entry;
pub mod error;
pub mod event;
pub mod key;
pub mod lister;
pub mod watch;

pub use backend::{JobId, ListBackend};
pub use cache::ListingCache;
pub use config::CacheConfig;
pub use diff::{ListingDelta, reconcile};
pub use entry::{DIRECTORY_MIME, Entry, EntryKind, EntryMeta};
pub use error::{ListingError, Result};
pub use event::{ChangeNotice, JobEvent, JobMessage, ListerEvent, WatchEvent};
pub use key::DirKey;
pub use lister::{ListerId, ListerOptions, WhichItems};
pub use watch::{DirectoryWatch, NullWatch};
