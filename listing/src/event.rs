//! Typed events flowing in and out of the cache.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::JobId;
use crate::entry::Entry;

/// Notification delivered to one lister's event channel.
///
/// The cache is the only producer; every lister owns its own receiver, so
/// the order seen on a channel is exactly the order the cache produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListerEvent {
    /// Listing of `url` started (fresh job, cache replay, or update).
    Started(Url),

    /// A batch of entries passed the lister's filters.
    NewItems { dir: Url, entries: Vec<Entry> },

    /// Entries disappeared from a held directory.
    ItemsDeleted { dir: Url, entries: Vec<Entry> },

    /// Entries changed in place; each pair is `(old, new)`.
    RefreshItems {
        dir: Url,
        entries: Vec<(Entry, Entry)>,
    },

    /// Listing of `url` finished successfully.
    Completed(Url),

    /// Listing of `url` terminated without completing: a stop, a backend
    /// failure, or the directory itself disappearing.
    Canceled(Url),

    /// The directory is now known under a different URL.
    Redirected { from: Url, to: Url },
}

/// Event emitted by an enumeration job.
///
/// A job emits any number of `Entries` batches, at most one `Redirect`
/// before the terminal event, and then exactly one of `Finished` or
/// `Failed`. An entry named `.` describes the listed directory itself and
/// becomes its root entry; `..` is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    /// One batch of entries, in enumeration order.
    Entries(Vec<Entry>),

    /// The backend was told the directory lives elsewhere.
    Redirect(Url),

    /// Terminal success.
    Finished,

    /// Terminal failure.
    Failed(String),
}

/// A job event tagged with the job it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    /// The job that produced the event.
    pub job: JobId,

    /// The event itself.
    pub event: JobEvent,
}

/// Filesystem-watch notification, keyed by local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent {
    /// Something at `path` changed.
    Dirty(PathBuf),

    /// A new object appeared at `path`.
    Created(PathBuf),

    /// The object at `path` was removed.
    Deleted(PathBuf),
}

/// Cross-process change broadcast.
///
/// These arrive from other processes mutating the filesystem and are
/// dispatched onto the same internal update/refresh/remove/rename
/// primitives as local watch events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeNotice {
    /// Files appeared somewhere under `dir`.
    FilesAdded(Url),

    /// The files at these URLs changed in place.
    FilesChanged(Vec<Url>),

    /// The files at these URLs are gone.
    FilesRemoved(Vec<Url>),

    /// A file or directory moved.
    FileRenamed { from: Url, to: Url },
}
