//! The enumeration backend contract.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::entry::Entry;
use crate::error::Result;
use crate::event::JobMessage;

/// Opaque identifier of one enumeration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Asynchronous directory enumeration.
///
/// The cache owns exactly one backend and funnels every listing through
/// it. `start` must return without blocking: results arrive later as
/// [`JobMessage`]s on the supplied sender, on the cache's event loop. A
/// started job emits entry batches in a stable order, at most one
/// redirect, and exactly one terminal `Finished`/`Failed` event — unless
/// it is cancelled first, after which the cache ignores its messages.
pub trait ListBackend {
    /// Whether this backend can enumerate the given URL at all.
    fn supports(&self, url: &Url) -> bool;

    /// Start enumerating `url`, reporting progress as `job`.
    fn start(&mut self, job: JobId, url: &Url, events: UnboundedSender<JobMessage>) -> Result<()>;

    /// Cancel a running job. Cancelling an unknown or finished job is a
    /// no-op.
    fn cancel(&mut self, job: JobId);

    /// Take a fresh metadata snapshot of a single entry, if the backend
    /// can do so cheaply. `None` makes the cache fall back to a full
    /// directory update.
    fn stat(&mut self, url: &Url) -> Option<Entry> {
        let _ = url;
        None
    }
}
