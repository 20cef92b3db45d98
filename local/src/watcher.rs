//! Filesystem watcher over notify.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error};

use dirview_listing::{DirectoryWatch, ListingError, Result, WatchEvent};

/// Watcher feeding local filesystem changes into the cache.
///
/// Wraps the platform's recommended notify watcher and translates its
/// events into [`WatchEvent`]s on the channel handed back by
/// [`FsWatcher::new`]; give that receiver to the cache via
/// `ListingCache::with_watch_events`.
pub struct FsWatcher {
    watcher: RecommendedWatcher,

    /// Paths currently watched, so duplicate requests stay cheap.
    watched: HashSet<PathBuf>,
}

impl FsWatcher {
    /// Create a watcher and the channel it reports on.
    pub fn new() -> Result<(Self, UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let translated = match event.kind {
                            notify::EventKind::Create(_) => WatchEvent::Created(path),
                            notify::EventKind::Remove(_) => WatchEvent::Deleted(path),
                            notify::EventKind::Modify(_) | notify::EventKind::Other => {
                                WatchEvent::Dirty(path)
                            }
                            notify::EventKind::Access(_) | notify::EventKind::Any => continue,
                        };
                        if tx.send(translated).is_err() {
                            // Cache is gone; nothing left to notify.
                            return;
                        }
                    }
                }
                Err(e) => error!("watch error: {e}"),
            },
        )
        .map_err(|e| ListingError::Backend(e.to_string()))?;

        Ok((
            Self {
                watcher,
                watched: HashSet::new(),
            },
            rx,
        ))
    }

    /// Paths currently watched.
    pub fn watched(&self) -> impl Iterator<Item = &Path> {
        self.watched.iter().map(PathBuf::as_path)
    }
}

impl DirectoryWatch for FsWatcher {
    fn watch(&mut self, path: &Path) -> Result<()> {
        if !self.watched.insert(path.to_path_buf()) {
            return Ok(());
        }
        debug!("watching {}", path.display());
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                self.watched.remove(path);
                ListingError::Backend(e.to_string())
            })
    }

    fn unwatch(&mut self, path: &Path) {
        if self.watched.remove(path) {
            debug!("unwatching {}", path.display());
            let _ = self.watcher.unwatch(path);
        }
    }
}
