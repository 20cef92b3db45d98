//! Per-observer lister state and filtering.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use url::Url;
use wildmatch::WildMatch;

use crate::entry::Entry;
use crate::event::ListerEvent;
use crate::key::DirKey;

/// Opaque handle to one registered lister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListerId(pub u64);

impl fmt::Display for ListerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lister#{}", self.0)
    }
}

/// Which entries a synchronous read should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhichItems {
    /// Every cached entry, unfiltered. Cheap.
    All,

    /// Only entries passing the lister's current filters. Walks every
    /// entry and applies the predicates; observers of large directories
    /// are better served by the streamed batch notifications.
    Filtered,
}

/// Filter configuration for a new lister.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListerOptions {
    /// Name globs; an entry matching any of them passes. Directories are
    /// exempt, and an empty set passes everything.
    pub name_filters: Vec<String>,

    /// Mimetypes to include; empty means all.
    pub mime_filters: Vec<String>,

    /// Mimetypes to exclude.
    pub mime_exclude_filters: Vec<String>,

    /// Only show directories.
    pub dirs_only: bool,

    /// Show hidden entries.
    pub show_hidden: bool,

    /// Keep held directories fresh from watch events.
    pub auto_update: bool,
}

impl ListerOptions {
    /// Options with no filtering and auto-update enabled.
    pub fn new() -> Self {
        Self {
            auto_update: true,
            ..Self::default()
        }
    }

    /// Set the name globs.
    pub fn with_name_filters(mut self, globs: Vec<String>) -> Self {
        self.name_filters = globs;
        self
    }

    /// Set the mimetype include list.
    pub fn with_mime_filters(mut self, mimes: Vec<String>) -> Self {
        self.mime_filters = mimes;
        self
    }

    /// Only show directories.
    pub fn dirs_only(mut self) -> Self {
        self.dirs_only = true;
        self
    }

    /// Show hidden entries.
    pub fn show_hidden(mut self) -> Self {
        self.show_hidden = true;
        self
    }

    /// Disable watch-driven updates for this lister.
    pub fn manual_updates(mut self) -> Self {
        self.auto_update = false;
        self
    }
}

/// Compiled filter predicates.
#[derive(Debug, Clone)]
pub(crate) struct FilterSpec {
    name_globs: Vec<WildMatch>,
    mime: Vec<String>,
    mime_exclude: Vec<String>,
    dirs_only: bool,
    show_hidden: bool,
}

impl FilterSpec {
    fn compile(options: &ListerOptions) -> Self {
        Self {
            name_globs: compile_globs(&options.name_filters),
            mime: options.mime_filters.clone(),
            mime_exclude: options.mime_exclude_filters.clone(),
            dirs_only: options.dirs_only,
            show_hidden: options.show_hidden,
        }
    }

    /// Whether an entry is visible through these filters.
    pub(crate) fn matches(&self, entry: &Entry) -> bool {
        if entry.hidden && !self.show_hidden {
            return false;
        }
        if self.dirs_only && !entry.is_dir() {
            return false;
        }
        if !entry.is_dir()
            && !self.name_globs.is_empty()
            && !self.name_globs.iter().any(|g| g.matches(&entry.name))
        {
            return false;
        }
        if self.mime.is_empty() && self.mime_exclude.is_empty() {
            return true;
        }
        let mime = entry.mime_type();
        if !self.mime.is_empty() && !self.mime.iter().any(|m| *m == mime) {
            return false;
        }
        !self.mime_exclude.iter().any(|m| *m == mime)
    }
}

fn compile_globs(patterns: &[String]) -> Vec<WildMatch> {
    patterns.iter().map(|p| WildMatch::new(p)).collect()
}

/// Mutable per-lister record owned by the cache.
///
/// Holds the observer's directory list, filter state, and the pending
/// batch buffers that turn per-entry bookkeeping into batched channel
/// notifications.
pub(crate) struct ListerState {
    /// Directories this lister has opened, in open order.
    pub(crate) dirs: Vec<DirKey>,

    /// Top-level directory (the first opened, or the last non-keep open).
    pub(crate) root_url: Option<DirKey>,

    /// Root entry of the top-level directory, once known.
    pub(crate) root_item: Option<Entry>,

    /// Active filter predicates.
    pub(crate) filters: FilterSpec,

    /// Filter state as of the last emitted delta, present only while
    /// filter changes are pending.
    pub(crate) old_filters: Option<FilterSpec>,

    /// Whether watch events should keep this lister's directories fresh.
    pub(crate) auto_update: bool,

    /// Jobs this lister is currently attached to.
    pub(crate) active_jobs: usize,

    /// True once every attached job has terminated.
    pub(crate) complete: bool,

    pending_new: Vec<Entry>,
    pending_refresh: Vec<(Entry, Entry)>,
    pending_deleted: Vec<Entry>,

    tx: UnboundedSender<ListerEvent>,
}

impl ListerState {
    pub(crate) fn new(options: &ListerOptions, tx: UnboundedSender<ListerEvent>) -> Self {
        Self {
            dirs: Vec::new(),
            root_url: None,
            root_item: None,
            filters: FilterSpec::compile(options),
            old_filters: None,
            auto_update: options.auto_update,
            active_jobs: 0,
            complete: true,
            pending_new: Vec::new(),
            pending_refresh: Vec::new(),
            pending_deleted: Vec::new(),
            tx,
        }
    }

    /// Send an event; an observer that dropped its receiver just stops
    /// hearing from us until the host removes the lister.
    pub(crate) fn send(&self, event: ListerEvent) {
        let _ = self.tx.send(event);
    }

    /// Buffer a new entry if it passes the filters.
    pub(crate) fn add_new_item(&mut self, entry: &Entry) {
        if self.filters.matches(entry) {
            self.pending_new.push(entry.clone());
        }
    }

    /// Buffer a changed entry, translating the change into this lister's
    /// filtered view: a change can surface, hide, or refresh the entry.
    pub(crate) fn add_refresh_pair(&mut self, old: &Entry, new: &Entry) {
        let was_visible = self.filters.matches(old);
        let is_visible = self.filters.matches(new);
        match (was_visible, is_visible) {
            (true, true) => self.pending_refresh.push((old.clone(), new.clone())),
            (true, false) => self.pending_deleted.push(old.clone()),
            (false, true) => self.pending_new.push(new.clone()),
            (false, false) => {}
        }
    }

    /// Buffer a removed entry if it was visible.
    pub(crate) fn add_deleted_item(&mut self, entry: &Entry) {
        if self.filters.matches(entry) {
            self.pending_deleted.push(entry.clone());
        }
    }

    /// Flush the pending buffers for `dir` as batched notifications.
    /// Removals go out first so an observer never sees a stale entry
    /// alongside its replacement.
    pub(crate) fn flush(&mut self, dir: &Url) {
        if !self.pending_deleted.is_empty() {
            let entries = std::mem::take(&mut self.pending_deleted);
            self.send(ListerEvent::ItemsDeleted {
                dir: dir.clone(),
                entries,
            });
        }
        if !self.pending_new.is_empty() {
            let entries = std::mem::take(&mut self.pending_new);
            self.send(ListerEvent::NewItems {
                dir: dir.clone(),
                entries,
            });
        }
        if !self.pending_refresh.is_empty() {
            let entries = std::mem::take(&mut self.pending_refresh);
            self.send(ListerEvent::RefreshItems {
                dir: dir.clone(),
                entries,
            });
        }
    }

    /// Re-evaluate already-delivered entries against a filter change:
    /// newly excluded entries leave the view, newly included ones enter
    /// it. The old predicates are judged as they were, not as they are.
    pub(crate) fn apply_filter_delta(&mut self, old: &FilterSpec, entries: &[Entry]) {
        for entry in entries {
            let was_visible = old.matches(entry);
            let is_visible = self.filters.matches(entry);
            if was_visible && !is_visible {
                self.pending_deleted.push(entry.clone());
            } else if !was_visible && is_visible {
                self.pending_new.push(entry.clone());
            }
        }
    }

    /// Snapshot the current filters before the first pending change, so
    /// [`emit_changes`](crate::cache::ListingCache::emit_changes) can
    /// diff old against new.
    fn note_filter_change(&mut self) {
        if self.old_filters.is_none() {
            self.old_filters = Some(self.filters.clone());
        }
    }

    /// Whether filter changes are pending a delta emission.
    pub(crate) fn has_pending_filter_changes(&self) -> bool {
        self.old_filters.is_some()
    }

    /// Take the snapshotted pre-change filters.
    pub(crate) fn take_old_filters(&mut self) -> Option<FilterSpec> {
        self.old_filters.take()
    }

    pub(crate) fn set_name_filters(&mut self, globs: Vec<String>) {
        self.note_filter_change();
        self.filters.name_globs = compile_globs(&globs);
    }

    pub(crate) fn set_mime_filters(&mut self, mimes: Vec<String>) {
        if self.filters.mime == mimes {
            return;
        }
        self.note_filter_change();
        self.filters.mime = mimes;
    }

    pub(crate) fn set_mime_exclude_filters(&mut self, mimes: Vec<String>) {
        if self.filters.mime_exclude == mimes {
            return;
        }
        self.note_filter_change();
        self.filters.mime_exclude = mimes;
    }

    pub(crate) fn set_dirs_only(&mut self, dirs_only: bool) {
        if self.filters.dirs_only == dirs_only {
            return;
        }
        self.note_filter_change();
        self.filters.dirs_only = dirs_only;
    }

    pub(crate) fn set_show_hidden(&mut self, show_hidden: bool) {
        if self.filters.show_hidden == show_hidden {
            return;
        }
        self.note_filter_change();
        self.filters.show_hidden = show_hidden;
    }
}
