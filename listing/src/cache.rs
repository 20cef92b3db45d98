//! The process-wide directory listing coordinator.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use lru::LruCache;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{JobId, ListBackend};
use crate::config::CacheConfig;
use crate::diff::reconcile;
use crate::entry::Entry;
use crate::error::{ListingError, Result};
use crate::event::{ChangeNotice, JobEvent, JobMessage, ListerEvent, WatchEvent};
use crate::key::{DirKey, relocate_url};
use crate::lister::{ListerId, ListerOptions, ListerState, WhichItems};
use crate::watch::DirectoryWatch;

/// Cached snapshot of one directory.
///
/// Exclusively owned and mutated by the cache; observers only ever see
/// cloned entries.
struct DirState {
    entries: BTreeMap<String, Entry>,
    root: Option<Entry>,
    complete: bool,
    watch_refs: u32,
    /// Canonical local path for watch targeting; `None` for keys that do
    /// not live on the local filesystem.
    local_path: Option<PathBuf>,
}

impl DirState {
    fn new(key: &DirKey) -> Self {
        Self {
            entries: BTreeMap::new(),
            root: None,
            complete: false,
            watch_refs: 0,
            local_path: key.to_local_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    /// Full listing of a fresh or reloaded directory.
    Listing,

    /// Refresh of an already-held directory, reconciled on completion.
    Update,
}

struct JobRecord {
    key: DirKey,
    kind: JobKind,
    /// Entries streamed so far. For listing jobs this is the replay
    /// buffer for late joiners (receipt order); update jobs accumulate
    /// here until the terminal event triggers reconciliation.
    buffer: Vec<Entry>,
    redirects: u8,
}

/// The directory-listing cache.
///
/// One explicitly constructed instance coordinates every
/// [`ListerId`] handle: it guarantees at most one outstanding listing job
/// and one update job per directory, fans results out to every attached
/// lister, keeps a bounded LRU cache of complete-but-unreferenced
/// snapshots, and reconciles watch and cross-process change notifications
/// into every observer's filtered view.
///
/// The cache is single-threaded and event-driven: backends and watchers
/// run wherever they like and report through channels; every mutation
/// happens on the loop turn that dispatches the triggering event, via
/// [`run`](Self::run) or [`pump`](Self::pump).
pub struct ListingCache {
    config: CacheConfig,
    backend: Box<dyn ListBackend>,
    watcher: Box<dyn DirectoryWatch>,

    /// Directory snapshots some lister currently references.
    in_use: HashMap<DirKey, DirState>,

    /// Complete snapshots nobody references, bounded LRU.
    cached: LruCache<DirKey, DirState>,

    /// Listers attached to a running listing of the key.
    listing: HashMap<DirKey, Vec<ListerId>>,

    /// Listers holding a stable view of the key.
    holding: HashMap<DirKey, Vec<ListerId>>,

    listers: HashMap<ListerId, ListerState>,

    jobs: HashMap<JobId, JobRecord>,
    list_jobs: HashMap<DirKey, JobId>,
    update_jobs: HashMap<DirKey, JobId>,

    /// Directories with a coalesced update scheduled.
    pending_updates: HashMap<DirKey, Instant>,

    job_tx: UnboundedSender<JobMessage>,
    job_rx: UnboundedReceiver<JobMessage>,
    watch_rx: Option<UnboundedReceiver<WatchEvent>>,

    next_lister: u64,
    next_job: u64,
}

impl ListingCache {
    /// Create a cache over the given enumeration backend and watcher.
    pub fn new(
        backend: Box<dyn ListBackend>,
        watcher: Box<dyn DirectoryWatch>,
        config: CacheConfig,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            backend,
            watcher,
            in_use: HashMap::new(),
            cached: LruCache::new(capacity),
            listing: HashMap::new(),
            holding: HashMap::new(),
            listers: HashMap::new(),
            jobs: HashMap::new(),
            list_jobs: HashMap::new(),
            update_jobs: HashMap::new(),
            pending_updates: HashMap::new(),
            job_tx,
            job_rx,
            watch_rx: None,
            next_lister: 0,
            next_job: 0,
        }
    }

    /// Attach the channel a watcher implementation reports on.
    pub fn with_watch_events(mut self, rx: UnboundedReceiver<WatchEvent>) -> Self {
        self.watch_rx = Some(rx);
        self
    }

    // ---- lister registration ------------------------------------------

    /// Register a new lister and hand back its handle and event channel.
    pub fn add_lister(
        &mut self,
        options: &ListerOptions,
    ) -> (ListerId, UnboundedReceiver<ListerEvent>) {
        let id = ListerId(self.next_lister);
        self.next_lister += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.listers.insert(id, ListerState::new(options, tx));
        debug!("registered {id}");
        (id, rx)
    }

    /// Deregister a lister, stopping its jobs and releasing its
    /// directories.
    pub fn remove_lister(&mut self, id: ListerId) -> Result<()> {
        self.ensure_lister(id)?;
        self.stop(id)?;
        self.forget_all(id);
        self.listers.remove(&id);
        debug!("removed {id}");
        Ok(())
    }

    // ---- opening and stopping -----------------------------------------

    /// Open `url` for a lister.
    ///
    /// `keep` preserves previously opened directories (tree mode) instead
    /// of releasing them; `reload` bypasses cached snapshots. Fails
    /// synchronously, mutating nothing, when the URL is malformed or no
    /// backend can enumerate it.
    pub fn open(&mut self, id: ListerId, url: &str, keep: bool, reload: bool) -> Result<()> {
        let key = DirKey::parse(url)?;
        if !self.backend.supports(key.as_url()) {
            return Err(ListingError::UnsupportedScheme(
                key.as_url().scheme().to_string(),
            ));
        }
        self.ensure_lister(id)?;
        debug!("open {key} for {id} keep={keep} reload={reload}");

        // Emit pending filter deltas first so a tree view stays
        // consistent across the newly added root.
        if keep && self.lister(id)?.has_pending_filter_changes() {
            self.emit_changes(id)?;
        }

        if !keep {
            self.stop(id)?;
            self.forget_all(id);
            if let Some(l) = self.listers.get_mut(&id) {
                l.root_url = None;
                l.root_item = None;
            }
        } else if self.lister(id)?.dirs.contains(&key) {
            // Re-opening one of our own directories: detach from it first.
            self.stop_one(id, &key);
            self.forget_dir(id, &key);
            if let Some(l) = self.listers.get_mut(&id)
                && l.root_url.as_ref() == Some(&key)
            {
                l.root_item = None;
            }
        }

        if let Some(l) = self.listers.get_mut(&id) {
            l.dirs.push(key.clone());
            if l.root_url.is_none() || !keep {
                l.root_url = Some(key.clone());
            }
        }

        if let Some(&job) = self.list_jobs.get(&key) {
            self.join_running_listing(id, &key, job);
        } else if self.in_use.contains_key(&key) {
            let complete = self.in_use.get(&key).map(|s| s.complete).unwrap_or(false);
            debug!("open {key}: serving in-use snapshot");
            self.serve_snapshot(id, &key);
            if reload || !complete {
                self.update_key(&key);
            }
        } else if !reload && self.cached.contains(&key) {
            if let Some(mut state) = self.cached.pop(&key) {
                debug!("open {key}: promoting cached snapshot");
                // The snapshot cache held one watch reference; give it
                // back before the state goes into use.
                Self::release_watch(self.watcher.as_mut(), &mut state);
                let complete = state.complete;
                self.in_use.insert(key.clone(), state);
                self.serve_snapshot(id, &key);
                if !complete {
                    self.update_key(&key);
                }
            }
        } else {
            // A reload discards any stale snapshot outright.
            if let Some(mut stale) = self.cached.pop(&key) {
                Self::drop_watch(self.watcher.as_mut(), &mut stale);
            }
            self.start_listing(id, &key);
        }

        if self.lister(id)?.auto_update {
            self.watch_inc(&key);
        }
        Ok(())
    }

    /// Detach a lister from everything it is currently listing.
    ///
    /// The shared job is cancelled only when the last interested lister
    /// detaches; others continue undisturbed.
    pub fn stop(&mut self, id: ListerId) -> Result<()> {
        self.ensure_lister(id)?;
        let keys: Vec<DirKey> = self
            .listing
            .iter()
            .filter(|(_, ids)| ids.contains(&id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.stop_one(id, &key);
        }
        Ok(())
    }

    /// Detach a lister from one directory it is currently listing.
    pub fn stop_dir(&mut self, id: ListerId, url: &str) -> Result<()> {
        self.ensure_lister(id)?;
        let key = DirKey::parse(url)?;
        self.stop_one(id, &key);
        Ok(())
    }

    // ---- updates ------------------------------------------------------

    /// Refresh a directory.
    ///
    /// Referenced directories get (at most) one update job; unreferenced
    /// cached snapshots are only marked dirty so the next `open` refreshes
    /// them without wasted I/O.
    pub fn update(&mut self, url: &str) -> Result<()> {
        let key = DirKey::parse(url)?;
        self.update_key(&key);
        Ok(())
    }

    fn update_key(&mut self, key: &DirKey) {
        if !self.in_use.contains_key(key) {
            if let Some(state) = self.cached.peek_mut(key) {
                state.complete = false;
                Self::release_watch(self.watcher.as_mut(), state);
                debug!("directory {key} not in use, marked dirty");
            } else {
                debug!("update for {key} ignored, not cached");
            }
            return;
        }

        // A new request supersedes whatever job is in flight; the
        // replacement continues the same logical listing, so nobody is
        // notified about the restart.
        let killed = self.kill_job_for(key);

        let job = self.alloc_job();
        self.jobs.insert(
            job,
            JobRecord {
                key: key.clone(),
                kind: JobKind::Update,
                buffer: Vec::new(),
                redirects: 0,
            },
        );
        self.update_jobs.insert(key.clone(), job);

        if !killed {
            for id in self.holding.get(key).cloned().unwrap_or_default() {
                if let Some(l) = self.listers.get_mut(&id) {
                    l.active_jobs += 1;
                    l.complete = false;
                    l.send(ListerEvent::Started(key.as_url().clone()));
                }
            }
        }

        debug!("update started in {key}");
        if let Err(e) = self.backend.start(job, key.as_url(), self.job_tx.clone()) {
            warn!("update job for {key} failed to start: {e}");
            self.handle_job_message(JobMessage {
                job,
                event: JobEvent::Failed(e.to_string()),
            });
        }
    }

    /// Toggle watch-driven updates for a lister, adjusting the watch
    /// refcount of every directory it references.
    pub fn set_auto_update(&mut self, id: ListerId, enable: bool) -> Result<()> {
        let lister = self.lister_mut(id)?;
        if lister.auto_update == enable {
            return Ok(());
        }
        lister.auto_update = enable;
        let dirs = lister.dirs.clone();
        for key in dirs {
            if enable {
                self.watch_inc(&key);
            } else {
                self.watch_dec(&key);
            }
        }
        Ok(())
    }

    // ---- synchronous reads --------------------------------------------

    /// Entries of every directory the lister references.
    ///
    /// `All` clones the raw cached sets; `Filtered` additionally applies
    /// the lister's predicates to every entry, so observers of very large
    /// directories are better served by the streamed notifications.
    pub fn items(&self, id: ListerId, which: WhichItems) -> Result<Vec<Entry>> {
        let lister = self.lister(id)?;
        let mut out = Vec::new();
        for key in &lister.dirs {
            for entry in self.entries_of(key) {
                match which {
                    WhichItems::All => out.push(entry),
                    WhichItems::Filtered => {
                        if lister.filters.matches(&entry) {
                            out.push(entry);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Root entry of the lister's top-level directory, once known.
    pub fn root_item(&self, id: ListerId) -> Result<Option<Entry>> {
        Ok(self.lister(id)?.root_item.clone())
    }

    /// Whether every job this lister attached to has terminated.
    pub fn is_finished(&self, id: ListerId) -> Result<bool> {
        Ok(self.lister(id)?.complete)
    }

    /// The directories a lister currently references, in open order.
    pub fn directories(&self, id: ListerId) -> Result<Vec<Url>> {
        Ok(self
            .lister(id)?
            .dirs
            .iter()
            .map(|key| key.as_url().clone())
            .collect())
    }

    /// Find an entry by name across the lister's directories.
    pub fn find_by_name(&self, id: ListerId, name: &str) -> Result<Option<Entry>> {
        let lister = self.lister(id)?;
        for key in &lister.dirs {
            if let Some(state) = self.in_use.get(key)
                && let Some(entry) = state.entries.get(name)
            {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    /// Find an entry by URL within the lister's directories.
    pub fn find_by_url(&self, id: ListerId, url: &Url) -> Result<Option<Entry>> {
        let lister = self.lister(id)?;
        let Some((parent, name)) = DirKey::split_file_url(url) else {
            return Ok(None);
        };
        if !lister.dirs.contains(&parent) {
            return Ok(None);
        }
        Ok(self.lookup_entry(&parent, &name))
    }

    // ---- filters ------------------------------------------------------

    /// Replace the name globs. Takes effect for newly delivered items
    /// immediately; already-delivered items are re-evaluated by
    /// [`emit_changes`](Self::emit_changes).
    pub fn set_name_filters(&mut self, id: ListerId, globs: Vec<String>) -> Result<()> {
        self.lister_mut(id)?.set_name_filters(globs);
        Ok(())
    }

    /// Replace the mimetype include list.
    pub fn set_mime_filters(&mut self, id: ListerId, mimes: Vec<String>) -> Result<()> {
        self.lister_mut(id)?.set_mime_filters(mimes);
        Ok(())
    }

    /// Replace the mimetype exclude list.
    pub fn set_mime_exclude_filters(&mut self, id: ListerId, mimes: Vec<String>) -> Result<()> {
        self.lister_mut(id)?.set_mime_exclude_filters(mimes);
        Ok(())
    }

    /// Drop all mimetype filtering.
    pub fn clear_mime_filters(&mut self, id: ListerId) -> Result<()> {
        let lister = self.lister_mut(id)?;
        lister.set_mime_filters(Vec::new());
        lister.set_mime_exclude_filters(Vec::new());
        Ok(())
    }

    /// Only show directories.
    pub fn set_dirs_only(&mut self, id: ListerId, dirs_only: bool) -> Result<()> {
        self.lister_mut(id)?.set_dirs_only(dirs_only);
        Ok(())
    }

    /// Show hidden entries.
    pub fn set_show_hidden(&mut self, id: ListerId, show_hidden: bool) -> Result<()> {
        self.lister_mut(id)?.set_show_hidden(show_hidden);
        Ok(())
    }

    /// Emit the delta produced by filter changes since the last call:
    /// newly excluded items as deletions, newly included ones as
    /// additions.
    pub fn emit_changes(&mut self, id: ListerId) -> Result<()> {
        let lister = self.lister_mut(id)?;
        let Some(old) = lister.take_old_filters() else {
            return Ok(());
        };
        let dirs = lister.dirs.clone();
        for key in dirs {
            let entries = self.entries_of(&key);
            if let Some(l) = self.listers.get_mut(&id) {
                l.apply_filter_delta(&old, &entries);
                l.flush(key.as_url());
            }
        }
        Ok(())
    }

    // ---- change application -------------------------------------------

    /// Apply one cross-process change notice.
    pub fn apply_change(&mut self, notice: ChangeNotice) {
        match notice {
            ChangeNotice::FilesAdded(dir) => self.files_added(&dir),
            ChangeNotice::FilesChanged(urls) => self.files_changed(&urls),
            ChangeNotice::FilesRemoved(urls) => self.files_removed(&urls),
            ChangeNotice::FileRenamed { from, to } => self.file_renamed(&from, &to),
        }
    }

    /// Files appeared under `dir`: refresh it.
    pub fn files_added(&mut self, dir: &Url) {
        if let Ok(key) = DirKey::from_url(dir.clone()) {
            debug!("files added under {key}");
            self.update_key(&key);
        }
    }

    /// The files at `urls` changed in place: refresh just those entries.
    pub fn files_changed(&mut self, urls: &[Url]) {
        for url in urls {
            let Some((parent, name)) = DirKey::split_file_url(url) else {
                continue;
            };
            let Some(old) = self.lookup_entry(&parent, &name) else {
                debug!("changed file {url} not in any listing");
                continue;
            };
            match self.backend.stat(url) {
                Some(new) => {
                    if !old.same_listing(&new) {
                        self.replace_entry(&parent, &old, new);
                    }
                }
                // No cheap per-entry snapshot: fall back to refreshing
                // the whole directory.
                None => self.schedule_update(&parent),
            }
        }
    }

    /// The files at `urls` are gone: drop their entries and evict any
    /// cached subtree below them.
    pub fn files_removed(&mut self, urls: &[Url]) {
        for url in urls {
            let Some((parent, name)) = DirKey::split_file_url(url) else {
                continue;
            };
            let removed = self.remove_entry(&parent, &name);
            if let Ok(key) = DirKey::from_url(url.clone()) {
                self.delete_subtree(&key);
            }
            if let Some(entry) = removed {
                debug!("removed {url} from {parent}");
                for id in self.holding.get(&parent).cloned().unwrap_or_default() {
                    if let Some(l) = self.listers.get_mut(&id) {
                        l.add_deleted_item(&entry);
                        l.flush(parent.as_url());
                    }
                }
            }
        }
    }

    /// Something moved: relocate any cached subtree and refresh the moved
    /// entry in its parent listing.
    pub fn file_renamed(&mut self, from: &Url, to: &Url) {
        let (Ok(src), Ok(dst)) = (DirKey::from_url(from.clone()), DirKey::from_url(to.clone()))
        else {
            return;
        };
        info!("rename {src} -> {dst}");
        self.rename_tree(&src, &dst);
        self.rename_parent_entry(from, to);
    }

    // ---- watch events -------------------------------------------------

    /// Apply one filesystem-watch notification.
    pub fn handle_watch_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Dirty(path) => {
                let Ok(url) = Url::from_file_path(&path) else {
                    return;
                };
                // A dirty non-directory entry gets a targeted refresh;
                // everything else means the directory itself is stale.
                let known_file = DirKey::split_file_url(&url)
                    .and_then(|(parent, name)| self.lookup_entry(&parent, &name))
                    .is_some_and(|entry| !entry.is_dir());
                if known_file {
                    self.files_changed(&[url]);
                } else if let Ok(key) = DirKey::from_local_path(&path) {
                    self.schedule_update(&key);
                }
            }
            WatchEvent::Created(path) => {
                if let Some(parent) = path.parent()
                    && let Ok(key) = DirKey::from_local_path(parent)
                {
                    self.schedule_update(&key);
                }
            }
            WatchEvent::Deleted(path) => {
                if let Ok(url) = Url::from_file_path(&path) {
                    self.files_removed(&[url]);
                }
            }
        }
    }

    // ---- event pumping ------------------------------------------------

    /// Drain all queued job and watch events and run due coalesced
    /// updates. Hosts with their own loop can call this instead of
    /// [`run`](Self::run).
    pub fn pump(&mut self) {
        while let Ok(msg) = self.job_rx.try_recv() {
            self.handle_job_message(msg);
        }
        let mut events = Vec::new();
        if let Some(rx) = &mut self.watch_rx {
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
        }
        for event in events {
            self.handle_watch_event(event);
        }
        self.flush_due_updates();
    }

    /// Wait for the next input, dispatch it, and return. Returns `false`
    /// once no further input can arrive.
    pub async fn run_once(&mut self) -> bool {
        enum Input {
            Job(JobMessage),
            Watch(WatchEvent),
            WatchClosed,
            Flush,
        }

        let deadline = self.pending_updates.values().min().copied();
        let input = {
            let job_rx = &mut self.job_rx;
            let watch_rx = self.watch_rx.as_mut();
            tokio::select! {
                msg = job_rx.recv() => match msg {
                    Some(msg) => Input::Job(msg),
                    // We hold a sender ourselves, so this cannot happen.
                    None => return false,
                },
                event = async {
                    match watch_rx {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Some(event) => Input::Watch(event),
                    None => Input::WatchClosed,
                },
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => Input::Flush,
            }
        };

        match input {
            Input::Job(msg) => self.handle_job_message(msg),
            Input::Watch(event) => self.handle_watch_event(event),
            Input::WatchClosed => self.watch_rx = None,
            Input::Flush => self.flush_due_updates(),
        }
        true
    }

    /// Drive the cache until its inputs close.
    pub async fn run(&mut self) {
        while self.run_once().await {}
    }

    /// Dispatch one job event. Events of cancelled jobs are ignored.
    pub fn handle_job_message(&mut self, msg: JobMessage) {
        if !self.jobs.contains_key(&msg.job) {
            return;
        }
        match msg.event {
            JobEvent::Entries(batch) => self.job_entries(msg.job, batch),
            JobEvent::Redirect(url) => self.job_redirect(msg.job, url),
            JobEvent::Finished => self.job_finished(msg.job, None),
            JobEvent::Failed(error) => self.job_finished(msg.job, Some(error)),
        }
    }

    /// Run every coalesced update whose delay has elapsed.
    pub fn flush_due_updates(&mut self) {
        let now = Instant::now();
        let due: Vec<DirKey> = self
            .pending_updates
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.pending_updates.remove(&key);
            self.update_key(&key);
        }
    }

    fn schedule_update(&mut self, key: &DirKey) {
        let deadline = Instant::now() + self.config.coalesce_delay;
        // Re-arming on every event absorbs bursts on the same directory.
        self.pending_updates.insert(key.clone(), deadline);
        debug!("scheduled coalesced update for {key}");
    }

    // ---- job event handling -------------------------------------------

    fn job_entries(&mut self, job: JobId, batch: Vec<Entry>) {
        let Some((key, kind)) = self.jobs.get(&job).map(|r| (r.key.clone(), r.kind)) else {
            return;
        };

        if kind == JobKind::Update {
            if let Some(record) = self.jobs.get_mut(&job) {
                record.buffer.extend(batch);
            }
            return;
        }

        let ids = self.listing.get(&key).cloned().unwrap_or_default();
        debug_assert!(
            !ids.is_empty(),
            "listing job for {key} has no attached listers"
        );

        let mut streamed = Vec::new();
        let mut root = None;
        if let Some(state) = self.in_use.get_mut(&key) {
            for entry in batch {
                match entry.name.as_str() {
                    ".." => {}
                    "." => {
                        root = Some(entry.clone());
                        state.root = Some(entry);
                    }
                    _ => {
                        state.entries.insert(entry.name.clone(), entry.clone());
                        streamed.push(entry);
                    }
                }
            }
        }

        if let Some(record) = self.jobs.get_mut(&job) {
            record.buffer.extend(streamed.iter().cloned());
        }

        for id in ids {
            if let Some(l) = self.listers.get_mut(&id) {
                if let Some(root) = &root
                    && l.root_item.is_none()
                    && l.root_url.as_ref() == Some(&key)
                {
                    l.root_item = Some(root.clone());
                }
                for entry in &streamed {
                    l.add_new_item(entry);
                }
                l.flush(key.as_url());
            }
        }
    }

    fn job_finished(&mut self, job: JobId, error: Option<String>) {
        let Some(record) = self.jobs.remove(&job) else {
            return;
        };
        let key = record.key;

        match record.kind {
            JobKind::Listing => {
                self.list_jobs.remove(&key);
                let ids = self.listing.remove(&key).unwrap_or_default();

                match &error {
                    None => {
                        if let Some(state) = self.in_use.get_mut(&key) {
                            state.complete = true;
                        }
                        info!("finished listing {key}");
                    }
                    Some(e) => {
                        // The directory stays incomplete and is never
                        // promoted to the snapshot cache.
                        warn!("listing {key} failed: {e}");
                    }
                }

                for id in ids {
                    self.move_to_holding(id, &key);
                    if let Some(l) = self.listers.get_mut(&id) {
                        l.active_jobs = l.active_jobs.saturating_sub(1);
                        match &error {
                            None => l.send(ListerEvent::Completed(key.as_url().clone())),
                            Some(_) => l.send(ListerEvent::Canceled(key.as_url().clone())),
                        }
                        if l.active_jobs == 0 {
                            l.complete = true;
                        }
                    }
                }
            }
            JobKind::Update => {
                self.update_jobs.remove(&key);

                // An update that superseded a listing job inherits its
                // listers; fold them into the holders now.
                if !self.list_jobs.contains_key(&key)
                    && let Some(listed) = self.listing.remove(&key)
                {
                    for id in listed {
                        self.move_to_holding(id, &key);
                    }
                }
                let ids = self.holding.get(&key).cloned().unwrap_or_default();

                match error {
                    Some(e) => {
                        warn!("update of {key} failed: {e}");
                        for id in ids {
                            if let Some(l) = self.listers.get_mut(&id) {
                                l.active_jobs = l.active_jobs.saturating_sub(1);
                                l.send(ListerEvent::Canceled(key.as_url().clone()));
                                if l.active_jobs == 0 {
                                    l.complete = true;
                                }
                            }
                        }
                    }
                    None => {
                        self.apply_update(&key, record.buffer, &ids);
                        for id in ids {
                            if let Some(l) = self.listers.get_mut(&id) {
                                l.active_jobs = l.active_jobs.saturating_sub(1);
                                l.send(ListerEvent::Completed(key.as_url().clone()));
                                if l.active_jobs == 0 {
                                    l.complete = true;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Reconcile a finished update against the cached entries and fan the
    /// delta out to the holders.
    fn apply_update(&mut self, key: &DirKey, incoming: Vec<Entry>, ids: &[ListerId]) {
        let Some(state) = self.in_use.get_mut(key) else {
            debug_assert!(false, "update finished for unreferenced {key}");
            return;
        };
        state.complete = true;
        let delta = reconcile(&mut state.entries, incoming);
        if let Some(root) = &delta.root {
            state.root = Some(root.clone());
        }
        if delta.is_empty() {
            debug!("update of {key}: unchanged");
        } else {
            info!(
                "update of {key}: {} added, {} refreshed, {} removed",
                delta.added.len(),
                delta.refreshed.len(),
                delta.removed.len()
            );
        }

        // Removed directories drag their cached subtrees with them.
        let gone_dirs: Vec<DirKey> = delta
            .removed
            .iter()
            .filter(|entry| entry.is_dir())
            .filter_map(|entry| DirKey::from_url(entry.url(key)).ok())
            .collect();

        for id in ids {
            if let Some(l) = self.listers.get_mut(id) {
                if let Some(root) = &delta.root
                    && l.root_item.is_none()
                    && l.root_url.as_ref() == Some(key)
                {
                    l.root_item = Some(root.clone());
                }
                for entry in &delta.removed {
                    l.add_deleted_item(entry);
                }
                for entry in &delta.added {
                    l.add_new_item(entry);
                }
                for (old, new) in &delta.refreshed {
                    l.add_refresh_pair(old, new);
                }
                l.flush(key.as_url());
            }
        }

        for gone in gone_dirs {
            self.delete_subtree(&gone);
        }
    }

    fn job_redirect(&mut self, job: JobId, new_url: Url) {
        let Some(record) = self.jobs.get_mut(&job) else {
            return;
        };
        if record.kind == JobKind::Update {
            warn!("ignoring redirect of update job for {}", record.key);
            return;
        }

        record.redirects += 1;
        if record.redirects > self.config.max_redirects {
            let key = record.key.clone();
            let error = ListingError::TooManyRedirects(key.to_string());
            warn!("{error}");
            self.backend.cancel(job);
            self.job_finished(job, Some(error.to_string()));
            return;
        }

        let old_key = record.key.clone();
        let new_key = match DirKey::from_url(new_url) {
            Ok(key) => key,
            Err(e) => {
                self.backend.cancel(job);
                self.job_finished(job, Some(e.to_string()));
                return;
            }
        };
        if new_key == old_key {
            return;
        }
        info!("redirection {old_key} -> {new_key}");

        // Re-key the state. Redirects arrive before entries, so whatever
        // was streamed is discarded along with the replay buffer.
        let mut state = match self.in_use.remove(&old_key) {
            Some(state) => state,
            None => DirState::new(&old_key),
        };
        state.entries.clear();
        state.root = None;
        state.complete = false;
        let moved_refs = state.watch_refs;
        if moved_refs > 0
            && let Some(path) = &state.local_path
        {
            self.watcher.unwatch(path);
        }
        state.local_path = new_key.to_local_path();

        if let Some(record) = self.jobs.get_mut(&job) {
            record.key = new_key.clone();
            record.buffer.clear();
        }
        self.list_jobs.remove(&old_key);

        let ids = self.listing.remove(&old_key).unwrap_or_default();
        for id in &ids {
            if let Some(l) = self.listers.get_mut(id) {
                if let Some(pos) = l.dirs.iter().position(|k| *k == old_key) {
                    l.dirs[pos] = new_key.clone();
                }
                if l.root_url.as_ref() == Some(&old_key) {
                    l.root_url = Some(new_key.clone());
                    l.root_item = None;
                }
                l.send(ListerEvent::Redirected {
                    from: old_key.as_url().clone(),
                    to: new_key.as_url().clone(),
                });
            }
        }

        if let Some(&existing_job) = self.list_jobs.get(&new_key) {
            // Someone is already listing the target: fold our listers
            // into that job instead of running a duplicate.
            debug!("redirection joins running listing of {new_key}");
            self.backend.cancel(job);
            self.jobs.remove(&job);
            Self::merge_watch_refs(self.watcher.as_mut(), &mut self.in_use, &new_key, moved_refs);
            drop(state);
            let replay = self
                .jobs
                .get(&existing_job)
                .map(|r| r.buffer.clone())
                .unwrap_or_default();
            for id in ids {
                self.register_listing(id, &new_key);
                if let Some(l) = self.listers.get_mut(&id) {
                    for entry in &replay {
                        l.add_new_item(entry);
                    }
                    l.flush(new_key.as_url());
                }
            }
        } else if self.in_use.contains_key(&new_key) {
            // The target is already held: keep the existing snapshot
            // (holders keep their delivered entries) and let our job
            // stream into it.
            debug!("redirection merges into held {new_key}");
            Self::merge_watch_refs(self.watcher.as_mut(), &mut self.in_use, &new_key, moved_refs);
            drop(state);
            self.list_jobs.insert(new_key.clone(), job);
            for id in ids {
                self.register_listing(id, &new_key);
            }
        } else {
            if let Some(mut stale) = self.cached.pop(&new_key) {
                Self::drop_watch(self.watcher.as_mut(), &mut stale);
            }
            if moved_refs > 0
                && let Some(path) = &state.local_path
                && let Err(e) = self.watcher.watch(path)
            {
                warn!("failed to watch {}: {e}", path.display());
            }
            self.in_use.insert(new_key.clone(), state);
            self.list_jobs.insert(new_key.clone(), job);
            for id in ids {
                self.register_listing(id, &new_key);
            }
        }
    }

    // ---- open helpers -------------------------------------------------

    /// Join a listing job already running for `key`: replay everything
    /// streamed so far, then keep receiving the live stream.
    fn join_running_listing(&mut self, id: ListerId, key: &DirKey, job: JobId) {
        debug!("open {key}: joining running listing");
        let replay = self
            .jobs
            .get(&job)
            .map(|record| record.buffer.clone())
            .unwrap_or_default();
        let root = self.in_use.get(key).and_then(|state| state.root.clone());

        self.register_listing(id, key);
        if let Some(l) = self.listers.get_mut(&id) {
            l.active_jobs += 1;
            l.complete = false;
            l.send(ListerEvent::Started(key.as_url().clone()));
            if let Some(root) = root
                && l.root_item.is_none()
                && l.root_url.as_ref() == Some(key)
            {
                l.root_item = Some(root);
            }
            for entry in &replay {
                l.add_new_item(entry);
            }
            l.flush(key.as_url());
        }
    }

    /// Serve a complete (or completing) snapshot synchronously and
    /// register the lister as holding it.
    fn serve_snapshot(&mut self, id: ListerId, key: &DirKey) {
        self.assert_untracked(id, key);
        let entries: Vec<Entry> = self
            .in_use
            .get(key)
            .map(|state| state.entries.values().cloned().collect())
            .unwrap_or_default();
        let root = self.in_use.get(key).and_then(|state| state.root.clone());

        if let Some(l) = self.listers.get_mut(&id) {
            l.send(ListerEvent::Started(key.as_url().clone()));
            if let Some(root) = root
                && l.root_item.is_none()
                && l.root_url.as_ref() == Some(key)
            {
                l.root_item = Some(root);
            }
            for entry in &entries {
                l.add_new_item(entry);
            }
            l.flush(key.as_url());
            l.send(ListerEvent::Completed(key.as_url().clone()));
        }
        self.holding.entry(key.clone()).or_default().push(id);
    }

    /// Create fresh state for `key` and start its listing job.
    fn start_listing(&mut self, id: ListerId, key: &DirKey) {
        debug!("open {key}: starting listing job");
        self.assert_untracked(id, key);
        let state = DirState::new(key);
        self.in_use.insert(key.clone(), state);
        self.listing.insert(key.clone(), vec![id]);

        let job = self.alloc_job();
        self.jobs.insert(
            job,
            JobRecord {
                key: key.clone(),
                kind: JobKind::Listing,
                buffer: Vec::new(),
                redirects: 0,
            },
        );
        self.list_jobs.insert(key.clone(), job);

        if let Some(l) = self.listers.get_mut(&id) {
            l.active_jobs += 1;
            l.complete = false;
            if l.root_url.as_ref() == Some(key) {
                l.root_item = None;
            }
            l.send(ListerEvent::Started(key.as_url().clone()));
        }

        if let Err(e) = self.backend.start(job, key.as_url(), self.job_tx.clone()) {
            warn!("listing job for {key} failed to start: {e}");
            self.handle_job_message(JobMessage {
                job,
                event: JobEvent::Failed(e.to_string()),
            });
        }
    }

    /// Register a lister in the listing set of `key`. Job accounting is
    /// the caller's business: joining a job bumps it, re-keying after a
    /// redirect keeps the existing count.
    fn register_listing(&mut self, id: ListerId, key: &DirKey) {
        self.assert_untracked(id, key);
        self.listing.entry(key.clone()).or_default().push(id);
    }

    // ---- detach helpers -----------------------------------------------

    /// Detach `id` from the listing of `key`, cancelling the shared job
    /// if it was the last interested lister.
    fn stop_one(&mut self, id: ListerId, key: &DirKey) {
        let Some(ids) = self.listing.get_mut(key) else {
            return;
        };
        let Some(pos) = ids.iter().position(|x| *x == id) else {
            return;
        };
        ids.remove(pos);
        let now_empty = ids.is_empty();
        if now_empty {
            self.listing.remove(key);
        }

        self.move_to_holding(id, key);
        if let Some(l) = self.listers.get_mut(&id) {
            l.active_jobs = l.active_jobs.saturating_sub(1);
            l.send(ListerEvent::Canceled(key.as_url().clone()));
            if l.active_jobs == 0 {
                l.complete = true;
            }
        }

        if now_empty {
            debug!("last lister left {key}, cancelling its job");
            self.kill_job_for(key);
        }
    }

    /// Release every directory a lister references.
    fn forget_all(&mut self, id: ListerId) {
        let dirs = self
            .listers
            .get_mut(&id)
            .map(|l| std::mem::take(&mut l.dirs))
            .unwrap_or_default();
        for key in dirs {
            self.forget_dir_inner(id, &key);
        }
    }

    /// Release one directory of a lister.
    fn forget_dir(&mut self, id: ListerId, key: &DirKey) {
        if let Some(l) = self.listers.get_mut(&id)
            && let Some(pos) = l.dirs.iter().position(|k| k == key)
        {
            l.dirs.remove(pos);
        }
        self.forget_dir_inner(id, key);
    }

    fn forget_dir_inner(&mut self, id: ListerId, key: &DirKey) {
        let Some(holders) = self.holding.get_mut(key) else {
            return;
        };
        let Some(pos) = holders.iter().position(|x| *x == id) else {
            return;
        };
        holders.remove(pos);
        let now_empty = holders.is_empty();
        if now_empty {
            self.holding.remove(key);
        }

        if now_empty && !self.listing.contains_key(key) {
            if let Some(mut state) = self.in_use.remove(key) {
                // A running update just lost its last audience.
                if self.kill_job_for(key)
                    && let Some(l) = self.listers.get_mut(&id)
                {
                    debug!("cancelled update job for {key}");
                    l.active_jobs = l.active_jobs.saturating_sub(1);
                    l.send(ListerEvent::Canceled(key.as_url().clone()));
                    if l.active_jobs == 0 {
                        l.complete = true;
                    }
                }

                if state.complete {
                    debug!("{key} moved into the snapshot cache");
                    // Cached snapshots keep themselves fresh: the cache
                    // itself holds one watch reference.
                    Self::acquire_watch(self.watcher.as_mut(), &mut state);
                    if let Some((victim_key, mut victim)) = self.cached.push(key.clone(), state) {
                        if victim_key != *key {
                            debug!("evicted {victim_key} from the snapshot cache");
                        }
                        Self::drop_watch(self.watcher.as_mut(), &mut victim);
                    }
                } else {
                    debug!("discarding incomplete {key}");
                    Self::drop_watch(self.watcher.as_mut(), &mut state);
                }
            }
        }

        if self.listers.get(&id).map(|l| l.auto_update).unwrap_or(false) {
            self.watch_dec(key);
        }
    }

    /// Move a lister from the listing set of `key` into its holding set.
    fn move_to_holding(&mut self, id: ListerId, key: &DirKey) {
        let holders = self.holding.entry(key.clone()).or_default();
        assert!(
            !holders.contains(&id),
            "{id} already holds {key} while listing it"
        );
        holders.push(id);
    }

    /// A lister about to be registered for `key` must not already sit in
    /// either coordination set; that would mean job deduplication broke.
    fn assert_untracked(&self, id: ListerId, key: &DirKey) {
        assert!(
            !self
                .listing
                .get(key)
                .is_some_and(|ids| ids.contains(&id)),
            "{id} already listing {key}"
        );
        assert!(
            !self
                .holding
                .get(key)
                .is_some_and(|ids| ids.contains(&id)),
            "{id} already holding {key}"
        );
    }

    // ---- rename and delete --------------------------------------------

    /// Relocate every in-use directory under `src` onto `dst`, rewriting
    /// entry URLs, and purge stale snapshots under `src`.
    fn rename_tree(&mut self, src: &DirKey, dst: &DirKey) {
        let affected: Vec<DirKey> = self
            .in_use
            .keys()
            .filter(|key| src.contains(key))
            .cloned()
            .collect();

        for old_key in affected {
            let Some(new_key) = old_key.relocate(src, dst) else {
                continue;
            };
            debug!("relocating {old_key} -> {new_key}");

            if let Some(mut state) = self.in_use.remove(&old_key) {
                for entry in state.entries.values_mut() {
                    if let Some(target) = &entry.target_url
                        && let Some(moved) = relocate_url(target, src, dst)
                    {
                        entry.target_url = Some(moved);
                    }
                }
                if let Some(root) = &mut state.root
                    && let Some(target) = &root.target_url
                    && let Some(moved) = relocate_url(target, src, dst)
                {
                    root.target_url = Some(moved);
                }
                if state.watch_refs > 0
                    && let Some(path) = &state.local_path
                {
                    self.watcher.unwatch(path);
                }
                state.local_path = new_key.to_local_path();
                if state.watch_refs > 0
                    && let Some(path) = &state.local_path
                    && let Err(e) = self.watcher.watch(path)
                {
                    warn!("failed to watch {}: {e}", path.display());
                }
                self.in_use.insert(new_key.clone(), state);
            }

            // Holders learn the new location.
            if let Some(ids) = self.holding.remove(&old_key) {
                for id in &ids {
                    self.rekey_lister_dir(*id, &old_key, &new_key);
                    if let Some(l) = self.listers.get_mut(id) {
                        l.send(ListerEvent::Redirected {
                            from: old_key.as_url().clone(),
                            to: new_key.as_url().clone(),
                        });
                    }
                }
                self.holding.insert(new_key.clone(), ids);
            }

            // An interrupted listing restarts against the new location.
            if let Some(ids) = self.listing.remove(&old_key) {
                self.kill_job_for(&old_key);
                for id in &ids {
                    self.rekey_lister_dir(*id, &old_key, &new_key);
                    if let Some(l) = self.listers.get_mut(id) {
                        l.send(ListerEvent::Canceled(old_key.as_url().clone()));
                        l.send(ListerEvent::Started(new_key.as_url().clone()));
                    }
                }
                self.listing.insert(new_key.clone(), ids);
                self.restart_listing(&new_key);
            }
        }

        self.purge_cached_under(src);
    }

    fn rekey_lister_dir(&mut self, id: ListerId, old_key: &DirKey, new_key: &DirKey) {
        if let Some(l) = self.listers.get_mut(&id) {
            if let Some(pos) = l.dirs.iter().position(|k| k == old_key) {
                l.dirs[pos] = new_key.clone();
            }
            if l.root_url.as_ref() == Some(old_key) {
                l.root_url = Some(new_key.clone());
                if let Some(root) = &mut l.root_item
                    && let Some(target) = &root.target_url
                    && let Some(moved) = relocate_url(target, old_key, new_key)
                {
                    root.target_url = Some(moved);
                }
            }
        }
    }

    /// Start a listing job for `key` whose listing set is already
    /// populated (rename recovery).
    fn restart_listing(&mut self, key: &DirKey) {
        if self.list_jobs.contains_key(key) {
            return;
        }
        self.in_use
            .entry(key.clone())
            .or_insert_with(|| DirState::new(key))
            .complete = false;

        let job = self.alloc_job();
        self.jobs.insert(
            job,
            JobRecord {
                key: key.clone(),
                kind: JobKind::Listing,
                buffer: Vec::new(),
                redirects: 0,
            },
        );
        self.list_jobs.insert(key.clone(), job);
        if let Err(e) = self.backend.start(job, key.as_url(), self.job_tx.clone()) {
            warn!("restarted listing for {key} failed to start: {e}");
            self.handle_job_message(JobMessage {
                job,
                event: JobEvent::Failed(e.to_string()),
            });
        }
    }

    /// Refresh the renamed entry itself inside its parent listing.
    fn rename_parent_entry(&mut self, from: &Url, to: &Url) {
        let Some((old_parent, old_name)) = DirKey::split_file_url(from) else {
            return;
        };
        let Some((new_parent, new_name)) = DirKey::split_file_url(to) else {
            return;
        };

        if old_parent == new_parent {
            let Some(old) = self.remove_entry(&old_parent, &old_name) else {
                return;
            };
            let mut new = old.renamed(&new_name);
            if let (Some(target), Ok(src), Ok(dst)) = (
                &old.target_url,
                DirKey::from_url(from.clone()),
                DirKey::from_url(to.clone()),
            ) && let Some(moved) = relocate_url(target, &src, &dst)
            {
                new.target_url = Some(moved);
            }
            self.insert_entry(&old_parent, new.clone());
            self.notify_refresh(&old_parent, &old, &new);
        } else {
            // Moved across directories: disappearance here, appearance
            // there.
            if let Some(old) = self.remove_entry(&old_parent, &old_name) {
                for id in self.holding.get(&old_parent).cloned().unwrap_or_default() {
                    if let Some(l) = self.listers.get_mut(&id) {
                        l.add_deleted_item(&old);
                        l.flush(old_parent.as_url());
                    }
                }
            }
            self.update_key(&new_parent);
        }
    }

    /// Evict `key` and every cached descendant, detaching all listers and
    /// cancelling in-flight jobs under the subtree.
    fn delete_subtree(&mut self, key: &DirKey) {
        let affected: Vec<DirKey> = self
            .in_use
            .keys()
            .filter(|k| key.contains(k))
            .cloned()
            .collect();

        for gone in &affected {
            debug!("deleting {gone}");

            // Anyone still listing it gets a cancel first; that also
            // moves them into the holders we detach next.
            let listed = self.listing.get(gone).cloned().unwrap_or_default();
            for id in &listed {
                self.stop_one(*id, gone);
            }

            let holders = self.holding.get(gone).cloned().unwrap_or_default();
            for id in holders {
                if let Some(l) = self.listers.get_mut(&id)
                    && l.root_url.as_ref() == Some(gone)
                {
                    l.root_item = None;
                }
                self.forget_dir(id, gone);
                if !listed.contains(&id)
                    && let Some(l) = self.listers.get_mut(&id)
                {
                    l.send(ListerEvent::Canceled(gone.as_url().clone()));
                }
            }

            self.kill_job_for(gone);
            self.pending_updates.remove(gone);

            // forget_dir may have parked the complete snapshot in the
            // cache; the purge below sweeps it out again.
            if let Some(mut state) = self.in_use.remove(gone) {
                Self::drop_watch(self.watcher.as_mut(), &mut state);
            }
        }

        self.purge_cached_under(key);
    }

    fn purge_cached_under(&mut self, key: &DirKey) {
        let stale: Vec<DirKey> = self
            .cached
            .iter()
            .filter(|(k, _)| key.contains(k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in stale {
            if let Some(mut state) = self.cached.pop(&k) {
                debug!("purged {k} from the snapshot cache");
                Self::drop_watch(self.watcher.as_mut(), &mut state);
            }
        }
    }

    // ---- entry plumbing -----------------------------------------------

    fn entries_of(&self, key: &DirKey) -> Vec<Entry> {
        if let Some(state) = self.in_use.get(key) {
            state.entries.values().cloned().collect()
        } else if let Some(state) = self.cached.peek(key) {
            state.entries.values().cloned().collect()
        } else {
            Vec::new()
        }
    }

    fn lookup_entry(&self, key: &DirKey, name: &str) -> Option<Entry> {
        if let Some(state) = self.in_use.get(key) {
            return state.entries.get(name).cloned();
        }
        self.cached
            .peek(key)
            .and_then(|state| state.entries.get(name).cloned())
    }

    fn remove_entry(&mut self, key: &DirKey, name: &str) -> Option<Entry> {
        if let Some(state) = self.in_use.get_mut(key) {
            return state.entries.remove(name);
        }
        self.cached
            .peek_mut(key)
            .and_then(|state| state.entries.remove(name))
    }

    fn insert_entry(&mut self, key: &DirKey, entry: Entry) {
        if let Some(state) = self.in_use.get_mut(key) {
            state.entries.insert(entry.name.clone(), entry);
        } else if let Some(state) = self.cached.peek_mut(key) {
            state.entries.insert(entry.name.clone(), entry);
        }
    }

    /// Swap an entry in place and notify every lister attached to the
    /// parent, whether holding or still listing.
    fn replace_entry(&mut self, parent: &DirKey, old: &Entry, new: Entry) {
        self.insert_entry(parent, new.clone());
        self.notify_refresh(parent, old, &new);
    }

    fn notify_refresh(&mut self, parent: &DirKey, old: &Entry, new: &Entry) {
        let mut ids = self.holding.get(parent).cloned().unwrap_or_default();
        for id in self.listing.get(parent).cloned().unwrap_or_default() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for id in ids {
            if let Some(l) = self.listers.get_mut(&id) {
                l.add_refresh_pair(old, new);
                l.flush(parent.as_url());
            }
        }
    }

    // ---- jobs and watches ---------------------------------------------

    fn alloc_job(&mut self) -> JobId {
        let job = JobId(self.next_job);
        self.next_job += 1;
        job
    }

    /// Cancel whatever job is running for `key`. Listers attached to it
    /// are deliberately left untouched: callers decide what they learn.
    fn kill_job_for(&mut self, key: &DirKey) -> bool {
        let job = self
            .list_jobs
            .remove(key)
            .or_else(|| self.update_jobs.remove(key));
        match job {
            Some(job) => {
                self.backend.cancel(job);
                self.jobs.remove(&job);
                true
            }
            None => false,
        }
    }

    fn watch_inc(&mut self, key: &DirKey) {
        if let Some(state) = self.in_use.get_mut(key) {
            Self::acquire_watch(self.watcher.as_mut(), state);
        } else if let Some(state) = self.cached.peek_mut(key) {
            Self::acquire_watch(self.watcher.as_mut(), state);
        }
    }

    fn watch_dec(&mut self, key: &DirKey) {
        if let Some(state) = self.in_use.get_mut(key) {
            Self::release_watch(self.watcher.as_mut(), state);
        } else if let Some(state) = self.cached.peek_mut(key) {
            Self::release_watch(self.watcher.as_mut(), state);
        }
    }

    fn acquire_watch(watcher: &mut dyn DirectoryWatch, state: &mut DirState) {
        state.watch_refs += 1;
        if state.watch_refs == 1
            && let Some(path) = &state.local_path
            && let Err(e) = watcher.watch(path)
        {
            warn!("failed to watch {}: {e}", path.display());
        }
    }

    fn release_watch(watcher: &mut dyn DirectoryWatch, state: &mut DirState) {
        if state.watch_refs == 0 {
            return;
        }
        state.watch_refs -= 1;
        if state.watch_refs == 0
            && let Some(path) = &state.local_path
        {
            watcher.unwatch(path);
        }
    }

    /// Release every reference a dying state still holds.
    fn drop_watch(watcher: &mut dyn DirectoryWatch, state: &mut DirState) {
        if state.watch_refs > 0
            && let Some(path) = &state.local_path
        {
            watcher.unwatch(path);
        }
        state.watch_refs = 0;
    }

    /// Fold watch references carried over from a re-keyed state into the
    /// state already present at the target key.
    fn merge_watch_refs(
        watcher: &mut dyn DirectoryWatch,
        in_use: &mut HashMap<DirKey, DirState>,
        key: &DirKey,
        refs: u32,
    ) {
        if refs == 0 {
            return;
        }
        if let Some(state) = in_use.get_mut(key) {
            let was_unwatched = state.watch_refs == 0;
            state.watch_refs += refs;
            if was_unwatched
                && let Some(path) = &state.local_path
                && let Err(e) = watcher.watch(path)
            {
                warn!("failed to watch {}: {e}", path.display());
            }
        }
    }

    // ---- lookups ------------------------------------------------------

    fn ensure_lister(&self, id: ListerId) -> Result<()> {
        if self.listers.contains_key(&id) {
            Ok(())
        } else {
            Err(ListingError::UnknownLister(id.0))
        }
    }

    fn lister(&self, id: ListerId) -> Result<&ListerState> {
        self.listers
            .get(&id)
            .ok_or(ListingError::UnknownLister(id.0))
    }

    fn lister_mut(&mut self, id: ListerId) -> Result<&mut ListerState> {
        self.listers
            .get_mut(&id)
            .ok_or(ListingError::UnknownLister(id.0))
    }
}
