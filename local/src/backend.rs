//! Local filesystem enumeration.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use url::Url;

use dirview_listing::{
    Entry, EntryKind, EntryMeta, JobEvent, JobId, JobMessage, ListBackend, ListingError, Result,
};

/// Enumeration backend for `file://` URLs.
///
/// Each job runs `read_dir` on the blocking thread pool and streams entry
/// batches back over the job channel, starting with the `.` entry of the
/// listed directory itself. Cancellation is cooperative: the flag is
/// checked between batches.
///
/// `start` must be called from within a tokio runtime.
pub struct LocalBackend {
    batch_size: usize,
    active: Arc<Mutex<HashMap<JobId, Arc<AtomicBool>>>>,
}

impl LocalBackend {
    /// Backend with the default batch size.
    pub fn new() -> Self {
        Self {
            batch_size: 64,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set how many entries go into one streamed batch.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ListBackend for LocalBackend {
    fn supports(&self, url: &Url) -> bool {
        url.scheme() == "file"
    }

    fn start(&mut self, job: JobId, url: &Url, events: UnboundedSender<JobMessage>) -> Result<()> {
        let path = url
            .to_file_path()
            .map_err(|_| ListingError::InvalidUrl(url.to_string()))?;
        let cancelled = Arc::new(AtomicBool::new(false));
        if let Ok(mut active) = self.active.lock() {
            active.insert(job, Arc::clone(&cancelled));
        }

        debug!("{job}: listing {}", path.display());
        let batch_size = self.batch_size;
        let active = Arc::clone(&self.active);
        tokio::task::spawn_blocking(move || {
            list_directory(job, &path, batch_size, &cancelled, &events);
            if let Ok(mut active) = active.lock() {
                active.remove(&job);
            }
        });
        Ok(())
    }

    fn cancel(&mut self, job: JobId) {
        if let Ok(mut active) = self.active.lock()
            && let Some(flag) = active.remove(&job)
        {
            debug!("{job}: cancelled");
            flag.store(true, Ordering::Relaxed);
        }
    }

    fn stat(&mut self, url: &Url) -> Option<Entry> {
        let path = url.to_file_path().ok()?;
        let name = path.file_name()?.to_str()?.to_string();
        let metadata = fs::symlink_metadata(&path).ok()?;
        Some(entry_named(name, &metadata))
    }
}

/// Blocking part of one listing job.
fn list_directory(
    job: JobId,
    path: &Path,
    batch_size: usize,
    cancelled: &AtomicBool,
    events: &UnboundedSender<JobMessage>,
) {
    let send = |event: JobEvent| {
        let _ = events.send(JobMessage { job, event });
    };

    let root = match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => entry_named(".".to_string(), &metadata),
        Ok(_) => {
            send(JobEvent::Failed(format!(
                "not a directory: {}",
                path.display()
            )));
            return;
        }
        Err(e) => {
            send(JobEvent::Failed(format!(
                "cannot list {}: {e}",
                path.display()
            )));
            return;
        }
    };
    send(JobEvent::Entries(vec![root]));

    let reader = match fs::read_dir(path) {
        Ok(reader) => reader,
        Err(e) => {
            send(JobEvent::Failed(format!(
                "cannot list {}: {e}",
                path.display()
            )));
            return;
        }
    };

    let mut batch = Vec::with_capacity(batch_size);
    for dir_entry in reader {
        if cancelled.load(Ordering::Relaxed) {
            debug!("{job}: stopped mid-listing");
            return;
        }
        let dir_entry = match dir_entry {
            Ok(dir_entry) => dir_entry,
            Err(e) => {
                warn!("{job}: skipping unreadable entry: {e}");
                continue;
            }
        };
        let Some(name) = dir_entry.file_name().to_str().map(str::to_string) else {
            warn!("{job}: skipping entry with non-unicode name");
            continue;
        };
        batch.push(entry_for(name, &dir_entry.path()));
        if batch.len() >= batch_size {
            send(JobEvent::Entries(std::mem::take(&mut batch)));
        }
    }
    if !batch.is_empty() {
        send(JobEvent::Entries(batch));
    }

    if cancelled.load(Ordering::Relaxed) {
        return;
    }
    send(JobEvent::Finished);
}

fn entry_for(name: String, path: &Path) -> Entry {
    match fs::symlink_metadata(path) {
        Ok(metadata) => entry_named(name, &metadata),
        // The object vanished between read_dir and stat; report what we
        // still know.
        Err(_) => Entry::new(name, EntryMeta::file(0)),
    }
}

fn entry_named(name: String, metadata: &fs::Metadata) -> Entry {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    };

    let mut meta = EntryMeta {
        kind,
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        mode: None,
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.mode = Some(metadata.permissions().mode());
    }

    Entry::new(name, meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn run_listing(backend: &mut LocalBackend, url: &Url) -> (Vec<Entry>, bool) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend.start(JobId(1), url, tx).unwrap();

        let mut entries = Vec::new();
        let mut finished = false;
        while let Some(msg) = rx.recv().await {
            match msg.event {
                JobEvent::Entries(batch) => entries.extend(batch),
                JobEvent::Finished => {
                    finished = true;
                    break;
                }
                JobEvent::Failed(_) => break,
                JobEvent::Redirect(_) => {}
            }
        }
        (entries, finished)
    }

    #[tokio::test]
    async fn test_lists_directory_with_root_entry_first() {
        let temp_dir = TempDir::new().unwrap();
        let mut f = File::create(temp_dir.path().join("hello.txt")).unwrap();
        writeln!(f, "hi").unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let mut backend = LocalBackend::new();
        let url = Url::from_directory_path(temp_dir.path()).unwrap();
        let (entries, finished) = run_listing(&mut backend, &url).await;

        assert!(finished);
        assert_eq!(entries[0].name, ".");
        assert!(entries[0].is_dir());

        let mut names: Vec<&str> = entries[1..].iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["hello.txt", "sub"]);

        let sub = entries.iter().find(|e| e.name == "sub").unwrap();
        assert_eq!(sub.meta.kind, EntryKind::Directory);
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let mut backend = LocalBackend::new();
        let url = Url::parse("file:///definitely/not/here/12345").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend.start(JobId(7), &url, tx).unwrap();

        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg.event, JobEvent::Failed(_)));
    }

    #[tokio::test]
    async fn test_rejects_non_file_urls() {
        let backend = LocalBackend::new();
        assert!(!backend.supports(&Url::parse("ftp://host/dir").unwrap()));
        assert!(backend.supports(&Url::parse("file:///tmp").unwrap()));
    }

    #[tokio::test]
    async fn test_stat_single_entry() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("data.bin");
        fs::write(&file_path, [0u8; 16]).unwrap();

        let mut backend = LocalBackend::new();
        let url = Url::from_file_path(&file_path).unwrap();
        let entry = backend.stat(&url).unwrap();
        assert_eq!(entry.name, "data.bin");
        assert_eq!(entry.meta.size, 16);
        assert_eq!(entry.meta.kind, EntryKind::File);
    }
}
