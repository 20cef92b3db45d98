//! Directory entry snapshots.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::key::DirKey;

/// Mimetype reported for directories.
pub const DIRECTORY_MIME: &str = "inode/directory";

/// Kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Regular file.
    File,

    /// Directory.
    Directory,

    /// Symbolic link.
    Symlink,
}

/// Stat-like metadata for one entry.
///
/// This is the display-relevant subset compared during reconciliation;
/// the mimetype deliberately lives outside of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// What kind of object this is.
    pub kind: EntryKind,

    /// Size in bytes.
    pub size: u64,

    /// Last modification time, when the backend knows it.
    pub modified: Option<DateTime<Utc>>,

    /// Unix permission bits, when the backend knows them.
    pub mode: Option<u32>,
}

impl EntryMeta {
    /// Metadata for a plain file of the given size.
    pub fn file(size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            modified: None,
            mode: None,
        }
    }

    /// Metadata for a directory.
    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
            mode: None,
        }
    }

    /// Set the modification time.
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Set the permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Value snapshot of one filesystem object inside a listed directory.
///
/// Entries are plain values: the cache hands out clones and never expects
/// an observer to mutate shared state through them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Name within the containing directory.
    pub name: String,

    /// Explicit URL override. Most entries derive their URL from the
    /// containing directory; backends that list virtual folders can point
    /// an entry somewhere else entirely.
    pub target_url: Option<Url>,

    /// Stat-like metadata.
    pub meta: EntryMeta,

    /// Whether the entry is hidden in directory views.
    pub hidden: bool,

    /// Resolved mimetype, if resolution already happened.
    mime: Option<String>,
}

impl Entry {
    /// Create an entry. The hidden flag defaults to the Unix dotfile
    /// convention and can be overridden with [`Entry::with_hidden`].
    pub fn new(name: impl Into<String>, meta: EntryMeta) -> Self {
        let name = name.into();
        let hidden = name.starts_with('.') && name != "." && name != "..";
        Self {
            name,
            target_url: None,
            meta,
            hidden,
            mime: None,
        }
    }

    /// Override the hidden flag.
    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    /// Attach an explicit target URL.
    pub fn with_target_url(mut self, url: Url) -> Self {
        self.target_url = Some(url);
        self
    }

    /// Attach an already-resolved mimetype.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.meta.kind == EntryKind::Directory
    }

    /// The entry's URL within `dir`, honoring an explicit override.
    pub fn url(&self, dir: &DirKey) -> Url {
        match &self.target_url {
            Some(url) => url.clone(),
            None => dir.join(&self.name),
        }
    }

    /// The entry's mimetype, resolving it from the name on first use.
    ///
    /// Directories always report [`DIRECTORY_MIME`]; everything else falls
    /// back to an extension-based guess when no resolved type is stored.
    pub fn mime_type(&self) -> Cow<'_, str> {
        if let Some(mime) = &self.mime {
            return Cow::Borrowed(mime);
        }
        if self.is_dir() {
            return Cow::Borrowed(DIRECTORY_MIME);
        }
        Cow::Owned(
            mime_guess::from_path(&self.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        )
    }

    /// Clone of this entry under a new name. The resolved mimetype is
    /// dropped so it gets re-derived from the new name; an explicit
    /// target URL is kept and rewritten by the caller if needed.
    pub(crate) fn renamed(&self, name: &str) -> Entry {
        let mut entry = self.clone();
        entry.name = name.to_string();
        entry.hidden = name.starts_with('.') && name != "." && name != "..";
        entry.mime = None;
        entry
    }

    /// Structural comparison for change detection.
    ///
    /// Deliberately excludes the mimetype: resolution is lazy, so two
    /// snapshots of an unchanged file may differ only in whether the type
    /// has been computed yet.
    pub fn same_listing(&self, other: &Entry) -> bool {
        self.name == other.name
            && self.target_url == other.target_url
            && self.hidden == other.hidden
            && self.meta == other.meta
    }
}
