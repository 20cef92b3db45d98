//! Canonical directory keys.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ListingError, Result};

/// Canonicalized directory URL.
///
/// Every map in the cache is keyed by a `DirKey`, so canonicalization
/// happens exactly once: empty path segments are collapsed and trailing
/// separators stripped, which makes `file:///tmp/x/` and `file:///tmp//x`
/// the same directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirKey(Url);

impl DirKey {
    /// Parse and canonicalize a directory URL.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|_| ListingError::InvalidUrl(input.to_string()))?;
        Self::from_url(url)
    }

    /// Canonicalize an already-parsed URL.
    pub fn from_url(mut url: Url) -> Result<Self> {
        if url.cannot_be_a_base() {
            return Err(ListingError::InvalidUrl(url.to_string()));
        }
        let segments: Vec<String> = url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        url.set_path(&format!("/{}", segments.join("/")));
        url.set_fragment(None);
        Ok(Self(url))
    }

    /// Key for a local directory path.
    pub fn from_local_path(path: &Path) -> Result<Self> {
        let url = Url::from_file_path(path)
            .map_err(|_| ListingError::InvalidUrl(path.display().to_string()))?;
        Self::from_url(url)
    }

    /// The underlying URL.
    pub fn as_url(&self) -> &Url {
        &self.0
    }

    /// String form of the canonical URL.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// URL of a child entry inside this directory.
    pub fn join(&self, name: &str) -> Url {
        let mut url = self.0.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(name);
        }
        url
    }

    /// Key of a child directory inside this directory.
    pub fn child(&self, name: &str) -> Result<Self> {
        Self::from_url(self.join(name))
    }

    /// Key of the parent directory, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.path() == "/" {
            return None;
        }
        let mut url = self.0.clone();
        url.path_segments_mut().ok()?.pop();
        Self::from_url(url).ok()
    }

    /// Split a file URL into its containing directory key and entry name.
    pub fn split_file_url(url: &Url) -> Option<(Self, String)> {
        let name = url.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
        let name = name.to_string();
        let key = Self::from_url(url.clone()).ok()?;
        Some((key.parent()?, name))
    }

    /// Whether `other` is this directory or somewhere below it.
    pub fn contains(&self, other: &DirKey) -> bool {
        if self.0.scheme() != other.0.scheme()
            || self.0.host_str() != other.0.host_str()
            || self.0.port() != other.0.port()
        {
            return false;
        }
        let base = self.0.path();
        let path = other.0.path();
        if base == "/" {
            return true;
        }
        path == base
            || (path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
    }

    /// Re-base this key from `old_base` onto `new_base`.
    ///
    /// Returns `None` when the key does not live under `old_base`.
    pub fn relocate(&self, old_base: &DirKey, new_base: &DirKey) -> Option<Self> {
        relocate_url(&self.0, old_base, new_base).and_then(|url| Self::from_url(url).ok())
    }

    /// Canonical local path for watch targeting, for `file://` keys only.
    pub fn to_local_path(&self) -> Option<PathBuf> {
        if self.0.scheme() == "file" {
            self.0.to_file_path().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for DirKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Re-base any URL under `old_base` onto `new_base`, preserving the
/// relative suffix. Used when a renamed directory drags its cached
/// subtree along.
pub fn relocate_url(url: &Url, old_base: &DirKey, new_base: &DirKey) -> Option<Url> {
    let key = DirKey::from_url(url.clone()).ok()?;
    if !old_base.contains(&key) {
        return None;
    }
    let base_path = old_base.as_url().path();
    let suffix = if base_path == "/" {
        key.as_url().path().to_string()
    } else {
        key.as_url().path()[base_path.len()..].to_string()
    };
    let mut out = new_base.as_url().clone();
    if !suffix.is_empty() {
        out.set_path(&format!(
            "{}{}",
            new_base.as_url().path().trim_end_matches('/'),
            suffix
        ));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_canonicalization() {
        let a = DirKey::parse("file:///home/user/").unwrap();
        let b = DirKey::parse("file:///home//user").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "file:///home/user");
    }

    #[test]
    fn test_rejects_non_hierarchical_urls() {
        assert!(DirKey::parse("mailto:nobody@example.org").is_err());
        assert!(DirKey::parse("not a url").is_err());
    }

    #[test]
    fn test_join_and_parent() {
        let key = DirKey::parse("file:///home/user").unwrap();
        assert_eq!(key.join("a.txt").as_str(), "file:///home/user/a.txt");
        assert_eq!(key.parent().unwrap().as_str(), "file:///home");
        assert!(DirKey::parse("file:///").unwrap().parent().is_none());
    }

    #[test]
    fn test_split_file_url() {
        let url = Url::parse("file:///home/user/a.txt").unwrap();
        let (dir, name) = DirKey::split_file_url(&url).unwrap();
        assert_eq!(dir.as_str(), "file:///home/user");
        assert_eq!(name, "a.txt");
    }

    #[test]
    fn test_contains() {
        let base = DirKey::parse("file:///home/user").unwrap();
        assert!(base.contains(&base));
        assert!(base.contains(&DirKey::parse("file:///home/user/sub/deep").unwrap()));
        assert!(!base.contains(&DirKey::parse("file:///home/username").unwrap()));
        assert!(!base.contains(&DirKey::parse("ftp://host/home/user").unwrap()));
    }

    #[test]
    fn test_relocate() {
        let old_base = DirKey::parse("file:///home/old").unwrap();
        let new_base = DirKey::parse("file:///home/new").unwrap();
        let nested = DirKey::parse("file:///home/old/sub").unwrap();

        let moved = nested.relocate(&old_base, &new_base).unwrap();
        assert_eq!(moved.as_str(), "file:///home/new/sub");

        assert_eq!(
            old_base.relocate(&old_base, &new_base).unwrap(),
            new_base
        );

        let outside = DirKey::parse("file:///etc").unwrap();
        assert!(outside.relocate(&old_base, &new_base).is_none());
    }
}
