//! Reconciliation of a fresh listing against cached entries.

use std::collections::{BTreeMap, HashSet};

use crate::entry::Entry;

/// Outcome of reconciling one update listing.
#[derive(Debug, Default)]
pub struct ListingDelta {
    /// Entries that were not present before, in enumeration order.
    pub added: Vec<Entry>,

    /// Entries whose display-relevant metadata changed, as `(old, new)`.
    pub refreshed: Vec<(Entry, Entry)>,

    /// Entries that no longer exist.
    pub removed: Vec<Entry>,

    /// Fresh root entry (`.`), when the listing contained one.
    pub root: Option<Entry>,
}

impl ListingDelta {
    /// Whether the listing turned out to be unchanged.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.refreshed.is_empty() && self.removed.is_empty()
    }
}

/// Mark-and-sweep diff: apply `incoming` to `current` in place and report
/// what actually changed.
///
/// Every incoming entry costs one map lookup; entries left unseen after
/// the pass are removals. Unchanged entries are kept as-is so an already
/// resolved mimetype survives the update. `.` is captured as the root
/// entry and `..` is skipped, mirroring what enumeration backends emit.
pub fn reconcile(current: &mut BTreeMap<String, Entry>, incoming: Vec<Entry>) -> ListingDelta {
    let mut delta = ListingDelta::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(incoming.len());

    for entry in incoming {
        match entry.name.as_str() {
            "." => {
                delta.root = Some(entry);
                continue;
            }
            ".." => continue,
            _ => {}
        }

        match current.get(&entry.name) {
            Some(old) => {
                seen.insert(entry.name.clone());
                if !old.same_listing(&entry) {
                    delta.refreshed.push((old.clone(), entry.clone()));
                    current.insert(entry.name.clone(), entry);
                }
            }
            None => {
                seen.insert(entry.name.clone());
                delta.added.push(entry.clone());
                current.insert(entry.name.clone(), entry);
            }
        }
    }

    let gone: Vec<String> = current
        .keys()
        .filter(|name| !seen.contains(*name))
        .cloned()
        .collect();
    for name in gone {
        if let Some(entry) = current.remove(&name) {
            delta.removed.push(entry);
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryMeta;
    use pretty_assertions::assert_eq;

    fn listing(entries: &[Entry]) -> BTreeMap<String, Entry> {
        entries
            .iter()
            .map(|e| (e.name.clone(), e.clone()))
            .collect()
    }

    #[test]
    fn test_unchanged_listing_is_idempotent() {
        let a = Entry::new("a.txt", EntryMeta::file(3));
        let b = Entry::new("b.txt", EntryMeta::file(5));
        let mut current = listing(&[a.clone(), b.clone()]);

        let delta = reconcile(&mut current, vec![a, b]);
        assert!(delta.is_empty());
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn test_added_and_removed() {
        let a = Entry::new("a.txt", EntryMeta::file(3));
        let b = Entry::new("b.txt", EntryMeta::file(5));
        let c = Entry::new("c.txt", EntryMeta::file(1));
        let mut current = listing(&[a.clone(), b.clone()]);

        let delta = reconcile(&mut current, vec![a, c]);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].name, "c.txt");
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].name, "b.txt");
        assert!(delta.refreshed.is_empty());
        assert!(current.contains_key("c.txt"));
        assert!(!current.contains_key("b.txt"));
    }

    #[test]
    fn test_metadata_change_refreshes() {
        let old = Entry::new("a.txt", EntryMeta::file(3));
        let new = Entry::new("a.txt", EntryMeta::file(7));
        let mut current = listing(&[old.clone()]);

        let delta = reconcile(&mut current, vec![new.clone()]);
        assert_eq!(delta.refreshed.len(), 1);
        assert_eq!(delta.refreshed[0].0.meta.size, 3);
        assert_eq!(delta.refreshed[0].1.meta.size, 7);
        assert_eq!(current["a.txt"].meta.size, 7);
    }

    #[test]
    fn test_resolved_mime_survives_unchanged_entry() {
        let resolved = Entry::new("a.txt", EntryMeta::file(3)).with_mime("text/x-custom");
        let mut current = listing(&[resolved]);

        let delta = reconcile(&mut current, vec![Entry::new("a.txt", EntryMeta::file(3))]);
        assert!(delta.is_empty());
        assert_eq!(current["a.txt"].mime_type(), "text/x-custom");
    }

    #[test]
    fn test_dot_entries() {
        let mut current = BTreeMap::new();
        let delta = reconcile(
            &mut current,
            vec![
                Entry::new(".", EntryMeta::directory()),
                Entry::new("..", EntryMeta::directory()),
                Entry::new("a.txt", EntryMeta::file(1)),
            ],
        );
        assert!(delta.root.is_some());
        assert_eq!(delta.added.len(), 1);
        assert_eq!(current.len(), 1);
    }
}
