//! End-to-end listing of real directories through the cache.

use std::fs;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use url::Url;

use dirview_listing::{
    CacheConfig, EntryKind, ListerEvent, ListerOptions, ListingCache, NullWatch, WhichItems,
};
use dirview_local::LocalBackend;

fn cache() -> ListingCache {
    ListingCache::new(
        Box::new(LocalBackend::new()),
        Box::new(NullWatch),
        CacheConfig::new(),
    )
}

/// Pump the cache until this lister's directory finishes one way or the
/// other, returning everything it observed.
async fn wait_for_terminal(
    cache: &mut ListingCache,
    rx: &mut UnboundedReceiver<ListerEvent>,
) -> Vec<ListerEvent> {
    let mut events = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            while let Ok(event) = rx.try_recv() {
                let terminal = matches!(
                    event,
                    ListerEvent::Completed(_) | ListerEvent::Canceled(_)
                );
                events.push(event);
                if terminal {
                    return;
                }
            }
            if !cache.run_once().await {
                return;
            }
        }
    })
    .await
    .expect("listing did not reach a terminal event in time");
    events
}

#[tokio::test]
async fn test_lists_real_directory() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.txt"), "one").unwrap();
    fs::write(temp_dir.path().join("b.txt"), "two!").unwrap();
    fs::create_dir(temp_dir.path().join("sub")).unwrap();

    let mut cache = cache();
    let (id, mut rx) = cache.add_lister(&ListerOptions::new());
    let url = Url::from_directory_path(temp_dir.path()).unwrap();
    cache.open(id, url.as_str(), false, false).unwrap();

    let events = wait_for_terminal(&mut cache, &mut rx).await;
    assert!(matches!(events.last(), Some(ListerEvent::Completed(_))));

    let mut names: Vec<String> = cache
        .items(id, WhichItems::All)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

    let sub = cache.find_by_name(id, "sub").unwrap().unwrap();
    assert_eq!(sub.meta.kind, EntryKind::Directory);
    let a = cache.find_by_name(id, "a.txt").unwrap().unwrap();
    assert_eq!(a.meta.size, 3);

    let root = cache.root_item(id).unwrap().expect("root entry");
    assert!(root.is_dir());
}

#[tokio::test]
async fn test_second_open_is_served_from_cache() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("kept.txt"), "data").unwrap();

    let mut cache = cache();
    let url = Url::from_directory_path(temp_dir.path()).unwrap();

    let (a, mut rx_a) = cache.add_lister(&ListerOptions::new());
    cache.open(a, url.as_str(), false, false).unwrap();
    wait_for_terminal(&mut cache, &mut rx_a).await;
    let first: Vec<String> = cache
        .items(a, WhichItems::All)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    cache.remove_lister(a).unwrap();

    // Served synchronously from the snapshot cache, no job, no pumping.
    let (b, mut rx_b) = cache.add_lister(&ListerOptions::new());
    cache.open(b, url.as_str(), false, false).unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx_b.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.last(), Some(ListerEvent::Completed(_))));

    let second: Vec<String> = cache
        .items(b, WhichItems::All)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_hidden_files_follow_lister_filters() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("visible.txt"), "v").unwrap();
    fs::write(temp_dir.path().join(".dotfile"), "h").unwrap();

    let mut cache = cache();
    let (id, mut rx) = cache.add_lister(&ListerOptions::new());
    let url = Url::from_directory_path(temp_dir.path()).unwrap();
    cache.open(id, url.as_str(), false, false).unwrap();
    let events = wait_for_terminal(&mut cache, &mut rx).await;

    let delivered: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            ListerEvent::NewItems { entries, .. } => {
                Some(entries.iter().map(|e| e.name.clone()).collect::<Vec<_>>())
            }
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(delivered, vec!["visible.txt"]);

    // The snapshot still knows the hidden entry.
    assert_eq!(cache.items(id, WhichItems::All).unwrap().len(), 2);
    assert_eq!(cache.items(id, WhichItems::Filtered).unwrap().len(), 1);
}

#[tokio::test]
async fn test_open_missing_directory_cancels() {
    let mut cache = cache();
    let (id, mut rx) = cache.add_lister(&ListerOptions::new());
    cache
        .open(id, "file:///definitely/not/here/12345", false, false)
        .unwrap();

    let events = wait_for_terminal(&mut cache, &mut rx).await;
    assert!(matches!(events.last(), Some(ListerEvent::Canceled(_))));
    assert!(cache.is_finished(id).unwrap());
}
