use super::*;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use storage::PageManagerOptions;
use tempfile::TempDir;

fn open_tree() -> (TempDir, Arc<PageManager>, BTree) {
    let dir = TempDir::new().unwrap();
    let pages = Arc::new(
        PageManager::open(
            dir.path().join("data.oba"),
            PageManagerOptions {
                initial_pages: 4,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let tree = BTree::create(pages.clone()).unwrap();
    (dir, pages, tree)
}

fn eref(page: u64, slot: u16) -> EntryRef {
    EntryRef {
        page_id: PageId(page),
        slot,
    }
}

#[test]
fn empty_tree_finds_nothing() {
    let (_dir, _pages, tree) = open_tree();
    assert!(tree.search(b"missing").unwrap().is_empty());
    assert!(tree.scan_all().unwrap().is_empty());
}

#[test]
fn insert_and_search_single_key() {
    let (_dir, _pages, tree) = open_tree();
    tree.insert(b"alice".to_vec(), eref(42, 5)).unwrap();

    assert_eq!(tree.search(b"alice").unwrap(), vec![eref(42, 5)]);
    assert!(tree.search(b"bob").unwrap().is_empty());
}

#[test]
fn duplicate_keys_accumulate_postings() {
    let (_dir, _pages, tree) = open_tree();
    for slot in 0..5 {
        tree.insert(b"person".to_vec(), eref(1, slot)).unwrap();
    }
    let mut found = tree.search(b"person").unwrap();
    found.sort_by_key(|e| e.slot);
    assert_eq!(found.len(), 5);
    assert_eq!(found[4], eref(1, 4));
}

#[test]
fn splits_preserve_every_key() {
    let (_dir, _pages, tree) = open_tree();
    let count = 500u32;
    for i in 0..count {
        let key = format!("key-{i:05}");
        tree.insert(key.into_bytes(), eref(u64::from(i), 0)).unwrap();
    }

    for i in 0..count {
        let key = format!("key-{i:05}");
        let found = tree.search(key.as_bytes()).unwrap();
        assert_eq!(found, vec![eref(u64::from(i), 0)], "key {key}");
    }
    assert_eq!(tree.scan_all().unwrap().len(), count as usize);
}

#[test]
fn root_page_id_is_stable_across_splits() {
    let (_dir, _pages, tree) = open_tree();
    let root = tree.root_page_id();
    for i in 0..300u32 {
        tree.insert(format!("{i:08}").into_bytes(), eref(u64::from(i), 0))
            .unwrap();
    }
    assert_eq!(tree.root_page_id(), root);
}

#[test]
fn reopen_at_recorded_root_sees_the_same_tree() {
    let (_dir, pages, tree) = open_tree();
    for i in 0..100u32 {
        tree.insert(format!("k{i:04}").into_bytes(), eref(u64::from(i), 1))
            .unwrap();
    }
    let root = tree.root_page_id();

    let reopened = BTree::open(pages, root).unwrap();
    assert_eq!(reopened.scan_all().unwrap().len(), 100);
    assert_eq!(reopened.search(b"k0042").unwrap(), vec![eref(42, 1)]);
}

#[test]
fn delete_removes_only_the_matching_posting() {
    let (_dir, _pages, tree) = open_tree();
    tree.insert(b"shared".to_vec(), eref(1, 1)).unwrap();
    tree.insert(b"shared".to_vec(), eref(2, 2)).unwrap();

    assert!(tree.delete(b"shared", eref(1, 1)).unwrap());
    assert_eq!(tree.search(b"shared").unwrap(), vec![eref(2, 2)]);

    // Deleting again is a no-op, not an error.
    assert!(!tree.delete(b"shared", eref(1, 1)).unwrap());
}

#[test]
fn delete_finds_postings_past_a_leaf_split() {
    let (_dir, _pages, tree) = open_tree();
    // Enough duplicates to guarantee the key spans multiple leaves.
    for slot in 0..80u16 {
        tree.insert(b"dup".to_vec(), eref(9, slot)).unwrap();
    }
    for slot in 0..80u16 {
        assert!(tree.delete(b"dup", eref(9, slot)).unwrap(), "slot {slot}");
    }
    assert!(tree.search(b"dup").unwrap().is_empty());
}

#[test]
fn range_scan_respects_inclusive_bounds() {
    let (_dir, _pages, tree) = open_tree();
    for i in 0..10u32 {
        tree.insert(vec![b'a' + i as u8], eref(u64::from(i), 0)).unwrap();
    }

    let found = tree.scan_range(Some(b"c"), Some(b"f")).unwrap();
    assert_eq!(found.len(), 4);

    let from_start = tree.scan_range(None, Some(b"b")).unwrap();
    assert_eq!(from_start.len(), 2);

    let to_end = tree.scan_range(Some(b"i"), None).unwrap();
    assert_eq!(to_end.len(), 2);
}

#[test]
fn collect_pages_covers_the_whole_tree() {
    let (_dir, pages, tree) = open_tree();
    for i in 0..400u32 {
        tree.insert(format!("key-{i:05}").into_bytes(), eref(u64::from(i), 0))
            .unwrap();
    }

    let collected = tree.collect_pages().unwrap();
    assert!(collected.contains(&tree.root_page_id()));
    assert!(collected.len() > 1);

    // Freeing every collected page leaves no dangling allocations.
    for page_id in collected {
        pages.free_page(page_id).unwrap();
    }
}

#[test]
fn oversized_single_entry_reports_page_overflow() {
    let (_dir, _pages, tree) = open_tree();
    let huge = vec![b'x'; PAGE_PAYLOAD_SIZE];
    assert!(matches!(
        tree.insert(huge, eref(1, 0)),
        Err(DbError::PageOverflow(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn inserted_keys_are_always_findable(
        keys in proptest::collection::hash_set("[a-z]{1,24}", 1..120)
    ) {
        let (_dir, _pages, tree) = open_tree();
        let keys: Vec<String> = keys.into_iter().collect();
        for (i, key) in keys.iter().enumerate() {
            tree.insert(key.clone().into_bytes(), eref(i as u64, 0)).unwrap();
        }
        for (i, key) in keys.iter().enumerate() {
            let found = tree.search(key.as_bytes()).unwrap();
            prop_assert_eq!(found, vec![eref(i as u64, 0)]);
        }
        prop_assert_eq!(tree.scan_all().unwrap().len(), keys.len());
    }
}
