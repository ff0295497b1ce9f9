use super::*;
use common::EntryRef;
use proptest::prelude::*;
use storage::PageManagerOptions;
use tempfile::TempDir;

fn eref(page: u64, slot: u16) -> EntryRef {
    EntryRef {
        page_id: PageId(page),
        slot,
    }
}

fn seeded_tree() -> RadixTree {
    let tree = RadixTree::new();
    tree.insert("dc=com", eref(1, 0)).unwrap();
    tree.insert("dc=example,dc=com", eref(1, 1)).unwrap();
    tree.insert("ou=users,dc=example,dc=com", eref(2, 0)).unwrap();
    tree.insert("uid=alice,ou=users,dc=example,dc=com", eref(2, 1))
        .unwrap();
    tree.insert("uid=bob,ou=users,dc=example,dc=com", eref(2, 2))
        .unwrap();
    tree
}

#[test]
fn insert_lookup_roundtrip() {
    let tree = seeded_tree();
    assert_eq!(
        tree.lookup("uid=alice,ou=users,dc=example,dc=com").unwrap(),
        Some(eref(2, 1))
    );
    assert_eq!(
        tree.lookup("UID=Alice, OU=Users, DC=Example, DC=Com").unwrap(),
        None,
        "values are case-sensitive"
    );
    assert_eq!(tree.lookup("uid=carol,ou=users,dc=example,dc=com").unwrap(), None);
    assert_eq!(tree.len(), 5);
}

#[test]
fn attribute_types_normalize_on_every_path() {
    let tree = RadixTree::new();
    tree.insert("UID=alice,OU=users,DC=com", eref(3, 0)).unwrap();
    assert_eq!(tree.lookup("uid=alice,ou=users,dc=com").unwrap(), Some(eref(3, 0)));
}

#[test]
fn duplicate_insert_is_rejected() {
    let tree = seeded_tree();
    assert!(matches!(
        tree.insert("uid=alice,ou=users,dc=example,dc=com", eref(9, 9)),
        Err(DbError::EntryExists(_))
    ));
}

#[test]
fn intermediate_nodes_exist_without_entries() {
    let tree = RadixTree::new();
    tree.insert("uid=alice,ou=users,dc=example,dc=com", eref(1, 0))
        .unwrap();
    // The path was created but carries no entries above the leaf.
    assert_eq!(tree.lookup("ou=users,dc=example,dc=com").unwrap(), None);
    assert_eq!(tree.get_subtree_count("dc=com").unwrap(), 1);
    assert!(tree.has_children("dc=com").unwrap());
    assert!(!tree.has_children("uid=alice,ou=users,dc=example,dc=com").unwrap());
}

#[test]
fn delete_prunes_empty_branches() {
    let tree = RadixTree::new();
    tree.insert("uid=alice,ou=users,dc=example,dc=com", eref(1, 0))
        .unwrap();
    let nodes_before = tree.node_count();
    assert_eq!(nodes_before, 5); // root + 4 components

    tree.delete("uid=alice,ou=users,dc=example,dc=com").unwrap();
    assert_eq!(tree.node_count(), 1); // only the root survives
    assert_eq!(tree.len(), 0);
}

#[test]
fn delete_stops_pruning_at_entries_and_branches() {
    let tree = seeded_tree();
    tree.delete("uid=alice,ou=users,dc=example,dc=com").unwrap();

    // ou=users still has bob and its own entry; nothing above is pruned.
    assert_eq!(tree.lookup("uid=bob,ou=users,dc=example,dc=com").unwrap(), Some(eref(2, 2)));
    assert_eq!(tree.get_subtree_count("ou=users,dc=example,dc=com").unwrap(), 2);
    assert!(matches!(
        tree.delete("uid=alice,ou=users,dc=example,dc=com"),
        Err(DbError::EntryNotFound(_))
    ));
}

#[test]
fn update_replaces_ref_without_count_change() {
    let tree = seeded_tree();
    tree.update("uid=bob,ou=users,dc=example,dc=com", eref(7, 7))
        .unwrap();
    assert_eq!(tree.lookup("uid=bob,ou=users,dc=example,dc=com").unwrap(), Some(eref(7, 7)));
    assert_eq!(tree.len(), 5);
    assert!(tree.verify_counts());

    assert!(matches!(
        tree.update("uid=nobody,dc=com", eref(0, 0)),
        Err(DbError::EntryNotFound(_))
    ));
}

#[test]
fn subtree_counts_track_mutations() {
    let tree = seeded_tree();
    assert_eq!(tree.get_subtree_count("dc=com").unwrap(), 5);
    assert_eq!(tree.get_subtree_count("ou=users,dc=example,dc=com").unwrap(), 3);
    assert!(tree.verify_counts());

    tree.delete("uid=bob,ou=users,dc=example,dc=com").unwrap();
    assert_eq!(tree.get_subtree_count("dc=com").unwrap(), 4);
    assert!(tree.verify_counts());
}

#[test]
fn get_parent_walks_one_level_up() {
    let tree = seeded_tree();
    assert_eq!(
        tree.get_parent("uid=alice,ou=users,dc=example,dc=com").unwrap(),
        Some("ou=users,dc=example,dc=com".to_string())
    );
    assert_eq!(tree.get_parent("dc=com").unwrap(), None);
}

#[test]
fn base_scope_yields_only_the_base() {
    let tree = seeded_tree();
    let mut iter = tree
        .iterate("ou=users,dc=example,dc=com", Scope::Base)
        .unwrap();
    assert!(iter.next());
    assert_eq!(iter.dn().unwrap(), "ou=users,dc=example,dc=com");
    assert_eq!(iter.entry_ref().unwrap(), eref(2, 0));
    assert!(!iter.next());
}

#[test]
fn base_scope_on_entryless_node_is_empty() {
    let tree = RadixTree::new();
    tree.insert("uid=alice,ou=users,dc=com", eref(1, 0)).unwrap();
    let mut iter = tree.iterate("ou=users,dc=com", Scope::Base).unwrap();
    assert!(!iter.next());
    assert!(iter.is_empty());
}

#[test]
fn onelevel_scope_yields_direct_children_only() {
    let tree = seeded_tree();
    tree.insert("cn=deep,uid=alice,ou=users,dc=example,dc=com", eref(3, 0))
        .unwrap();

    let mut iter = tree
        .iterate("ou=users,dc=example,dc=com", Scope::OneLevel)
        .unwrap();
    let mut dns = Vec::new();
    while iter.next() {
        dns.push(iter.dn().unwrap().to_string());
    }
    dns.sort();
    assert_eq!(
        dns,
        vec![
            "uid=alice,ou=users,dc=example,dc=com",
            "uid=bob,ou=users,dc=example,dc=com",
        ]
    );
}

#[test]
fn subtree_scope_yields_base_and_descendants() {
    let tree = seeded_tree();
    let mut iter = tree
        .iterate("dc=example,dc=com", Scope::Subtree)
        .unwrap();
    let mut dns = Vec::new();
    while iter.next() {
        dns.push(iter.dn().unwrap().to_string());
    }
    assert_eq!(dns.len(), 4);
    assert!(dns.contains(&"dc=example,dc=com".to_string()));
    assert!(dns.contains(&"uid=bob,ou=users,dc=example,dc=com".to_string()));
}

#[test]
fn iterate_missing_base_is_empty() {
    let tree = seeded_tree();
    let mut iter = tree.iterate("ou=ghosts,dc=com", Scope::Subtree).unwrap();
    assert!(!iter.next());
}

#[test]
fn compress_then_lookup_and_mutate() {
    let tree = RadixTree::new();
    tree.insert("uid=alice,ou=users,dc=example,dc=com", eref(1, 0))
        .unwrap();
    let nodes_before = tree.node_count();
    tree.compress();
    assert!(tree.node_count() < nodes_before);
    assert!(tree.verify_counts());

    // Lookups traverse merged edges.
    assert_eq!(
        tree.lookup("uid=alice,ou=users,dc=example,dc=com").unwrap(),
        Some(eref(1, 0))
    );

    // Inserting under a merged edge re-expands it as needed.
    tree.insert("uid=bob,ou=users,dc=example,dc=com", eref(1, 1))
        .unwrap();
    assert_eq!(
        tree.lookup("uid=bob,ou=users,dc=example,dc=com").unwrap(),
        Some(eref(1, 1))
    );
    assert!(tree.verify_counts());

    tree.split();
    assert_eq!(
        tree.lookup("uid=alice,ou=users,dc=example,dc=com").unwrap(),
        Some(eref(1, 0))
    );
    assert!(tree.verify_counts());
}

#[test]
fn persist_root_roundtrips_through_a_page() {
    let dir = TempDir::new().unwrap();
    let pages = PageManager::open(
        dir.path().join("data.oba"),
        PageManagerOptions {
            initial_pages: 4,
            ..Default::default()
        },
    )
    .unwrap();
    let root_page = pages.allocate_page(PageType::DnIndex).unwrap();

    let tree = seeded_tree();
    tree.persist_root(&pages, root_page).unwrap();

    let restored = RadixTree::load_root(&pages, root_page).unwrap();
    assert_eq!(restored.len(), 5);
    assert_eq!(
        restored.lookup("uid=alice,ou=users,dc=example,dc=com").unwrap(),
        Some(eref(2, 1))
    );
    assert_eq!(
        restored.get_subtree_count("ou=users,dc=example,dc=com").unwrap(),
        3
    );
    assert!(restored.verify_counts());
}

#[test]
fn oversized_tree_reports_page_overflow() {
    let dir = TempDir::new().unwrap();
    let pages = PageManager::open(
        dir.path().join("data.oba"),
        PageManagerOptions {
            initial_pages: 4,
            ..Default::default()
        },
    )
    .unwrap();
    let root_page = pages.allocate_page(PageType::DnIndex).unwrap();

    let tree = RadixTree::new();
    for i in 0..200 {
        tree.insert(&format!("uid=user-{i:04},ou=people,dc=example,dc=com"), eref(1, i))
            .unwrap();
    }
    assert!(matches!(
        tree.persist_root(&pages, root_page),
        Err(DbError::PageOverflow(_))
    ));
}

#[test]
fn cache_file_roundtrip_and_staleness() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("radix.cache");

    let tree = seeded_tree();
    tree.save_cache(&path, 42).unwrap();

    match RadixTree::load_cache(&path, 42).unwrap() {
        CacheLoad::Loaded(restored) => {
            assert_eq!(restored.len(), 5);
            assert_eq!(
                restored.lookup("uid=bob,ou=users,dc=example,dc=com").unwrap(),
                Some(eref(2, 2))
            );
            assert!(restored.verify_counts());
        }
        CacheLoad::Stale => panic!("cache should match tx id 42"),
    }

    assert!(matches!(
        RadixTree::load_cache(&path, 43).unwrap(),
        CacheLoad::Stale
    ));
}

#[test]
fn corrupted_cache_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("radix.cache");
    seeded_tree().save_cache(&path, 1).unwrap();

    let mut raw = std::fs::read(&path).unwrap();
    let last = raw.len() - 1;
    raw[last] ^= 0xFF;
    std::fs::write(&path, &raw).unwrap();

    assert!(matches!(
        RadixTree::load_cache(&path, 1),
        Err(DbError::FileCorrupted(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn subtree_counts_hold_under_random_mutations(
        ops in proptest::collection::vec((any::<bool>(), 0u8..4, 0u8..4, 0u8..4), 1..100)
    ) {
        let tree = RadixTree::new();
        let mut live: std::collections::HashSet<String> = Default::default();

        for (insert, a, b, c) in ops {
            let dn = format!("uid=u{a},ou=o{b},dc=d{c}");
            if insert {
                match tree.insert(&dn, eref(1, u16::from(a))) {
                    Ok(()) => { live.insert(dn); }
                    Err(DbError::EntryExists(_)) => {}
                    Err(e) => return Err(TestCaseError::fail(format!("insert: {e}"))),
                }
            } else {
                match tree.delete(&dn) {
                    Ok(()) => { live.remove(&dn); }
                    Err(DbError::EntryNotFound(_)) => {}
                    Err(e) => return Err(TestCaseError::fail(format!("delete: {e}"))),
                }
            }
            prop_assert!(tree.verify_counts());
            prop_assert_eq!(tree.len(), live.len());
        }

        for dn in &live {
            prop_assert!(tree.lookup(dn).unwrap().is_some());
        }
    }
}
