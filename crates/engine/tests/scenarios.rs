//! End-to-end scenarios across the assembled engine.

use common::{EngineOptions, Entry, EntryRef, PageId};
use engine::ObaDb;
use radix::Scope;
use storage::{PageManager, PageManagerOptions, PageType};
use tempfile::TempDir;
use wal::WalRecordType;

fn options(dir: &TempDir) -> EngineOptions {
    EngineOptions::builder()
        .data_dir(dir.path().to_path_buf())
        .initial_pages(8)
        .build()
}

#[test]
fn freed_page_is_the_next_one_allocated() {
    let dir = TempDir::new().unwrap();
    let pm = PageManager::open(
        dir.path().join("data.oba"),
        PageManagerOptions {
            initial_pages: 5,
            ..Default::default()
        },
    )
    .unwrap();

    let mut allocated = Vec::new();
    while pm.stats().free_pages > 0 {
        allocated.push(pm.allocate_page(PageType::Data).unwrap());
    }
    let victim = allocated[2];
    pm.free_page(victim).unwrap();
    assert_eq!(pm.allocate_page(PageType::Data).unwrap(), victim);
    pm.close().unwrap();
}

#[test]
fn clean_close_leaves_only_the_checkpoint_in_the_wal() {
    let dir = TempDir::new().unwrap();
    {
        let db = ObaDb::open(options(&dir)).unwrap();
        for i in 0..5 {
            db.add_entry(
                &Entry::new(format!("uid=u{i},dc=example,dc=com")).add_attribute("uid", format!("u{i}")),
            )
            .unwrap();
        }
        db.close().unwrap();
    }

    let db = ObaDb::open(options(&dir)).unwrap();
    let mut iter = db.wal().iter(1).unwrap();
    let mut types = Vec::new();
    while let Some(record) = iter.next().unwrap() {
        types.push(record.record_type);
    }
    assert_eq!(types, vec![WalRecordType::Checkpoint]);
    db.close().unwrap();
}

#[test]
fn onelevel_search_yields_exactly_the_direct_children() {
    let dir = TempDir::new().unwrap();
    let db = ObaDb::open(options(&dir)).unwrap();

    for dn in [
        "dc=com",
        "dc=example,dc=com",
        "ou=users,dc=example,dc=com",
        "uid=alice,ou=users,dc=example,dc=com",
        "uid=bob,ou=users,dc=example,dc=com",
        "cn=deep,uid=alice,ou=users,dc=example,dc=com",
    ] {
        db.add_entry(&Entry::new(dn).add_attribute("objectclass", "top"))
            .unwrap();
    }

    let results = db
        .search_scope("ou=users,dc=example,dc=com", Scope::OneLevel)
        .unwrap();
    let mut dns: Vec<&str> = results.iter().map(|(dn, _)| dn.as_str()).collect();
    dns.sort();
    assert_eq!(
        dns,
        vec![
            "uid=alice,ou=users,dc=example,dc=com",
            "uid=bob,ou=users,dc=example,dc=com",
        ]
    );

    let subtree = db
        .search_scope("ou=users,dc=example,dc=com", Scope::Subtree)
        .unwrap();
    assert_eq!(subtree.len(), 4);
    db.close().unwrap();
}

#[test]
fn index_search_follows_entry_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = ObaDb::open(options(&dir)).unwrap();
    db.index_manager()
        .create_index("mail", index::IndexType::Equality)
        .unwrap();

    let entry = Entry::new("uid=alice,ou=users,dc=example,dc=com")
        .add_attribute("objectclass", "inetOrgPerson")
        .add_attribute("uid", "alice")
        .add_attribute("mail", "alice@example.com");
    let eref = db.add_entry(&entry).unwrap();

    let hits = db.index_manager().search("uid", "alice").unwrap();
    assert_eq!(hits, vec![eref]);
    assert_eq!(
        db.index_manager().search("mail", "alice@example.com").unwrap(),
        vec![eref]
    );

    let modified = Entry::new("uid=alice,ou=users,dc=example,dc=com")
        .add_attribute("objectclass", "inetOrgPerson")
        .add_attribute("uid", "alice")
        .add_attribute("mail", "alice@new.com");
    let new_ref = db.modify_entry(&modified).unwrap();
    assert!(db
        .index_manager()
        .search("mail", "alice@example.com")
        .unwrap()
        .is_empty());
    assert_eq!(
        db.index_manager().search("mail", "alice@new.com").unwrap(),
        vec![new_ref]
    );

    db.delete_entry("uid=alice,ou=users,dc=example,dc=com").unwrap();
    assert!(db.index_manager().search("uid", "alice").unwrap().is_empty());
    db.close().unwrap();
}

#[test]
fn subtree_counts_are_queryable_through_the_engine() {
    let dir = TempDir::new().unwrap();
    let db = ObaDb::open(options(&dir)).unwrap();
    for dn in [
        "dc=com",
        "ou=users,dc=com",
        "uid=a,ou=users,dc=com",
        "uid=b,ou=users,dc=com",
    ] {
        db.add_entry(&Entry::new(dn).add_attribute("objectclass", "top"))
            .unwrap();
    }
    assert_eq!(db.dn_index().get_subtree_count("dc=com").unwrap(), 4);
    assert_eq!(db.dn_index().get_subtree_count("ou=users,dc=com").unwrap(), 3);
    assert!(db.dn_index().verify_counts());
    db.close().unwrap();
}

#[test]
fn deleted_entries_stay_gone_after_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = ObaDb::open(options(&dir)).unwrap();
        db.add_entry(&Entry::new("uid=a,dc=com").add_attribute("uid", "a"))
            .unwrap();
        db.add_entry(&Entry::new("uid=b,dc=com").add_attribute("uid", "b"))
            .unwrap();
        db.delete_entry("uid=a,dc=com").unwrap();
        db.close().unwrap();
    }

    let db = ObaDb::open(options(&dir)).unwrap();
    assert!(db.get_entry("uid=a,dc=com").unwrap().is_none());
    assert!(db.get_entry("uid=b,dc=com").unwrap().is_some());
    assert!(db.index_manager().search("uid", "a").unwrap().is_empty());
    db.close().unwrap();
}

#[test]
fn entry_refs_point_into_real_pages() {
    let dir = TempDir::new().unwrap();
    let db = ObaDb::open(options(&dir)).unwrap();
    let eref: EntryRef = db
        .add_entry(&Entry::new("uid=a,dc=com").add_attribute("uid", "a"))
        .unwrap();
    assert_ne!(eref.page_id, PageId(0));
    let page = db.page_manager().read_page(eref.page_id).unwrap();
    assert_eq!(page.page_type, PageType::Data);
    db.close().unwrap();
}
