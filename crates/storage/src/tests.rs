use super::*;
use common::{DbError, PageId};
use proptest::prelude::*;
use tempfile::tempdir;

fn open_new(dir: &std::path::Path, initial_pages: u64) -> PageManager {
    let options = PageManagerOptions {
        initial_pages,
        ..Default::default()
    };
    PageManager::open(dir.join("data.oba"), options).unwrap()
}

#[test]
fn page_roundtrip_preserves_payload_and_checksum() {
    let mut page = Page::new(PageId(7), PageType::Data);
    page.payload[0..4].copy_from_slice(b"obad");
    page.item_count = 3;

    let image = page.serialize();
    let restored = Page::deserialize_validated(&image).unwrap();
    assert_eq!(restored.id, PageId(7));
    assert_eq!(restored.page_type, PageType::Data);
    assert_eq!(restored.item_count, 3);
    assert_eq!(restored.payload, page.payload);
}

#[test]
fn corrupted_payload_fails_validation() {
    let page = Page::new(PageId(3), PageType::Data);
    let mut image = page.serialize();
    image[PAGE_HEADER_SIZE + 100] ^= 0xFF;
    assert!(matches!(
        Page::deserialize_validated(&image),
        Err(DbError::InvalidChecksum(3))
    ));
    // The non-validating variant still parses.
    assert!(Page::deserialize(&image).is_ok());
}

#[test]
fn header_roundtrip_and_corruption() {
    let mut header = FileHeader::new(16);
    header.dn_index_root = PageId(2);
    let image = header.serialize();
    assert_eq!(FileHeader::deserialize_validated(&image).unwrap(), header);

    let mut bad_magic = image;
    bad_magic[0] = b'X';
    assert!(matches!(
        FileHeader::deserialize_validated(&bad_magic),
        Err(DbError::InvalidMagic)
    ));

    let mut bad_crc = image;
    bad_crc[12] ^= 0xFF;
    assert!(matches!(
        FileHeader::deserialize_validated(&bad_crc),
        Err(DbError::HeaderChecksum)
    ));

    let mut future = FileHeader::new(16);
    future.version = FORMAT_VERSION + 1;
    assert!(matches!(
        FileHeader::deserialize_validated(&future.serialize()),
        Err(DbError::UnsupportedVersion(_))
    ));
}

#[test]
fn fresh_file_has_initial_free_pages() {
    let dir = tempdir().unwrap();
    let pm = open_new(dir.path(), 5);
    assert_eq!(pm.total_pages(), 5);
    assert_eq!(pm.stats().free_pages, 4);
}

#[test]
fn freed_page_is_reused_lifo() {
    let dir = tempdir().unwrap();
    let pm = open_new(dir.path(), 5);

    let mut allocated = Vec::new();
    for _ in 0..4 {
        allocated.push(pm.allocate_page(PageType::Data).unwrap());
    }
    assert_eq!(pm.stats().free_pages, 0);

    let victim = allocated[1];
    pm.free_page(victim).unwrap();
    assert_eq!(pm.allocate_page(PageType::Data).unwrap(), victim);
}

#[test]
fn exhausted_free_list_grows_the_file() {
    let dir = tempdir().unwrap();
    let pm = open_new(dir.path(), 2);
    pm.allocate_page(PageType::Data).unwrap();
    let grown = pm.allocate_page(PageType::Data).unwrap();
    assert_eq!(grown, PageId(2));
    assert!(pm.total_pages() > 2);
    assert!(pm.stats().free_pages > 0);
}

#[test]
fn free_page_argument_errors() {
    let dir = tempdir().unwrap();
    let pm = open_new(dir.path(), 5);
    assert!(matches!(pm.free_page(PageId(0)), Err(DbError::CannotFreeHeader)));
    assert!(matches!(
        pm.free_page(PageId(99)),
        Err(DbError::PageOutOfRange(99))
    ));
    assert!(matches!(
        pm.free_page(PageId(3)),
        Err(DbError::PageAlreadyFree(3))
    ));
}

#[test]
fn write_read_roundtrip_through_file() {
    let dir = tempdir().unwrap();
    let pm = open_new(dir.path(), 5);
    let id = pm.allocate_page(PageType::Data).unwrap();

    let mut page = pm.read_page(id).unwrap();
    page.payload[0..8].copy_from_slice(b"original");
    page.item_count = 1;
    pm.write_page(&page).unwrap();

    let back = pm.read_page_validated(id).unwrap();
    assert_eq!(&back.payload[0..8], b"original");
    assert_eq!(back.item_count, 1);
}

#[test]
fn close_then_reopen_restores_free_list_and_roots() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.oba");

    let freed;
    {
        let pm = PageManager::open(
            &path,
            PageManagerOptions {
                initial_pages: 8,
                ..Default::default()
            },
        )
        .unwrap();
        let a = pm.allocate_page(PageType::Data).unwrap();
        let _b = pm.allocate_page(PageType::DnIndex).unwrap();
        pm.free_page(a).unwrap();
        freed = a;
        pm.set_dn_index_root(PageId(3)).unwrap();
        pm.close().unwrap();
        assert!(matches!(pm.close(), Err(DbError::FileClosed)));
    }

    let pm = PageManager::open(&path, PageManagerOptions::default()).unwrap();
    assert_eq!(pm.dn_index_root(), PageId(3));
    assert!(pm.free_list().contains(freed));
    // Everything freed-but-not-reallocated survives the reopen.
    assert_eq!(pm.total_pages(), 8);
}

#[test]
fn closed_manager_rejects_operations() {
    let dir = tempdir().unwrap();
    let pm = open_new(dir.path(), 4);
    let id = pm.allocate_page(PageType::Data).unwrap();
    pm.close().unwrap();

    assert!(matches!(pm.read_page(id), Err(DbError::FileClosed)));
    assert!(matches!(
        pm.allocate_page(PageType::Data),
        Err(DbError::FileClosed)
    ));
    assert!(matches!(pm.sync(), Err(DbError::FileClosed)));
}

#[test]
fn read_only_mode_rejects_mutators() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.oba");
    {
        let pm = PageManager::open(
            &path,
            PageManagerOptions {
                initial_pages: 4,
                ..Default::default()
            },
        )
        .unwrap();
        pm.close().unwrap();
    }

    let pm = PageManager::open(
        &path,
        PageManagerOptions {
            read_only: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(
        pm.allocate_page(PageType::Data),
        Err(DbError::ReadOnly)
    ));
    assert!(matches!(pm.free_page(PageId(1)), Err(DbError::ReadOnly)));
    assert!(pm.read_page(PageId(1)).is_ok());
    pm.close().unwrap();
}

#[test]
fn free_list_serializes_across_multiple_chain_pages() {
    let list = FreeList::new();
    let total = FREE_LIST_ENTRIES_PER_PAGE + 10;
    for i in 0..total {
        list.push(PageId(i as u64 + 1));
    }

    let mut first = Page::new(PageId(1), PageType::Free);
    let (next_idx, more) = list.serialize_to_page(&mut first, 0);
    assert_eq!(next_idx, FREE_LIST_ENTRIES_PER_PAGE);
    assert!(more);

    let mut second = Page::new(PageId(2), PageType::Free);
    let (end, more) = list.serialize_to_page(&mut second, next_idx);
    assert_eq!(end, total);
    assert!(!more);

    crate::freelist::set_next_page(&mut first, PageId(2));
    let restored = FreeList::new();
    restored
        .load_from_pages(&[first.clone(), second.clone()])
        .unwrap();
    assert_eq!(restored.peek_all(), list.peek_all());
    assert_eq!(crate::freelist::next_page(&first), PageId(2));
}

#[test]
fn free_list_remove_and_contains() {
    let list = FreeList::new();
    list.push(PageId(1));
    list.push(PageId(2));
    list.push(PageId(3));
    assert!(list.contains(PageId(2)));
    assert!(list.remove(PageId(2)));
    assert!(!list.contains(PageId(2)));
    assert!(!list.remove(PageId(2)));
    assert_eq!(list.pop(), Some(PageId(3)));
    assert_eq!(list.pop(), Some(PageId(1)));
    assert_eq!(list.pop(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn page_payload_roundtrips(payload in proptest::collection::vec(any::<u8>(), PAGE_PAYLOAD_SIZE)) {
        let mut page = Page::new(PageId(9), PageType::Overflow);
        page.payload.copy_from_slice(&payload);
        let restored = Page::deserialize_validated(&page.serialize()).unwrap();
        prop_assert_eq!(restored.payload, payload);
    }

    #[test]
    fn alloc_free_state_survives_reopen(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.oba");
        let mut live: Vec<PageId> = Vec::new();

        {
            let pm = PageManager::open(
                &path,
                PageManagerOptions { initial_pages: 4, ..Default::default() },
            ).unwrap();
            for alloc in ops {
                if alloc || live.is_empty() {
                    live.push(pm.allocate_page(PageType::Data).unwrap());
                } else {
                    let id = live.swap_remove(live.len() / 2);
                    pm.free_page(id).unwrap();
                }
            }
            pm.close().unwrap();
        }

        let pm = PageManager::open(&path, PageManagerOptions::default()).unwrap();
        let free: std::collections::HashSet<_> =
            pm.free_list().peek_all().into_iter().collect();
        // Every page is either live or free, never both.
        for id in &live {
            prop_assert!(!free.contains(id));
        }
        prop_assert_eq!(free.len() + live.len(), pm.total_pages() as usize - 1);
    }
}
