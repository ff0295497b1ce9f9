//! Attribute index manager.
//!
//! Secondary indexes map attribute values to entry locations, one B+Tree
//! per indexed attribute. Three kinds are supported:
//!
//! - **Equality** — key is the attribute value itself.
//! - **Presence** — a single marker key per entry that carries the
//!   attribute at all.
//! - **Substring** — fixed-length 3-grams of each value; a substring query
//!   intersects the posting lists of the needle's 3-grams, and the filter
//!   layer re-applies the full pattern to the candidates.
//!
//! The set of indexes is persisted in a dedicated metadata page (type
//! `AttrIndex`, payload marker `0xAA`) listing each attribute, its index
//! kind, and its tree's root page, so `IndexManager::new` can reopen every
//! index from a cold start.


use btree::BTree;
use common::{DbError, DbResult, Entry, EntryRef, PageId};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use storage::{Page, PageManager, PageType, PAGE_PAYLOAD_SIZE};
use tracing::{debug, warn};

/// Shortest indexed substring; also the n-gram width.
pub const MIN_SUBSTR: usize = 3;

/// Key under which presence postings are stored (LDAP's presence-filter
/// wildcard).
pub const PRESENCE_MARKER: &[u8] = b"*";

const METADATA_MARKER: u8 = 0xAA;
const MAX_ATTRIBUTE_LEN: usize = 256;

/// Kinds of secondary index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexType {
    Equality = 1,
    Presence = 2,
    Substring = 3,
}

impl TryFrom<u8> for IndexType {
    type Error = DbError;

    fn try_from(value: u8) -> DbResult<Self> {
        match value {
            1 => Ok(IndexType::Equality),
            2 => Ok(IndexType::Presence),
            3 => Ok(IndexType::Substring),
            other => Err(DbError::MetadataCorrupted(format!(
                "unknown index type byte {other:#04x}"
            ))),
        }
    }
}

/// One secondary index: an attribute, a kind, and its B+Tree.
struct Index {
    attribute: String,
    index_type: IndexType,
    tree: BTree,
}

/// What [`IndexManager::get_index`] and [`IndexManager::list_indexes`]
/// report about an index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub attribute: String,
    pub index_type: IndexType,
    pub root_page_id: PageId,
}

struct Inner {
    indexes: HashMap<String, Index>,
    metadata_page: PageId,
    closed: bool,
}

/// Owns every secondary index and their metadata page.
pub struct IndexManager {
    pages: Arc<PageManager>,
    inner: RwLock<Inner>,
}

impl IndexManager {
    /// Load the index set from the metadata page, or bootstrap a fresh one
    /// with the default equality indexes (`objectclass`, `uid`, `cn`).
    pub fn new(pages: Arc<PageManager>) -> DbResult<Self> {
        match Self::find_metadata_page(&pages)? {
            Some((metadata_page, indexes)) => {
                debug!(count = indexes.len(), page = metadata_page.0, "loaded index metadata");
                Ok(Self {
                    pages,
                    inner: RwLock::new(Inner {
                        indexes,
                        metadata_page,
                        closed: false,
                    }),
                })
            }
            None => {
                let metadata_page = pages.allocate_page(PageType::AttrIndex)?;
                let manager = Self {
                    pages,
                    inner: RwLock::new(Inner {
                        indexes: HashMap::new(),
                        metadata_page,
                        closed: false,
                    }),
                };
                manager.create_default_indexes()?;
                Ok(manager)
            }
        }
    }

    fn create_default_indexes(&self) -> DbResult<()> {
        for attr in ["objectclass", "uid", "cn"] {
            self.create_index(attr, IndexType::Equality)?;
        }
        Ok(())
    }

    /// Scan for the page carrying the metadata marker and load the index
    /// set recorded there.
    fn find_metadata_page(
        pages: &Arc<PageManager>,
    ) -> DbResult<Option<(PageId, HashMap<String, Index>)>> {
        for id in 1..pages.total_pages() {
            let page = pages.read_page_validated(PageId(id))?;
            if page.page_type != PageType::AttrIndex || page.payload[0] != METADATA_MARKER {
                continue;
            }
            let indexes = Self::load_metadata(pages, &page)?;
            return Ok(Some((PageId(id), indexes)));
        }
        Ok(None)
    }

    fn load_metadata(pages: &Arc<PageManager>, page: &Page) -> DbResult<HashMap<String, Index>> {
        let corrupt = |what: &str| DbError::MetadataCorrupted(what.to_string());
        let payload = &page.payload;
        let count = u16::from_le_bytes(payload[1..3].try_into().expect("2 bytes")) as usize;

        let mut indexes = HashMap::new();
        let mut pos = 3usize;
        for _ in 0..count {
            let entry_end = pos + 11;
            if entry_end > payload.len() {
                return Err(corrupt("index entry escapes the metadata page"));
            }
            let index_type = IndexType::try_from(payload[pos])?;
            let root = PageId(u64::from_le_bytes(
                payload[pos + 1..pos + 9].try_into().expect("8 bytes"),
            ));
            let attr_len =
                u16::from_le_bytes(payload[pos + 9..pos + 11].try_into().expect("2 bytes"))
                    as usize;
            if attr_len == 0 || attr_len > MAX_ATTRIBUTE_LEN {
                return Err(corrupt("unreasonable attribute length"));
            }
            let attr_end = entry_end + attr_len;
            if attr_end > payload.len() {
                return Err(corrupt("attribute name escapes the metadata page"));
            }
            let attribute = std::str::from_utf8(&payload[entry_end..attr_end])
                .map_err(|_| corrupt("attribute name is not utf-8"))?
                .to_string();

            let tree = BTree::open(pages.clone(), root)?;
            indexes.insert(
                attribute.clone(),
                Index {
                    attribute,
                    index_type,
                    tree,
                },
            );
            pos = attr_end;
        }
        Ok(indexes)
    }

    fn persist_metadata(&self, inner: &Inner) -> DbResult<()> {
        let mut page = Page::new(inner.metadata_page, PageType::AttrIndex);
        let payload = &mut page.payload;
        payload[0] = METADATA_MARKER;
        payload[1..3].copy_from_slice(&(inner.indexes.len() as u16).to_le_bytes());

        let mut pos = 3usize;
        for index in inner.indexes.values() {
            let needed = 11 + index.attribute.len();
            if pos + needed > PAGE_PAYLOAD_SIZE {
                return Err(DbError::PageOverflow(pos + needed));
            }
            payload[pos] = index.index_type as u8;
            payload[pos + 1..pos + 9].copy_from_slice(&index.tree.root_page_id().0.to_le_bytes());
            payload[pos + 9..pos + 11]
                .copy_from_slice(&(index.attribute.len() as u16).to_le_bytes());
            payload[pos + 11..pos + needed].copy_from_slice(index.attribute.as_bytes());
            pos += needed;
        }
        page.item_count = inner.indexes.len() as u16;
        self.pages.write_page(&page)
    }

    /// Create an index over an attribute.
    ///
    /// # Errors
    ///
    /// `InvalidAttribute` for empty or over-long names, `IndexExists` for
    /// duplicates, `ManagerClosed` after `close`.
    pub fn create_index(&self, attribute: &str, index_type: IndexType) -> DbResult<()> {
        let attribute = normalize_attribute(attribute)?;
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        if inner.indexes.contains_key(&attribute) {
            return Err(DbError::IndexExists(attribute));
        }

        let tree = BTree::create(self.pages.clone())?;
        inner.indexes.insert(
            attribute.clone(),
            Index {
                attribute: attribute.clone(),
                index_type,
                tree,
            },
        );
        self.persist_metadata(&inner)?;
        debug!(%attribute, ?index_type, "created index");
        Ok(())
    }

    /// Drop an index, freeing its page graph best-effort.
    pub fn drop_index(&self, attribute: &str) -> DbResult<()> {
        let attribute = normalize_attribute(attribute)?;
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        let index = inner
            .indexes
            .remove(&attribute)
            .ok_or_else(|| DbError::IndexNotFound(attribute.clone()))?;

        match index.tree.collect_pages() {
            Ok(pages) => {
                for page_id in pages {
                    if let Err(e) = self.pages.free_page(page_id) {
                        warn!(page = page_id.0, error = %e, "could not free index page");
                    }
                }
            }
            Err(e) => warn!(%attribute, error = %e, "could not walk dropped index"),
        }

        self.persist_metadata(&inner)?;
        debug!(%attribute, "dropped index");
        Ok(())
    }

    /// Describe the index on an attribute, if any.
    pub fn get_index(&self, attribute: &str) -> Option<IndexDescriptor> {
        let attribute = normalize_attribute(attribute).ok()?;
        let inner = self.inner.read();
        inner.indexes.get(&attribute).map(describe)
    }

    pub fn list_indexes(&self) -> Vec<IndexDescriptor> {
        let inner = self.inner.read();
        let mut list: Vec<_> = inner.indexes.values().map(describe).collect();
        list.sort_by(|a, b| a.attribute.cmp(&b.attribute));
        list
    }

    pub fn index_count(&self) -> usize {
        self.inner.read().indexes.len()
    }

    /// Apply an entry change to every affected index.
    ///
    /// `old = None` is an insert, `new = None` a delete, both present a
    /// modify (same DN, old values removed before new ones are added).
    /// Removals are idempotent: missing postings are ignored.
    pub fn update_indexes(
        &self,
        old: Option<&Entry>,
        new: Option<&Entry>,
        eref: EntryRef,
    ) -> DbResult<()> {
        // Tree mutations need the exclusive lock; reads share it.
        let inner = self.inner.write();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }

        if let Some(entry) = old {
            for (attribute, values) in &entry.attributes {
                if let Some(index) = inner.indexes.get(attribute) {
                    for key in index_keys(index.index_type, values) {
                        // Swallowed: removing an absent posting is a no-op.
                        let _ = index.tree.delete(&key, eref);
                    }
                }
            }
        }
        if let Some(entry) = new {
            for (attribute, values) in &entry.attributes {
                if let Some(index) = inner.indexes.get(attribute) {
                    for key in index_keys(index.index_type, values) {
                        index.tree.insert(key, eref)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Equality lookup.
    pub fn search(&self, attribute: &str, value: &str) -> DbResult<Vec<EntryRef>> {
        if value.is_empty() {
            return Err(DbError::EmptyValue);
        }
        let inner = self.inner.read();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        let index = find_index(&inner, attribute, IndexType::Equality)?;
        index.tree.search(value.as_bytes())
    }

    /// Entries that carry the attribute at all.
    pub fn search_presence(&self, attribute: &str) -> DbResult<Vec<EntryRef>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        let index = find_index(&inner, attribute, IndexType::Presence)?;
        index.tree.search(PRESENCE_MARKER)
    }

    /// Equality-index range scan over `[low, high]`.
    pub fn search_range(
        &self,
        attribute: &str,
        low: &str,
        high: &str,
    ) -> DbResult<Vec<EntryRef>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        let index = find_index(&inner, attribute, IndexType::Equality)?;
        index.tree.scan_range(Some(low.as_bytes()), Some(high.as_bytes()))
    }

    /// Candidate entries whose value may contain `needle`, by intersecting
    /// the needle's 3-gram posting lists. The caller re-applies the full
    /// pattern to candidate values.
    ///
    /// # Errors
    ///
    /// `EmptyPattern` when the needle is shorter than [`MIN_SUBSTR`].
    pub fn search_substring(&self, attribute: &str, needle: &str) -> DbResult<Vec<EntryRef>> {
        if needle.len() < MIN_SUBSTR {
            return Err(DbError::EmptyPattern);
        }
        let inner = self.inner.read();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        let index = find_index(&inner, attribute, IndexType::Substring)?;

        let mut candidates: Option<BTreeSet<EntryRef>> = None;
        for gram in ngrams(needle) {
            let postings: BTreeSet<EntryRef> =
                index.tree.search(&gram)?.into_iter().collect();
            candidates = Some(match candidates {
                None => postings,
                Some(current) => current.intersection(&postings).copied().collect(),
            });
            if candidates.as_ref().map(BTreeSet::is_empty).unwrap_or(false) {
                break;
            }
        }
        Ok(candidates.unwrap_or_default().into_iter().collect())
    }

    /// Persist the data file (metadata is written on every change).
    pub fn sync(&self) -> DbResult<()> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        self.pages.sync()
    }

    /// Flush and refuse further mutation.
    pub fn close(&self) -> DbResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(DbError::ManagerClosed);
        }
        self.persist_metadata(&inner)?;
        self.pages.sync()?;
        inner.closed = true;
        Ok(())
    }
}

fn describe(index: &Index) -> IndexDescriptor {
    IndexDescriptor {
        attribute: index.attribute.clone(),
        index_type: index.index_type,
        root_page_id: index.tree.root_page_id(),
    }
}

fn find_index<'a>(inner: &'a Inner, attribute: &str, want: IndexType) -> DbResult<&'a Index> {
    let attribute = normalize_attribute(attribute)?;
    match inner.indexes.get(&attribute) {
        Some(index) if index.index_type == want => Ok(index),
        _ => Err(DbError::IndexNotFound(attribute)),
    }
}

fn normalize_attribute(attribute: &str) -> DbResult<String> {
    let normalized = attribute.trim().to_ascii_lowercase();
    if normalized.is_empty() || normalized.len() > MAX_ATTRIBUTE_LEN {
        return Err(DbError::InvalidAttribute(attribute.to_string()));
    }
    Ok(normalized)
}

/// The index keys a value set produces for a given index kind.
///
/// Empty values never produce keys; presence indexes one marker per entry
/// (for the first non-empty value).
fn index_keys(index_type: IndexType, values: &[String]) -> Vec<Vec<u8>> {
    match index_type {
        IndexType::Equality => values
            .iter()
            .filter(|v| !v.is_empty())
            .map(|v| v.as_bytes().to_vec())
            .collect(),
        IndexType::Presence => {
            if values.iter().any(|v| !v.is_empty()) {
                vec![PRESENCE_MARKER.to_vec()]
            } else {
                Vec::new()
            }
        }
        IndexType::Substring => {
            let mut grams = BTreeSet::new();
            for value in values {
                grams.extend(ngrams(value));
            }
            grams.into_iter().collect()
        }
    }
}

/// Fixed-length 3-grams of a value, byte-wise.
fn ngrams(value: &str) -> Vec<Vec<u8>> {
    let bytes = value.as_bytes();
    if bytes.len() < MIN_SUBSTR {
        return Vec::new();
    }
    bytes.windows(MIN_SUBSTR).map(|w| w.to_vec()).collect()
}
