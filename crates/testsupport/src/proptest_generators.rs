//! Property-based generators for core ObaDB types.

use common::{Entry, PageId};
use proptest::prelude::*;
use wal::WalRecord;

/// Strategy for a single normalized RDN like `uid=ab12`.
pub fn arb_rdn() -> impl Strategy<Value = String> {
    ("[a-z]{1,8}", "[a-zA-Z0-9]{1,12}").prop_map(|(attr, value)| format!("{attr}={value}"))
}

/// Strategy for a DN of 1–5 RDNs, leaf-first as written.
///
/// # Example
///
/// ```
/// use proptest::prelude::*;
/// use testsupport::proptest_generators::arb_dn;
///
/// proptest! {
///     #[test]
///     fn parses(dn in arb_dn()) {
///         common::dn::parse_dn(&dn).unwrap();
///     }
/// }
/// ```
pub fn arb_dn() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_rdn(), 1..5).prop_map(|rdns| rdns.join(","))
}

/// Strategy for a directory entry with a random DN and 0–4 attributes.
pub fn arb_entry() -> impl Strategy<Value = Entry> {
    (
        arb_dn(),
        prop::collection::vec(("[a-z]{1,8}", "[a-zA-Z0-9 ]{1,20}"), 0..4),
    )
        .prop_map(|(dn, attrs)| {
            let mut entry = Entry::new(dn);
            for (name, value) in attrs {
                entry = entry.add_attribute(&name, value);
            }
            entry
        })
}

/// Strategy for WAL records of every type.
pub fn arb_wal_record() -> impl Strategy<Value = WalRecord> {
    let data = || prop::collection::vec(any::<u8>(), 0..128);
    prop_oneof![
        any::<u64>().prop_map(WalRecord::begin),
        any::<u64>().prop_map(WalRecord::commit),
        any::<u64>().prop_map(WalRecord::abort),
        (any::<u64>(), any::<u64>(), any::<u16>(), data(), data()).prop_map(
            |(tx, page, offset, old, new)| WalRecord::update(tx, PageId(page), offset, old, new)
        ),
    ]
}

/// Strategy for a full page payload.
pub fn arb_page_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), storage::PAGE_PAYLOAD_SIZE..=storage::PAGE_PAYLOAD_SIZE)
}
