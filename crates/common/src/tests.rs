use super::*;
use crate::dn::{normalize_dn, parent_dn, parse_dn, rdn};
use proptest::prelude::*;

#[test]
fn parse_dn_reverses_to_root_first() {
    let parts = parse_dn("uid=alice,ou=users,dc=example,dc=com").unwrap();
    assert_eq!(parts, ["dc=com", "dc=example", "ou=users", "uid=alice"]);
}

#[test]
fn parse_dn_lowercases_attribute_types_only() {
    let parts = parse_dn("UID=Alice,OU=Users,DC=Example").unwrap();
    assert_eq!(parts, ["dc=Example", "ou=Users", "uid=Alice"]);
}

#[test]
fn parse_dn_trims_whitespace_around_rdns() {
    let parts = parse_dn("uid=alice, ou=users , dc=com").unwrap();
    assert_eq!(parts, ["dc=com", "ou=users", "uid=alice"]);
}

#[test]
fn parse_dn_honors_escaped_commas() {
    let parts = parse_dn("cn=Smith\\, John,ou=people,dc=com").unwrap();
    assert_eq!(parts, ["dc=com", "ou=people", "cn=Smith\\, John"]);
}

#[test]
fn parse_dn_rejects_empty_and_malformed() {
    assert!(matches!(parse_dn(""), Err(DbError::EmptyDn)));
    assert!(matches!(parse_dn("   "), Err(DbError::EmptyDn)));
    assert!(matches!(parse_dn("nodnhere"), Err(DbError::InvalidRdn(_))));
    assert!(matches!(parse_dn("=value,dc=com"), Err(DbError::InvalidRdn(_))));
    assert!(matches!(parse_dn("uid=a,,dc=com"), Err(DbError::InvalidRdn(_))));
}

#[test]
fn normalize_dn_is_idempotent() {
    let once = normalize_dn("UID=Alice, OU=Users,DC=Example,DC=Com").unwrap();
    let twice = normalize_dn(&once).unwrap();
    assert_eq!(once, twice);
    assert_eq!(once, "uid=Alice,ou=Users,dc=Example,dc=Com");
}

#[test]
fn rdn_and_parent() {
    assert_eq!(rdn("uid=alice,ou=users,dc=com").unwrap(), "uid=alice");
    assert_eq!(
        parent_dn("uid=alice,ou=users,dc=com").unwrap(),
        Some("ou=users,dc=com".to_string())
    );
    assert_eq!(parent_dn("dc=com").unwrap(), None);
}

#[test]
fn entry_merges_attribute_values() {
    let entry = Entry::new("uid=alice,dc=com")
        .add_attribute("UID", "alice")
        .add_attribute("mail", "alice@example.com")
        .add_attribute("mail", "alice@corp.example.com");
    assert_eq!(entry.values("uid").unwrap(), ["alice"]);
    assert_eq!(entry.values("MAIL").unwrap().len(), 2);
    assert_eq!(entry.first_value("mail").unwrap(), "alice@example.com");
    assert!(entry.values("cn").is_none());
}

#[test]
fn default_options_validate() {
    let opts = EngineOptions::default();
    assert!(opts.validate().is_ok());
    assert_eq!(opts.page_size, 4096);
    assert_eq!(opts.buffer_pool_size, 256);
    assert_eq!(opts.wal_buffer_size, 64 * 1024);
    assert_eq!(opts.initial_pages, 16);
    assert!(opts.create_if_not_exists);
    assert!(!opts.read_only);
}

#[test]
fn options_reject_bad_page_size_and_empty_dir() {
    let opts = EngineOptions::builder().page_size(8192).build();
    assert!(matches!(opts.validate(), Err(DbError::Config(_))));

    let opts = EngineOptions::builder()
        .data_dir(std::path::PathBuf::new())
        .build();
    assert!(matches!(opts.validate(), Err(DbError::Config(_))));
}

proptest! {
    #[test]
    fn normalize_is_a_fixpoint(parts in proptest::collection::vec("[a-zA-Z]{1,8}=[a-zA-Z0-9 ]{1,12}", 1..6)) {
        let dn = parts.join(",");
        let once = normalize_dn(&dn).unwrap();
        let twice = normalize_dn(&once).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn parse_roundtrips_component_count(parts in proptest::collection::vec("[a-z]{1,8}=[a-zA-Z0-9]{1,12}", 1..6)) {
        let dn = parts.join(",");
        let parsed = parse_dn(&dn).unwrap();
        prop_assert_eq!(parsed.len(), parts.len());
    }
}
