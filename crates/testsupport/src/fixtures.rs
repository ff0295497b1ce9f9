//! Common directory-entry fixtures.

use common::Entry;

/// A person entry under the standard test suffix.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let entry = person("alice");
/// assert_eq!(entry.first_value("uid").unwrap(), "alice");
/// ```
pub fn person(uid: &str) -> Entry {
    Entry::new(format!("uid={uid},ou=users,dc=example,dc=com"))
        .add_attribute("objectclass", "inetOrgPerson")
        .add_attribute("uid", uid)
        .add_attribute("cn", format!("{uid} person"))
        .add_attribute("mail", format!("{uid}@example.com"))
}

/// An organizational-unit entry under the standard test suffix.
///
/// # Example
///
/// ```
/// use testsupport::prelude::*;
///
/// let entry = org_unit("users");
/// assert_eq!(entry.dn, "ou=users,dc=example,dc=com");
/// ```
pub fn org_unit(name: &str) -> Entry {
    Entry::new(format!("ou={name},dc=example,dc=com"))
        .add_attribute("objectclass", "organizationalUnit")
        .add_attribute("ou", name)
}

/// The suffix (naming-context) entries every test directory starts with.
pub fn suffix_entries() -> Vec<Entry> {
    vec![
        Entry::new("dc=com").add_attribute("objectclass", "domain"),
        Entry::new("dc=example,dc=com")
            .add_attribute("objectclass", "domain")
            .add_attribute("dc", "example"),
    ]
}
