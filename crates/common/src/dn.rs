//! Distinguished-name parsing and normalization.
//!
//! A DN is a comma-separated list of `attr=value` RDNs, leaf-first as
//! written (`uid=alice,ou=users,dc=example,dc=com`). The radix tree keys
//! nodes by normalized components in **root-first** order, so `parse_dn`
//! reverses the written order:
//!
//! ```
//! use common::dn::parse_dn;
//!
//! let parts = parse_dn("uid=alice,ou=users,dc=example,dc=com").unwrap();
//! assert_eq!(parts, ["dc=com", "dc=example", "ou=users", "uid=alice"]);
//! ```
//!
//! Normalization lowercases and trims the attribute type and keeps the
//! value as written. A backslash escapes the following character, so
//! `cn=Smith\, John` is a single RDN.

use crate::{DbError, DbResult};

/// Split a DN into normalized components in root-first order.
pub fn parse_dn(dn: &str) -> DbResult<Vec<String>> {
    let dn = dn.trim();
    if dn.is_empty() {
        return Err(DbError::EmptyDn);
    }

    let mut components = Vec::new();
    for rdn in split_unescaped(dn, ',') {
        components.push(normalize_rdn(&rdn)?);
    }
    components.reverse();
    Ok(components)
}

/// Normalize a DN string: each RDN gets a lowercased, trimmed attribute
/// type; the written leaf-first order is preserved. Idempotent.
pub fn normalize_dn(dn: &str) -> DbResult<String> {
    let mut components = parse_dn(dn)?;
    components.reverse();
    Ok(components.join(","))
}

/// The leaf (first written) RDN of a DN, normalized.
pub fn rdn(dn: &str) -> DbResult<String> {
    let mut components = parse_dn(dn)?;
    components
        .pop()
        .ok_or_else(|| DbError::InvalidDn(dn.to_string()))
}

/// The parent DN in normalized form, or `None` for a single-RDN name.
pub fn parent_dn(dn: &str) -> DbResult<Option<String>> {
    let mut components = parse_dn(dn)?;
    components.pop();
    if components.is_empty() {
        return Ok(None);
    }
    components.reverse();
    Ok(Some(components.join(",")))
}

/// Split an already-normalized DN (or a multi-component edge key) into its
/// raw components, honoring escapes and applying no further normalization.
pub fn split_components(s: &str) -> Vec<String> {
    split_unescaped(s, ',')
}

/// Normalize one `attr=value` component.
fn normalize_rdn(rdn: &str) -> DbResult<String> {
    let rdn = rdn.trim();
    if rdn.is_empty() {
        return Err(DbError::InvalidRdn(rdn.to_string()));
    }
    let eq = find_unescaped(rdn, '=').ok_or_else(|| DbError::InvalidRdn(rdn.to_string()))?;
    let attr = rdn[..eq].trim().to_ascii_lowercase();
    if attr.is_empty() {
        return Err(DbError::InvalidRdn(rdn.to_string()));
    }
    let value = &rdn[eq + 1..];
    Ok(format!("{attr}={value}"))
}

/// Split on a separator, honoring backslash escapes.
fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in s.chars() {
        if escaped {
            current.push('\\');
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        // Trailing lone backslash; keep it literal.
        current.push('\\');
    }
    parts.push(current);
    parts
}

/// Byte index of the first unescaped occurrence of `needle`.
fn find_unescaped(s: &str, needle: char) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == needle {
            return Some(idx);
        }
    }
    None
}
