//! Reference-name validation and directory/file (D/F) conflict detection for
//! a batch of additions and deletions applied together.
//!
//! A reftable transaction adds and deletes many refs atomically, and git's
//! namespace rule — `refs/heads/a` and `refs/heads/a/b` can never coexist —
//! must hold across the *combined* effect of the batch and whatever the
//! table already contains. This mirrors `validate_ref_record_addition`'s
//! approach: check the to-be-added set against itself and against what
//! survives after the to-be-deleted set is removed, rather than against the
//! live table alone.

use crate::error::{Error, Result};

/// Rejects empty names, any `.`/`..` path component, and a trailing slash.
/// A bare `HEAD`-style name with no slash at all is allowed (git itself is
/// permissive there; the component checks below only look inside slashes).
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Refname("ref name must not be empty".into()));
    }
    if name.ends_with('/') {
        return Err(Error::Refname(format!("ref name {name:?} must not end in '/'")));
    }
    for component in name.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::Refname(format!(
                "ref name {name:?} has an invalid path component {component:?}"
            )));
        }
    }
    Ok(())
}

/// One pending change in a batch: adding `name` (with `deletion = false`) or
/// deleting it (`deletion = true`).
#[derive(Clone)]
pub struct PendingChange<'a> {
    pub name: &'a str,
    pub deletion: bool,
}

/// Returns true if `adds`/`dels` (the batch) together with whatever else
/// exists (`existing`, a sorted lookup of ref names already live in the
/// stack, excluding anything the batch itself deletes) would put some ref
/// name as both a leaf and a directory prefix of another.
///
/// `existing` is queried through a closure rather than a concrete container
/// so callers can back it by a `MergedTables` scan without collecting every
/// ref name up front.
pub fn validate_batch(changes: &[PendingChange<'_>], existing_has_prefix: impl Fn(&str) -> Result<bool>, existing_has: impl Fn(&str) -> Result<bool>) -> Result<()> {
    let mut added: Vec<&str> = Vec::new();
    let mut deleted: Vec<&str> = Vec::new();
    for c in changes {
        validate_ref_name(c.name)?;
        if c.deletion {
            deleted.push(c.name);
        } else {
            added.push(c.name);
        }
    }
    added.sort_unstable();
    deleted.sort_unstable();

    for &name in &added {
        // No existing (and not concurrently deleted) ref may occupy a
        // parent-path component of `name`.
        for prefix in parent_prefixes(name) {
            if added.binary_search(&prefix).is_ok() {
                return Err(conflict(name, prefix));
            }
            if deleted.binary_search(&prefix).is_ok() {
                continue;
            }
            if existing_has(prefix)? {
                return Err(conflict(name, prefix));
            }
        }
        // No existing (and not concurrently deleted) ref may sit at
        // `name/...`, i.e. treat `name` itself as a directory.
        let sub_prefix = format!("{name}/");
        if added.iter().any(|a| a.starts_with(&sub_prefix)) {
            return Err(conflict(name, name));
        }
        if !deleted.iter().any(|d| d.starts_with(&sub_prefix)) && existing_has_prefix(&sub_prefix)? {
            return Err(conflict(name, name));
        }
    }
    Ok(())
}

fn conflict(name: &str, other: &str) -> Error {
    Error::NameConflict(format!("{name:?} conflicts with {other:?} (directory/file clash)"))
}

/// Yields every proper parent path of `name`, e.g. for `refs/heads/a/b`:
/// `refs/heads/a`, `refs/heads`, `refs`.
fn parent_prefixes(name: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(trim_last_component(name), |s| trim_last_component(s))
}

fn trim_last_component(name: &str) -> Option<&str> {
    let idx = name.rfind('/')?;
    Some(&name[..idx])
}
