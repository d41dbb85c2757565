//! Picks the language server that belongs to this IDE window when several
//! are running.

use std::collections::HashMap;

use super::ProcessCandidate;

/// Choose among several candidates by process ancestry.
///
/// `caller_parent` is the parent pid of the calling process (the IDE main
/// process). A *sibling* candidate shares that parent. A *nephew* candidate's
/// parent is itself a child of `caller_parent`; `parents` maps a candidate's
/// parent pid to its own parent. Siblings win over nephews, then the first
/// match in listing order wins. Returns `None` when nothing matches.
pub fn resolve_ancestry<'a>(
    candidates: &'a [ProcessCandidate],
    caller_parent: u32,
    parents: &HashMap<u32, u32>,
) -> Option<&'a ProcessCandidate> {
    if let Some(sibling) = candidates.iter().find(|c| c.ppid == Some(caller_parent)) {
        return Some(sibling);
    }

    candidates.iter().find(|c| {
        c.ppid
            .and_then(|ppid| parents.get(&ppid))
            .is_some_and(|grandparent| *grandparent == caller_parent)
    })
}
