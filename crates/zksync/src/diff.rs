//! Partition of a remote child listing against a local directory listing.

use std::cmp::Ordering;

/// Result of merging remote children with local entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenDiff {
    /// Present remotely, missing locally
    pub add: Vec<String>,
    /// Present locally, gone remotely
    pub remove: Vec<String>,
    /// Present on both sides
    pub common: Vec<String>,
}

impl ChildrenDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.common.is_empty()
    }
}

/// Merge two sorted name lists in one linear pass.
///
/// Both inputs must be sorted under the same (byte-wise) ordering.
pub fn diff_children(remote: &[String], local: &[String]) -> ChildrenDiff {
    let mut diff = ChildrenDiff::default();
    let mut remote_iter = remote.iter().peekable();
    let mut local_iter = local.iter().peekable();

    loop {
        match (remote_iter.peek(), local_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => diff.add.extend(remote_iter.by_ref().cloned()),
            (None, Some(_)) => diff.remove.extend(local_iter.by_ref().cloned()),
            (Some(child), Some(file)) => match child.cmp(file) {
                Ordering::Less => {
                    diff.add.push((*child).clone());
                    remote_iter.next();
                }
                Ordering::Greater => {
                    diff.remove.push((*file).clone());
                    local_iter.next();
                }
                Ordering::Equal => {
                    diff.common.push((*child).clone());
                    remote_iter.next();
                    local_iter.next();
                }
            },
        }
    }

    diff
}
