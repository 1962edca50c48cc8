//! Resource version ordering.

use std::cmp::Ordering;

fn parse(rv: &str) -> u64 {
    if rv.is_empty() {
        return 0;
    }
    match rv.parse::<u64>() {
        Ok(v) => v,
        Err(e) => panic!("resource version {rv:?} is not an unsigned decimal: {e}"),
    }
}

/// Compare two resource versions numerically. An empty version sorts as zero.
///
/// # Panics
///
/// Panics if either version is not an unsigned decimal. Versions come from the control plane,
/// which only produces numeric ones.
pub fn compare_resource_version(a: &str, b: &str) -> Ordering {
    parse(a).cmp(&parse(b))
}

/// Whether `incoming` is strictly newer than `current`.
pub fn is_newer(incoming: &str, current: &str) -> bool {
    compare_resource_version(incoming, current) == Ordering::Greater
}
