pub use common::configuration::quorum_size;

/// True if the members of `nodes` that appear in `responders` form a strict
/// majority of `nodes`. Duplicates and non-members in `responders` do not count.
pub fn majority<S: AsRef<str>>(nodes: &[S], responders: &[S]) -> bool {
    let count = nodes
        .iter()
        .filter(|n| responders.iter().any(|r| r.as_ref() == n.as_ref()))
        .count();
    count >= quorum_size(nodes.len())
}
