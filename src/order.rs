//! Dense sibling ordering.
//!
//! Entities sharing a parent (or sharing the goal list) carry a dense,
//! zero-based `order`. New entities append at the end of their sibling group;
//! removals and explicit reorders renumber the survivors back to 0..n-1.
//!
//! Ties between concurrent adds that computed the same order resolve by
//! ascending `server_ms`, then ascending `id` — a deterministic total order,
//! so rehydration from storage always reproduces the same sequence.

use std::cmp::Ordering;

use crate::protocol::Entity;

/// Order assigned to a new entity: append at the end of its sibling group.
pub fn next_order(siblings: &[&Entity]) -> u64 {
    siblings.len() as u64
}

/// Total ordering over siblings: `(order, server_ms, id)` ascending.
pub fn sibling_cmp(a: &Entity, b: &Entity) -> Ordering {
    a.data
        .order
        .cmp(&b.data.order)
        .then_with(|| a.server_ms.cmp(&b.server_ms))
        .then_with(|| a.id.cmp(&b.id))
}

/// Reassign a dense 0..n-1 sequence over a sibling group.
///
/// `siblings` is sorted in place by [`sibling_cmp`] first, so relative order
/// of survivors is preserved and collisions settle deterministically.
/// Returns the ids whose order actually changed.
pub fn renumber(siblings: &mut [&mut Entity]) -> Vec<String> {
    siblings.sort_by(|a, b| sibling_cmp(a, b));

    let mut changed = Vec::new();
    for (i, entity) in siblings.iter_mut().enumerate() {
        let target = i as u64;
        if entity.data.order != target {
            entity.data.order = target;
            changed.push(entity.id.clone());
        }
    }
    changed
}
