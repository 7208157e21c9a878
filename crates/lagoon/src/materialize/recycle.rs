//! Structural sharing across successive materializations.
//!
//! Given the previous result and a freshly built one, return a tree where
//! every subtree whose fingerprint is unchanged is the previous subtree
//! itself (the same `Arc`), so observers can diff by identity. Arrays of
//! different lengths recycle equal-fingerprint elements from either end,
//! which covers append, prepend, and shrink. Opaque JSON leaves are never
//! recycled.

use std::collections::BTreeMap;

use itertools::{
    EitherOrBoth::{Both, Left, Right},
    Itertools,
};

use crate::materialize::fingerprint::FingerprintNode;
use crate::tree::TreeNode;

/// Recycle `next` against `prev`, guided by their fingerprint trees.
pub fn recycle(
    prev: &TreeNode,
    prev_fp: &FingerprintNode,
    next: TreeNode,
    next_fp: &FingerprintNode,
) -> TreeNode {
    if prev.ptr_eq(&next) {
        return prev.clone();
    }
    match (prev, prev_fp, &next, next_fp) {
        (
            TreeNode::Object(prev_map),
            FingerprintNode::Object(pf),
            TreeNode::Object(next_map),
            FingerprintNode::Object(nf),
        ) => {
            if pf.fp == nf.fp {
                return prev.clone();
            }
            let mut out = BTreeMap::new();
            for eob in next_map
                .iter()
                .merge_join_by(prev_map.iter(), |(next_key, _), (prev_key, _)| {
                    next_key.cmp(prev_key)
                })
            {
                match eob {
                    // Key only in the fresh result.
                    Left((key, next_child)) => {
                        out.insert(key.clone(), next_child.clone());
                    }
                    // Key dropped from the fresh result: nothing to keep.
                    Right(_) => {}
                    Both((key, next_child), (_, prev_child)) => {
                        let recycled = match (pf.children.get(key), nf.children.get(key)) {
                            (Some(prev_child_fp), Some(next_child_fp)) => recycle(
                                prev_child,
                                prev_child_fp,
                                next_child.clone(),
                                next_child_fp,
                            ),
                            _ => next_child.clone(),
                        };
                        out.insert(key.clone(), recycled);
                    }
                }
            }
            TreeNode::object(out)
        }

        (
            TreeNode::Array(prev_items),
            FingerprintNode::Array(pf),
            TreeNode::Array(next_items),
            FingerprintNode::Array(nf),
        ) => {
            if pf.fp == nf.fp {
                return prev.clone();
            }
            let mut out: Vec<TreeNode> = next_items.iter().cloned().collect();

            if prev_items.len() == next_items.len() {
                for (index, slot) in out.iter_mut().enumerate() {
                    if let (Some(prev_child), Some(prev_child_fp), Some(next_child_fp)) = (
                        prev_items.get(index),
                        pf.items.get(index),
                        nf.items.get(index),
                    ) {
                        *slot = recycle(
                            prev_child,
                            prev_child_fp,
                            slot.clone(),
                            next_child_fp,
                        );
                    }
                }
            } else {
                // Different lengths: take identical elements from the front,
                // then from the back, leaving the middle fresh.
                let front = pf
                    .items
                    .iter()
                    .zip(nf.items.iter())
                    .take_while(|(p, n)| p.value() == n.value())
                    .count();
                for index in 0..front {
                    out[index] = prev_items[index].clone();
                }

                let remaining = usize::min(pf.items.len(), nf.items.len()) - front;
                let back = pf
                    .items
                    .iter()
                    .rev()
                    .zip(nf.items.iter().rev())
                    .take_while(|(p, n)| p.value() == n.value())
                    .take(remaining)
                    .count();
                for offset in 0..back {
                    let next_index = nf.items.len() - 1 - offset;
                    let prev_index = pf.items.len() - 1 - offset;
                    out[next_index] = prev_items[prev_index].clone();
                }
            }
            TreeNode::array(out)
        }

        // Scalars and opaque JSON: keep the fresh value.
        _ => next,
    }
}
