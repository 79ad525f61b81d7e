// Graph simplification: tip trimming and bubble popping
// Runs over the SdbgAccess contract; deletions are collected in an atomic
// bit vector during the parallel scans and applied in a final sweep.

use crate::graph::{BranchGroup, SdbgAccess};
use rayon::prelude::*;
use sdbg_common::AtomicBitVector;
use std::sync::Mutex;
use std::time::Instant;
use tracing::info;

const MAX_BRANCHES_PER_GROUP: usize = 4;

/// Tip and bubble removal over one graph. Owns the deletion marks so the
/// bit vector is allocated once and reused across the doubling passes.
#[derive(Default)]
pub struct Simplifier {
    marked: AtomicBitVector,
}

impl Simplifier {
    pub fn new() -> Self {
        Simplifier {
            marked: AtomicBitVector::new(),
        }
    }

    /// Remove tips of length up to `max_tip_len`, running one trim pass per
    /// doubling length threshold (2, 4, 8, ... then `max_tip_len` itself).
    /// Returns the total number of tips removed.
    ///
    /// `min_final_standalone` is accepted for interface stability but does
    /// not participate in the criterion: trimming is length-bounded only.
    pub fn remove_tips<D: SdbgAccess>(
        &mut self,
        dbg: &D,
        max_tip_len: usize,
        min_final_standalone: usize,
    ) -> u64 {
        let _ = min_final_standalone;
        let mut number_tips = 0u64;

        let mut len = 2;
        while len < max_tip_len {
            let timer = Instant::now();
            number_tips += self.trim(dbg, len);
            info!(
                len,
                removed = number_tips,
                elapsed = ?timer.elapsed(),
                "tip removal pass"
            );
            len *= 2;
        }
        let timer = Instant::now();
        number_tips += self.trim(dbg, max_tip_len);
        info!(
            len = max_tip_len,
            removed = number_tips,
            elapsed = ?timer.elapsed(),
            "tip removal final pass"
        );

        // Release the mark storage
        let mut empty = AtomicBitVector::new();
        self.marked.swap(&mut empty);

        number_tips
    }

    /// One trim pass with length threshold `len`.
    fn trim<D: SdbgAccess>(&mut self, dbg: &D, len: usize) -> u64 {
        self.marked.reset(dbg.size() as usize);
        let marked = &self.marked;

        // Backward walks from dead-end nodes
        let backward: u64 = (0..dbg.size())
            .into_par_iter()
            .map(|node_idx| {
                if !dbg.is_valid_node(node_idx)
                    || marked.get(node_idx as usize)
                    || !dbg.is_last(node_idx)
                    || !dbg.outdegree_zero(node_idx)
                {
                    return 0;
                }
                let mut path = vec![node_idx];
                let mut cur_node = node_idx;
                let mut is_tip = false;
                for _ in 1..len {
                    match dbg.unique_incoming(cur_node) {
                        None => {
                            is_tip = dbg.indegree_zero(cur_node);
                            break;
                        }
                        Some(prev_node) => {
                            if dbg.unique_outgoing(prev_node).is_none() {
                                is_tip = true;
                                break;
                            }
                            path.push(prev_node);
                            cur_node = prev_node;
                        }
                    }
                }
                if is_tip {
                    for &n in &path {
                        mark_node(dbg, marked, n);
                    }
                    1
                } else {
                    0
                }
            })
            .sum();

        // Forward walks from source nodes
        let forward: u64 = (0..dbg.size())
            .into_par_iter()
            .map(|node_idx| {
                if !dbg.is_valid_node(node_idx)
                    || marked.get(node_idx as usize)
                    || !dbg.is_last(node_idx)
                    || !dbg.indegree_zero(node_idx)
                {
                    return 0;
                }
                let mut path = vec![node_idx];
                let mut cur_node = node_idx;
                let mut is_tip = false;
                for _ in 1..len {
                    match dbg.unique_outgoing(cur_node) {
                        None => {
                            is_tip = dbg.outdegree_zero(cur_node);
                            break;
                        }
                        Some(next_node) => {
                            if dbg.unique_incoming(next_node).is_none() {
                                is_tip = true;
                                break;
                            }
                            path.push(next_node);
                            cur_node = next_node;
                        }
                    }
                }
                if is_tip {
                    for &n in &path {
                        mark_node(dbg, marked, n);
                    }
                    1
                } else {
                    0
                }
            })
            .sum();

        (0..dbg.size()).into_par_iter().for_each(|node_idx| {
            if marked.get(node_idx as usize) {
                dbg.set_invalid(node_idx);
            }
        });

        backward + forward
    }
}

#[inline]
fn mark_node<D: SdbgAccess>(dbg: &D, marked: &AtomicBitVector, node_idx: u64) {
    marked.set(dbg.get_last_index(node_idx) as usize);
}

/// Pop low-depth bubble branches. `make_group` hands out the external
/// branch-group search for a root node with the given branch and length
/// limits. A non-positive `max_bubble_len` defaults to `2k + 2`.
/// Returns the number of bubbles removed.
pub fn pop_bubbles<D, B, F>(
    dbg: &D,
    max_bubble_len: i64,
    low_depth_ratio: f64,
    make_group: F,
) -> u64
where
    D: SdbgAccess,
    B: BranchGroup,
    F: Fn(u64, usize, usize) -> B + Sync,
{
    let max_bubble_len = if max_bubble_len <= 0 {
        dbg.kmer_k() * 2 + 2
    } else {
        max_bubble_len as usize
    };

    let candidates: Mutex<Vec<(usize, u64)>> = Mutex::new(Vec::new());

    (0..dbg.size()).into_par_iter().for_each(|node_idx| {
        if dbg.is_valid_node(node_idx) && dbg.is_last(node_idx) && dbg.outdegree(node_idx) > 1 {
            let mut bubble = make_group(node_idx, MAX_BRANCHES_PER_GROUP, max_bubble_len);
            if bubble.search() {
                let mut cands = candidates.lock().expect("bubble candidate lock");
                cands.push((bubble.length(), node_idx));
            }
        }
    });

    // Search state does not survive the parallel scan; re-search serially
    // before removing anything.
    let candidates = candidates.into_inner().expect("bubble candidate lock");
    let mut num_bubbles = 0u64;
    for (_, node_idx) in candidates {
        let mut bubble = make_group(node_idx, MAX_BRANCHES_PER_GROUP, max_bubble_len);
        if bubble.search() && bubble.remove_error_branches(low_depth_ratio) {
            num_bubbles += 1;
        }
    }
    info!(num_bubbles, "bubble popping done");
    num_bubbles
}
