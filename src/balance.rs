//! Load-balance planning: target partitions and exchange ranges.
//!
//! The planner works on partition *schemas*: per-rank octant counts over
//! the global Morton sequence. Intersecting the current schema with the
//! target schema yields, for every peer, the `[start, end)` interval of
//! local indices to ship or to receive.

use std::collections::BTreeMap;

use crate::constants::MAX_LEVEL;
use crate::octant::Octant;

/// Per-peer `[start, end)` local index ranges.
pub type ExchangeRanges = BTreeMap<usize, [u32; 2]>;

/// What a load-balance step does with the octants of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeAction {
    Undefined,
    None,
    Send,
    Receive,
    /// First load balance of a replicated serial tree: ranges outside the
    /// kept slice are simply deleted.
    Delete,
}

/// The ranges of local octants exchanged during a load balance.
#[derive(Debug, Clone)]
pub struct LoadBalanceRanges {
    pub send_action: ExchangeAction,
    pub recv_action: ExchangeAction,
    pub send_ranges: ExchangeRanges,
    pub recv_ranges: ExchangeRanges,
}

impl Default for LoadBalanceRanges {
    fn default() -> Self {
        LoadBalanceRanges {
            send_action: ExchangeAction::Undefined,
            recv_action: ExchangeAction::Undefined,
            send_ranges: ExchangeRanges::new(),
            recv_ranges: ExchangeRanges::new(),
        }
    }
}

impl LoadBalanceRanges {
    pub fn new(serial: bool, send_ranges: ExchangeRanges, recv_ranges: ExchangeRanges) -> Self {
        let (send_action, recv_action) = if serial {
            (ExchangeAction::Delete, ExchangeAction::None)
        } else {
            (ExchangeAction::Send, ExchangeAction::Receive)
        };
        LoadBalanceRanges {
            send_action,
            recv_action,
            send_ranges,
            recv_ranges,
        }
    }

    pub fn none() -> Self {
        LoadBalanceRanges {
            send_action: ExchangeAction::None,
            recv_action: ExchangeAction::None,
            send_ranges: ExchangeRanges::new(),
            recv_ranges: ExchangeRanges::new(),
        }
    }

    pub fn clear(&mut self) {
        *self = LoadBalanceRanges::default();
    }
}

/// Uniform target partition: everyone gets `N / P`, the first `N mod P`
/// ranks one more.
pub fn uniform_partition(global_count: u64, nproc: usize) -> Vec<u32> {
    let division = (global_count / nproc as u64) as u32;
    let remainder = (global_count % nproc as u64) as u32;
    (0..nproc as u32)
        .map(|rank| division + u32::from(rank < remainder))
        .collect()
}

/// Weighted target partition over the gathered global weight vector.
///
/// A greedy sweep fills ranks 0..P−2 until each holds at least the
/// average of the remaining weight; the last rank takes the rest. The
/// result is deterministic given the weight vector.
pub fn weighted_partition(global_weights: &[f64], nproc: usize) -> Vec<u32> {
    let total = global_weights.len() as u64;
    let mut partition = vec![0u32; nproc];
    let mut assigned = 0usize;
    for rank in 0..nproc - 1 {
        let unassigned_weight: f64 = global_weights[assigned..].iter().sum();
        let target_weight = unassigned_weight / (nproc - rank) as f64;
        let mut partition_weight = 0.0;
        while partition_weight < target_weight {
            partition_weight += global_weights[assigned];
            partition[rank] += 1;
            assigned += 1;
            if assigned as u64 == total {
                break;
            }
        }
        if assigned as u64 == total {
            break;
        }
    }
    partition[nproc - 1] = (total - assigned as u64) as u32;
    partition
}

/// The family level kept compact for a given user level, one above the
/// deepest at most.
pub fn family_compact_level(user_level: u8, max_depth: u8) -> u8 {
    (max_depth.saturating_sub(user_level)).max(1).min(MAX_LEVEL)
}

/// Locally computed boundary corrections for the family-compact
/// partition.
///
/// For every tentative inter-rank boundary owned by this rank, the
/// boundary is moved forward or backward to the nearest position aligned
/// to the `dh`-sized family blocks, whichever direction moves fewer
/// cells. When no aligned position exists in a direction the local
/// octant count acts as a sentinel correction in that direction.
///
/// Returns the index of the first boundary owned by this rank and its
/// corrections, in boundary order.
pub fn family_compact_corrections(
    octants: &[Octant],
    range_global_idx: &[u64],
    rank: usize,
    partition_temp: &[u32],
    dh: u64,
) -> (u32, Vec<i32>) {
    let nproc = partition_temp.len();
    let n_octants = octants.len() as i64;

    let alignment_rest = |octant: &Octant| -> u64 {
        let coords = octant.coordinates();
        let dim = octant.dim();
        let mut rest = (coords[0] as u64 % dh) + (coords[1] as u64 % dh);
        if dim == 3 {
            rest += coords[2] as u64 % dh;
        }
        rest
    };

    let mut first_interface = 0u32;
    let mut corrections = Vec::new();
    let mut sum = 0u64;
    for boundary in 0..nproc - 1 {
        sum += partition_temp[boundary] as u64;
        // The rank currently owning the octant at the tentative boundary
        // computes the correction.
        let owner = range_global_idx
            .partition_point(|&range| range < sum)
            .min(nproc - 1);
        if owner != rank {
            continue;
        }
        if corrections.is_empty() {
            first_interface = boundary as u32;
        }

        let istart = if rank != 0 {
            (sum - range_global_idx[rank - 1] - 1) as i64
        } else {
            sum as i64
        };
        if istart >= n_octants {
            // The tentative boundary falls past the last octant; the end
            // of the domain is always block aligned.
            corrections.push(0);
            continue;
        }

        // Walk forward to the nearest aligned octant.
        let mut i = istart;
        let mut forward = n_octants;
        while i < n_octants {
            if alignment_rest(&octants[i as usize]) == 0 {
                forward = i - istart;
                break;
            }
            i += 1;
        }

        // And backward.
        let mut i = istart;
        let mut backward = n_octants;
        while i >= 0 {
            if alignment_rest(&octants[i as usize]) == 0 {
                backward = istart - i;
                break;
            }
            i -= 1;
        }

        let correction = if forward < backward {
            forward as i32
        } else {
            -(backward as i32)
        };
        corrections.push(correction);
    }
    (first_interface, corrections)
}

/// Apply gathered boundary corrections to a tentative partition.
///
/// Each rank's count grows by the correction of its own right boundary
/// and shrinks by the correction of its left one.
pub fn apply_corrections(partition_temp: &[u32], corrections: &[i32]) -> Vec<u32> {
    let nproc = partition_temp.len();
    let mut partition = Vec::with_capacity(nproc);
    for rank in 0..nproc {
        let mut count = partition_temp[rank] as i64;
        if rank < nproc - 1 {
            count += corrections[rank] as i64;
        }
        if rank != 0 {
            count -= corrections[rank - 1] as i64;
        }
        partition.push(count.max(0) as u32);
    }
    partition
}

/// Intersections of this rank's slice in schema A with every partition of
/// schema B, in global indices.
pub fn partition_intersections(
    partition_a: &[u32],
    partition_b: &[u32],
    rank: usize,
) -> BTreeMap<usize, [u64; 2]> {
    let mut intersections = BTreeMap::new();
    if partition_a[rank] == 0 {
        return intersections;
    }
    let nproc = partition_a.len();
    let mut offsets_a = vec![0u64; nproc + 1];
    let mut offsets_b = vec![0u64; nproc + 1];
    for i in 0..nproc {
        offsets_a[i + 1] = offsets_a[i] + partition_a[i] as u64;
        offsets_b[i + 1] = offsets_b[i] + partition_b[i] as u64;
    }

    let begin_a = offsets_a[rank];
    let end_a = offsets_a[rank + 1];

    let first = offsets_b.partition_point(|&offset| offset <= begin_a) - 1;
    for rank_b in first..nproc {
        let begin_b = offsets_b[rank_b];
        let end_b = offsets_b[rank_b + 1];
        intersections.insert(rank_b, [begin_a.max(begin_b), end_a.min(end_b)]);
        if end_b >= end_a {
            break;
        }
    }
    intersections
}

/// Ranges of local octants this rank sends to each peer when moving from
/// `current` to `updated`.
pub fn send_ranges(current: &[u32], updated: &[u32], rank: usize) -> ExchangeRanges {
    let mut offset = 0u64;
    for count in current.iter().take(rank) {
        offset += *count as u64;
    }
    partition_intersections(current, updated, rank)
        .into_iter()
        .filter(|(peer, _)| *peer != rank)
        .map(|(peer, [begin, end])| (peer, [(begin - offset) as u32, (end - offset) as u32]))
        .collect()
}

/// Ranges of local octants this rank receives from each peer, expressed
/// in the updated local indexing.
pub fn recv_ranges(current: &[u32], updated: &[u32], rank: usize) -> ExchangeRanges {
    let mut offset = 0u64;
    for count in updated.iter().take(rank) {
        offset += *count as u64;
    }
    partition_intersections(updated, current, rank)
        .into_iter()
        .filter(|(peer, _)| *peer != rank)
        .map(|(peer, [begin, end])| (peer, [(begin - offset) as u32, (end - offset) as u32]))
        .collect()
}

/// Family-block alignment size of a compact level.
pub fn family_block_size(level: u8) -> u64 {
    1u64 << (MAX_LEVEL - level)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_uniform_partition() {
        assert_eq!(uniform_partition(64, 2), vec![32, 32]);
        assert_eq!(uniform_partition(10, 3), vec![4, 3, 3]);
        assert_eq!(uniform_partition(2, 4), vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_weighted_partition_uniform_weights() {
        let weights = vec![1.0; 64];
        assert_eq!(weighted_partition(&weights, 2), vec![32, 32]);
    }

    #[test]
    fn test_weighted_partition_skewed() {
        // One heavy octant at the front pushes the first boundary early.
        let mut weights = vec![1.0; 10];
        weights[0] = 100.0;
        let partition = weighted_partition(&weights, 2);
        assert_eq!(partition.iter().sum::<u32>(), 10);
        assert_eq!(partition[0], 1);
        assert_eq!(partition[1], 9);
    }

    #[test]
    fn test_partition_intersections() {
        // Schema A: [4, 4]; schema B: [6, 2].
        let inter = partition_intersections(&[4, 4], &[6, 2], 1);
        assert_eq!(inter[&0], [4, 6]);
        assert_eq!(inter[&1], [6, 8]);
    }

    #[test]
    fn test_send_recv_ranges() {
        // Moving from [8, 0] to [4, 4]: rank 0 sends its upper half.
        let send = send_ranges(&[8, 0], &[4, 4], 0);
        assert_eq!(send.len(), 1);
        assert_eq!(send[&1], [4, 8]);

        let recv = recv_ranges(&[8, 0], &[4, 4], 1);
        assert_eq!(recv.len(), 1);
        assert_eq!(recv[&0], [0, 4]);
    }

    #[test]
    fn test_apply_corrections() {
        // Move the single boundary of [5, 5] forward by two.
        assert_eq!(apply_corrections(&[5, 5], &[2]), vec![7, 3]);
        // And backward by one.
        assert_eq!(apply_corrections(&[5, 5], &[-1]), vec![4, 6]);
    }

    #[test]
    fn test_family_compact_level() {
        assert_eq!(family_compact_level(1, 3), 2);
        assert_eq!(family_compact_level(5, 3), 1);
        assert_eq!(family_compact_level(0, 2), 2);
    }
}
