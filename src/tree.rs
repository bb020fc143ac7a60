//! The facade orchestrating the distributed adaptive tree.
//!
//! One [`AmrTree`] lives on every rank of the communicator. After
//! construction the tree is *serial*: every rank replicates the full leaf
//! sequence and no ghosts exist. The first load balance splits the
//! sequence and switches the engine to the partitioned regime, in which
//! every adapt rebuilds the partition registry and the ghost halo
//! collectively. All collective entry points must be called in the same
//! order with the same arguments on every rank.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::Once;

use itertools::izip;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::balance::{
    family_block_size, family_compact_corrections, family_compact_level, recv_ranges,
    send_ranges, uniform_partition, weighted_partition, apply_corrections,
    partition_intersections, LoadBalanceRanges,
};
use crate::comm::Communicator;
use crate::constants::{tree_constants, TreeConstants, MAX_LEVEL};
use crate::error::{Result, TreeError};
use crate::halo::{
    decode_accretion_message, encode_accretion_message, group_foreign_seeds, read_octant_blob,
    write_octant_blob, Accretion, GHOST_ENTRY_SIZE,
};
use crate::local_tree::{Intersection, LocalTree};
use crate::morton::Morton;
use crate::octant::Octant;
use crate::partition::PartitionRegistry;
use crate::snapshot::{self, FullState, SnapshotView};
use crate::stream::{BinaryReader, BinaryWriter};
use crate::tools::{all_gather_pod, all_gather_varcount_pod, all_reduce_and, all_reduce_or};

/// The operation that last modified the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Init,
    AdaptMapped,
    AdaptUnmapped,
    LoadBalance,
    LoadBalanceFirst,
    PreAdapt,
}

impl Operation {
    fn code(self) -> i32 {
        match self {
            Operation::Init => snapshot::OP_INIT,
            Operation::AdaptMapped => snapshot::OP_ADAPT_MAPPED,
            Operation::AdaptUnmapped => snapshot::OP_ADAPT_UNMAPPED,
            Operation::LoadBalance => snapshot::OP_LOADBALANCE,
            Operation::LoadBalanceFirst => snapshot::OP_LOADBALANCE_FIRST,
            Operation::PreAdapt => snapshot::OP_PRE_ADAPT,
        }
    }

    fn from_code(code: i32) -> Result<Operation> {
        Ok(match code {
            snapshot::OP_INIT => Operation::Init,
            snapshot::OP_ADAPT_MAPPED => Operation::AdaptMapped,
            snapshot::OP_ADAPT_UNMAPPED => Operation::AdaptUnmapped,
            snapshot::OP_LOADBALANCE => Operation::LoadBalance,
            snapshot::OP_LOADBALANCE_FIRST => Operation::LoadBalanceFirst,
            snapshot::OP_PRE_ADAPT => Operation::PreAdapt,
            _ => {
                return Err(TreeError::SnapshotConfigMismatch(format!(
                    "unknown operation code {}",
                    code
                )))
            }
        })
    }
}

/// Provenance of one octant across the last mapped operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Old local indices (adapt) or old local index in the previous
    /// partition (load balance).
    pub old_ids: Vec<u32>,
    /// Whether each old id refers to a ghost octant.
    pub is_ghost: Vec<bool>,
    /// Rank on which each old octant resided.
    pub ranks: Vec<usize>,
}

struct LogWriter(std::sync::Arc<std::fs::File>);

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}

// The log file is a process-wide singleton: the first construction names
// it, later constructions reuse it.
fn init_logger(log_file: &str) {
    static LOGGER: Once = Once::new();
    LOGGER.call_once(|| {
        if let Ok(file) = std::fs::File::create(log_file) {
            let file = std::sync::Arc::new(file);
            let make_writer = move || LogWriter(std::sync::Arc::clone(&file));
            let _ = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_target(false)
                .with_writer(make_writer)
                .try_init();
        }
    });
}

/// A distributed linear quad/octree over the unit square or cube.
pub struct AmrTree<C: Communicator> {
    comm: C,
    dim: u8,
    serial: bool,
    status: u64,
    last_op: Operation,
    max_depth: u8,
    global_num_octants: u64,
    n_ghost_layers: usize,
    periodic: [bool; 6],
    local: LocalTree,
    registry: PartitionRegistry,
    borders_per_proc: BTreeMap<usize, Vec<u32>>,
    internal_idxs: Vec<u32>,
    pborder_idxs: Vec<u32>,
    map_idx: Vec<u32>,
    lb_ranges: LoadBalanceRanges,
}

impl<C: Communicator> AmrTree<C> {
    /// Build a tree holding the single root octant on every rank.
    pub fn new(dim: u8, log_file: &str, comm: C) -> Result<AmrTree<C>> {
        if dim != 2 && dim != 3 {
            return Err(TreeError::InvalidArgument(format!(
                "dimension must be 2 or 3, got {}",
                dim
            )));
        }
        init_logger(log_file);
        let local = LocalTree::new(dim, true);
        let registry = PartitionRegistry::new_serial(
            comm.size(),
            local.first_desc_morton(),
            local.last_desc_morton(),
            1,
        );
        let n_octants = local.num_octants();
        let tree = AmrTree {
            comm,
            dim,
            serial: true,
            status: 0,
            last_op: Operation::Init,
            max_depth: 0,
            global_num_octants: n_octants as u64,
            n_ghost_layers: 1,
            periodic: [false; 6],
            local,
            registry,
            borders_per_proc: BTreeMap::new(),
            internal_idxs: (0..n_octants as u32).collect(),
            pborder_idxs: Vec::new(),
            map_idx: Vec::new(),
            lb_ranges: LoadBalanceRanges::default(),
        };
        info!(
            dim,
            nproc = tree.comm.size(),
            max_level = MAX_LEVEL,
            "tree initialized"
        );
        Ok(tree)
    }

    /// Restore a tree from a snapshot stream.
    pub fn from_snapshot<R: Read>(stream: R, log_file: &str, comm: C) -> Result<AmrTree<C>> {
        init_logger(log_file);
        let snap = snapshot::restore(stream, comm.size())?;

        let mut local = LocalTree::new(snap.dim, false);
        *local.octants_mut() = snap.octants;
        local.update_local_max_depth();
        local.set_balance_codim(snap.balance_codim);

        let mut periodic = [false; 6];
        for (flag, &value) in periodic.iter_mut().zip(&snap.periodic) {
            *flag = value;
        }
        local.set_periodic(periodic);

        let rank = comm.rank();
        let mut registry = PartitionRegistry::new_serial(comm.size(), 0, 0, 0);
        registry.set_range_global_idx(snap.range_idx.clone());
        registry.set_descendants(snap.first_desc.clone(), snap.last_desc.clone());
        local.set_desc_mortons(snap.first_desc[rank], snap.last_desc[rank]);

        let mut last_op = Operation::Init;
        let mut map_idx = Vec::new();
        if let Some(full) = &snap.full {
            last_op = Operation::from_code(full.last_op)?;
            map_idx = full.map_idx.clone();
            local.set_ghost_bros(Vec::new(), full.last_ghost_bros.clone());
            if !full.prev_range_idx.is_empty() {
                registry.set_range_global_idx_prev(full.prev_range_idx.clone());
            }
        }

        let n_octants = local.num_octants();
        let mut tree = AmrTree {
            comm,
            dim: snap.dim,
            serial: snap.serial,
            status: snap.status,
            last_op,
            max_depth: snap.max_depth.max(0) as u8,
            global_num_octants: snap.global_count,
            n_ghost_layers: snap.halo_width as usize,
            periodic,
            local,
            registry,
            borders_per_proc: BTreeMap::new(),
            internal_idxs: (0..n_octants as u32).collect(),
            pborder_idxs: Vec::new(),
            map_idx,
            lb_ranges: LoadBalanceRanges::default(),
        };
        if !tree.serial {
            tree.compute_ghost_halo();
        }
        info!(octants = tree.global_num_octants, "tree restored");
        Ok(tree)
    }

    // ------------------------------------------------------------------
    // Identity and basic queries
    // ------------------------------------------------------------------

    pub fn dim(&self) -> u8 {
        self.dim
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn nproc(&self) -> usize {
        self.comm.size()
    }

    pub fn is_serial(&self) -> bool {
        self.serial
    }

    pub fn status(&self) -> u64 {
        self.status
    }

    pub fn last_operation(&self) -> Operation {
        self.last_op
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    pub fn constants(&self) -> &'static TreeConstants {
        tree_constants(self.dim)
    }

    pub fn octant_count(&self) -> usize {
        self.local.num_octants()
    }

    pub fn ghost_count(&self) -> usize {
        self.local.num_ghosts()
    }

    pub fn global_octant_count(&self) -> u64 {
        self.global_num_octants
    }

    pub fn octant(&self, idx: usize) -> &Octant {
        &self.local.octants()[idx]
    }

    pub fn ghost_octant(&self, idx: usize) -> &Octant {
        &self.local.ghosts()[idx]
    }

    pub fn marker(&self, idx: usize) -> i8 {
        self.local.octants()[idx].marker()
    }

    /// The `(morton, level)` pair persistently identifying an octant.
    pub fn persistent_index(&self, idx: usize) -> (Morton, u8) {
        let octant = self.octant(idx);
        (octant.morton(), octant.level())
    }

    /// Global index of a local octant.
    pub fn global_idx(&self, idx: usize) -> u64 {
        let rank = self.comm.rank();
        if self.serial || rank == 0 {
            idx as u64
        } else {
            self.registry.range_global_idx()[rank - 1] + 1 + idx as u64
        }
    }

    /// Global index of a ghost octant.
    pub fn ghost_global_idx(&self, idx: usize) -> u64 {
        self.local.ghost_global_idxs()[idx]
    }

    /// Local index of an owned global index.
    fn local_idx_of_global(&self, global_idx: u64) -> u32 {
        let rank = self.comm.rank();
        let offset = if self.serial || rank == 0 {
            0
        } else {
            self.registry.range_global_idx()[rank - 1] + 1
        };
        (global_idx - offset) as u32
    }

    /// Whether a global index belongs to the local slice.
    fn is_internal(&self, global_idx: u64) -> bool {
        if self.serial {
            return global_idx < self.global_num_octants;
        }
        let rank = self.comm.rank();
        let ranges = self.registry.range_global_idx();
        if rank == 0 {
            global_idx <= ranges[0]
        } else {
            global_idx > ranges[rank - 1] && global_idx <= ranges[rank]
        }
    }

    /// Rank owning a global octant index.
    pub fn owner_rank(&self, global_idx: u64) -> Option<usize> {
        self.registry.owner_of_global_idx(global_idx)
    }

    /// Rank owning a Morton key.
    pub fn find_owner(&self, morton: Morton) -> Option<usize> {
        self.registry.find_owner(morton)
    }

    pub fn partition_registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    pub fn borders_per_proc(&self) -> &BTreeMap<usize, Vec<u32>> {
        &self.borders_per_proc
    }

    pub fn internal_count(&self) -> usize {
        self.internal_idxs.len()
    }

    pub fn pborder_count(&self) -> usize {
        self.pborder_idxs.len()
    }

    pub fn load_balance_ranges(&self) -> &LoadBalanceRanges {
        &self.lb_ranges
    }

    pub fn ghost_layers(&self) -> usize {
        self.n_ghost_layers
    }

    /// Neighbours of a local octant through one entity; see
    /// [`LocalTree::find_neighbours`].
    pub fn find_neighbors(&self, idx: usize, entity: u8, codim: u8) -> (Vec<u32>, Vec<bool>) {
        self.local
            .find_neighbours(&self.local.octants()[idx], entity, codim, false)
    }

    /// Deduplicated neighbours of a local octant across all codimensions.
    pub fn find_all_neighbors(&self, idx: usize) -> (Vec<u32>, Vec<bool>) {
        self.local
            .find_all_codim_neighbours(&self.local.octants()[idx], false)
    }

    /// All neighbours sharing one node of a local octant, including finer
    /// cells whose face or edge carries the node; see
    /// [`LocalTree::find_all_node_neighbours`].
    pub fn find_all_node_neighbors(&self, idx: usize, node: u8) -> (Vec<u32>, Vec<bool>) {
        self.local
            .find_all_node_neighbours(&self.local.octants()[idx], node, false)
    }

    /// Neighbours of a ghost octant through one entity.
    pub fn find_ghost_neighbors(&self, idx: usize, entity: u8, codim: u8) -> (Vec<u32>, Vec<bool>) {
        self.local
            .find_neighbours(&self.local.ghosts()[idx], entity, codim, false)
    }

    pub fn local_tree(&self) -> &LocalTree {
        &self.local
    }

    // ------------------------------------------------------------------
    // Marker and balance control
    // ------------------------------------------------------------------

    fn ensure_mutable(&self) -> Result<()> {
        if self.last_op == Operation::PreAdapt {
            return Err(TreeError::InvalidState(
                "markers are frozen between preadapt and adapt".to_string(),
            ));
        }
        Ok(())
    }

    /// Request refinement (positive) or coarsening (negative) of an octant.
    pub fn set_marker(&mut self, idx: usize, marker: i8) -> Result<()> {
        self.ensure_mutable()?;
        if marker.unsigned_abs() > MAX_LEVEL {
            return Err(TreeError::InvalidArgument(format!(
                "marker {} outside [-{}, {}]",
                marker, MAX_LEVEL, MAX_LEVEL
            )));
        }
        self.local.octants_mut()[idx].set_marker(marker);
        Ok(())
    }

    /// Enable or disable 2:1 balancing for an octant.
    pub fn set_balance(&mut self, idx: usize, enabled: bool) -> Result<()> {
        self.ensure_mutable()?;
        self.local.octants_mut()[idx].set_balance(enabled);
        Ok(())
    }

    pub fn balance_codimension(&self) -> u8 {
        self.local.balance_codim()
    }

    /// Set the highest codimension across which 2:1 balance is enforced.
    pub fn set_balance_codimension(&mut self, codim: u8) -> Result<()> {
        if codim < 1 || codim > self.dim {
            return Err(TreeError::InvalidArgument(format!(
                "balance codimension must be in 1..={}, got {}",
                self.dim, codim
            )));
        }
        self.local.set_balance_codim(codim);
        Ok(())
    }

    pub fn periodic(&self) -> &[bool] {
        &self.periodic[..2 * self.dim as usize]
    }

    /// Declare a face of the domain periodic; the opposite face is set
    /// implicitly.
    pub fn set_periodic(&mut self, face: u8) -> Result<()> {
        if face >= 2 * self.dim {
            return Err(TreeError::InvalidArgument(format!(
                "face {} out of range for dimension {}",
                face, self.dim
            )));
        }
        let opposite = tree_constants(self.dim).opposite_face[face as usize];
        self.periodic[face as usize] = true;
        self.periodic[opposite as usize] = true;
        self.local.set_periodic(self.periodic);
        Ok(())
    }

    /// Set the halo width. The halo can never be disabled once enabled.
    pub fn set_ghost_layers(&mut self, layers: usize) -> Result<()> {
        if layers == 0 {
            return Err(TreeError::InvalidArgument(
                "the ghost halo cannot be disabled".to_string(),
            ));
        }
        if layers > i32::MAX as usize {
            return Err(TreeError::InvalidArgument(format!(
                "halo width {} exceeds the maximum layer index",
                layers
            )));
        }
        self.n_ghost_layers = layers;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Partition registry refresh
    // ------------------------------------------------------------------

    fn update_adapt(&mut self) {
        self.registry.save_prev();
        if self.serial {
            self.max_depth = self.local.local_max_depth();
            self.global_num_octants = self.local.num_octants() as u64;
            let last = self.global_num_octants.wrapping_sub(1);
            self.registry
                .set_range_global_idx(vec![last; self.comm.size()]);
            self.internal_idxs = (0..self.local.num_octants() as u32).collect();
            self.pborder_idxs.clear();
        } else {
            self.max_depth =
                crate::tools::all_reduce_max_u8(&self.comm, self.local.local_max_depth());
            let counts = all_gather_pod(&self.comm, &(self.local.num_octants() as u64));
            self.global_num_octants = counts.iter().sum();
            self.registry.update_ranges_from_counts(&counts);
        }
    }

    fn update_global_desc_mortons(&mut self) {
        self.local.update_desc_mortons();
        let rank = self.comm.rank();
        let first = all_gather_pod(&self.comm, &self.local.first_desc_morton());
        let adjusted_first = self.registry.update_first_desc(first, rank);
        let last = all_gather_pod(&self.comm, &self.local.last_desc_morton());
        let adjusted_last = self.registry.update_last_desc(last, rank);
        self.local.set_desc_mortons(adjusted_first, adjusted_last);
    }

    fn update_after_coarse(&mut self) {
        self.update_adapt();
        if !self.serial {
            self.update_global_desc_mortons();
        }
    }

    // ------------------------------------------------------------------
    // Ghost halo
    // ------------------------------------------------------------------

    /// Exchange the markers of the border octants; ghosts are updated in
    /// place. Returns whether any local ghost marker changed.
    fn sync_ghost_markers(&mut self) -> bool {
        let mut sends = BTreeMap::new();
        for (&peer, borders) in &self.borders_per_proc {
            let mut buffer = Vec::with_capacity(borders.len());
            for &idx in borders {
                buffer.push(self.local.octants()[idx as usize].marker() as u8);
            }
            sends.insert(peer, buffer);
        }
        let received = self.comm.exchange(sends);
        let mut updated = false;
        let mut ghost_idx = 0usize;
        for (_sender, buffer) in received {
            for &byte in &buffer {
                let marker = byte as i8;
                let ghost = &mut self.local.ghosts_mut()[ghost_idx];
                if ghost.marker() != marker {
                    ghost.set_marker(marker);
                    updated = true;
                }
                ghost_idx += 1;
            }
        }
        debug_assert_eq!(ghost_idx, self.local.num_ghosts());
        updated
    }

    /// 2:1 balance the markers, iterating marker exchanges with the
    /// neighbour ranks until a global fixed point.
    fn balance21(&mut self, balance_new: bool) {
        if self.serial || self.comm.size() == 1 {
            self.local.local_balance(balance_new, false);
            return;
        }
        // Ghost markers may be stale from the last halo build; bring them
        // up to date before the first propagation pass.
        self.sync_ghost_markers();
        loop {
            let changed = self.local.local_balance(balance_new, true);
            let updated = self.sync_ghost_markers();
            if !all_reduce_or(&self.comm, changed || updated) {
                break;
            }
        }
    }

    /// Identify the layer-0 sources: walk every owned octant, compute the
    /// owners of all its virtual neighbours, and group the octants that
    /// serve foreign ranks.
    fn build_first_layer(&mut self) {
        let tc = tree_constants(self.dim);
        let rank = self.comm.rank();
        let max_depth = self.max_depth;
        let mut borders: BTreeMap<usize, Vec<u32>> = BTreeMap::new();
        let mut internal = Vec::new();
        let mut pborder = Vec::new();

        for idx in 0..self.local.num_octants() {
            let octant = self.local.octants()[idx].clone();
            let to_level = self.local.max_virtual_neigh_level(&octant, max_depth);
            let mut neigh_ranks: BTreeSet<usize> = BTreeSet::new();
            let mut face_pbound = [false; 6];

            for face in 0..tc.n_faces {
                let coeff = tc.normals[face as usize];
                for morton in self.local.virtual_entity_mortons(&octant, coeff, to_level) {
                    if let Some(owner) = self.registry.find_owner(morton) {
                        if owner != rank {
                            neigh_ranks.insert(owner);
                            face_pbound[face as usize] = true;
                        }
                    }
                }
            }
            for edge in 0..tc.n_edges {
                let coeff = tc.edge_coeffs[edge as usize];
                for morton in self.local.virtual_entity_mortons(&octant, coeff, to_level) {
                    if let Some(owner) = self.registry.find_owner(morton) {
                        if owner != rank {
                            neigh_ranks.insert(owner);
                        }
                    }
                }
            }
            for node in 0..tc.n_nodes {
                let coeff = tc.node_coeffs[node as usize];
                for morton in self.local.virtual_entity_mortons(&octant, coeff, to_level) {
                    if let Some(owner) = self.registry.find_owner(morton) {
                        if owner != rank {
                            neigh_ranks.insert(owner);
                        }
                    }
                }
            }

            let octant = &mut self.local.octants_mut()[idx];
            for face in 0..tc.n_faces {
                octant.set_pbound(face, face_pbound[face as usize]);
            }
            if neigh_ranks.is_empty() {
                internal.push(idx as u32);
            } else {
                pborder.push(idx as u32);
                for peer in neigh_ranks {
                    borders.entry(peer).or_default().push(idx as u32);
                }
            }
        }

        self.borders_per_proc = borders;
        self.internal_idxs = internal;
        self.pborder_idxs = pborder;
    }

    fn initialize_accretions(&self) -> Vec<Accretion> {
        const FIRST_LAYER: i32 = 0;
        let mut accretions = Vec::with_capacity(self.borders_per_proc.len());
        for (&target, borders) in &self.borders_per_proc {
            let mut accretion = Accretion::new(target);
            accretion.population.reserve(self.n_ghost_layers * borders.len());
            for &idx in borders {
                let global_idx = self.global_idx(idx as usize);
                accretion.population.insert(global_idx, FIRST_LAYER);
                accretion.internal_seeds.insert(global_idx, FIRST_LAYER);
            }
            accretions.push(accretion);
        }
        accretions
    }

    /// Grow every accretion by one layer: the 1-ring of each internal
    /// seed joins the population, ghosts join the foreign seeds.
    fn grow_accretions(
        &self,
        accretions: &mut [Accretion],
        one_rings: &mut FxHashMap<u32, Vec<u64>>,
    ) {
        for accretion in accretions.iter_mut() {
            if accretion.internal_seeds.is_empty() {
                continue;
            }
            let seeds = std::mem::take(&mut accretion.internal_seeds);
            for (&seed_global_idx, &seed_layer) in &seeds {
                let seed_idx = self.local_idx_of_global(seed_global_idx);
                let ring = one_rings.entry(seed_idx).or_insert_with(|| {
                    let octant = &self.local.octants()[seed_idx as usize];
                    let (neighbours, ghost_flags) =
                        self.local.find_all_codim_neighbours(octant, false);
                    let mut ring: Vec<u64> = izip!(neighbours, ghost_flags)
                        .map(|(nidx, is_ghost)| {
                            if is_ghost {
                                self.local.ghost_global_idxs()[nidx as usize]
                            } else {
                                self.global_idx(nidx as usize)
                            }
                        })
                        .collect();
                    ring.push(seed_global_idx);
                    ring
                });
                for &neigh_global_idx in ring.iter() {
                    if accretion.population.contains_key(&neigh_global_idx) {
                        continue;
                    }
                    if self.is_internal(neigh_global_idx) {
                        accretion.population.insert(neigh_global_idx, seed_layer + 1);
                        accretion
                            .internal_seeds
                            .insert(neigh_global_idx, seed_layer + 1);
                    } else {
                        let owner = self
                            .registry
                            .owner_of_global_idx(neigh_global_idx)
                            .expect("ghost index within the global range");
                        if owner != accretion.target_rank {
                            accretion
                                .foreign_seeds
                                .entry(neigh_global_idx)
                                .or_insert(seed_layer + 1);
                        }
                    }
                }
            }
        }
    }

    /// Ship the foreign seeds to their owners, which continue the
    /// accretions targeted at the same ranks.
    fn exchange_accretions(&self, accretions: &mut Vec<Accretion>) {
        let grouped = group_foreign_seeds(accretions, |global_idx| {
            self.registry
                .owner_of_global_idx(global_idx)
                .expect("seed index within the global range")
        });
        for accretion in accretions.iter_mut() {
            accretion.foreign_seeds.clear();
        }
        let needed = all_reduce_or(&self.comm, !grouped.is_empty());
        if !needed {
            return;
        }
        let sends: BTreeMap<usize, Vec<u8>> = grouped
            .into_iter()
            .map(|(owner, payload)| (owner, encode_accretion_message(&payload)))
            .collect();
        let received = self.comm.exchange(sends);
        for (_sender, bytes) in received {
            for (target_rank, seeds) in decode_accretion_message(&bytes) {
                let pos = accretions.iter().position(|a| a.target_rank == target_rank);
                let accretion = match pos {
                    Some(pos) => &mut accretions[pos],
                    None => {
                        accretions.push(Accretion::new(target_rank));
                        accretions.last_mut().expect("accretion just pushed")
                    }
                };
                for (global_idx, layer) in seeds {
                    debug_assert!(self.is_internal(global_idx));
                    accretion.population.entry(global_idx).or_insert(layer);
                    accretion.internal_seeds.entry(global_idx).or_insert(layer);
                }
            }
        }
    }

    /// Send each border octant to the rank it serves and materialize the
    /// received ghosts, ordered by sender rank.
    fn build_ghosts(&mut self, accretions: &[Accretion]) {
        let mut sends = BTreeMap::new();
        for (&target, borders) in &self.borders_per_proc {
            if borders.is_empty() {
                continue;
            }
            let accretion = accretions.iter().find(|a| a.target_rank == target);
            let mut writer = BinaryWriter::new(Vec::with_capacity(
                borders.len() * GHOST_ENTRY_SIZE,
            ));
            for &idx in borders {
                let global_idx = self.global_idx(idx as usize);
                writer.put_u64(global_idx).expect("in-memory write");
                write_octant_blob(&mut writer, &self.local.octants()[idx as usize]);
                let layer = accretion
                    .map(|a| a.population[&global_idx])
                    .unwrap_or(0);
                writer.put_i32(layer).expect("in-memory write");
            }
            sends.insert(target, writer.into_inner());
        }

        let received = self.comm.exchange(sends);
        let mut ghosts = Vec::new();
        let mut global_idxs = Vec::new();
        for (_sender, bytes) in received {
            let count = bytes.len() / GHOST_ENTRY_SIZE;
            let mut reader = BinaryReader::new(bytes.as_slice());
            for _ in 0..count {
                let global_idx = reader.get_u64().expect("in-memory read");
                let mut ghost = read_octant_blob(&mut reader, self.dim);
                let layer = reader.get_i32().expect("in-memory read");
                ghost.set_ghost_layer(layer);
                global_idxs.push(global_idx);
                ghosts.push(ghost);
            }
        }
        self.local.set_ghosts(ghosts, global_idxs);
    }

    /// Rebuild the whole ghost halo by accretion.
    fn compute_ghost_halo(&mut self) {
        if self.serial || self.comm.size() == 1 {
            self.local.clear_ghosts();
            self.borders_per_proc.clear();
            return;
        }
        self.build_first_layer();
        // The accretion growth walks 1-rings across the partition border,
        // so the first ghost layer must be materialized up front.
        self.build_ghosts(&[]);

        if self.n_ghost_layers > 1 {
            let mut accretions = self.initialize_accretions();
            let mut one_rings = FxHashMap::default();
            for _layer in 1..self.n_ghost_layers {
                self.exchange_accretions(&mut accretions);
                self.grow_accretions(&mut accretions, &mut one_rings);
            }
            // One trailing exchange so the last layer's foreign seeds
            // settle on their owners.
            self.exchange_accretions(&mut accretions);

            // The interior/border classification keeps its layer-0
            // meaning; only the source lists widen.
            for accretion in &accretions {
                let mut borders: Vec<u32> = accretion
                    .population
                    .keys()
                    .map(|&global_idx| self.local_idx_of_global(global_idx))
                    .collect();
                borders.sort_unstable();
                self.borders_per_proc.insert(accretion.target_rank, borders);
            }

            self.build_ghosts(&accretions);
        }
        debug!(
            ghosts = self.local.num_ghosts(),
            neighbours = self.borders_per_proc.len(),
            "halo rebuilt"
        );
    }

    // ------------------------------------------------------------------
    // Adaptation
    // ------------------------------------------------------------------

    /// Balance the markers and freeze them until the next adapt.
    pub fn preadapt(&mut self) {
        info!("pre-adapt");
        self.balance21(false);
        self.last_op = Operation::PreAdapt;
    }

    /// Balance the markers without committing to an adapt.
    pub fn settle_markers(&mut self) {
        info!("settle markers");
        self.balance21(false);
    }

    /// True if any rank holds an octant with a non-zero marker.
    pub fn check_to_adapt(&self) -> bool {
        let local_check = self
            .local
            .octants()
            .iter()
            .any(|octant| octant.marker() != 0);
        all_reduce_or(&self.comm, local_check)
    }

    /// Octants carrying non-zero markers after a preadapt, together with
    /// the ghost brothers of partition-straddling coarsening families.
    pub fn pre_mapping(&self) -> Result<(Vec<u32>, Vec<i8>, Vec<bool>)> {
        if self.last_op != Operation::PreAdapt {
            return Err(TreeError::InvalidState(
                "pre-mapping is only available after preadapt".to_string(),
            ));
        }
        let (first_bros, last_bros) = self.local.probe_boundary_coarsening();
        let mut idx = Vec::new();
        let mut markers = Vec::new();
        let mut is_ghost = Vec::new();
        for &bro in &first_bros {
            idx.push(bro);
            markers.push(self.local.ghosts()[bro as usize].marker());
            is_ghost.push(true);
        }
        for (i, octant) in self.local.octants().iter().enumerate() {
            if octant.marker() != 0 {
                idx.push(i as u32);
                markers.push(octant.marker());
                is_ghost.push(false);
            }
        }
        for &bro in &last_bros {
            idx.push(bro);
            markers.push(self.local.ghosts()[bro as usize].marker());
            is_ghost.push(true);
        }
        Ok((idx, markers, is_ghost))
    }

    fn private_adapt(&mut self, map_enabled: bool) -> bool {
        self.lb_ranges.clear();
        let n_start = self.local.num_octants();
        self.local.clear_new_flags();
        self.local.clear_ghost_bros();
        if map_enabled {
            self.map_idx = (0..n_start as u32).collect();
        } else {
            self.map_idx.clear();
        }

        info!(octants = self.global_num_octants, "adapt (refine/coarse)");

        if self.last_op != Operation::PreAdapt {
            self.balance21(false);
        }

        let mut local_done = false;

        while self.local.refine(&mut self.map_idx) {}
        if self.local.num_octants() > n_start {
            local_done = true;
        }
        self.update_adapt();
        if !self.serial {
            self.compute_ghost_halo();
        }
        let n_refined = self.local.num_octants();

        while self.local.coarse(&mut self.map_idx) {}
        self.local.clear_negative_markers();
        self.update_after_coarse();
        if !self.serial {
            self.compute_ghost_halo();
        }
        if self.local.num_octants() < n_refined {
            local_done = true;
        }

        let done = all_reduce_or(&self.comm, local_done);
        self.last_op = if map_enabled {
            Operation::AdaptMapped
        } else {
            Operation::AdaptUnmapped
        };
        info!(octants = self.global_num_octants, changed = done, "adapt done");
        done
    }

    /// Apply the markers: refine, then coarsen, to a fixed point. Returns
    /// whether the topology changed anywhere.
    pub fn adapt(&mut self, map_enabled: bool) -> bool {
        let done = self.private_adapt(map_enabled);
        self.status += done as u64;
        done
    }

    /// Refine every octant by one level.
    pub fn adapt_global_refine(&mut self, map_enabled: bool) -> bool {
        let n_start = self.local.num_octants();
        self.local.clear_new_flags();
        self.local.clear_ghost_bros();
        self.map_idx = (0..n_start as u32).collect();

        info!(octants = self.global_num_octants, "adapt (global refine)");

        self.local.global_refine(&mut self.map_idx);
        let local_done = self.local.num_octants() > n_start;
        self.update_adapt();
        if !self.serial {
            self.compute_ghost_halo();
        }

        let done = all_reduce_or(&self.comm, local_done);
        self.last_op = if map_enabled {
            Operation::AdaptMapped
        } else {
            Operation::AdaptUnmapped
        };
        self.status += done as u64;
        info!(octants = self.global_num_octants, "global refine done");
        done
    }

    /// Coarsen every family by one level.
    pub fn adapt_global_coarse(&mut self, map_enabled: bool) -> bool {
        let n_start = self.local.num_octants();
        self.local.clear_new_flags();
        self.local.clear_ghost_bros();
        if map_enabled {
            self.map_idx = (0..n_start as u32).collect();
        } else {
            self.map_idx.clear();
        }

        info!(octants = self.global_num_octants, "adapt (global coarse)");

        self.balance21(false);

        self.local.global_coarse(&mut self.map_idx);
        self.local.clear_negative_markers();
        self.update_after_coarse();
        if !self.serial {
            self.compute_ghost_halo();
        }

        // Coarsening may have broken the 2:1 invariant where families were
        // incomplete; rebalance the new octants and refine the violators.
        self.balance21(true);
        while self.local.refine(&mut self.map_idx) {}
        self.update_adapt();
        if !self.serial {
            self.compute_ghost_halo();
        }

        let local_done = self.local.num_octants() < n_start;
        let done = all_reduce_or(&self.comm, local_done);
        self.last_op = if map_enabled {
            Operation::AdaptMapped
        } else {
            Operation::AdaptUnmapped
        };
        self.status += done as u64;
        info!(octants = self.global_num_octants, "global coarse done");
        done
    }

    /// Provenance of one octant across the last mapped adapt or load
    /// balance.
    pub fn mapping(&self, idx: usize) -> Result<Mapping> {
        match self.last_op {
            Operation::AdaptMapped => {
                if idx >= self.map_idx.len() {
                    return Err(TreeError::InvalidArgument(format!(
                        "index {} outside the mapped range",
                        idx
                    )));
                }
                let rank = self.comm.rank();
                if self.local.octants()[idx].is_new_coarse() {
                    let n_children = tree_constants(self.dim).n_children as usize;
                    let mut n_internal = n_children;
                    if idx == self.local.num_octants() - 1 {
                        n_internal -= self.local.last_ghost_bros().len();
                    }
                    let mut old_ids = Vec::with_capacity(n_children);
                    let mut is_ghost = Vec::with_capacity(n_children);
                    for i in 0..n_internal {
                        old_ids.push(self.map_idx[idx] + i as u32);
                        is_ghost.push(false);
                    }
                    for &bro in self.local.last_ghost_bros() {
                        old_ids.push(bro);
                        is_ghost.push(true);
                    }
                    Ok(Mapping {
                        ranks: vec![rank; old_ids.len()],
                        old_ids,
                        is_ghost,
                    })
                } else {
                    Ok(Mapping {
                        old_ids: vec![self.map_idx[idx]],
                        is_ghost: vec![false],
                        ranks: vec![rank],
                    })
                }
            }
            Operation::LoadBalance | Operation::LoadBalanceFirst => {
                let global_idx = self.global_idx(idx);
                let prev = self.registry.range_global_idx_prev();
                let mut old_id = global_idx;
                let mut old_rank = self.comm.rank();
                for (iproc, &range) in prev.iter().enumerate() {
                    if range >= global_idx {
                        if iproc > 0 {
                            old_id -= prev[iproc - 1] + 1;
                        }
                        if self.last_op == Operation::LoadBalance {
                            old_rank = iproc;
                        }
                        break;
                    }
                }
                Ok(Mapping {
                    old_ids: vec![old_id as u32],
                    is_ghost: vec![false],
                    ranks: vec![old_rank],
                })
            }
            _ => Err(TreeError::InvalidState(
                "the last operation did not record a mapping".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Load balance
    // ------------------------------------------------------------------

    fn current_partition(&self) -> Vec<u32> {
        let nproc = self.comm.size();
        let mut current = vec![0u32; nproc];
        if self.serial {
            current[self.comm.rank()] = self.local.num_octants() as u32;
        } else {
            let ranges = self.registry.range_global_idx();
            current[0] = (ranges[0] + 1) as u32;
            for i in 1..nproc {
                current[i] = (ranges[i] - ranges[i - 1]) as u32;
            }
        }
        current
    }

    fn gather_global_weights(&self, weights: &[f64]) -> Vec<f64> {
        assert_eq!(
            weights.len(),
            self.local.num_octants(),
            "one weight per local octant"
        );
        if self.serial {
            weights.to_vec()
        } else {
            all_gather_varcount_pod(&self.comm, weights)
                .into_iter()
                .flatten()
                .collect()
        }
    }

    fn target_partition(&self, weights: Option<&[f64]>) -> Vec<u32> {
        match weights {
            None => uniform_partition(self.global_num_octants, self.comm.size()),
            Some(weights) => {
                let global = self.gather_global_weights(weights);
                weighted_partition(&global, self.comm.size())
            }
        }
    }

    fn family_compact_partition(&self, user_level: u8, weights: Option<&[f64]>) -> Vec<u32> {
        let temp = self.target_partition(weights);
        let nproc = self.comm.size();
        let level = family_compact_level(user_level, self.max_depth);
        let dh = family_block_size(level);

        let (first_interface, corrections) = family_compact_corrections(
            self.local.octants(),
            self.registry.range_global_idx(),
            self.comm.rank(),
            &temp,
            dh,
        );

        // Every rank broadcasts the corrections of the boundaries it owns.
        let mut payload = BinaryWriter::new(Vec::new());
        payload.put_u32(first_interface).expect("in-memory write");
        payload
            .put_u32(corrections.len() as u32)
            .expect("in-memory write");
        for &correction in &corrections {
            payload.put_i32(correction).expect("in-memory write");
        }
        let gathered = self.comm.all_gather_bytes(&payload.into_inner());

        let mut deplace = vec![0i32; nproc.saturating_sub(1)];
        for bytes in gathered {
            let mut reader = BinaryReader::new(bytes.as_slice());
            let first = reader.get_u32().expect("in-memory read") as usize;
            let count = reader.get_u32().expect("in-memory read") as usize;
            for k in 0..count {
                deplace[first + k] = reader.get_i32().expect("in-memory read");
            }
        }

        apply_corrections(&temp, &deplace)
    }

    fn private_load_balance(&mut self, partition: &[u32]) {
        let rank = self.comm.rank();
        let current = self.current_partition();

        let send = send_ranges(&current, partition, rank);
        let recv = recv_ranges(&current, partition, rank);
        self.lb_ranges = LoadBalanceRanges::new(self.serial, send.clone(), recv);

        if self.serial {
            self.last_op = Operation::LoadBalanceFirst;
            // Every rank holds the whole sequence: keep the assigned slice.
            let stride: u64 = partition[..rank].iter().map(|&c| c as u64).sum();
            let end = stride + partition[rank] as u64;
            let octants = self.local.octants_mut();
            let kept: Vec<Octant> = octants[stride as usize..end as usize].to_vec();
            *octants = kept;
        } else {
            self.last_op = Operation::LoadBalance;
            let mut sends = BTreeMap::new();
            for (&peer, &[start, end]) in &send {
                if start == end {
                    continue;
                }
                let mut writer = BinaryWriter::new(Vec::new());
                for idx in start..end {
                    write_octant_blob(&mut writer, &self.local.octants()[idx as usize]);
                }
                sends.insert(peer, writer.into_inner());
            }
            let received = self.comm.exchange(sends);

            // The kept slice is the intersection of the old and the new
            // own ranges, in old local indices.
            let own = partition_intersections(&current, partition, rank)
                .get(&rank)
                .copied()
                .filter(|&[begin, end]| begin < end);
            let offset: u64 = current[..rank].iter().map(|&c| c as u64).sum();

            let mut octants = Vec::with_capacity(partition[rank] as usize);
            let unpack = |octants: &mut Vec<Octant>, bytes: &[u8]| {
                let mut reader = BinaryReader::new(bytes);
                let count = bytes.len() / crate::halo::OCTANT_BLOB_SIZE;
                for _ in 0..count {
                    octants.push(read_octant_blob(&mut reader, self.dim));
                }
            };
            for (&sender, bytes) in &received {
                if sender < rank {
                    unpack(&mut octants, bytes);
                }
            }
            if let Some([begin, end]) = own {
                let start = (begin - offset) as usize;
                let stop = (end - offset) as usize;
                octants.extend_from_slice(&self.local.octants()[start..stop]);
            }
            for (&sender, bytes) in &received {
                if sender > rank {
                    unpack(&mut octants, bytes);
                }
            }
            *self.local.octants_mut() = octants;
        }

        self.update_load_balance();
        self.compute_ghost_halo();
    }

    fn update_load_balance(&mut self) {
        self.local.update_local_max_depth();
        let counts = all_gather_pod(&self.comm, &(self.local.num_octants() as u64));
        self.registry.save_prev();
        self.registry.update_ranges_from_counts(&counts);
        self.global_num_octants = counts.iter().sum();
        self.serial = false;
        self.update_global_desc_mortons();
    }

    /// Redistribute the octants following the Morton order, uniformly or
    /// according to the given per-octant weights.
    pub fn load_balance(&mut self, weights: Option<&[f64]>) {
        info!("load balance");
        if self.comm.size() == 1 {
            self.last_op = Operation::LoadBalance;
            return;
        }
        let partition = self.target_partition(weights);
        self.private_load_balance(&partition);
        info!(
            octants = self.local.num_octants(),
            ghosts = self.local.num_ghosts(),
            "load balance done"
        );
    }

    /// Redistribute the octants keeping families of the given level
    /// compact on one rank.
    pub fn load_balance_family_compact(&mut self, level: u8, weights: Option<&[f64]>) {
        info!(level, "load balance (family compact)");
        if self.comm.size() == 1 {
            self.last_op = Operation::LoadBalance;
            return;
        }
        let partition = self.family_compact_partition(level, weights);
        self.private_load_balance(&partition);
        info!(
            octants = self.local.num_octants(),
            ghosts = self.local.num_ghosts(),
            "load balance done"
        );
    }

    /// The exchange ranges a load balance with these weights would use,
    /// without performing it. Collective.
    pub fn eval_load_balance_ranges(&self, weights: Option<&[f64]>) -> LoadBalanceRanges {
        if self.comm.size() == 1 {
            return LoadBalanceRanges::none();
        }
        let partition = self.target_partition(weights);
        let current = self.current_partition();
        let rank = self.comm.rank();
        LoadBalanceRanges::new(
            self.serial,
            send_ranges(&current, &partition, rank),
            recv_ranges(&current, &partition, rank),
        )
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Collective verification of the 2:1 invariant across the enabled
    /// codimensions.
    pub fn check_balance(&self) -> bool {
        let tc = tree_constants(self.dim);
        let mut entities: Vec<(u8, u8)> = vec![(1, tc.n_faces)];
        if self.dim == 3 && self.local.balance_codim() >= 2 {
            entities.push((2, tc.n_edges));
        }
        if self.local.balance_codim() >= self.dim {
            entities.push((self.dim, tc.n_nodes));
        }
        let mut balanced = true;
        'outer: for idx in 0..self.local.num_octants() {
            let level = self.local.octants()[idx].level() as i32;
            for &(codim, count) in &entities {
                for entity in 0..count {
                    let (neighbours, ghost_flags) = self.find_neighbors(idx, entity, codim);
                    for (nidx, is_ghost) in izip!(neighbours, ghost_flags) {
                        let neighbour = if is_ghost {
                            &self.local.ghosts()[nidx as usize]
                        } else {
                            &self.local.octants()[nidx as usize]
                        };
                        if (neighbour.level() as i32 - level).abs() > 1 {
                            warn!(
                                octant = idx,
                                entity,
                                codim,
                                "octree is locally out of 2:1 balance"
                            );
                            balanced = false;
                            break 'outer;
                        }
                    }
                }
            }
        }
        all_reduce_and(&self.comm, balanced)
    }

    // ------------------------------------------------------------------
    // Intersections and connectivity
    // ------------------------------------------------------------------

    pub fn compute_intersections(&mut self) {
        self.local.compute_intersections();
    }

    pub fn intersections(&self) -> &[Intersection] {
        self.local.intersections()
    }

    pub fn compute_connectivity(&mut self) {
        self.local.compute_connectivity();
    }

    pub fn update_connectivity(&mut self) {
        self.local.update_connectivity();
    }

    pub fn clear_connectivity(&mut self) {
        self.local.clear_connectivity();
    }

    pub fn nodes(&self) -> &[[u32; 3]] {
        self.local.nodes()
    }

    pub fn connectivity(&self) -> &[Vec<u32>] {
        self.local.connectivity()
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Write the binary snapshot; with `full` the mapping of the last
    /// operation is included.
    pub fn dump<W: Write>(&self, stream: W, full: bool) -> Result<()> {
        let full_state = if full {
            Some(FullState {
                last_op: self.last_op.code(),
                map_idx: self.map_idx.clone(),
                last_ghost_bros: self.local.last_ghost_bros().to_vec(),
                prev_range_idx: self.registry.range_global_idx_prev().to_vec(),
            })
        } else {
            None
        };
        let view = SnapshotView {
            nproc: self.comm.size(),
            dim: self.dim,
            serial: self.serial,
            halo_width: self.n_ghost_layers as u64,
            max_depth: self.max_depth as i8,
            status: self.status,
            balance_codim: self.local.balance_codim(),
            periodic: &self.periodic[..2 * self.dim as usize],
            octants: self.local.octants(),
            global_count: self.global_num_octants,
            registry: &self.registry,
            full: full_state.as_ref(),
        };
        snapshot::dump(stream, &view)
    }

    /// Swap the communicator; the replacement must carry the same rank
    /// and size.
    pub fn replace_communicator(&mut self, comm: C) -> Result<C> {
        if comm.size() != self.comm.size() || comm.rank() != self.comm.rank() {
            return Err(TreeError::CommunicatorMismatch {
                expected: self.comm.size(),
                actual: comm.size(),
            });
        }
        Ok(std::mem::replace(&mut self.comm, comm))
    }
}
