//! The ordered list of owned octants plus the ordered list of ghosts.
//!
//! All structural operations here are purely local and non-blocking: the
//! facade interleaves them with the collective exchanges. The owned
//! sequence is always sorted ascending by Morton key and forms a prefix
//! slice of a valid global linear tree; refinement and coarsening preserve
//! that ordering in place.

use std::collections::BTreeMap;

use itertools::izip;
use rustc_hash::FxHashSet;

use crate::constants::{tree_constants, MAX_LENGTH, MAX_LEVEL};
use crate::morton::{self, Morton};
use crate::octant::Octant;

/// One face shared by two owners or by one owner and the domain boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intersection {
    /// `[inner, outer]` owner indices; the inner owner is the recording
    /// octant, whose face index is stored below. Boundary intersections
    /// repeat the inner index.
    pub owners: [u32; 2],
    /// Face index of the inner owner.
    pub face: u8,
    /// Which owner is the finer one (0 or 1).
    pub finer: u8,
    /// The outer owner is a ghost index.
    pub is_ghost: bool,
    /// The face lies on the domain boundary.
    pub bound: bool,
    /// The face touches a foreign partition.
    pub pbound: bool,
}

/// The local portion of the distributed tree.
pub struct LocalTree {
    dim: u8,
    octants: Vec<Octant>,
    ghosts: Vec<Octant>,
    ghost_global_idxs: Vec<u64>,
    first_desc_morton: Morton,
    last_desc_morton: Morton,
    local_max_depth: u8,
    periodic: [bool; 6],
    balance_codim: u8,
    /// Ghost indices of coarsening brothers absorbed from the previous rank.
    first_ghost_bros: Vec<u32>,
    /// Ghost indices of coarsening brothers absorbed from the following rank.
    last_ghost_bros: Vec<u32>,
    nodes: Vec<[u32; 3]>,
    connectivity: Vec<Vec<u32>>,
    intersections: Vec<Intersection>,
}

impl LocalTree {
    /// A tree holding the single root octant.
    pub fn new(dim: u8, create_root: bool) -> LocalTree {
        let octants = if create_root {
            vec![Octant::root(dim)]
        } else {
            Vec::new()
        };
        let mut tree = LocalTree {
            dim,
            octants,
            ghosts: Vec::new(),
            ghost_global_idxs: Vec::new(),
            first_desc_morton: 0,
            last_desc_morton: 0,
            local_max_depth: 0,
            periodic: [false; 6],
            balance_codim: 1,
            first_ghost_bros: Vec::new(),
            last_ghost_bros: Vec::new(),
            nodes: Vec::new(),
            connectivity: Vec::new(),
            intersections: Vec::new(),
        };
        tree.update_desc_mortons();
        tree
    }

    pub fn dim(&self) -> u8 {
        self.dim
    }

    pub fn octants(&self) -> &[Octant] {
        &self.octants
    }

    pub fn octants_mut(&mut self) -> &mut Vec<Octant> {
        &mut self.octants
    }

    pub fn ghosts(&self) -> &[Octant] {
        &self.ghosts
    }

    pub fn ghosts_mut(&mut self) -> &mut Vec<Octant> {
        &mut self.ghosts
    }

    pub fn ghost_global_idxs(&self) -> &[u64] {
        &self.ghost_global_idxs
    }

    pub fn num_octants(&self) -> usize {
        self.octants.len()
    }

    pub fn num_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    pub fn local_max_depth(&self) -> u8 {
        self.local_max_depth
    }

    pub fn first_desc_morton(&self) -> Morton {
        self.first_desc_morton
    }

    pub fn last_desc_morton(&self) -> Morton {
        self.last_desc_morton
    }

    pub fn set_desc_mortons(&mut self, first: Morton, last: Morton) {
        self.first_desc_morton = first;
        self.last_desc_morton = last;
    }

    pub fn periodic(&self) -> &[bool; 6] {
        &self.periodic
    }

    pub fn set_periodic(&mut self, periodic: [bool; 6]) {
        self.periodic = periodic;
    }

    pub fn balance_codim(&self) -> u8 {
        self.balance_codim
    }

    pub fn set_balance_codim(&mut self, codim: u8) {
        self.balance_codim = codim;
    }

    pub fn first_ghost_bros(&self) -> &[u32] {
        &self.first_ghost_bros
    }

    pub fn last_ghost_bros(&self) -> &[u32] {
        &self.last_ghost_bros
    }

    pub fn clear_ghost_bros(&mut self) {
        self.first_ghost_bros.clear();
        self.last_ghost_bros.clear();
    }

    pub fn set_ghost_bros(&mut self, first: Vec<u32>, last: Vec<u32>) {
        self.first_ghost_bros = first;
        self.last_ghost_bros = last;
    }

    /// Ghost brothers of the partition-straddling families that the next
    /// coarsening pass would absorb, without modifying the tree.
    pub fn probe_boundary_coarsening(&self) -> (Vec<u32>, Vec<u32>) {
        if self.ghosts.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let first = self
            .head_family_absorbed()
            .map(|(_, bros)| bros)
            .unwrap_or_default();
        let last = self
            .tail_family_collapse(0)
            .map(|(_, _, bros)| bros)
            .unwrap_or_default();
        (first, last)
    }

    pub fn nodes(&self) -> &[[u32; 3]] {
        &self.nodes
    }

    pub fn connectivity(&self) -> &[Vec<u32>] {
        &self.connectivity
    }

    pub fn intersections(&self) -> &[Intersection] {
        &self.intersections
    }

    /// Replace the ghost set.
    pub fn set_ghosts(&mut self, ghosts: Vec<Octant>, global_idxs: Vec<u64>) {
        debug_assert_eq!(ghosts.len(), global_idxs.len());
        self.ghosts = ghosts;
        self.ghost_global_idxs = global_idxs;
    }

    pub fn clear_ghosts(&mut self) {
        self.ghosts.clear();
        self.ghost_global_idxs.clear();
    }

    /// Refresh the first/last descendant keys of the local slice.
    pub fn update_desc_mortons(&mut self) {
        if let (Some(first), Some(last)) = (self.octants.first(), self.octants.last()) {
            self.first_desc_morton = first.morton();
            self.last_desc_morton = last.last_desc_morton();
        } else {
            self.first_desc_morton = Morton::MAX;
            self.last_desc_morton = 0;
        }
    }

    /// Recompute the deepest level present locally.
    pub fn update_local_max_depth(&mut self) {
        self.local_max_depth = self
            .octants
            .iter()
            .map(|octant| octant.level())
            .max()
            .unwrap_or(0);
    }

    // ------------------------------------------------------------------
    // Neighbour search
    // ------------------------------------------------------------------

    /// Deepest level at which virtual neighbours of an octant can exist.
    ///
    /// A balance-enabled octant can only neighbour cells one level finer;
    /// with balancing disabled any depth reached locally or remotely is
    /// possible.
    pub fn max_virtual_neigh_level(&self, octant: &Octant, max_depth: u8) -> u8 {
        if octant.balance() {
            (octant.level() + 1).min(max_depth.max(octant.level()))
        } else {
            max_depth.max(octant.level())
        }
    }

    /// Translate the octant origin for a search along direction `coeff`,
    /// wrapping periodic axes. `None` when the entity sits on a
    /// non-periodic domain boundary.
    fn translated_origin(&self, octant: &Octant, coeff: [i8; 3]) -> Option<[i64; 3]> {
        let size = octant.size() as i64;
        let coords = octant.coordinates();
        let mut origin = [coords[0] as i64, coords[1] as i64, coords[2] as i64];
        for axis in 0..self.dim as usize {
            match coeff[axis] {
                -1 if origin[axis] == 0 => {
                    if self.periodic[2 * axis] {
                        origin[axis] += MAX_LENGTH as i64;
                    } else {
                        return None;
                    }
                }
                1 if origin[axis] + size == MAX_LENGTH as i64 => {
                    if self.periodic[2 * axis + 1] {
                        origin[axis] -= MAX_LENGTH as i64;
                    } else {
                        return None;
                    }
                }
                _ => {}
            }
        }
        Some(origin)
    }

    fn touches(&self, candidate: &Octant, origin: [i64; 3], size: i64, coeff: [i8; 3]) -> bool {
        let anchor = candidate.coordinates();
        let c_size = candidate.size() as i64;
        for axis in 0..self.dim as usize {
            let a = anchor[axis] as i64;
            match coeff[axis] {
                -1 => {
                    if a + c_size != origin[axis] {
                        return false;
                    }
                }
                1 => {
                    if a != origin[axis] + size {
                        return false;
                    }
                }
                _ => {
                    if a.max(origin[axis]) >= (a + c_size).min(origin[axis] + size) {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn search_list(
        &self,
        list: &[Octant],
        virtual_morton: Morton,
        virtual_level: u8,
        origin: [i64; 3],
        size: i64,
        coeff: [i8; 3],
        found: &mut Vec<u32>,
    ) {
        let virtual_last = morton::last_descendant(self.dim, virtual_morton, virtual_level);
        // A coarser or same-size neighbour contains the virtual anchor.
        let pos = list.partition_point(|octant| octant.morton() <= virtual_morton);
        if pos > 0 {
            let candidate = &list[pos - 1];
            if candidate.last_desc_morton() >= virtual_morton
                && candidate.level() <= virtual_level
            {
                found.push((pos - 1) as u32);
                return;
            }
        }
        // Otherwise all neighbours are finer cells inside the virtual
        // region; keep the ones actually touching the entity.
        let start = list.partition_point(|octant| octant.morton() < virtual_morton);
        for idx in start..list.len() {
            let candidate = &list[idx];
            if candidate.morton() > virtual_last {
                break;
            }
            if self.touches(candidate, origin, size, coeff) {
                found.push(idx as u32);
            }
        }
    }

    fn neighbours_along(
        &self,
        octant: &Octant,
        coeff: [i8; 3],
        only_internal: bool,
    ) -> (Vec<u32>, Vec<bool>) {
        let mut neighbours = Vec::new();
        let mut is_ghost = Vec::new();
        let Some(origin) = self.translated_origin(octant, coeff) else {
            return (neighbours, is_ghost);
        };
        let size = octant.size() as i64;
        let mut virtual_anchor = [0u32; 3];
        for axis in 0..3 {
            virtual_anchor[axis] = (origin[axis] + coeff[axis] as i64 * size) as u32;
        }
        let virtual_morton = morton::encode(
            self.dim,
            virtual_anchor[0],
            virtual_anchor[1],
            virtual_anchor[2],
        );

        let mut owned = Vec::new();
        self.search_list(
            &self.octants,
            virtual_morton,
            octant.level(),
            origin,
            size,
            coeff,
            &mut owned,
        );
        for idx in owned {
            neighbours.push(idx);
            is_ghost.push(false);
        }
        if !only_internal && !self.ghosts.is_empty() {
            let mut ghost = Vec::new();
            self.search_list(
                &self.ghosts,
                virtual_morton,
                octant.level(),
                origin,
                size,
                coeff,
                &mut ghost,
            );
            for idx in ghost {
                neighbours.push(idx);
                is_ghost.push(true);
            }
        }
        (neighbours, is_ghost)
    }

    /// Find the neighbours of an octant through one entity.
    ///
    /// `codim` is 1 for a face, 2 for an edge (3D only) and `dim` for a
    /// node. Returned indices refer to the owned list or, where the ghost
    /// flag is set, to the ghost list. For non-periodic domain-boundary
    /// entities the result is empty.
    pub fn find_neighbours(
        &self,
        octant: &Octant,
        entity: u8,
        codim: u8,
        only_internal: bool,
    ) -> (Vec<u32>, Vec<bool>) {
        let tc = tree_constants(self.dim);
        let coeff = if codim == 1 && entity < tc.n_faces {
            tc.normals[entity as usize]
        } else if codim == 2 && self.dim == 3 && entity < tc.n_edges {
            tc.edge_coeffs[entity as usize]
        } else if codim == self.dim && entity < tc.n_nodes {
            tc.node_coeffs[entity as usize]
        } else {
            return (Vec::new(), Vec::new());
        };
        self.neighbours_along(octant, coeff, only_internal)
    }

    /// Union of the neighbours across codimensions 1..dim, deduplicated.
    ///
    /// Every per-entity search returns only cells actually touching the
    /// probed entity, so the union is a plain dedup. The node-centric
    /// union, which needs the hanging-node filter, is
    /// [`find_all_node_neighbours`](Self::find_all_node_neighbours).
    pub fn find_all_codim_neighbours(
        &self,
        octant: &Octant,
        only_internal: bool,
    ) -> (Vec<u32>, Vec<bool>) {
        let tc = tree_constants(self.dim);
        let mut seen = FxHashSet::default();
        let mut neighbours = Vec::new();
        let mut is_ghost = Vec::new();
        let mut entity_counts: Vec<(u8, u8)> = vec![(1, tc.n_faces)];
        if self.dim == 3 {
            entity_counts.push((2, tc.n_edges));
        }
        entity_counts.push((self.dim, tc.n_nodes));
        for (codim, count) in entity_counts {
            for entity in 0..count {
                let (n, g) = self.find_neighbours(octant, entity, codim, only_internal);
                for (idx, ghost) in izip!(n, g) {
                    if seen.insert((ghost, idx)) {
                        neighbours.push(idx);
                        is_ghost.push(ghost);
                    }
                }
            }
        }
        (neighbours, is_ghost)
    }

    /// True if a node of one octant lies on the closed bounding box of
    /// another (the hanging-node test).
    pub fn is_node_on_octant(&self, node: [u32; 3], octant: &Octant) -> bool {
        let anchor = octant.coordinates();
        let size = octant.size();
        for axis in 0..self.dim as usize {
            if node[axis] < anchor[axis] || node[axis] > anchor[axis] + size {
                return false;
            }
        }
        true
    }

    fn push_node_neighbours(
        &self,
        found: (Vec<u32>, Vec<bool>),
        node_coords: [u32; 3],
        level: u8,
        filter_finer: bool,
        seen: &mut FxHashSet<(bool, u32)>,
        neighbours: &mut Vec<u32>,
        is_ghost: &mut Vec<bool>,
    ) {
        for (idx, ghost) in izip!(found.0, found.1) {
            if filter_finer {
                let neighbour = if ghost {
                    &self.ghosts[idx as usize]
                } else {
                    &self.octants[idx as usize]
                };
                if neighbour.level() > level && !self.is_node_on_octant(node_coords, neighbour) {
                    continue;
                }
            }
            if seen.insert((ghost, idx)) {
                neighbours.push(idx);
                is_ghost.push(ghost);
            }
        }
    }

    /// All neighbours sharing one node of the octant.
    ///
    /// On non-uniform trees the node can hang inside the face (or, in 3D,
    /// the edge) of a finer neighbour, so besides the diagonal node probe
    /// the faces and edges meeting at the node are probed as well: a
    /// coarser or same-level neighbour found there certainly carries the
    /// node, a finer one is kept only if the node actually lies on its
    /// bounding box.
    pub fn find_all_node_neighbours(
        &self,
        octant: &Octant,
        node: u8,
        only_internal: bool,
    ) -> (Vec<u32>, Vec<bool>) {
        let tc = tree_constants(self.dim);
        let node_coords = octant.node(node);
        let level = octant.level();
        let mut seen = FxHashSet::default();
        let mut neighbours = Vec::new();
        let mut is_ghost = Vec::new();

        // Neighbours diagonal across the node touch it by construction.
        let found = self.find_neighbours(octant, node, self.dim, only_internal);
        self.push_node_neighbours(
            found,
            node_coords,
            level,
            false,
            &mut seen,
            &mut neighbours,
            &mut is_ghost,
        );

        if self.dim == 3 {
            for &edge in &tc.node_edge[node as usize] {
                let found = self.find_neighbours(octant, edge, 2, only_internal);
                self.push_node_neighbours(
                    found,
                    node_coords,
                    level,
                    true,
                    &mut seen,
                    &mut neighbours,
                    &mut is_ghost,
                );
            }
        }

        for k in 0..self.dim as usize {
            let face = tc.node_face[node as usize][k];
            let found = self.find_neighbours(octant, face, 1, only_internal);
            self.push_node_neighbours(
                found,
                node_coords,
                level,
                true,
                &mut seen,
                &mut neighbours,
                &mut is_ghost,
            );
        }

        (neighbours, is_ghost)
    }

    /// Morton keys of the deepest virtual neighbours beyond one entity.
    ///
    /// The cells enumerated are the `to_level`-sized cells on the far side
    /// of the entity; their owners are the ranks for which this octant is
    /// a layer-0 source. Returns nothing for non-periodic boundary
    /// entities.
    pub fn virtual_entity_mortons(
        &self,
        octant: &Octant,
        coeff: [i8; 3],
        to_level: u8,
    ) -> Vec<Morton> {
        let Some(origin) = self.translated_origin(octant, coeff) else {
            return Vec::new();
        };
        let size = octant.size() as i64;
        let fine = 1i64 << (MAX_LEVEL - to_level);
        let steps = (size / fine).max(1);
        // Anchor of the virtual block on each displaced axis.
        let mut base = [0i64; 3];
        for axis in 0..3 {
            base[axis] = match coeff[axis] {
                -1 => origin[axis] - fine,
                1 => origin[axis] + size,
                _ => origin[axis],
            };
        }
        let free: Vec<usize> = (0..self.dim as usize)
            .filter(|&axis| coeff[axis] == 0)
            .collect();
        let count = steps.pow(free.len() as u32);
        let mut mortons = Vec::with_capacity(count as usize);
        for cell in 0..count {
            let mut anchor = base;
            let mut remainder = cell;
            for &axis in &free {
                anchor[axis] = base[axis] + (remainder % steps) * fine;
                remainder /= steps;
            }
            mortons.push(morton::encode(
                self.dim,
                anchor[0] as u32,
                anchor[1] as u32,
                anchor[2] as u32,
            ));
        }
        mortons
    }

    // ------------------------------------------------------------------
    // Refinement and coarsening
    // ------------------------------------------------------------------

    /// One refinement pass: split every octant with a positive marker.
    ///
    /// Children carry the decremented marker, so the facade loops this
    /// until stable to honour deeper requests. Returns whether the local
    /// topology changed.
    pub fn refine(&mut self, map_idx: &mut Vec<u32>) -> bool {
        let do_map = !map_idx.is_empty();
        let mut splits = 0usize;
        for octant in &mut self.octants {
            if octant.marker() > 0 && octant.level() == MAX_LEVEL {
                // Refinement past the deepest level is silently clamped.
                octant.set_marker(0);
            }
            if octant.marker() > 0 {
                splits += 1;
            }
        }
        if splits == 0 {
            return false;
        }

        let n_children = tree_constants(self.dim).n_children as usize;
        let old = std::mem::take(&mut self.octants);
        let mut octants = Vec::with_capacity(old.len() + splits * (n_children - 1));
        let mut new_map = Vec::with_capacity(if do_map { octants.capacity() } else { 0 });
        let mut max_depth = self.local_max_depth;
        for (i, octant) in old.into_iter().enumerate() {
            if octant.marker() > 0 {
                max_depth = max_depth.max(octant.level() + 1);
                for child in octant.children() {
                    octants.push(child);
                    if do_map {
                        new_map.push(map_idx[i]);
                    }
                }
            } else {
                octants.push(octant);
                if do_map {
                    new_map.push(map_idx[i]);
                }
            }
        }
        self.octants = octants;
        self.local_max_depth = max_depth;
        if do_map {
            *map_idx = new_map;
        }
        true
    }

    /// One coarsening pass: collapse aligned families whose members all
    /// request coarsening.
    ///
    /// A family straddling a partition boundary collapses only when the
    /// missing siblings are ghosts; the rank owning the zero child takes
    /// the parent and records the ghost brothers, the other ranks drop
    /// their members.
    pub fn coarse(&mut self, map_idx: &mut Vec<u32>) -> bool {
        let n = self.octants.len();
        if n == 0 {
            return false;
        }
        let do_map = !map_idx.is_empty();
        let n_children = tree_constants(self.dim).n_children as usize;

        // Leading local siblings whose zero child lives on a previous rank.
        let mut head_drop = 0usize;
        let mut head_bros: Vec<u32> = Vec::new();
        if !self.ghosts.is_empty() {
            if let Some((members, bros)) = self.head_family_absorbed() {
                head_drop = members;
                head_bros = bros;
            }
        }

        // Trailing local siblings completed by ghosts of a following rank.
        let mut tail_start = n;
        let mut tail_parent: Option<Octant> = None;
        let mut tail_bros: Vec<u32> = Vec::new();
        if !self.ghosts.is_empty() {
            if let Some((start, parent, bros)) = self.tail_family_collapse(head_drop) {
                tail_start = start;
                tail_parent = Some(parent);
                tail_bros = bros;
            }
        }

        let mut changed = head_drop > 0 || tail_parent.is_some();
        let old = std::mem::take(&mut self.octants);
        let mut octants = Vec::with_capacity(old.len());
        let mut new_map = Vec::with_capacity(if do_map { old.len() } else { 0 });

        let mut i = head_drop;
        while i < tail_start {
            let octant = &old[i];
            if octant.marker() < 0
                && octant.level() > 0
                && octant.is_family_first_child()
                && i + n_children <= tail_start
                && self.is_coarsenable_family(&old[i..i + n_children])
            {
                let parent = Self::build_coarse_parent(&old[i..i + n_children]);
                octants.push(parent);
                if do_map {
                    new_map.push(map_idx[i]);
                }
                i += n_children;
                changed = true;
                continue;
            }
            octants.push(octant.clone());
            if do_map {
                new_map.push(map_idx[i]);
            }
            i += 1;
        }

        if let Some(parent) = tail_parent {
            let mut members: Vec<Octant> = old[tail_start..].to_vec();
            for &ghost_idx in &tail_bros {
                members.push(self.ghosts[ghost_idx as usize].clone());
            }
            let mut parent = parent;
            let marker = members.iter().map(|m| m.marker()).max().unwrap_or(-1);
            parent.set_marker(marker + 1);
            parent.set_new_coarse(true);
            octants.push(parent);
            if do_map {
                new_map.push(map_idx[tail_start]);
            }
            self.last_ghost_bros = tail_bros;
        }
        if head_drop > 0 {
            self.first_ghost_bros = head_bros;
        }

        self.octants = octants;
        if do_map {
            *map_idx = new_map;
        }
        if changed {
            self.update_local_max_depth();
        }
        changed
    }

    fn is_coarsenable_family(&self, members: &[Octant]) -> bool {
        let first = &members[0];
        let level = first.level();
        let parent_morton = morton::parent(self.dim, first.morton(), level);
        members.iter().all(|member| {
            member.level() == level
                && member.marker() < 0
                && morton::parent(self.dim, member.morton(), level) == parent_morton
        })
    }

    fn build_coarse_parent(members: &[Octant]) -> Octant {
        let mut parent = members[0].family_parent();
        let marker = members.iter().map(|m| m.marker()).max().unwrap_or(-1);
        parent.set_marker(marker + 1);
        parent.set_new_coarse(true);
        parent
    }

    /// Ghost siblings of the family containing a given local member, all
    /// required to be coarsenable leaves. `None` when the family is not
    /// fully visible or not uniformly marked.
    fn ghost_family_members(
        &self,
        parent_morton: Morton,
        parent_last: Morton,
        level: u8,
    ) -> Option<Vec<u32>> {
        let start = self
            .ghosts
            .partition_point(|ghost| ghost.morton() < parent_morton);
        let mut members = Vec::new();
        for idx in start..self.ghosts.len() {
            let ghost = &self.ghosts[idx];
            if ghost.morton() > parent_last {
                break;
            }
            if ghost.level() != level || ghost.marker() >= 0 {
                return None;
            }
            members.push(idx as u32);
        }
        Some(members)
    }

    /// Detect a leading run of siblings whose family is completed by
    /// ghosts and whose zero child is foreign. Returns the number of local
    /// members to drop and the ghost brother indices preceding them.
    fn head_family_absorbed(&self) -> Option<(usize, Vec<u32>)> {
        let n_children = tree_constants(self.dim).n_children as usize;
        let first = self.octants.first()?;
        if first.level() == 0 || first.marker() >= 0 || first.is_family_first_child() {
            return None;
        }
        let level = first.level();
        let parent_morton = morton::parent(self.dim, first.morton(), level);
        let parent_last = morton::last_descendant(self.dim, parent_morton, level - 1);

        let mut members = 0usize;
        while members < self.octants.len() {
            let octant = &self.octants[members];
            if octant.morton() > parent_last {
                break;
            }
            if octant.level() != level || octant.marker() >= 0 {
                return None;
            }
            members += 1;
        }

        let ghost_members = self.ghost_family_members(parent_morton, parent_last, level)?;
        if members + ghost_members.len() != n_children {
            return None;
        }
        // The zero child must exist as a ghost on a previous rank.
        let zero_is_ghost = ghost_members
            .iter()
            .any(|&idx| self.ghosts[idx as usize].morton() == parent_morton);
        if !zero_is_ghost {
            return None;
        }
        let first_morton = first.morton();
        let bros = ghost_members
            .into_iter()
            .filter(|&idx| self.ghosts[idx as usize].morton() < first_morton)
            .collect();
        Some((members, bros))
    }

    /// Detect a trailing run of siblings starting at a local zero child
    /// and completed by ghosts of a following rank. Returns the start of
    /// the run, the parent, and the ghost brother indices.
    fn tail_family_collapse(&self, head_drop: usize) -> Option<(usize, Octant, Vec<u32>)> {
        let n_children = tree_constants(self.dim).n_children as usize;
        let n = self.octants.len();
        let last = self.octants.last()?;
        if last.level() == 0 || last.marker() >= 0 {
            return None;
        }
        let level = last.level();
        let parent_morton = morton::parent(self.dim, last.morton(), level);
        let parent_last = morton::last_descendant(self.dim, parent_morton, level - 1);

        // Local run of family members ending at the last octant.
        let run_start = self
            .octants
            .partition_point(|octant| octant.morton() < parent_morton);
        if run_start < head_drop {
            return None;
        }
        if run_start >= n || self.octants[run_start].morton() != parent_morton {
            // The zero child is not local; the head logic owns this case.
            return None;
        }
        let members = n - run_start;
        if members >= n_children {
            // The family is fully local; the sequential scan handles it.
            return None;
        }
        for octant in &self.octants[run_start..] {
            if octant.level() != level || octant.marker() >= 0 {
                return None;
            }
        }

        let ghost_members = self.ghost_family_members(parent_morton, parent_last, level)?;
        if members + ghost_members.len() != n_children {
            return None;
        }
        let parent = self.octants[run_start].family_parent();
        Some((run_start, parent, ghost_members))
    }

    /// Force every marker to +1 and run one refinement pass.
    pub fn global_refine(&mut self, map_idx: &mut Vec<u32>) -> bool {
        for octant in &mut self.octants {
            octant.set_marker(1);
        }
        self.refine(map_idx)
    }

    /// Force every marker to −1 and run one coarsening pass.
    pub fn global_coarse(&mut self, map_idx: &mut Vec<u32>) -> bool {
        for octant in &mut self.octants {
            octant.set_marker(-1);
        }
        for ghost in &mut self.ghosts {
            ghost.set_marker(-1);
        }
        self.coarse(map_idx)
    }

    /// Reset the coarsening requests that no complete family consumed.
    pub fn clear_negative_markers(&mut self) {
        for octant in &mut self.octants {
            if octant.marker() < 0 {
                octant.set_marker(0);
            }
        }
    }

    /// Clear the new-by-refine / new-by-coarsen flags of every octant.
    pub fn clear_new_flags(&mut self) {
        for octant in &mut self.octants {
            octant.set_new_refine(false);
            octant.set_new_coarse(false);
        }
    }

    // ------------------------------------------------------------------
    // 2:1 marker balancing
    // ------------------------------------------------------------------

    fn balance_entities(&self) -> Vec<(u8, u8)> {
        let tc = tree_constants(self.dim);
        let mut entities = vec![(1u8, tc.n_faces)];
        if self.dim == 3 && self.balance_codim >= 2 {
            entities.push((2, tc.n_edges));
        }
        if self.balance_codim >= self.dim {
            entities.push((self.dim, tc.n_nodes));
        }
        entities
    }

    /// True if the family of the given octant is fully visible (owned or
    /// ghost), uniform in level, and marked for coarsening throughout.
    fn family_coarsenable(&self, idx: usize) -> bool {
        let octant = &self.octants[idx];
        let level = octant.level();
        if level == 0 {
            return false;
        }
        let n_children = tree_constants(self.dim).n_children as usize;
        let parent_morton = morton::parent(self.dim, octant.morton(), level);
        let parent_last = morton::last_descendant(self.dim, parent_morton, level - 1);
        let start = self
            .octants
            .partition_point(|o| o.morton() < parent_morton);
        let mut members = 0;
        for member in &self.octants[start..] {
            if member.morton() > parent_last {
                break;
            }
            if member.level() != level || member.marker() >= 0 {
                return false;
            }
            members += 1;
        }
        if members == n_children {
            return true;
        }
        if self.ghosts.is_empty() {
            return false;
        }
        match self.ghost_family_members(parent_morton, parent_last, level) {
            Some(ghost_members) => members + ghost_members.len() == n_children,
            None => false,
        }
    }

    /// Reset the coarsening marker of every octant whose family cannot
    /// collapse, so that balance constraints see accurate targets.
    fn cancel_incomplete_coarsening(&mut self) -> bool {
        let mut changed = false;
        for idx in 0..self.octants.len() {
            if self.octants[idx].marker() < 0 && !self.family_coarsenable(idx) {
                self.octants[idx].set_marker(0);
                changed = true;
            }
        }
        changed
    }

    /// Iterative 2:1 marker propagation; levels are never touched.
    ///
    /// Propagation is seeded at octants whose marker is non-zero (and, if
    /// `balance_new` is set, at octants freshly created by the current
    /// adapt). When `seed_from_ghosts` is set, ghost octants with
    /// synchronized markers seed as well, pushing their targets onto local
    /// neighbours. Markers of balance-disabled octants are never modified,
    /// but their targets still constrain enabled neighbours. Coarsening
    /// requests of families that cannot collapse are cancelled up front.
    pub fn local_balance(&mut self, balance_new: bool, seed_from_ghosts: bool) -> bool {
        let entities = self.balance_entities();
        let mut changed_any = false;
        loop {
            let mut changed = self.cancel_incomplete_coarsening();

            for idx in 0..self.octants.len() {
                let octant = self.octants[idx].clone();
                let seeded = octant.marker() != 0
                    || (balance_new && (octant.is_new_refine() || octant.is_new_coarse()));
                if !seeded {
                    continue;
                }
                let my_level = octant.level() as i32;
                let mut my_marker = octant.marker() as i32;
                for &(codim, count) in &entities {
                    for entity in 0..count {
                        let (neighbours, ghost_flags) =
                            self.find_neighbours(&octant, entity, codim, false);
                        for (nidx, is_ghost) in izip!(neighbours, ghost_flags) {
                            let neighbour = if is_ghost {
                                &self.ghosts[nidx as usize]
                            } else {
                                &self.octants[nidx as usize]
                            };
                            let n_level = neighbour.level() as i32;
                            let n_target = n_level + neighbour.marker() as i32;
                            let n_balance = neighbour.balance();
                            let my_target = my_level + my_marker;
                            if n_target > my_target + 1 && octant.balance() {
                                my_marker = n_target - 1 - my_level;
                                changed = true;
                            } else if my_target > n_target + 1 && !is_ghost && n_balance {
                                self.octants[nidx as usize]
                                    .set_marker((my_target - 1 - n_level) as i8);
                                changed = true;
                            }
                        }
                    }
                }
                if my_marker != octant.marker() as i32 {
                    self.octants[idx].set_marker(my_marker as i8);
                }
            }

            if seed_from_ghosts {
                for gidx in 0..self.ghosts.len() {
                    let ghost = self.ghosts[gidx].clone();
                    let seeded = ghost.marker() != 0
                        || (balance_new && (ghost.is_new_refine() || ghost.is_new_coarse()));
                    if !seeded {
                        continue;
                    }
                    let g_target = ghost.level() as i32 + ghost.marker() as i32;
                    for &(codim, count) in &entities {
                        for entity in 0..count {
                            let (neighbours, _) =
                                self.find_neighbours(&ghost, entity, codim, true);
                            for nidx in neighbours {
                                let neighbour = &self.octants[nidx as usize];
                                if !neighbour.balance() {
                                    continue;
                                }
                                let n_level = neighbour.level() as i32;
                                let n_target = n_level + neighbour.marker() as i32;
                                if g_target > n_target + 1 {
                                    self.octants[nidx as usize]
                                        .set_marker((g_target - 1 - n_level) as i8);
                                    changed = true;
                                }
                            }
                        }
                    }
                }
            }

            if !changed {
                break;
            }
            changed_any = true;
        }
        changed_any
    }

    // ------------------------------------------------------------------
    // Connectivity and intersections
    // ------------------------------------------------------------------

    /// Enumerate the unique cell corners and the per-cell corner indices.
    pub fn compute_connectivity(&mut self) {
        let n_nodes = tree_constants(self.dim).n_nodes;
        let mut unique: BTreeMap<[u32; 3], u32> = BTreeMap::new();
        for octant in &self.octants {
            for i in 0..n_nodes {
                unique.entry(octant.node(i)).or_insert(0);
            }
        }
        for (id, value) in unique.values_mut().enumerate() {
            *value = id as u32;
        }
        self.nodes = unique.keys().copied().collect();
        self.connectivity = self
            .octants
            .iter()
            .map(|octant| {
                (0..n_nodes)
                    .map(|i| unique[&octant.node(i)])
                    .collect::<Vec<u32>>()
            })
            .collect();
    }

    pub fn clear_connectivity(&mut self) {
        self.nodes.clear();
        self.connectivity.clear();
    }

    /// Re-run the corner enumeration after a structural change.
    pub fn update_connectivity(&mut self) {
        self.clear_connectivity();
        self.compute_connectivity();
    }

    /// One record per face shared by two owners or by one owner and the
    /// domain boundary, ordered ascending by `(min_owner_morton, face)`.
    pub fn compute_intersections(&mut self) {
        let tc = tree_constants(self.dim);
        let mut records: Vec<(Morton, Intersection)> = Vec::new();
        for (idx, octant) in self.octants.iter().enumerate() {
            let morton = octant.morton();
            for face in 0..tc.n_faces {
                if octant.bound(face) && !self.periodic[face as usize] {
                    records.push((
                        morton,
                        Intersection {
                            owners: [idx as u32, idx as u32],
                            face,
                            finer: 0,
                            is_ghost: false,
                            bound: true,
                            pbound: false,
                        },
                    ));
                    continue;
                }
                let (neighbours, ghost_flags) = self.find_neighbours(octant, face, 1, false);
                for (nidx, is_ghost) in izip!(neighbours, ghost_flags) {
                    let neighbour = if is_ghost {
                        &self.ghosts[nidx as usize]
                    } else {
                        &self.octants[nidx as usize]
                    };
                    if !is_ghost {
                        // Record each interior pair once, from the finer
                        // side, or from the lower key on equal levels.
                        if neighbour.level() > octant.level()
                            || (neighbour.level() == octant.level()
                                && neighbour.morton() < morton)
                        {
                            continue;
                        }
                    }
                    let key = morton.min(neighbour.morton());
                    records.push((
                        key,
                        Intersection {
                            owners: [idx as u32, nidx],
                            face,
                            finer: if neighbour.level() > octant.level() { 1 } else { 0 },
                            is_ghost,
                            bound: false,
                            pbound: is_ghost,
                        },
                    ));
                }
            }
        }
        records.sort_by(|a, b| (a.0, a.1.face).cmp(&(b.0, b.1.face)));
        self.intersections = records.into_iter().map(|(_, record)| record).collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn refine_all(tree: &mut LocalTree) {
        let mut map = Vec::new();
        tree.global_refine(&mut map);
    }

    #[test]
    fn test_refine_keeps_morton_order() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        refine_all(&mut tree);
        assert_eq!(tree.num_octants(), 16);
        for (a, b) in tree.octants().iter().zip(tree.octants().iter().skip(1)) {
            assert!(a.morton() < b.morton());
        }
        assert_eq!(tree.local_max_depth(), 2);
    }

    #[test]
    fn test_refine_decrements_marker() {
        let mut tree = LocalTree::new(2, true);
        tree.octants_mut()[0].set_marker(2);
        let mut map = Vec::new();
        assert!(tree.refine(&mut map));
        assert_eq!(tree.num_octants(), 4);
        for octant in tree.octants() {
            assert_eq!(octant.marker(), 1);
            assert!(octant.is_new_refine());
        }
        assert!(tree.refine(&mut map));
        assert_eq!(tree.num_octants(), 16);
        assert!(!tree.refine(&mut map));
    }

    #[test]
    fn test_coarse_collapses_family() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        for octant in tree.octants_mut() {
            octant.set_marker(-1);
        }
        let mut map = Vec::new();
        assert!(tree.coarse(&mut map));
        assert_eq!(tree.num_octants(), 1);
        let root = &tree.octants()[0];
        assert_eq!(root.level(), 0);
        assert!(root.is_new_coarse());
        assert_eq!(root.marker(), 0);
    }

    #[test]
    fn test_coarse_requires_full_family() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        for octant in tree.octants_mut().iter_mut().skip(1) {
            octant.set_marker(-1);
        }
        let mut map = Vec::new();
        assert!(!tree.coarse(&mut map));
        assert_eq!(tree.num_octants(), 4);
    }

    #[test]
    fn test_face_neighbours_same_level() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        // Cell 0 is the lower-left quadrant.
        let octant = tree.octants()[0].clone();
        let (right, ghost) = tree.find_neighbours(&octant, 1, 1, false);
        assert_eq!(ghost, vec![false]);
        assert_eq!(tree.octants()[right[0] as usize].coordinates()[0], octant.size());
        // The -x face is a domain boundary.
        let (left, _) = tree.find_neighbours(&octant, 0, 1, false);
        assert!(left.is_empty());
    }

    #[test]
    fn test_face_neighbours_finer() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        // Refine only the lower-left quadrant.
        tree.octants_mut()[0].set_marker(1);
        let mut map = Vec::new();
        tree.refine(&mut map);
        assert_eq!(tree.num_octants(), 7);
        // The lower-right quadrant now has two finer neighbours on its -x face.
        let idx = tree
            .octants()
            .iter()
            .position(|o| o.level() == 1 && o.coordinates()[0] > 0 && o.coordinates()[1] == 0)
            .unwrap();
        let octant = tree.octants()[idx].clone();
        let (neighbours, _) = tree.find_neighbours(&octant, 0, 1, false);
        assert_eq!(neighbours.len(), 2);
        for nidx in neighbours {
            assert_eq!(tree.octants()[nidx as usize].level(), 2);
        }
    }

    #[test]
    fn test_node_neighbours() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        let octant = tree.octants()[0].clone();
        // Node 3 of the lower-left quadrant is the domain center.
        let (neighbours, ghost_flags) = tree.find_neighbours(&octant, 3, 2, false);
        assert_eq!(neighbours.len(), 1);
        assert!(!ghost_flags[0]);
        let diagonal = &tree.octants()[neighbours[0] as usize];
        assert_eq!(
            diagonal.coordinates(),
            [octant.size(), octant.size(), 0]
        );
        // Node 0 touches the domain corner: no neighbours.
        let (none, _) = tree.find_neighbours(&octant, 0, 2, false);
        assert!(none.is_empty());
    }

    #[test]
    fn test_edge_neighbours_3d() {
        let mut tree = LocalTree::new(3, true);
        refine_all(&mut tree);
        // Child 0 and child 6 share the edge along x at y=half, z=half.
        let octant = tree.octants()[0].clone();
        let (neighbours, _) = tree.find_neighbours(&octant, 3, 2, false);
        assert_eq!(neighbours.len(), 1);
        let other = &tree.octants()[neighbours[0] as usize];
        assert_eq!(other.coordinates(), [0, octant.size(), octant.size()]);
    }

    #[test]
    fn test_all_node_neighbours_filters_hanging_nodes() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        // Refine only the lower-left quadrant; its east side now hangs
        // two finer cells on the lower-right quadrant's -x face.
        tree.octants_mut()[0].set_marker(1);
        let mut map = Vec::new();
        tree.refine(&mut map);
        assert_eq!(tree.num_octants(), 7);
        let idx = tree
            .octants()
            .iter()
            .position(|o| o.level() == 1 && o.coordinates()[0] > 0 && o.coordinates()[1] == 0)
            .unwrap();
        let octant = tree.octants()[idx].clone();

        // The -x face probe alone sees both finer cells, but only the one
        // whose bounding box carries node 0 is a node neighbour.
        let (face_neighbours, _) = tree.find_neighbours(&octant, 0, 1, false);
        assert_eq!(face_neighbours.len(), 2);
        let (neighbours, ghost_flags) = tree.find_all_node_neighbours(&octant, 0, false);
        assert_eq!(neighbours.len(), 1);
        assert!(!ghost_flags[0]);
        let kept = &tree.octants()[neighbours[0] as usize];
        assert_eq!(kept.level(), 2);
        assert!(tree.is_node_on_octant(octant.node(0), kept));
        for &nidx in &face_neighbours {
            if nidx != neighbours[0] {
                let rejected = &tree.octants()[nidx as usize];
                assert!(!tree.is_node_on_octant(octant.node(0), rejected));
            }
        }

        // Node 2 is the domain center: one finer subcell across the face,
        // plus the two coarse quadrants.
        let (neighbours, _) = tree.find_all_node_neighbours(&octant, 2, false);
        assert_eq!(neighbours.len(), 3);
        let mut levels: Vec<u8> = neighbours
            .iter()
            .map(|&nidx| tree.octants()[nidx as usize].level())
            .collect();
        levels.sort_unstable();
        assert_eq!(levels, vec![1, 1, 2]);
    }

    #[test]
    fn test_all_codim_neighbours_count() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        refine_all(&mut tree);
        // An interior cell of a uniform 4x4 grid has 8 distinct neighbours.
        let idx = tree
            .octants()
            .iter()
            .position(|o| {
                let c = o.coordinates();
                c[0] == o.size() && c[1] == o.size()
            })
            .unwrap();
        let octant = tree.octants()[idx].clone();
        let (neighbours, _) = tree.find_all_codim_neighbours(&octant, false);
        assert_eq!(neighbours.len(), 8);
    }

    #[test]
    fn test_periodic_face_neighbour() {
        let mut tree = LocalTree::new(2, true);
        let mut periodic = [false; 6];
        periodic[0] = true;
        periodic[1] = true;
        tree.set_periodic(periodic);
        refine_all(&mut tree);
        let octant = tree.octants()[0].clone();
        let (neighbours, _) = tree.find_neighbours(&octant, 0, 1, false);
        assert_eq!(neighbours.len(), 1);
        let other = &tree.octants()[neighbours[0] as usize];
        assert_eq!(other.coordinates()[0], octant.size());
        assert_eq!(other.coordinates()[1], 0);
    }

    #[test]
    fn test_local_balance_limits_gap() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        // Ask for a deep refinement of one corner cell only.
        tree.octants_mut()[0].set_marker(3);
        tree.local_balance(false, false);
        // With the default face-only balance codimension, every face pair
        // of requested targets must stay within one level.
        for idx in 0..tree.num_octants() {
            let octant = tree.octants()[idx].clone();
            let target = octant.level() as i32 + octant.marker() as i32;
            for face in 0..4 {
                let (neighbours, _) = tree.find_neighbours(&octant, face, 1, false);
                for nidx in neighbours {
                    let neighbour = &tree.octants()[nidx as usize];
                    let n_target = neighbour.level() as i32 + neighbour.marker() as i32;
                    assert!((target - n_target).abs() <= 1);
                }
            }
        }
    }

    #[test]
    fn test_connectivity_unique_corners() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        tree.compute_connectivity();
        // A uniform 2x2 grid has 9 distinct corners.
        assert_eq!(tree.nodes().len(), 9);
        assert_eq!(tree.connectivity().len(), 4);
        for row in tree.connectivity() {
            assert_eq!(row.len(), 4);
        }
    }

    #[test]
    fn test_intersections_ordering_and_counts() {
        let mut tree = LocalTree::new(2, true);
        refine_all(&mut tree);
        tree.compute_intersections();
        // 4 interior faces + 8 boundary faces.
        let interior = tree.intersections().iter().filter(|i| !i.bound).count();
        let boundary = tree.intersections().iter().filter(|i| i.bound).count();
        assert_eq!(interior, 4);
        assert_eq!(boundary, 8);
    }
}
