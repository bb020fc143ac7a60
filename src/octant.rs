//! A single leaf cell of the tree.

use bitflags::bitflags;

use crate::constants::{tree_constants, MAX_LENGTH, MAX_LEVEL, N_INFO};
use crate::morton::{self, Morton};

bitflags! {
    /// Per-octant status bits.
    ///
    /// The first twelve bits are the per-face boundary and partition
    /// boundary flags; the layout is fixed at six faces so that the 2D and
    /// 3D snapshot records share one shape.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OctantInfo: u32 {
        const BOUND_0 = 1 << 0;
        const BOUND_1 = 1 << 1;
        const BOUND_2 = 1 << 2;
        const BOUND_3 = 1 << 3;
        const BOUND_4 = 1 << 4;
        const BOUND_5 = 1 << 5;
        const PBOUND_0 = 1 << 6;
        const PBOUND_1 = 1 << 7;
        const PBOUND_2 = 1 << 8;
        const PBOUND_3 = 1 << 9;
        const PBOUND_4 = 1 << 10;
        const PBOUND_5 = 1 << 11;
        const NEW_REFINE = 1 << 12;
        const NEW_COARSE = 1 << 13;
        const BALANCE = 1 << 14;
        const AUX = 1 << 15;
    }
}

impl OctantInfo {
    fn bound_bit(face: u8) -> OctantInfo {
        OctantInfo::from_bits_truncate(1 << face)
    }

    fn pbound_bit(face: u8) -> OctantInfo {
        OctantInfo::from_bits_truncate(1 << (6 + face))
    }
}

/// One leaf cell: level, integer anchor, status bits, marker and ghost
/// layer.
///
/// The anchor is the node-0 corner on the integer grid; the side length is
/// `2^(MAX_LEVEL - level)` integer units. 2D octants have `z == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Octant {
    dim: u8,
    level: u8,
    marker: i8,
    x: u32,
    y: u32,
    z: u32,
    info: OctantInfo,
    ghost_layer: i32,
}

impl Octant {
    /// A new octant with boundary flags derived from its coordinates.
    pub fn new(dim: u8, level: u8, x: u32, y: u32, z: u32) -> Octant {
        let mut octant = Octant {
            dim,
            level,
            marker: 0,
            x,
            y,
            z,
            info: OctantInfo::BALANCE,
            ghost_layer: -1,
        };
        octant.update_boundary_info();
        octant
    }

    /// The level-0 octant covering the whole domain.
    pub fn root(dim: u8) -> Octant {
        Octant::new(dim, 0, 0, 0, 0)
    }

    pub fn dim(&self) -> u8 {
        self.dim
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// The anchor, i.e. the coordinates of node 0.
    pub fn coordinates(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// Side length in integer units.
    pub fn size(&self) -> u32 {
        1 << (MAX_LEVEL - self.level)
    }

    pub fn morton(&self) -> Morton {
        morton::encode(self.dim, self.x, self.y, self.z)
    }

    /// Key of the deepest descendant in the last corner.
    pub fn last_desc_morton(&self) -> Morton {
        morton::last_descendant(self.dim, self.morton(), self.level)
    }

    /// Key of the deepest first descendant.
    pub fn first_desc_morton(&self) -> Morton {
        self.morton()
    }

    pub fn marker(&self) -> i8 {
        self.marker
    }

    /// Set the adaptation marker, clamped to the feasible range of this
    /// octant's level. Requesting refinement at `MAX_LEVEL` is silently
    /// ignored.
    pub fn set_marker(&mut self, marker: i8) {
        let up = (MAX_LEVEL - self.level) as i8;
        let down = -(self.level as i8);
        self.marker = marker.clamp(down, up);
    }

    pub fn ghost_layer(&self) -> i32 {
        self.ghost_layer
    }

    pub fn set_ghost_layer(&mut self, layer: i32) {
        self.ghost_layer = layer;
    }

    pub fn is_ghost(&self) -> bool {
        self.ghost_layer >= 0
    }

    pub fn info(&self) -> OctantInfo {
        self.info
    }

    pub fn set_info(&mut self, info: OctantInfo) {
        self.info = info;
    }

    /// True if the given face lies on the domain boundary.
    pub fn bound(&self, face: u8) -> bool {
        self.info.contains(OctantInfo::bound_bit(face))
    }

    /// True if the given face touches a foreign partition.
    pub fn pbound(&self, face: u8) -> bool {
        self.info.contains(OctantInfo::pbound_bit(face))
    }

    pub fn set_pbound(&mut self, face: u8, value: bool) {
        self.info.set(OctantInfo::pbound_bit(face), value);
    }

    pub fn clear_pbound(&mut self) {
        self.info &= !(OctantInfo::PBOUND_0
            | OctantInfo::PBOUND_1
            | OctantInfo::PBOUND_2
            | OctantInfo::PBOUND_3
            | OctantInfo::PBOUND_4
            | OctantInfo::PBOUND_5);
    }

    pub fn balance(&self) -> bool {
        self.info.contains(OctantInfo::BALANCE)
    }

    pub fn set_balance(&mut self, enabled: bool) {
        self.info.set(OctantInfo::BALANCE, enabled);
    }

    pub fn is_new_refine(&self) -> bool {
        self.info.contains(OctantInfo::NEW_REFINE)
    }

    pub fn set_new_refine(&mut self, value: bool) {
        self.info.set(OctantInfo::NEW_REFINE, value);
    }

    pub fn is_new_coarse(&self) -> bool {
        self.info.contains(OctantInfo::NEW_COARSE)
    }

    pub fn set_new_coarse(&mut self, value: bool) {
        self.info.set(OctantInfo::NEW_COARSE, value);
    }

    /// Recompute the per-face domain boundary flags from the coordinates.
    pub fn update_boundary_info(&mut self) {
        let size = self.size();
        let coords = [self.x, self.y, self.z];
        for axis in 0..self.dim {
            let low = coords[axis as usize] == 0;
            let high = coords[axis as usize] + size == MAX_LENGTH;
            self.info.set(OctantInfo::bound_bit(2 * axis), low);
            self.info.set(OctantInfo::bound_bit(2 * axis + 1), high);
        }
    }

    /// The `2^dim` children, in Morton order. Children inherit the balance
    /// flag and a decremented marker and carry the new-by-refine flag.
    pub fn children(&self) -> Vec<Octant> {
        let tc = tree_constants(self.dim);
        let half = self.size() >> 1;
        let mut children = Vec::with_capacity(tc.n_children as usize);
        for k in 0..tc.n_children as u32 {
            let mut child = Octant::new(
                self.dim,
                self.level + 1,
                self.x + (k & 1) * half,
                self.y + ((k >> 1) & 1) * half,
                self.z + ((k >> 2) & 1) * half,
            );
            child.marker = (self.marker - 1).max(0);
            child.set_balance(self.balance());
            child.set_new_refine(true);
            children.push(child);
        }
        children
    }

    /// The conceptual parent of this octant's family.
    pub fn family_parent(&self) -> Octant {
        debug_assert!(self.level > 0);
        let double = self.size() << 1;
        let mask = !(double - 1);
        let mut parent = Octant::new(
            self.dim,
            self.level - 1,
            self.x & mask,
            self.y & mask,
            self.z & mask,
        );
        parent.set_balance(self.balance());
        parent
    }

    /// True if this octant is the "0" corner of its family.
    pub fn is_family_first_child(&self) -> bool {
        if self.level == 0 {
            return false;
        }
        let double = self.size() << 1;
        let mask = double - 1;
        (self.x & mask) == 0 && (self.y & mask) == 0 && (self.z & mask) == 0
    }

    /// Integer coordinates of the i-th corner.
    pub fn node(&self, i: u8) -> [u32; 3] {
        let size = self.size();
        [
            self.x + (i as u32 & 1) * size,
            self.y + ((i as u32 >> 1) & 1) * size,
            self.z + ((i as u32 >> 2) & 1) * size,
        ]
    }

    /// Integer coordinates of the center of a face.
    pub fn face_center(&self, face: u8) -> [u32; 3] {
        let tc = tree_constants(self.dim);
        let half = self.size() / 2;
        let normal = tc.normals[face as usize];
        let mut center = [self.x + half, self.y + half, self.z + half];
        if self.dim == 2 {
            center[2] = 0;
        }
        for axis in 0..self.dim as usize {
            if normal[axis] < 0 {
                center[axis] -= half;
            } else if normal[axis] > 0 {
                center[axis] += half;
            }
        }
        center
    }

    /// Integer coordinates of the two end points of an edge (3D).
    pub fn edge_endpoints(&self, edge: u8) -> [[u32; 3]; 2] {
        let tc = tree_constants(self.dim);
        let [a, b] = tc.edge_node[edge as usize];
        [self.node(a), self.node(b)]
    }

    /// Outward normal of a face.
    pub fn normal(&self, face: u8) -> [i8; 3] {
        tree_constants(self.dim).normals[face as usize]
    }

    /// The face opposite to `face`.
    pub fn opposite_face(&self, face: u8) -> u8 {
        tree_constants(self.dim).opposite_face[face as usize]
    }

    /// Translation that maps the virtual neighbour beyond a periodic face
    /// back into the domain.
    pub fn face_periodic_offset(&self, face: u8) -> [i64; 3] {
        let normal = self.normal(face);
        let mut offset = [0i64; 3];
        for axis in 0..3 {
            offset[axis] = -(normal[axis] as i64) * MAX_LENGTH as i64;
        }
        offset
    }

    /// Center of the octant in the unit-cube frame.
    pub fn center(&self) -> [f64; 3] {
        let half = self.size() as f64 / 2.0;
        let scale = 1.0 / MAX_LENGTH as f64;
        let mut center = [
            (self.x as f64 + half) * scale,
            (self.y as f64 + half) * scale,
            (self.z as f64 + half) * scale,
        ];
        if self.dim == 2 {
            center[2] = 0.0;
        }
        center
    }

    /// Side length in the unit-cube frame.
    pub fn scaled_size(&self) -> f64 {
        self.size() as f64 / MAX_LENGTH as f64
    }

    /// The info word packed into the low `N_INFO` bits of a `u32`.
    pub fn info_bits(&self) -> u32 {
        self.info.bits()
    }

    pub fn set_info_bits(&mut self, bits: u32) {
        self.info = OctantInfo::from_bits_truncate(bits & ((1 << N_INFO as u32) - 1));
    }
}
