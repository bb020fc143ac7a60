//! Versioned binary dump/restore of the engine state.
//!
//! The format is little-endian, untagged, and bit-exact across platforms;
//! see the repository documentation for the record order. The codec
//! borrows the engine state for dumping and returns an owned [`Snapshot`]
//! on restore; wiring it back into a live tree is the facade's job.

use std::io::{Read, Write};

use crate::constants::N_INFO;
use crate::error::{Result, TreeError};
use crate::octant::Octant;
use crate::partition::PartitionRegistry;
use crate::stream::{BinaryReader, BinaryWriter};

/// Version tag of the binary format.
pub const DUMP_VERSION: i32 = 1;

/// Operation codes stored in full dumps.
pub const OP_INIT: i32 = 0;
pub const OP_ADAPT_MAPPED: i32 = 1;
pub const OP_ADAPT_UNMAPPED: i32 = 2;
pub const OP_LOADBALANCE: i32 = 3;
pub const OP_LOADBALANCE_FIRST: i32 = 4;
pub const OP_PRE_ADAPT: i32 = 5;

/// Mapping state appended to a full dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullState {
    pub last_op: i32,
    pub map_idx: Vec<u32>,
    pub last_ghost_bros: Vec<u32>,
    pub prev_range_idx: Vec<u64>,
}

/// Borrowed view of everything a dump needs.
pub struct SnapshotView<'a> {
    pub nproc: usize,
    pub dim: u8,
    pub serial: bool,
    pub halo_width: u64,
    pub max_depth: i8,
    pub status: u64,
    pub balance_codim: u8,
    pub periodic: &'a [bool],
    pub octants: &'a [Octant],
    pub global_count: u64,
    pub registry: &'a PartitionRegistry,
    pub full: Option<&'a FullState>,
}

/// Owned engine state read back from a dump.
#[derive(Debug)]
pub struct Snapshot {
    pub dim: u8,
    pub serial: bool,
    pub halo_width: u64,
    pub max_depth: i8,
    pub status: u64,
    pub balance_codim: u8,
    pub periodic: Vec<bool>,
    pub octants: Vec<Octant>,
    pub global_count: u64,
    pub first_desc: Vec<u64>,
    pub last_desc: Vec<u64>,
    pub range_idx: Vec<u64>,
    pub full: Option<FullState>,
}

/// Write the binary snapshot to the stream.
pub fn dump<W: Write>(stream: W, view: &SnapshotView<'_>) -> Result<()> {
    let mut w = BinaryWriter::new(stream);
    w.put_i32(DUMP_VERSION)?;

    w.put_i32(view.nproc as i32)?;
    w.put_u8(view.dim)?;
    w.put_bool(view.serial)?;
    w.put_u64(view.halo_width)?;
    w.put_i8(view.max_depth)?;
    w.put_u64(view.status)?;
    w.put_u8(view.balance_codim)?;
    for &periodic in view.periodic {
        w.put_bool(periodic)?;
    }

    w.put_u32(view.octants.len() as u32)?;
    w.put_u64(view.global_count)?;
    for octant in view.octants {
        let coords = octant.coordinates();
        w.put_u8(octant.level())?;
        w.put_u32(coords[0])?;
        w.put_u32(coords[1])?;
        w.put_u32(coords[2])?;
        w.put_i32(octant.ghost_layer())?;
        let bits = octant.info_bits();
        for k in 0..N_INFO {
            w.put_bool(bits & (1 << k) != 0)?;
        }
        w.put_bool(octant.balance())?;
        w.put_i8(octant.marker())?;
    }

    for &desc in view.registry.first_desc() {
        w.put_u64(desc)?;
    }
    for &desc in view.registry.last_desc() {
        w.put_u64(desc)?;
    }
    for &range in view.registry.range_global_idx() {
        w.put_u64(range)?;
    }

    w.put_bool(view.full.is_some())?;
    if let Some(full) = view.full {
        w.put_i32(full.last_op)?;
        if full.last_op == OP_ADAPT_MAPPED {
            w.put_u32(full.map_idx.len() as u32)?;
            for &idx in &full.map_idx {
                w.put_u32(idx)?;
            }
            w.put_u64(full.last_ghost_bros.len() as u64)?;
            for &bro in &full.last_ghost_bros {
                w.put_u32(bro)?;
            }
        } else if full.last_op == OP_LOADBALANCE || full.last_op == OP_LOADBALANCE_FIRST {
            for &range in &full.prev_range_idx {
                w.put_u64(range)?;
            }
        }
    }
    Ok(())
}

/// Read a binary snapshot, verifying the version and the rank count.
pub fn restore<R: Read>(stream: R, current_nproc: usize) -> Result<Snapshot> {
    let mut r = BinaryReader::new(stream);

    let version = r.get_i32()?;
    if version != DUMP_VERSION {
        return Err(TreeError::SnapshotIncompatible {
            expected: DUMP_VERSION,
            found: version,
        });
    }

    let nproc = r.get_i32()? as usize;
    if nproc != current_nproc {
        return Err(TreeError::SnapshotRankMismatch {
            dumped: nproc,
            current: current_nproc,
        });
    }

    let dim = r.get_u8()?;
    if dim != 2 && dim != 3 {
        return Err(TreeError::SnapshotConfigMismatch(format!(
            "unsupported dimension {}",
            dim
        )));
    }

    let serial = r.get_bool()?;
    let halo_width = r.get_u64()?;
    let max_depth = r.get_i8()?;
    let status = r.get_u64()?;
    let balance_codim = r.get_u8()?;
    let mut periodic = vec![false; 2 * dim as usize];
    for flag in periodic.iter_mut() {
        *flag = r.get_bool()?;
    }

    let n_octants = r.get_u32()? as usize;
    let global_count = r.get_u64()?;
    let mut octants = Vec::with_capacity(n_octants);
    for _ in 0..n_octants {
        let level = r.get_u8()?;
        let x = r.get_u32()?;
        let y = r.get_u32()?;
        let z = r.get_u32()?;
        let mut octant = Octant::new(dim, level, x, y, z);
        octant.set_ghost_layer(r.get_i32()?);
        let mut bits = 0u32;
        for k in 0..N_INFO {
            if r.get_bool()? {
                bits |= 1 << k;
            }
        }
        octant.set_info_bits(bits);
        octant.set_balance(r.get_bool()?);
        octant.set_marker(r.get_i8()?);
        octants.push(octant);
    }

    let mut first_desc = vec![0u64; nproc];
    for desc in first_desc.iter_mut() {
        *desc = r.get_u64()?;
    }
    let mut last_desc = vec![0u64; nproc];
    for desc in last_desc.iter_mut() {
        *desc = r.get_u64()?;
    }
    let mut range_idx = vec![0u64; nproc];
    for range in range_idx.iter_mut() {
        *range = r.get_u64()?;
    }

    let mut full = None;
    if r.get_bool()? {
        let last_op = r.get_i32()?;
        let mut state = FullState {
            last_op,
            map_idx: Vec::new(),
            last_ghost_bros: Vec::new(),
            prev_range_idx: Vec::new(),
        };
        if last_op == OP_ADAPT_MAPPED {
            let map_len = r.get_u32()? as usize;
            state.map_idx.reserve(map_len);
            for _ in 0..map_len {
                state.map_idx.push(r.get_u32()?);
            }
            let n_bros = r.get_u64()? as usize;
            state.last_ghost_bros.reserve(n_bros);
            for _ in 0..n_bros {
                state.last_ghost_bros.push(r.get_u32()?);
            }
        } else if last_op == OP_LOADBALANCE || last_op == OP_LOADBALANCE_FIRST {
            state.prev_range_idx.reserve(nproc);
            for _ in 0..nproc {
                state.prev_range_idx.push(r.get_u64()?);
            }
        }
        full = Some(state);
    }

    Ok(Snapshot {
        dim,
        serial,
        halo_width,
        max_depth,
        status,
        balance_codim,
        periodic,
        octants,
        global_count,
        first_desc,
        last_desc,
        range_idx,
        full,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dump_restore_roundtrip() {
        let root = Octant::root(2);
        let children = root.children();
        let registry = PartitionRegistry::new_serial(
            1,
            root.first_desc_morton(),
            root.last_desc_morton(),
            children.len() as u64,
        );
        let full = FullState {
            last_op: OP_ADAPT_MAPPED,
            map_idx: vec![0, 0, 0, 0],
            last_ghost_bros: vec![],
            prev_range_idx: vec![],
        };
        let view = SnapshotView {
            nproc: 1,
            dim: 2,
            serial: true,
            halo_width: 1,
            max_depth: 1,
            status: 1,
            balance_codim: 1,
            periodic: &[false, true, false, false],
            octants: &children,
            global_count: 4,
            registry: &registry,
            full: Some(&full),
        };
        let mut bytes = Vec::new();
        dump(&mut bytes, &view).unwrap();

        let snapshot = restore(bytes.as_slice(), 1).unwrap();
        assert_eq!(snapshot.dim, 2);
        assert!(snapshot.serial);
        assert_eq!(snapshot.halo_width, 1);
        assert_eq!(snapshot.status, 1);
        assert_eq!(snapshot.periodic, vec![false, true, false, false]);
        assert_eq!(snapshot.octants, children);
        assert_eq!(snapshot.global_count, 4);
        assert_eq!(snapshot.full.unwrap(), full);
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = Vec::new();
        BinaryWriter::new(&mut bytes).put_i32(99).unwrap();
        match restore(bytes.as_slice(), 1) {
            Err(TreeError::SnapshotIncompatible { found: 99, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_rank_mismatch() {
        let mut bytes = Vec::new();
        let mut w = BinaryWriter::new(&mut bytes);
        w.put_i32(DUMP_VERSION).unwrap();
        w.put_i32(4).unwrap();
        match restore(bytes.as_slice(), 2) {
            Err(TreeError::SnapshotRankMismatch {
                dumped: 4,
                current: 2,
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_stream() {
        let root = Octant::root(2);
        let registry = PartitionRegistry::new_serial(1, 0, root.last_desc_morton(), 1);
        let octants = vec![root];
        let view = SnapshotView {
            nproc: 1,
            dim: 2,
            serial: true,
            halo_width: 1,
            max_depth: 0,
            status: 0,
            balance_codim: 1,
            periodic: &[false; 4],
            octants: &octants,
            global_count: 1,
            registry: &registry,
            full: None,
        };
        let mut bytes = Vec::new();
        dump(&mut bytes, &view).unwrap();
        bytes.truncate(bytes.len() / 2);
        match restore(bytes.as_slice(), 1) {
            Err(TreeError::SnapshotCorrupt(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
