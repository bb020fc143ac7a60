//! Ghost-halo accretion data and the wire codecs of the halo exchanges.
//!
//! The halo of width `k` is not built directly. Instead each rank
//! identifies its *sources* — owned cells that are ghosts on a neighbour
//! rank — layer by layer. The transient bookkeeping of that search is an
//! [`Accretion`] per served rank: the population of sources found so far
//! and the seeds whose 1-rings still have to be explored. Seeds that are
//! ghosts locally (foreign seeds) are shipped to their owner, which
//! continues the accretion on behalf of the same target rank.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::octant::Octant;
use crate::stream::{BinaryReader, BinaryWriter};

/// Transient search state for the sources serving one neighbour rank.
#[derive(Debug, Default)]
pub struct Accretion {
    /// The rank on which the gathered sources will be ghosts.
    pub target_rank: usize,
    /// Owned global index → halo layer of every source found so far.
    pub population: FxHashMap<u64, i32>,
    /// Owned seeds whose neighbourhood still has to be explored.
    pub internal_seeds: FxHashMap<u64, i32>,
    /// Ghost seeds that must continue on their owning rank.
    pub foreign_seeds: FxHashMap<u64, i32>,
}

impl Accretion {
    pub fn new(target_rank: usize) -> Accretion {
        Accretion {
            target_rank,
            ..Default::default()
        }
    }
}

/// Byte size of one ghost record on the wire: global index, octant blob
/// and layer.
pub const GHOST_ENTRY_SIZE: usize = 8 + OCTANT_BLOB_SIZE + 4;

/// Byte size of the packed octant: level, anchor, info bits and marker.
pub const OCTANT_BLOB_SIZE: usize = 1 + 4 + 4 + 4 + 4 + 1;

/// Pack an octant for transmission.
pub fn write_octant_blob<W: std::io::Write>(writer: &mut BinaryWriter<W>, octant: &Octant) {
    let coords = octant.coordinates();
    writer.put_u8(octant.level()).unwrap();
    writer.put_u32(coords[0]).unwrap();
    writer.put_u32(coords[1]).unwrap();
    writer.put_u32(coords[2]).unwrap();
    writer.put_u32(octant.info_bits()).unwrap();
    writer.put_i8(octant.marker()).unwrap();
}

/// Unpack an octant transmitted by a peer rank.
pub fn read_octant_blob<R: std::io::Read>(reader: &mut BinaryReader<R>, dim: u8) -> Octant {
    let level = reader.get_u8().unwrap();
    let x = reader.get_u32().unwrap();
    let y = reader.get_u32().unwrap();
    let z = reader.get_u32().unwrap();
    let info = reader.get_u32().unwrap();
    let marker = reader.get_i8().unwrap();
    let mut octant = Octant::new(dim, level, x, y, z);
    octant.set_info_bits(info);
    octant.set_marker(marker);
    octant
}

/// Encode the accretions to be continued by one receiver rank.
///
/// Message layout: `u64 nAccretions`, then for each accretion `i32
/// target_rank`, `u64 nSeeds` and the `(u64 global_idx, i32 layer)`
/// pairs. Seeds are emitted sorted by global index so the stream is
/// deterministic.
pub fn encode_accretion_message(accretions: &[(usize, Vec<(u64, i32)>)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut writer = BinaryWriter::new(&mut bytes);
    writer.put_u64(accretions.len() as u64).unwrap();
    for (target_rank, seeds) in accretions {
        writer.put_i32(*target_rank as i32).unwrap();
        writer.put_u64(seeds.len() as u64).unwrap();
        for &(global_idx, layer) in seeds {
            writer.put_u64(global_idx).unwrap();
            writer.put_i32(layer).unwrap();
        }
    }
    bytes
}

/// Decode an accretion-extension message.
pub fn decode_accretion_message(bytes: &[u8]) -> Vec<(usize, Vec<(u64, i32)>)> {
    let mut reader = BinaryReader::new(bytes);
    let n_accretions = reader.get_u64().unwrap();
    let mut accretions = Vec::with_capacity(n_accretions as usize);
    for _ in 0..n_accretions {
        let target_rank = reader.get_i32().unwrap() as usize;
        let n_seeds = reader.get_u64().unwrap();
        let mut seeds = Vec::with_capacity(n_seeds as usize);
        for _ in 0..n_seeds {
            let global_idx = reader.get_u64().unwrap();
            let layer = reader.get_i32().unwrap();
            seeds.push((global_idx, layer));
        }
        accretions.push((target_rank, seeds));
    }
    accretions
}

/// Group the foreign seeds of all accretions by their owning rank,
/// producing per-receiver message payloads.
pub fn group_foreign_seeds(
    accretions: &[Accretion],
    owner_of: impl Fn(u64) -> usize,
) -> BTreeMap<usize, Vec<(usize, Vec<(u64, i32)>)>> {
    let mut grouped: BTreeMap<usize, BTreeMap<usize, Vec<(u64, i32)>>> = BTreeMap::new();
    for accretion in accretions {
        for (&global_idx, &layer) in &accretion.foreign_seeds {
            let owner = owner_of(global_idx);
            grouped
                .entry(owner)
                .or_default()
                .entry(accretion.target_rank)
                .or_default()
                .push((global_idx, layer));
        }
    }
    grouped
        .into_iter()
        .map(|(owner, per_target)| {
            let payload = per_target
                .into_iter()
                .map(|(target, mut seeds)| {
                    seeds.sort_unstable();
                    (target, seeds)
                })
                .collect();
            (owner, payload)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accretion_message_roundtrip() {
        let message = vec![
            (2usize, vec![(10u64, 0), (42u64, 1)]),
            (5usize, vec![(7u64, 2)]),
        ];
        let bytes = encode_accretion_message(&message);
        assert_eq!(decode_accretion_message(&bytes), message);
    }

    #[test]
    fn test_octant_blob_roundtrip() {
        let mut octant = Octant::new(3, 4, 64, 128, 256);
        octant.set_marker(-2);
        octant.set_pbound(1, true);
        let mut bytes = Vec::new();
        write_octant_blob(&mut BinaryWriter::new(&mut bytes), &octant);
        assert_eq!(bytes.len(), OCTANT_BLOB_SIZE);
        let restored = read_octant_blob(&mut BinaryReader::new(bytes.as_slice()), 3);
        assert_eq!(restored.level(), 4);
        assert_eq!(restored.coordinates(), [64, 128, 256]);
        assert_eq!(restored.marker(), -2);
        assert!(restored.pbound(1));
    }

    #[test]
    fn test_group_foreign_seeds() {
        let mut a = Accretion::new(3);
        a.foreign_seeds.insert(100, 1);
        a.foreign_seeds.insert(200, 1);
        let mut b = Accretion::new(4);
        b.foreign_seeds.insert(100, 2);
        let grouped = group_foreign_seeds(&[a, b], |gidx| if gidx < 150 { 1 } else { 2 });
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&1], vec![(3, vec![(100, 1)]), (4, vec![(100, 2)])]);
        assert_eq!(grouped[&2], vec![(3, vec![(200, 1)])]);
    }
}
