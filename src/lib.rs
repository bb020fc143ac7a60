//! A distributed, adaptive linear quad/octree.
//!
//! This library provides a parallel octree engine for adaptive mesh
//! refinement over the unit square (2D) or unit cube (3D). Each process
//! owns a contiguous slice of a globally Morton-ordered sequence of leaf
//! cells, called *octants* in both dimensions. The engine maintains,
//! under refinement, coarsening and dynamic repartitioning:
//!
//! * the global Morton ordering of the leaves,
//! * a ghost halo of configurable width around every local slice,
//! * the 2:1 balance invariant (no two adjacent leaves differ by more
//!   than one level, across faces, or faces and edges and nodes,
//!   depending on the configured codimension),
//! * mapping data relating the octants before and after each adapt or
//!   load-balance step.
//!
//! Cells are addressed by dense local indices; the pair `(morton, level)`
//! is the persistent identifier of a cell across operations. Borrowed
//! [`Octant`](crate::octant::Octant) references must not be held across
//! operations that resize the sequence (adapt, load balance).
//!
//! ## Using the library
//!
//! The entry point is [`AmrTree`](crate::tree::AmrTree), generic over a
//! [`Communicator`](crate::comm::Communicator). The single-rank backend
//! is [`SerialComm`](crate::comm::SerialComm); multi-rank runs inside one
//! process use [`ThreadComm`](crate::comm::ThreadComm), and an MPI-backed
//! communicator is a drop-in replacement of the same three primitives.
//!
//! ```
//! use amrtree::{AmrTree, SerialComm};
//!
//! let log = std::env::temp_dir().join("amrtree-doc.log");
//! let mut tree = AmrTree::new(2, log.to_str().unwrap(), SerialComm).unwrap();
//! tree.adapt_global_refine(false);
//! assert_eq!(tree.octant_count(), 4);
//!
//! // Refine the lower-left quadrant once more.
//! tree.set_marker(0, 1).unwrap();
//! tree.adapt(false);
//! assert_eq!(tree.octant_count(), 7);
//! ```
//!
//! The facade drives the whole cycle: markers are set on local octants,
//! `preadapt`/`adapt` apply them under the 2:1 constraint, `load_balance`
//! repartitions the sequence, and the ghost halo is regenerated by
//! accretion after every topology change. `dump`/`from_snapshot` persist
//! and restore the complete engine state in a versioned binary format.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod balance;
pub mod comm;
pub mod constants;
pub mod error;
pub mod halo;
pub mod local_tree;
pub mod morton;
pub mod octant;
pub mod partition;
pub mod snapshot;
pub mod stream;
pub mod tools;
pub mod tree;

pub use crate::balance::{ExchangeAction, LoadBalanceRanges};
pub use crate::comm::{Communicator, SerialComm, ThreadComm};
pub use crate::error::{Result, TreeError};
pub use crate::local_tree::{Intersection, LocalTree};
pub use crate::octant::Octant;
pub use crate::tree::{AmrTree, Mapping, Operation};
