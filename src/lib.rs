//! Distributed merge trees and connected components for scalar fields.
//!
//! This library computes topological descriptors of large scalar fields on
//! structured grids, including AMR hierarchies: merge trees, persistence
//! diagrams and per-component integrals. The field is partitioned into
//! blocks addressed by gid and distributed over MPI ranks; all global
//! state is reconciled through typed all-to-all exchanges.
//!
//! The building blocks:
//!
//! - [`grid`]: boxes, index arithmetic and regular block decompositions.
//! - [`triplet`]: the triplet merge-tree representation, whose merge is
//!   commutative and associative under deterministic tie-breaks.
//! - [`vertex`] and [`masked_box`]: block-qualified vertex ids, AMR links
//!   and per-cell masks.
//! - [`local_tree`]: the value-order sweep producing a block's tree.
//! - [`swap`] and [`reduce`]: k-ary swap schedules and the
//!   distance-doubling fan-in that leaves a local-global tree on every
//!   uniform-grid block.
//! - [`components`]: the AMR connected-components fixed point driven by
//!   symmetrized cross-boundary edges.
//! - [`integral`]: persistent integrals, combined by a distance-halving
//!   reduce and routed to the block owning each component.
//! - [`diagram`]: persistence diagram output.
//!
//! On uniform grids the flow is `readers -> local_tree -> reduce ->
//! integral`. On AMR hierarchies it is `readers -> local_tree (masked) ->
//! components -> diagrams / integrals`. A block's callback never blocks:
//! suspension happens only at the exchanges and all-reduces between the
//! per-block passes.
//!
//! MPI integration drivers live under `demos/` and run with, e.g.,
//! `mpirun -n 4 cargo run --example mpi_amr_cycle`. Everything except the
//! exchanges is also exercised single-process by the unit tests, which
//! route messages between blocks held in one address space.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod components;
pub mod diagram;
pub mod error;
pub mod exchange;
pub mod grid;
pub mod integral;
pub mod local_tree;
pub mod masked_box;
pub mod reduce;
pub mod swap;
pub mod triplet;
pub mod vertex;

pub use crate::components::ComponentBlock;
pub use crate::error::TopologyError;
pub use crate::grid::{Decomposer, FieldSource, Grid, GridBox, Real};
pub use crate::integral::{IntegralParams, MinIntegral};
pub use crate::masked_box::{Mask, MaskedBox};
pub use crate::reduce::MergeTreeBlock;
pub use crate::swap::SwapPartners;
pub use crate::triplet::TripletMergeTree;
pub use crate::vertex::{AmrEdge, AmrLink, AmrNeighbor, AmrVertexId};
