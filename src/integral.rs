//! Persistent integrals over a completed local-global tree.
//!
//! The tracing pass decomposes the sublevel (or superlevel) set at the
//! isofind threshold into components, identified by their deepest vertex,
//! and integrates the field over each block's share of every component.
//! A distance-halving reduce then routes each partial integral to the
//! block whose core contains the component's deepest vertex, combining
//! contributions on the way.

use std::collections::HashMap;

use mpi::traits::{CommunicatorCollectives, Equivalence};

use crate::exchange::{bucket_by_rank, exchange_stream, Assigner};
use crate::grid::{FieldSource, Grid, Real};
use crate::reduce::MergeTreeBlock;
use crate::swap::SwapPartners;

/// Integral of one component, keyed by its deepest vertex.
#[derive(Clone, Debug)]
pub struct MinIntegral {
    /// Deepest vertex of the component.
    pub min_vtx: u64,
    /// Value at the deepest vertex.
    pub min_val: Real,
    /// Sum of value times cell volume over the traced cells.
    pub integral: Real,
    /// Number of traced cells.
    pub n_cells: u64,
    /// Sums of the additional fields over the traced cells.
    pub add_sums: Vec<Real>,
}

impl MinIntegral {
    fn new(min_vtx: u64, min_val: Real, n_add: usize) -> Self {
        Self {
            min_vtx,
            min_val,
            integral: 0.0,
            n_cells: 0,
            add_sums: vec![0.0; n_add],
        }
    }

    /// Merge another partial integral of the same component.
    pub fn combine(&mut self, other: &MinIntegral) {
        debug_assert_eq!(self.min_vtx, other.min_vtx);
        debug_assert_eq!(self.add_sums.len(), other.add_sums.len());
        self.integral += other.integral;
        self.n_cells += other.n_cells;
        for (a, b) in self.add_sums.iter_mut().zip(other.add_sums.iter()) {
            *a += b;
        }
    }
}

/// Thresholds and options of the integral computation.
#[derive(Copy, Clone, Debug)]
pub struct IntegralParams {
    /// Isofind threshold: the level at which components are cut.
    pub iso: Real,
    /// Significance threshold on the component extremum.
    pub max: Real,
    /// Divide field averages by the integral instead of the cell count.
    pub density_weighted: bool,
}

/// Trace one block: integrate its core cells component by component.
pub fn trace_block<const D: usize>(
    block: &MergeTreeBlock<D>,
    params: &IntegralParams,
    add_sources: &[&dyn FieldSource<D>],
    density: Option<&dyn FieldSource<D>>,
) -> HashMap<u64, MinIntegral> {
    let tree = &block.tree;
    let mut volume = 1.0;
    for s in block.cell_size.iter() {
        volume *= s;
    }
    // threshold level; the vertex part makes equal-valued saddles merge
    let iso_level = (params.iso, u64::MAX);

    let add_grids: Vec<Grid<D>> = add_sources.iter().map(|s| s.read(&block.core)).collect();
    let density_grid = density.map(|s| s.read(&block.core));

    let mut mi_map: HashMap<u64, MinIntegral> = HashMap::new();
    let mut contribute = |host: u64, value: Real, vertex: u64| {
        if tree.cmp(params.iso, value) {
            return; // not reached by the sweep at the isofind level
        }
        let pos = block.position(vertex);
        if !block.core.contains(pos) {
            return;
        }
        let rep = tree.representative(host, iso_level);
        let mi = mi_map
            .entry(rep)
            .or_insert_with(|| MinIntegral::new(rep, tree.node(rep).value, add_sources.len()));
        mi.integral += value * volume;
        mi.n_cells += 1;
        for (sum, grid) in mi.add_sums.iter_mut().zip(add_grids.iter()) {
            let mut x = grid.value(pos);
            if let Some(d) = density_grid.as_ref() {
                x /= d.value(pos);
            }
            if params.density_weighted {
                x *= value * volume;
            }
            *sum += x;
        }
    };

    for (&v, n) in tree.nodes() {
        contribute(v, n.value, v);
        for &(value, x) in n.vertices.iter() {
            contribute(v, value, x);
        }
    }

    // drop insignificant components and empty contributions
    mi_map.retain(|_, mi| !tree.cmp(params.max, mi.min_val) && mi.integral != 0.0);
    mi_map
}

/// Group member that brings an integral closer to `dest_gid` in `round`.
fn route_target<const D: usize>(
    partners: &SwapPartners<D>,
    gid: i32,
    round: usize,
    dest_gid: i32,
) -> i32 {
    let dim = partners.dim(round);
    let k = partners.k(round);
    let group = partners.group(gid, round);
    let step = {
        // recover the stride from two group members
        if group.len() < 2 {
            return gid;
        }
        let d = partners.decomposer();
        d.gid_to_coords(group[1])[dim] - d.gid_to_coords(group[0])[dim]
    };
    let dest = partners.decomposer().gid_to_coords(dest_gid)[dim];
    let j = ((dest % (step * k)) / step) as usize;
    group[j]
}

/// Trace all blocks and run the distance-halving combine; blocks held in
/// this process. Returns, per block, the integrals it ends up owning.
pub fn persistent_integrals<const D: usize>(
    blocks: &[MergeTreeBlock<D>],
    partners: &SwapPartners<D>,
    params: &IntegralParams,
    add_sources: &[&dyn FieldSource<D>],
    density: Option<&dyn FieldSource<D>>,
) -> Vec<(i32, Vec<MinIntegral>)> {
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();

    let mut maps: Vec<HashMap<u64, MinIntegral>> = blocks
        .iter()
        .map(|b| trace_block(b, params, add_sources, density))
        .collect();

    for round in 0..partners.nrounds() {
        let mut moved: Vec<(usize, MinIntegral)> = Vec::new();
        for (i, b) in blocks.iter().enumerate() {
            for (_, mi) in maps[i].drain() {
                let dest = partners
                    .decomposer()
                    .point_to_gid(blocks[i].position(mi.min_vtx));
                let target = route_target(partners, b.gid, round, dest);
                moved.push((index[&target], mi));
            }
        }
        for (i, mi) in moved {
            match maps[i].get_mut(&mi.min_vtx) {
                Some(existing) => existing.combine(&mi),
                None => {
                    maps[i].insert(mi.min_vtx, mi);
                }
            }
        }
    }

    blocks
        .iter()
        .zip(maps)
        .map(|(b, map)| {
            let mut mis: Vec<MinIntegral> = map.into_values().collect();
            for mi in mis.iter() {
                debug_assert_eq!(
                    partners.decomposer().point_to_gid(b.position(mi.min_vtx)),
                    b.gid,
                    "integral routed to the wrong block"
                );
            }
            mis.sort_by_key(|mi| mi.min_vtx);
            (b.gid, mis)
        })
        .collect()
}

/// Wire form of one partial integral.
#[derive(Copy, Clone, Default, Equivalence)]
pub struct MinIntegralMsg {
    to_gid: i32,
    min_vtx: u64,
    min_val: f64,
    integral: f64,
    n_cells: u64,
    n_add: u64,
}

/// Distributed distance-halving combine over MPI.
pub fn persistent_integrals_mpi<const D: usize, C: CommunicatorCollectives>(
    blocks: &[MergeTreeBlock<D>],
    partners: &SwapPartners<D>,
    params: &IntegralParams,
    add_sources: &[&dyn FieldSource<D>],
    density: Option<&dyn FieldSource<D>>,
    assigner: &Assigner,
    comm: &C,
) -> Vec<(i32, Vec<MinIntegral>)> {
    let nranks = comm.size();
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();

    let mut maps: Vec<HashMap<u64, MinIntegral>> = blocks
        .iter()
        .map(|b| trace_block(b, params, add_sources, density))
        .collect();

    for round in 0..partners.nrounds() {
        let mut headers: Vec<(i32, MinIntegralMsg)> = Vec::new();
        let mut sums: Vec<(i32, f64)> = Vec::new();
        for (i, b) in blocks.iter().enumerate() {
            for (_, mi) in maps[i].drain() {
                let dest = partners.decomposer().point_to_gid(b.position(mi.min_vtx));
                let target = route_target(partners, b.gid, round, dest);
                headers.push((
                    target,
                    MinIntegralMsg {
                        to_gid: target,
                        min_vtx: mi.min_vtx,
                        min_val: mi.min_val,
                        integral: mi.integral,
                        n_cells: mi.n_cells,
                        n_add: mi.add_sums.len() as u64,
                    },
                ));
                sums.extend(mi.add_sums.iter().map(|&s| (target, s)));
            }
        }

        let headers = exchange_stream(bucket_by_rank(headers, assigner, nranks), comm);
        let add_stream = exchange_stream(bucket_by_rank(sums, assigner, nranks), comm);

        let mut pos = 0;
        for h in headers {
            let mi = MinIntegral {
                min_vtx: h.min_vtx,
                min_val: h.min_val,
                integral: h.integral,
                n_cells: h.n_cells,
                add_sums: add_stream[pos..pos + h.n_add as usize].to_vec(),
            };
            pos += h.n_add as usize;
            let map = &mut maps[index[&h.to_gid]];
            match map.get_mut(&mi.min_vtx) {
                Some(existing) => existing.combine(&mi),
                None => {
                    map.insert(mi.min_vtx, mi);
                }
            }
        }
    }

    blocks
        .iter()
        .zip(maps)
        .map(|(b, map)| {
            let mut mis: Vec<MinIntegral> = map.into_values().collect();
            mis.sort_by_key(|mi| mi.min_vtx);
            (b.gid, mis)
        })
        .collect()
}

/// Format the integrals a block owns, one component per line: physical
/// coordinates of the deepest vertex, the integral, and the per-field
/// averages.
pub fn integral_lines<const D: usize>(
    block: &MergeTreeBlock<D>,
    mis: &[MinIntegral],
    density_weighted: bool,
) -> Vec<String> {
    mis.iter()
        .map(|mi| {
            let pos = block.position(mi.min_vtx);
            let mut line = String::new();
            for i in 0..D {
                line.push_str(&format!("{} ", pos[i] as Real * block.cell_size[i]));
            }
            line.push_str(&format!("{}", mi.integral));
            for sum in mi.add_sums.iter() {
                let denom = if density_weighted {
                    mi.integral
                } else {
                    mi.n_cells as Real
                };
                line.push_str(&format!(" {}", sum / denom));
            }
            line
        })
        .collect()
}
