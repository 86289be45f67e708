//! Swap-reduce construction of local-global trees on uniform grids.
//!
//! Every block starts with the merge tree of its own box. In each round
//! of a distance-doubling schedule the members of a group exchange their
//! trees sparsified to their global boundaries, merge what they receive,
//! grow their global bounding boxes to the group hull and sparsify again.
//! After the last round every block holds its exact local detail plus a
//! skeleton of the rest of the domain.

use std::collections::HashMap;

use mpi::traits::{CommunicatorCollectives, Equivalence};

use crate::exchange::{bucket_by_rank, exchange_stream, Assigner};
use crate::grid::{Decomposer, FieldSource, GridBox, Real, Vertex};
use crate::local_tree::compute_grid_tree;
use crate::swap::SwapPartners;
use crate::triplet::TripletMergeTree;

/// A uniform-grid block carrying its merge tree through the reduction.
pub struct MergeTreeBlock<const D: usize> {
    /// Block id.
    pub gid: i32,
    /// Cells this block owns; cores of distinct blocks are disjoint.
    pub core: GridBox<D>,
    /// Core plus the shared boundary layer; the cells swept locally.
    pub local: GridBox<D>,
    /// Bounding box of everything merged into the tree so far.
    pub global: GridBox<D>,
    /// The full domain; vertex ids are linear indices into this box.
    pub domain: GridBox<D>,
    /// Physical size of a cell.
    pub cell_size: [Real; D],
    /// The block's current tree.
    pub tree: TripletMergeTree<u64>,
}

impl<const D: usize> MergeTreeBlock<D> {
    /// Read the block's box from the source and compute its local tree.
    pub fn build(
        gid: i32,
        decomposer: &Decomposer<D>,
        source: &impl FieldSource<D>,
        negate: bool,
    ) -> Self {
        let core = decomposer.core(gid);
        let local = decomposer.bounds(gid);
        let grid = source.read(&local);
        let tree = compute_grid_tree(&local, decomposer.domain(), &grid, negate);
        log::debug!("initial tree size ({gid}): {}", tree.size());
        Self {
            gid,
            core,
            local,
            global: local,
            domain: *decomposer.domain(),
            cell_size: source.cell_size(),
            tree,
        }
    }

    /// Position of a tree vertex in the domain grid.
    pub fn position(&self, v: u64) -> Vertex<D> {
        self.domain.position(v)
    }

    /// The tree sparsified to the current global boundary, the form in
    /// which it travels to the round's partners.
    fn outbound_tree(&self) -> TripletMergeTree<u64> {
        let global = self.global;
        let domain = self.domain;
        self.tree
            .sparsify_copy(move |v| global.on_boundary(domain.position(v)))
    }

    /// Merge a received tree and grow the global box.
    fn absorb(&mut self, bounds: &GridBox<D>, tree: &TripletMergeTree<u64>) {
        self.global = self.global.hull(bounds);
        self.tree.merge(tree);
    }

    /// Post-merge sparsification of one round.
    fn sparsify_round(&mut self) {
        self.tree.repair();
        let (local, global, core, domain) = (self.local, self.global, self.core, self.domain);
        self.tree
            .sparsify(move |v| local.contains(domain.position(v)) || global.on_boundary(domain.position(v)));
        self.tree.remove_degree2(
            move |v| core.contains(domain.position(v)),
            move |v| global.on_boundary(domain.position(v)),
        );
        debug_assert!(self.tree.validate());
    }

    /// Terminal sparsification: keep local detail only, splice regular
    /// core vertices, and push absorbed vertices to their branches.
    fn finalize(&mut self) {
        self.tree.repair();
        let (local, core, domain) = (self.local, self.core, self.domain);
        self.tree.sparsify(move |v| local.contains(domain.position(v)));
        self.tree
            .remove_degree2(move |v| core.contains(domain.position(v)), |_| false);
        self.tree.redistribute_vertices();
        log::debug!("final tree size ({}): {}", self.gid, self.tree.size());
    }
}

/// Run the whole swap-reduce over blocks held in this process.
pub fn merge_sparsify<const D: usize>(
    blocks: &mut [MergeTreeBlock<D>],
    partners: &SwapPartners<D>,
) {
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();

    for round in 0..partners.nrounds() {
        let mut msgs: Vec<(usize, GridBox<D>, TripletMergeTree<u64>)> = Vec::new();
        for b in blocks.iter() {
            let outbound = b.outbound_tree();
            for to in partners.group(b.gid, round) {
                if to != b.gid {
                    msgs.push((index[&to], b.global, outbound.clone()));
                }
            }
        }
        let mut touched = vec![false; blocks.len()];
        for (i, bounds, tree) in msgs {
            blocks[i].absorb(&bounds, &tree);
            touched[i] = true;
        }
        for (b, t) in blocks.iter_mut().zip(touched) {
            if t {
                b.sparsify_round();
            }
        }
    }

    for b in blocks.iter_mut() {
        b.finalize();
    }
}

/// Wire header of one tree transfer.
#[derive(Copy, Clone, Default, Equivalence)]
pub struct TreeHeaderMsg {
    from_gid: i32,
    to_gid: i32,
    n_nodes: u64,
}

/// Wire form of one uniform-grid tree node.
#[derive(Copy, Clone, Default, Equivalence)]
pub struct GridTreeNodeMsg {
    vertex: u64,
    value: f64,
    through: u64,
    parent: u64,
}

/// Distributed swap-reduce: same rounds as [`merge_sparsify`], with the
/// group exchanges carried by all-to-all streams.
pub fn merge_sparsify_mpi<const D: usize, C: CommunicatorCollectives>(
    blocks: &mut [MergeTreeBlock<D>],
    partners: &SwapPartners<D>,
    assigner: &Assigner,
    comm: &C,
) {
    let nranks = comm.size();
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();

    for round in 0..partners.nrounds() {
        let mut headers: Vec<(i32, TreeHeaderMsg)> = Vec::new();
        let mut boxes: Vec<(i32, i64)> = Vec::new();
        let mut nodes: Vec<(i32, GridTreeNodeMsg)> = Vec::new();

        for b in blocks.iter() {
            let outbound = b.outbound_tree();
            let records: Vec<GridTreeNodeMsg> = outbound
                .nodes()
                .map(|(&v, n)| GridTreeNodeMsg {
                    vertex: v,
                    value: n.value,
                    through: n.through,
                    parent: n.parent,
                })
                .collect();
            for to in partners.group(b.gid, round) {
                if to == b.gid {
                    continue;
                }
                headers.push((
                    to,
                    TreeHeaderMsg {
                        from_gid: b.gid,
                        to_gid: to,
                        n_nodes: records.len() as u64,
                    },
                ));
                for i in 0..D {
                    boxes.push((to, b.global.from()[i]));
                }
                for i in 0..D {
                    boxes.push((to, b.global.to()[i]));
                }
                nodes.extend(records.iter().map(|&r| (to, r)));
            }
        }

        let headers = exchange_stream(bucket_by_rank(headers, assigner, nranks), comm);
        let boxes = exchange_stream(bucket_by_rank(boxes, assigner, nranks), comm);
        let nodes = exchange_stream(bucket_by_rank(nodes, assigner, nranks), comm);

        let mut box_pos = 0;
        let mut node_pos = 0;
        let mut touched = vec![false; blocks.len()];
        for h in headers {
            let mut from = [0i64; D];
            let mut to = [0i64; D];
            for x in from.iter_mut() {
                *x = boxes[box_pos];
                box_pos += 1;
            }
            for x in to.iter_mut() {
                *x = boxes[box_pos];
                box_pos += 1;
            }
            let records: Vec<(u64, Real, u64, u64)> = nodes
                [node_pos..node_pos + h.n_nodes as usize]
                .iter()
                .map(|r| (r.vertex, r.value, r.through, r.parent))
                .collect();
            node_pos += h.n_nodes as usize;

            let b = &mut blocks[index[&h.to_gid]];
            b.global = b.global.hull(&GridBox::new(from, to));
            b.tree.merge_records(&records);
            touched[index[&h.to_gid]] = true;
        }
        for (b, t) in blocks.iter_mut().zip(touched) {
            if t {
                b.sparsify_round();
            }
        }
    }

    for b in blocks.iter_mut() {
        b.finalize();
    }
}
