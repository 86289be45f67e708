//! Connected components across AMR blocks via an edge-exchange fixed point.
//!
//! Every block builds a merge tree of its active cells, discovers its
//! cross-boundary edges, and symmetrizes them with its neighbours. The
//! blocks then iterate: each undone component ships its root, its edges
//! and a fragment of the local tree to the neighbours it has not reached
//! yet; received fragments are folded into the local tree, components
//! whose roots fall together merge, and newly learned edges enlarge the
//! neighbour sets. A global all-reduce of the undone-component count
//! drives the loop to its fixed point.

use std::collections::{BTreeSet, HashMap};

use mpi::traits::{CommunicatorCollectives, Equivalence};

use crate::exchange::{all_reduce_sum, bucket_by_rank, exchange_stream, Assigner};
use crate::grid::{wrap_vertex, Grid, GridBox, Real, Vertex};
use crate::local_tree::{compute_masked_tree, neighbor_offsets};
use crate::masked_box::{Mask, MaskedBox};
use crate::triplet::TripletMergeTree;
use crate::vertex::{AmrEdge, AmrLink, AmrNeighbor, AmrVertexId};

/// How many rounds the watchdog tolerates before it starts complaining.
/// It only ever logs; the fixed point is guaranteed to converge.
const WATCHDOG_ROUNDS: usize = 1000;

/// One connected component tracked by a block.
#[derive(Clone, Debug)]
pub struct Component {
    /// The deepest vertex of the component when it was created; stable
    /// for the component's lifetime.
    pub root: AmrVertexId,
    /// Gids reachable through the edges known so far. Grows monotonically.
    pub current_neighbors: BTreeSet<i32>,
    /// Gids this component has already been sent to.
    pub processed_neighbors: BTreeSet<i32>,
    /// Cross-block edges of the component, own and inherited.
    pub outgoing_edges: Vec<AmrEdge>,
}

impl Component {
    fn new(root: AmrVertexId) -> Self {
        Self {
            root,
            current_neighbors: BTreeSet::new(),
            processed_neighbors: BTreeSet::new(),
            outgoing_edges: Vec::new(),
        }
    }

    /// Done once every reachable gid has been sent to.
    pub fn is_done(&self) -> bool {
        debug_assert!(self.processed_neighbors.is_subset(&self.current_neighbors));
        self.processed_neighbors.len() >= self.current_neighbors.len()
    }
}

/// One component descriptor in flight between two blocks.
#[derive(Clone, Debug)]
pub struct ComponentMessage {
    /// Sending block.
    pub from_gid: i32,
    /// Receiving block.
    pub to_gid: i32,
    /// Root of the sending component.
    pub root: AmrVertexId,
    /// The component's cross-block edges.
    pub edges: Vec<AmrEdge>,
    /// Tree fragment: the parent/saddle closure of the edge endpoints.
    pub nodes: Vec<(AmrVertexId, Real, AmrVertexId, AmrVertexId)>,
}

/// Block state of the AMR connected-components computation.
pub struct ComponentBlock<const D: usize> {
    /// Block id.
    pub gid: i32,
    /// The block's masked region.
    pub local: MaskedBox<D>,
    /// Adjacent AMR boxes.
    pub link: AmrLink<D>,
    /// Scalar values over the block's bounds.
    pub grid: Grid<D>,
    /// Sweep orientation.
    pub negate: bool,
    /// The block's merge tree; grows as fragments arrive.
    pub tree: TripletMergeTree<AmrVertexId>,
    /// Live components, merged in place as their roots fall together.
    pub components: Vec<Component>,
    /// Vertex to deepest after the local sweep.
    pub original_vertex_to_deepest: HashMap<AmrVertexId, AmrVertexId>,
    /// Vertex to deepest as of the latest round.
    pub current_vertex_to_deepest: HashMap<AmrVertexId, AmrVertexId>,
    /// Vertex to deepest after convergence.
    pub final_vertex_to_deepest: HashMap<AmrVertexId, AmrVertexId>,
    /// Own cross-block edges as enumerated locally, before symmetrization.
    pub initial_edges: Vec<AmrEdge>,
    /// Symmetrized edges per neighbour gid.
    pub edges_by_gid: HashMap<i32, Vec<AmrEdge>>,
    /// Gids first written to in the current round.
    pub new_receivers: BTreeSet<i32>,
    /// Gids written to in any round.
    pub processed_receivers: BTreeSet<i32>,
    /// Per-root persistence diagrams, filled by the final pass.
    pub local_diagrams: HashMap<AmrVertexId, Vec<(Real, Real)>>,
    /// Per-root integral contributions of this block.
    pub local_integral: HashMap<AmrVertexId, Real>,
    /// Per-root totals, present on the block owning the root.
    pub global_integral: HashMap<AmrVertexId, Real>,
    round: usize,
}

impl<const D: usize> ComponentBlock<D> {
    /// Create a block: set up the mask from the link and keep the values.
    /// Thresholding and the local tree wait until [`ComponentBlock::init`],
    /// which for relative thresholds runs after the global mean is known.
    pub fn new(
        gid: i32,
        refinement: i64,
        level: i32,
        core: GridBox<D>,
        domain_shape: Vertex<D>,
        link: AmrLink<D>,
        grid: Grid<D>,
        negate: bool,
    ) -> Self {
        let mut local = MaskedBox::new(gid, refinement, level, core, domain_shape);
        local.init_mask(&link);
        local.check_mask_validity(&link);
        Self {
            gid,
            local,
            link,
            grid,
            negate,
            tree: TripletMergeTree::new(negate),
            components: Vec::new(),
            original_vertex_to_deepest: HashMap::new(),
            current_vertex_to_deepest: HashMap::new(),
            final_vertex_to_deepest: HashMap::new(),
            initial_edges: Vec::new(),
            edges_by_gid: HashMap::new(),
            new_receivers: BTreeSet::new(),
            processed_receivers: BTreeSet::from([gid]),
            local_diagrams: HashMap::new(),
            local_integral: HashMap::new(),
            global_integral: HashMap::new(),
            round: 0,
        }
    }

    /// Local contribution to the global mean: volume-weighted sum and
    /// count of the unmasked core cells.
    pub fn unmasked_stats(&self) -> (Real, Real) {
        self.local.unmasked_stats(&self.grid)
    }

    /// Apply the absolute threshold, sweep the local tree, and enumerate
    /// the block's cross-boundary edges.
    pub fn init(&mut self, rho: Real) {
        self.local.apply_threshold(&self.grid, rho, self.negate);
        self.tree = compute_masked_tree(&self.local, &self.grid, self.negate);

        let mut cross = Vec::new();
        for e in self.compute_outgoing_edges() {
            if e.a.gid == self.gid && e.b.gid == self.gid {
                // periodic wrap onto the block itself; applied directly
                if self.local.is_active(e.a.index) && self.local.is_active(e.b.index) {
                    self.tree.link_edge(e.a, e.b);
                }
            } else {
                cross.push(e);
            }
        }
        self.tree.repair();
        self.initial_edges = cross;
        self.original_vertex_to_deepest = self.tree.vertex_to_root();
        log::debug!(
            "gid {}: local tree size {}, {} outgoing edges",
            self.gid,
            self.tree.size(),
            self.initial_edges.len()
        );
    }

    /// Enumerate the geometric adjacencies between this block's active
    /// cells and cells owned by other blocks (or by this block through the
    /// periodic boundary). Both sides of a refinement boundary enumerate
    /// on the finer of the two lattices, so they produce the same pairs.
    fn compute_outgoing_edges(&self) -> Vec<AmrEdge> {
        let offsets = neighbor_offsets::<D>();
        let me = AmrNeighbor {
            gid: self.gid,
            refinement: self.local.refinement(),
            level: self.local.level(),
            core: *self.local.core(),
            bounds: *self.local.bounds(),
        };
        let mut candidates = vec![me];
        candidates.extend(self.link.neighbors().iter().copied());

        let mut edges = Vec::new();
        for idx in self.local.active_indices() {
            let p = self.local.position(idx);
            for off in offsets.iter() {
                let mut np = p;
                for i in 0..D {
                    np[i] += off[i];
                }
                let nidx = self.local.index(np);
                match self.local.mask_at(nidx) {
                    Mask::Masked(_) | Mask::Ghost(_) => {}
                    _ => continue,
                }
                for o in candidates.iter() {
                    self.edges_into(idx, p, np, o, &mut edges);
                }
            }
        }
        edges.sort_unstable();
        edges.dedup();
        edges
    }

    /// Edges from active cell `p` into the part of cell `np` owned by `o`.
    fn edges_into(
        &self,
        idx: u64,
        p: Vertex<D>,
        np: Vertex<D>,
        o: &AmrNeighbor<D>,
        edges: &mut Vec<AmrEdge>,
    ) {
        let my_ref = self.local.refinement();
        let lattice = my_ref.max(o.refinement);
        let target = MaskedBox::<D>::cell_footprint(np, my_ref, lattice);
        let own = MaskedBox::<D>::cell_footprint(p, my_ref, lattice);
        let adjacent = own.expanded(1);

        let mut fine_extent = self.local.domain_shape();
        for x in fine_extent.iter_mut() {
            *x *= lattice;
        }
        let mut o_extent = self.local.domain_shape();
        for x in o_extent.iter_mut() {
            *x *= o.refinement;
        }

        for q in target.vertices() {
            if !adjacent.contains(q) || own.contains(q) {
                continue;
            }
            let wq = wrap_vertex(q, fine_extent);
            let qo = crate::grid::to_refinement(wq, lattice, o.refinement);
            if !o.core.contains_wrapped(qo, o_extent) {
                continue;
            }
            let Some(uo) = MaskedBox::<D>::unwrap_into(&o.core, wrap_vertex(qo, o_extent), o_extent)
            else {
                continue;
            };
            let far = AmrVertexId::new(o.gid, o.bounds.index(uo));
            let near = self.local.vertex(idx);
            if near != far {
                edges.push(AmrEdge::new(near, far));
            }
        }
    }

    /// Outgoing edges whose far endpoint lies in `gid`.
    fn initial_edges_to(&self, gid: i32) -> Vec<AmrEdge> {
        self.initial_edges
            .iter()
            .filter(|e| e.endpoint_outside(self.gid).gid == gid)
            .copied()
            .collect()
    }

    /// Receive a neighbour's edges: keep those whose own endpoint is
    /// active. Both sides enumerate the same geometric pairs and each
    /// filters by its own mask, so the symmetrized sets are identical.
    fn delete_low_edges(&mut self, sender: i32, received: Vec<AmrEdge>) {
        let kept: Vec<AmrEdge> = received
            .into_iter()
            .filter(|e| {
                let own = e
                    .endpoint_in(self.gid)
                    .unwrap_or_else(|| panic!("gid {}: edge {e} without local endpoint", self.gid));
                self.local.is_active(own.index)
            })
            .collect();
        self.edges_by_gid.insert(sender, kept);
    }

    /// Create the components from the local tree roots and distribute the
    /// symmetrized edges among them.
    pub fn build_components(&mut self) {
        self.components = self.tree.roots().map(Component::new).collect();
        let by_root: HashMap<AmrVertexId, usize> = self
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.root, i))
            .collect();

        for edges in self.edges_by_gid.values() {
            for e in edges.iter() {
                let own = e.endpoint_in(self.gid).expect("foreign edge in edge set");
                let deepest = self.original_vertex_to_deepest[&own];
                let c = &mut self.components[by_root[&deepest]];
                c.outgoing_edges.push(*e);
                c.current_neighbors.insert(e.endpoint_outside(self.gid).gid);
            }
        }
        for c in self.components.iter_mut() {
            c.outgoing_edges.sort_unstable();
            c.outgoing_edges.dedup();
        }
        self.current_vertex_to_deepest = self.original_vertex_to_deepest.clone();
    }

    /// Number of components that still have unreached neighbours.
    pub fn undone_components(&self) -> usize {
        self.components.iter().filter(|c| !c.is_done()).count()
    }

    /// Round step 1: emit one message per undone component and
    /// not-yet-processed neighbour gid; mark those gids processed.
    pub fn cc_send(&mut self) -> Vec<ComponentMessage> {
        self.round += 1;
        log::debug!("gid {}: send round {}", self.gid, self.round);
        let mut out = Vec::new();
        self.new_receivers.clear();
        let gid = self.gid;
        for c in self.components.iter_mut() {
            if c.is_done() {
                continue;
            }
            let dests: Vec<i32> = c
                .current_neighbors
                .difference(&c.processed_neighbors)
                .copied()
                .collect();
            let fragment = tree_fragment(&self.tree, &c.outgoing_edges);
            for g in dests {
                out.push(ComponentMessage {
                    from_gid: gid,
                    to_gid: g,
                    root: c.root,
                    edges: c.outgoing_edges.clone(),
                    nodes: fragment.clone(),
                });
                c.processed_neighbors.insert(g);
                if !self.processed_receivers.contains(&g) {
                    self.new_receivers.insert(g);
                }
            }
        }
        self.processed_receivers
            .extend(self.new_receivers.iter().copied());
        out
    }

    /// Round step 3: fold the received fragments and edges into the tree,
    /// merge components whose roots fell together, and grow the neighbour
    /// sets from the received edges.
    pub fn cc_receive(&mut self, msgs: &[ComponentMessage]) {
        // (i) fragments first, then the cross edges they support
        for m in msgs {
            self.tree.merge_records(&m.nodes);
        }
        for m in msgs {
            for e in m.edges.iter() {
                if self.tree.contains(e.a) && self.tree.contains(e.b) {
                    self.tree.link_edge(e.a, e.b);
                }
            }
        }

        // (ii) canonicalize
        self.tree.repair();
        debug_assert!(self.tree.validate());

        // (iii) refresh the vertex-to-deepest view
        self.current_vertex_to_deepest = self.tree.vertex_to_root();

        // (iv) components whose roots merged into the same deepest vertex
        // collapse onto the one with the most extreme root
        let mut grouped: HashMap<AmrVertexId, Vec<usize>> = HashMap::new();
        for (i, c) in self.components.iter().enumerate() {
            grouped
                .entry(self.current_vertex_to_deepest[&c.root])
                .or_default()
                .push(i);
        }
        let mut absorbed: Vec<usize> = Vec::new();
        for (_, mut members) in grouped {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|&a, &b| {
                let la = self.tree.level_of(self.components[a].root);
                let lb = self.tree.level_of(self.components[b].root);
                if self.tree.cmp_level(la, lb) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            });
            let (winner, losers) = members.split_first().unwrap();
            for &l in losers {
                let (current, processed, edges) = {
                    let c = &mut self.components[l];
                    (
                        std::mem::take(&mut c.current_neighbors),
                        std::mem::take(&mut c.processed_neighbors),
                        std::mem::take(&mut c.outgoing_edges),
                    )
                };
                let w = &mut self.components[*winner];
                w.current_neighbors.extend(current);
                w.processed_neighbors.extend(processed);
                w.outgoing_edges.extend(edges);
                absorbed.push(l);
            }
        }
        absorbed.sort_unstable();
        for l in absorbed.into_iter().rev() {
            self.components.remove(l);
        }

        // (v) extend neighbour knowledge from the received descriptors
        let by_deepest: HashMap<AmrVertexId, usize> = self
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (self.current_vertex_to_deepest[&c.root], i))
            .collect();
        for m in msgs {
            let own = m
                .edges
                .iter()
                .find_map(|e| e.endpoint_in(self.gid).filter(|v| self.tree.contains(*v)));
            let Some(own) = own else { continue };
            let deepest = self.tree.find_root_of(own);
            let c = &mut self.components[by_deepest[&deepest]];
            for e in m.edges.iter() {
                for v in [e.a, e.b] {
                    if v.gid != self.gid {
                        c.current_neighbors.insert(v.gid);
                    }
                }
            }
            c.outgoing_edges.extend(m.edges.iter().copied());
            c.outgoing_edges.sort_unstable();
            c.outgoing_edges.dedup();
        }

        // components must never regress
        for c in self.components.iter() {
            debug_assert!(c.processed_neighbors.is_subset(&c.current_neighbors));
        }
    }

    /// Final pass: fix the vertex-to-deepest map and collect the per-root
    /// persistence diagrams of the local vertices.
    pub fn compute_final_components(&mut self, rho: Real) {
        self.final_vertex_to_deepest = self.tree.vertex_to_root();
        self.local_diagrams.clear();

        let death_inf = if self.negate {
            Real::NEG_INFINITY
        } else {
            Real::INFINITY
        };

        for (&v, n) in self.tree.nodes() {
            if v.gid != self.gid {
                continue;
            }
            if n.parent == v {
                self.local_diagrams
                    .entry(v)
                    .or_default()
                    .push((n.value, death_inf));
                continue;
            }
            let birth = n.value;
            let death = self.tree.node(n.through).value;
            if birth == death {
                continue;
            }
            if self.tree.cmp(rho, birth) {
                continue;
            }
            let root = self.final_vertex_to_deepest[&v];
            self.local_diagrams.entry(root).or_default().push((birth, death));
        }
    }

    /// Per-root integral of this block's cells at or beyond `theta`,
    /// weighted by the cell volume of the block's level.
    pub fn compute_local_integral(&mut self, theta: Real, cell_size: &[Real; D]) {
        self.local_integral.clear();
        let mut volume = self.local.scaling_factor();
        for s in cell_size.iter() {
            volume *= s;
        }
        for idx in self.local.active_indices() {
            let value = self.grid.value(self.local.position(idx));
            if self.tree.cmp(theta, value) {
                continue;
            }
            let root = self.final_vertex_to_deepest[&self.local.vertex(idx)];
            *self.local_integral.entry(root).or_insert(0.0) += value * volume;
        }
    }

    /// Physical coordinates of a vertex of this block.
    pub fn physical_position(&self, v: AmrVertexId, cell_size: &[Real; D]) -> [Real; D] {
        debug_assert_eq!(v.gid, self.gid);
        let p = self.local.global_position(v.index);
        let mut out = [0.0; D];
        for i in 0..D {
            out[i] = p[i] as Real * cell_size[i] / self.local.refinement() as Real;
        }
        out
    }
}

/// The tree fragment describing the component structure around the given
/// edges: every known endpoint together with its parent and saddle
/// closure, down to the current roots.
fn tree_fragment(
    tree: &TripletMergeTree<AmrVertexId>,
    edges: &[AmrEdge],
) -> Vec<(AmrVertexId, Real, AmrVertexId, AmrVertexId)> {
    let mut seen: BTreeSet<AmrVertexId> = BTreeSet::new();
    let mut worklist: Vec<AmrVertexId> = Vec::new();
    for e in edges {
        for v in [e.a, e.b] {
            if tree.contains(v) {
                worklist.push(v);
            }
        }
    }
    while let Some(v) = worklist.pop() {
        if !seen.insert(v) {
            continue;
        }
        let n = tree.node(v);
        if !seen.contains(&n.parent) {
            worklist.push(n.parent);
        }
        if !seen.contains(&n.through) {
            worklist.push(n.through);
        }
    }
    seen.into_iter()
        .map(|v| {
            let n = tree.node(v);
            (v, n.value, n.through, n.parent)
        })
        .collect()
}

/// Symmetrize the initial edges of blocks held in this process.
pub fn exchange_edges<const D: usize>(blocks: &mut [ComponentBlock<D>]) {
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();
    let mut inbox: Vec<(usize, i32, Vec<AmrEdge>)> = Vec::new();
    for b in blocks.iter() {
        for g in b.link.unique_gids(b.gid) {
            inbox.push((index[&g], b.gid, b.initial_edges_to(g)));
        }
    }
    for (i, sender, edges) in inbox {
        blocks[i].delete_low_edges(sender, edges);
    }
}

/// Check that after symmetrization the per-pair edge sets are identical
/// on both sides. Panics on violation.
pub fn check_edge_symmetry<const D: usize>(blocks: &[ComponentBlock<D>]) {
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();
    for a in blocks {
        for (&g, edges) in a.edges_by_gid.iter() {
            let b = &blocks[index[&g]];
            let mut mine = edges.clone();
            let mut theirs = b.edges_by_gid.get(&a.gid).cloned().unwrap_or_default();
            mine.sort_unstable();
            theirs.sort_unstable();
            assert_eq!(
                mine, theirs,
                "asymmetric edge sets between gids {} and {}",
                a.gid, g
            );
        }
    }
}

/// Run the fixed point over blocks held in this process. Returns the
/// global undone counts per round; the last entry is zero.
pub fn compute_connected_components<const D: usize>(
    blocks: &mut [ComponentBlock<D>],
) -> Vec<usize> {
    exchange_edges(blocks);
    for b in blocks.iter_mut() {
        b.build_components();
    }

    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();

    let mut history = Vec::new();
    loop {
        let mut inbox: Vec<Vec<ComponentMessage>> = (0..blocks.len()).map(|_| Vec::new()).collect();
        for b in blocks.iter_mut() {
            for m in b.cc_send() {
                inbox[index[&m.to_gid]].push(m);
            }
        }
        for (b, msgs) in blocks.iter_mut().zip(inbox.iter()) {
            b.cc_receive(msgs);
        }
        let undone: usize = blocks.iter().map(|b| b.undone_components()).sum();
        history.push(undone);
        if history.len() > WATCHDOG_ROUNDS {
            log::warn!("fixed point still running after {} rounds", history.len());
        }
        if undone == 0 {
            return history;
        }
    }
}

/// Wire header of one component message.
#[derive(Copy, Clone, Default, Equivalence)]
pub struct ComponentHeaderMsg {
    from_gid: i32,
    to_gid: i32,
    root: AmrVertexId,
    n_edges: u64,
    n_nodes: u64,
}

/// Wire form of one tree-fragment node.
#[derive(Copy, Clone, Default, Equivalence)]
pub struct TreeNodeMsg {
    vertex: AmrVertexId,
    value: f64,
    through: AmrVertexId,
    parent: AmrVertexId,
}

/// Wire form of one symmetrization edge.
#[derive(Copy, Clone, Default, Equivalence)]
pub struct EdgeMsg {
    from_gid: i32,
    to_gid: i32,
    edge: AmrEdge,
}

/// Distributed edge symmetrization.
pub fn exchange_edges_mpi<const D: usize, C: CommunicatorCollectives>(
    blocks: &mut [ComponentBlock<D>],
    assigner: &Assigner,
    comm: &C,
) {
    let nranks = comm.size();
    let mut outgoing: Vec<(i32, EdgeMsg)> = Vec::new();
    // every linked pair exchanges, empty sets included, so receivers can
    // tell "no surviving edges" from "no message"
    let mut handshakes: Vec<(i32, ComponentHeaderMsg)> = Vec::new();
    for b in blocks.iter() {
        for g in b.link.unique_gids(b.gid) {
            let edges = b.initial_edges_to(g);
            handshakes.push((
                g,
                ComponentHeaderMsg {
                    from_gid: b.gid,
                    to_gid: g,
                    root: AmrVertexId::default(),
                    n_edges: edges.len() as u64,
                    n_nodes: 0,
                },
            ));
            outgoing.extend(edges.into_iter().map(|edge| {
                (
                    g,
                    EdgeMsg {
                        from_gid: b.gid,
                        to_gid: g,
                        edge,
                    },
                )
            }));
        }
    }
    let headers = exchange_stream(bucket_by_rank(handshakes, assigner, nranks), comm);
    let edges = exchange_stream(bucket_by_rank(outgoing, assigner, nranks), comm);

    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();
    let mut pos = 0;
    for h in headers {
        let batch: Vec<AmrEdge> = edges[pos..pos + h.n_edges as usize]
            .iter()
            .map(|m| m.edge)
            .collect();
        pos += h.n_edges as usize;
        blocks[index[&h.to_gid]].delete_low_edges(h.from_gid, batch);
    }
}

/// Distributed fixed point; the convergence vote is a global all-reduce.
pub fn compute_connected_components_mpi<const D: usize, C: CommunicatorCollectives>(
    blocks: &mut [ComponentBlock<D>],
    assigner: &Assigner,
    comm: &C,
) -> Vec<usize> {
    exchange_edges_mpi(blocks, assigner, comm);
    for b in blocks.iter_mut() {
        b.build_components();
    }

    let nranks = comm.size();
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();

    let mut history = Vec::new();
    loop {
        let mut headers: Vec<(i32, ComponentHeaderMsg)> = Vec::new();
        let mut edge_stream: Vec<(i32, EdgeMsg)> = Vec::new();
        let mut node_stream: Vec<(i32, TreeNodeMsg)> = Vec::new();
        for b in blocks.iter_mut() {
            for m in b.cc_send() {
                headers.push((
                    m.to_gid,
                    ComponentHeaderMsg {
                        from_gid: m.from_gid,
                        to_gid: m.to_gid,
                        root: m.root,
                        n_edges: m.edges.len() as u64,
                        n_nodes: m.nodes.len() as u64,
                    },
                ));
                edge_stream.extend(m.edges.iter().map(|&edge| {
                    (
                        m.to_gid,
                        EdgeMsg {
                            from_gid: m.from_gid,
                            to_gid: m.to_gid,
                            edge,
                        },
                    )
                }));
                node_stream.extend(m.nodes.iter().map(|&(vertex, value, through, parent)| {
                    (
                        m.to_gid,
                        TreeNodeMsg {
                            vertex,
                            value,
                            through,
                            parent,
                        },
                    )
                }));
            }
        }

        let headers = exchange_stream(bucket_by_rank(headers, assigner, nranks), comm);
        let edges = exchange_stream(bucket_by_rank(edge_stream, assigner, nranks), comm);
        let nodes = exchange_stream(bucket_by_rank(node_stream, assigner, nranks), comm);

        let mut inbox: Vec<Vec<ComponentMessage>> = (0..blocks.len()).map(|_| Vec::new()).collect();
        let (mut epos, mut npos) = (0, 0);
        for h in headers {
            let msg = ComponentMessage {
                from_gid: h.from_gid,
                to_gid: h.to_gid,
                root: h.root,
                edges: edges[epos..epos + h.n_edges as usize]
                    .iter()
                    .map(|m| m.edge)
                    .collect(),
                nodes: nodes[npos..npos + h.n_nodes as usize]
                    .iter()
                    .map(|m| (m.vertex, m.value, m.through, m.parent))
                    .collect(),
            };
            epos += h.n_edges as usize;
            npos += h.n_nodes as usize;
            inbox[index[&h.to_gid]].push(msg);
        }
        for (b, msgs) in blocks.iter_mut().zip(inbox.iter()) {
            b.cc_receive(msgs);
        }

        let undone: u64 = all_reduce_sum(
            blocks.iter().map(|b| b.undone_components() as u64).sum::<u64>(),
            comm,
        );
        history.push(undone as usize);
        if history.len() > WATCHDOG_ROUNDS {
            log::warn!("fixed point still running after {} rounds", history.len());
        }
        if undone == 0 {
            return history;
        }
    }
}

/// Wire form of one per-root integral contribution.
#[derive(Copy, Clone, Default, Equivalence)]
pub struct IntegralMsg {
    to_gid: i32,
    root: AmrVertexId,
    value: f64,
}

/// Route every per-root integral contribution to the block owning the
/// root; blocks held in this process.
pub fn exchange_integrals<const D: usize>(blocks: &mut [ComponentBlock<D>]) {
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();
    let mut msgs: Vec<(usize, AmrVertexId, Real)> = Vec::new();
    for b in blocks.iter() {
        for (&root, &value) in b.local_integral.iter() {
            msgs.push((index[&root.gid], root, value));
        }
    }
    for (i, root, value) in msgs {
        *blocks[i].global_integral.entry(root).or_insert(0.0) += value;
    }
}

/// Distributed integral routing (see [`exchange_integrals`]).
pub fn exchange_integrals_mpi<const D: usize, C: CommunicatorCollectives>(
    blocks: &mut [ComponentBlock<D>],
    assigner: &Assigner,
    comm: &C,
) {
    let nranks = comm.size();
    let mut msgs: Vec<(i32, IntegralMsg)> = Vec::new();
    for b in blocks.iter() {
        for (&root, &value) in b.local_integral.iter() {
            msgs.push((
                root.gid,
                IntegralMsg {
                    to_gid: root.gid,
                    root,
                    value,
                },
            ));
        }
    }
    let received = exchange_stream(bucket_by_rank(msgs, assigner, nranks), comm);
    let index: HashMap<i32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.gid, i))
        .collect();
    for m in received {
        *blocks[index[&m.to_gid]]
            .global_integral
            .entry(m.root)
            .or_insert(0.0) += m.value;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::grid::{Decomposer, Grid, GridBox};

    fn uniform_blocks(
        shape: [i64; 3],
        divisions: [i64; 3],
        rho: Real,
        negate: bool,
        f: impl Fn([i64; 3]) -> Real,
    ) -> Vec<ComponentBlock<3>> {
        let mut to = shape;
        for x in to.iter_mut() {
            *x -= 1;
        }
        let decomposer = Decomposer::new(GridBox::new([0; 3], to), divisions);
        let descriptors: Vec<AmrNeighbor<3>> = (0..decomposer.nblocks())
            .map(|gid| {
                let core = decomposer.core(gid);
                AmrNeighbor {
                    gid,
                    refinement: 1,
                    level: 0,
                    core,
                    bounds: core.expanded(1),
                }
            })
            .collect();
        (0..decomposer.nblocks())
            .map(|gid| {
                let mut link = AmrLink::new();
                for d in descriptors.iter().filter(|d| d.gid != gid) {
                    link.add(*d);
                }
                let core = decomposer.core(gid);
                let grid = Grid::from_fn(core.expanded(1), |v| f(wrap_vertex(v, shape)));
                let mut b = ComponentBlock::new(gid, 1, 0, core, shape, link, grid, negate);
                b.init(rho);
                b
            })
            .collect()
    }

    fn distinct_final_roots(blocks: &[ComponentBlock<3>]) -> BTreeSet<AmrVertexId> {
        let mut roots = BTreeSet::new();
        for b in blocks {
            for idx in b.local.active_indices() {
                roots.insert(b.final_vertex_to_deepest[&b.local.vertex(idx)]);
            }
        }
        roots
    }

    fn all_pairs(blocks: &[ComponentBlock<3>]) -> Vec<(Real, Real)> {
        let mut pairs: Vec<(Real, Real)> = blocks
            .iter()
            .flat_map(|b| b.local_diagrams.values().flatten().copied())
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        pairs
    }

    fn gaussian(v: [i64; 3], c: [f64; 3], sigma: f64) -> f64 {
        let mut d2 = 0.0;
        for i in 0..3 {
            let d = v[i] as f64 - c[i];
            d2 += d * d;
        }
        (-d2 / (2.0 * sigma * sigma)).exp()
    }

    #[test]
    fn test_constant_block_converges_immediately() {
        let mut blocks = uniform_blocks([4, 4, 4], [1, 1, 1], 0.5, true, |_| 1.0);
        let history = compute_connected_components(&mut blocks);
        assert_eq!(history, vec![0]);

        let b = &mut blocks[0];
        b.compute_final_components(0.5);
        assert_eq!(b.components.len(), 1);
        let root = b.components[0].root;
        assert_eq!(b.local.global_position(root.index), [0, 0, 0]);
        assert_eq!(b.tree.node(root).value, 1.0);

        // no saddles: the only diagram point is the essential one
        let pairs = all_pairs(&blocks);
        assert_eq!(pairs, vec![(1.0, Real::NEG_INFINITY)]);
    }

    #[test]
    fn test_all_low_is_empty() {
        let mut blocks = uniform_blocks([4, 4, 4], [2, 2, 1], 0.5, true, |_| 0.1);
        let history = compute_connected_components(&mut blocks);
        assert_eq!(history, vec![0]);
        for b in blocks.iter_mut() {
            assert!(b.components.is_empty());
            b.compute_final_components(0.5);
            assert!(b.local_diagrams.is_empty());
            b.compute_local_integral(0.5, &[1.0; 3]);
            assert!(b.local_integral.is_empty());
        }
    }

    #[test]
    fn test_edge_symmetry() {
        let f = |v: [i64; 3]| gaussian(v, [3.0, 3.0, 3.0], 2.5);
        let mut blocks = uniform_blocks([8, 8, 8], [2, 2, 2], 0.1, true, f);
        exchange_edges(&mut blocks);
        check_edge_symmetry(&blocks);
        // at least one pair of neighbouring blocks shares edges
        assert!(blocks
            .iter()
            .any(|b| b.edges_by_gid.values().any(|e| !e.is_empty())));
    }

    #[test]
    fn test_sine_blob() {
        use std::f64::consts::PI;
        let shape = 8.0;
        let f = move |v: [i64; 3]| {
            (PI * v[0] as f64 / shape).sin()
                * (PI * v[1] as f64 / shape).sin()
                * (PI * v[2] as f64 / shape).sin()
        };
        let mut blocks = uniform_blocks([8, 8, 8], [2, 2, 2], 0.1, true, f);
        let history = compute_connected_components(&mut blocks);
        assert_eq!(*history.last().unwrap(), 0);

        for b in blocks.iter_mut() {
            b.compute_final_components(0.1);
        }
        let roots = distinct_final_roots(&blocks);
        assert_eq!(roots.len(), 1, "one component above the threshold");

        // the peak of the product of sines sits at the centre
        let root = *roots.iter().next().unwrap();
        let owner = blocks.iter().find(|b| b.gid == root.gid).unwrap();
        assert_eq!(owner.local.global_position(root.index), [4, 4, 4]);

        // integral over cells at or above the threshold
        for b in blocks.iter_mut() {
            b.compute_local_integral(0.1, &[1.0; 3]);
        }
        exchange_integrals(&mut blocks);

        let mut expected = 0.0;
        for v in GridBox::new([0; 3], [7, 7, 7]).vertices() {
            if f(v) >= 0.1 {
                expected += f(v);
            }
        }
        let total: Real = blocks
            .iter()
            .flat_map(|b| b.global_integral.values())
            .sum();
        assert!((total - expected).abs() < 1e-9);

        // and only the owner holds it
        for b in blocks.iter() {
            assert_eq!(!b.global_integral.is_empty(), b.gid == root.gid);
        }
    }

    fn two_gaussians(v: [i64; 3]) -> f64 {
        gaussian(v, [8.0, 8.0, 8.0], 8.0) + gaussian(v, [24.0, 24.0, 24.0], 8.0)
    }

    /// Independent reference: a Kruskal-style union-find sweep over the
    /// whole periodic domain. Returns the non-zero-persistence pairs and
    /// the essential births, as value pairs.
    fn reference_pairs(
        shape: [i64; 3],
        rho: Real,
        f: impl Fn([i64; 3]) -> Real,
    ) -> (Vec<(Real, Real)>, Vec<Real>) {
        let mut to = shape;
        for x in to.iter_mut() {
            *x -= 1;
        }
        let domain = GridBox::new([0; 3], to);

        let mut cells: Vec<(Real, u64)> = domain
            .vertices()
            .map(|v| (f(v), domain.index(v)))
            .filter(|&(val, _)| !(rho > val))
            .collect();
        // superlevel sweep: highest first, ties by index
        cells.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut parent: HashMap<u64, u64> = HashMap::new();
        let mut birth: HashMap<u64, Real> = HashMap::new();
        fn find(parent: &mut HashMap<u64, u64>, mut x: u64) -> u64 {
            while parent[&x] != x {
                let up = parent[&parent[&x]];
                parent.insert(x, up);
                x = up;
            }
            x
        }

        let offsets = neighbor_offsets::<3>();
        let mut pairs = Vec::new();
        for &(val, idx) in cells.iter() {
            parent.insert(idx, idx);
            birth.insert(idx, val);
            let p = domain.position(idx);
            for off in offsets.iter() {
                let mut np = p;
                for i in 0..3 {
                    np[i] += off[i];
                }
                let nidx = domain.index(wrap_vertex(np, shape));
                if !parent.contains_key(&nidx) {
                    continue;
                }
                let ra = find(&mut parent, idx);
                let rb = find(&mut parent, nidx);
                if ra == rb {
                    continue;
                }
                // the shallower component dies here
                let (survivor, loser) = if birth[&ra] > birth[&rb] || (birth[&ra] == birth[&rb] && ra < rb)
                {
                    (ra, rb)
                } else {
                    (rb, ra)
                };
                if birth[&loser] != val {
                    pairs.push((birth[&loser], val));
                }
                parent.insert(loser, survivor);
            }
        }

        let mut essential: Vec<Real> = parent
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|&x| find(&mut parent, x) == x)
            .map(|x| birth[&x])
            .collect();
        essential.sort_by(|a, b| a.total_cmp(b));
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        (pairs, essential)
    }

    #[test]
    fn test_two_gaussians_diagram() {
        let mut blocks = uniform_blocks([32, 32, 32], [2, 2, 2], 0.3, true, two_gaussians);
        let history = compute_connected_components(&mut blocks);
        assert_eq!(*history.last().unwrap(), 0);
        for w in history.windows(2) {
            assert!(w[1] <= w[0], "undone counts must not grow");
        }

        for b in blocks.iter_mut() {
            b.compute_final_components(0.3);
        }
        // the neck between the two blobs is above the threshold, so the
        // components merge into one
        let roots = distinct_final_roots(&blocks);
        assert_eq!(roots.len(), 1);

        let pairs = all_pairs(&blocks);
        let finite: Vec<(Real, Real)> = pairs
            .iter()
            .copied()
            .filter(|&(_, d)| d.is_finite())
            .collect();
        let essential: Vec<Real> = pairs
            .iter()
            .copied()
            .filter(|&(_, d)| !d.is_finite())
            .map(|(b, _)| b)
            .collect();

        let (expected_pairs, expected_essential) =
            reference_pairs([32, 32, 32], 0.3, two_gaussians);
        assert_eq!(finite, expected_pairs);
        assert_eq!(essential, expected_essential);

        // the losing peak is born at the second maximum
        assert_eq!(finite.len(), 1);
        assert_eq!(finite[0].0, two_gaussians([24, 24, 24]));
        assert_eq!(essential, vec![two_gaussians([8, 8, 8])]);
    }

    #[test]
    fn test_single_block_matches_distributed() {
        let run = |divisions: [i64; 3]| {
            let mut blocks =
                uniform_blocks([32, 32, 32], divisions, 0.3, true, two_gaussians);
            compute_connected_components(&mut blocks);
            for b in blocks.iter_mut() {
                b.compute_final_components(0.3);
                b.compute_local_integral(0.35, &[1.0; 3]);
            }
            exchange_integrals(&mut blocks);
            let total: Real = blocks
                .iter()
                .flat_map(|b| b.global_integral.values())
                .sum();
            (all_pairs(&blocks), total)
        };

        let (serial_pairs, serial_total) = run([1, 1, 1]);
        let (dist_pairs, dist_total) = run([2, 2, 2]);
        assert_eq!(serial_pairs, dist_pairs);
        assert!((serial_total - dist_total).abs() < 1e-9);
    }

    #[test]
    fn test_amr_coarse_fine() {
        let domain = [8, 8, 8];
        let coarse_core = GridBox::new([0, 0, 0], [7, 7, 7]);
        let fine_core = GridBox::new([4, 4, 4], [11, 11, 11]);

        let mut link0 = AmrLink::new();
        link0.add(AmrNeighbor {
            gid: 1,
            refinement: 2,
            level: 1,
            core: fine_core,
            bounds: fine_core.expanded(1),
        });
        let mut link1 = AmrLink::new();
        link1.add(AmrNeighbor {
            gid: 0,
            refinement: 1,
            level: 0,
            core: coarse_core,
            bounds: coarse_core.expanded(1),
        });

        let grid0 = Grid::constant(coarse_core.expanded(1), 0.2);
        let grid1 = Grid::constant(fine_core.expanded(1), 0.9);
        let mut blocks = vec![
            ComponentBlock::new(0, 1, 0, coarse_core, domain, link0, grid0, true),
            ComponentBlock::new(1, 2, 1, fine_core, domain, link1, grid1, true),
        ];
        for b in blocks.iter_mut() {
            b.init(0.5);
        }

        // the refined-away centre of the coarse block delegates to the
        // fine block; the rest of the coarse block is below the threshold
        assert!(matches!(
            blocks[0].local.mask_at(blocks[0].local.index([3, 3, 3])),
            Mask::Masked(1)
        ));
        assert_eq!(blocks[0].tree.size(), 0);

        let history = compute_connected_components(&mut blocks);
        assert_eq!(*history.last().unwrap(), 0);
        assert!(history.len() <= 2);

        check_edge_symmetry(&blocks);

        for b in blocks.iter_mut() {
            b.compute_final_components(0.5);
            b.compute_local_integral(0.5, &[1.0; 3]);
        }
        exchange_integrals(&mut blocks);

        // one component, rooted in the fine block
        let roots = distinct_final_roots(&blocks);
        assert_eq!(roots.len(), 1);
        let root = *roots.iter().next().unwrap();
        assert_eq!(root.gid, 1);

        // 8^3 fine cells of value 0.9, each 1/8 of a unit cell
        let total: Real = blocks[1].global_integral.values().sum();
        assert!((total - 512.0 * 0.9 * 0.125).abs() < 1e-9);
        assert!(blocks[0].global_integral.is_empty());
    }

    #[test]
    fn test_block_cycle_converges() {
        // four blocks around the periodic domain; everything active
        let mut blocks = uniform_blocks([8, 8, 1], [2, 2, 1], 0.5, true, |_| 1.0);
        exchange_edges(&mut blocks);
        check_edge_symmetry(&blocks);

        let history = compute_connected_components(&mut blocks);
        assert_eq!(*history.last().unwrap(), 0);
        assert!(history.len() <= 4, "cycle must converge quickly");
        for w in history.windows(2) {
            assert!(w[1] <= w[0]);
        }

        for b in blocks.iter_mut() {
            b.compute_final_components(0.5);
        }
        let roots = distinct_final_roots(&blocks);
        assert_eq!(roots.len(), 1);
    }
}
