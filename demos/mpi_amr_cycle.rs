//! Test the connected-components fixed point under MPI on four blocks
//! that form a cycle of ghost edges across the periodic boundary.

use mpi::traits::Communicator;

use amr_mergetree::components::{compute_connected_components_mpi, ComponentBlock};
use amr_mergetree::exchange::{gather_to_root, Assigner};
use amr_mergetree::grid::{wrap_vertex, Decomposer, Grid, GridBox};
use amr_mergetree::vertex::{AmrLink, AmrNeighbor, AmrVertexId};

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();

    // four blocks around the periodic domain, everything active
    let shape = [8, 8, 1];
    let domain = GridBox::new([0; 3], [7, 7, 0]);
    let decomposer = Decomposer::new(domain, [2, 2, 1]);
    let assigner = Assigner::new(world.size(), decomposer.nblocks());

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

    let mut blocks: Vec<ComponentBlock<3>> = assigner
        .gids_of(rank)
        .into_iter()
        .map(|gid| {
            let mut link = AmrLink::new();
            for d in descriptors.iter().filter(|d| d.gid != gid) {
                link.add(*d);
            }
            let core = decomposer.core(gid);
            let grid = Grid::from_fn(core.expanded(1), |v| {
                let w = wrap_vertex(v, shape);
                1.0 + 0.001 * (w[0] + 8 * w[1]) as f64
            });
            let mut b = ComponentBlock::new(gid, 1, 0, core, shape, link, grid, true);
            b.init(0.5);
            b
        })
        .collect();

    let history = compute_connected_components_mpi(&mut blocks, &assigner, &world);

    // the cycle must converge within four rounds, monotonically
    assert!(history.len() <= 4, "history {history:?}");
    for w in history.windows(2) {
        assert!(w[1] <= w[0], "history {history:?}");
    }

    // all blocks on all ranks agree on a single global root
    for b in blocks.iter_mut() {
        b.compute_final_components(0.5);
    }
    let roots: Vec<AmrVertexId> = blocks
        .iter()
        .flat_map(|b| {
            b.local
                .active_indices()
                .map(|i| b.final_vertex_to_deepest[&b.local.vertex(i)])
                .collect::<Vec<_>>()
        })
        .collect();
    if let Some(all_roots) = gather_to_root(&roots, &world) {
        assert!(!all_roots.is_empty());
        assert!(all_roots.iter().all(|&r| r == all_roots[0]));
        println!("No errors were found in the fixed-point iteration.");
    }
}
