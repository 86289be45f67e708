//! Test the uniform-grid pipeline under MPI: local trees, the
//! distance-doubling merge, and the persistent-integral reduce.

use mpi::traits::Communicator;

use amr_mergetree::exchange::{gather_to_root, Assigner};
use amr_mergetree::grid::{Decomposer, FieldSource, Grid, GridBox, GridSource, Real};
use amr_mergetree::integral::{persistent_integrals_mpi, IntegralParams};
use amr_mergetree::reduce::{merge_sparsify_mpi, MergeTreeBlock};
use amr_mergetree::swap::SwapPartners;

fn two_gaussians(shape: i64) -> GridSource<3> {
    let domain = GridBox::new([0; 3], [shape - 1, shape - 1, shape - 1]);
    let q = shape as Real / 4.0;
    let sigma = shape as Real / 4.0;
    let grid = Grid::from_fn(domain, |v| {
        let g = |c: Real| {
            let mut d2 = 0.0;
            for i in 0..3 {
                let d = v[i] as Real - c;
                d2 += d * d;
            }
            (-d2 / (2.0 * sigma * sigma)).exp()
        };
        g(q) + g(3.0 * q)
    });
    GridSource::new(grid, [1.0; 3])
}

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();

    let shape = 16;
    let source = two_gaussians(shape);
    let domain = GridBox::new([0; 3], [shape - 1, shape - 1, shape - 1]);
    let decomposer = Decomposer::new(domain, [2, 2, 2]);
    let assigner = Assigner::new(world.size(), decomposer.nblocks());

    // local trees for the blocks of this rank
    let mut blocks: Vec<MergeTreeBlock<3>> = assigner
        .gids_of(rank)
        .into_iter()
        .map(|gid| MergeTreeBlock::build(gid, &decomposer, &source, true))
        .collect();

    let partners = SwapPartners::new(decomposer.clone(), 2, true);
    merge_sparsify_mpi(&mut blocks, &partners, &assigner, &world);

    // every block must agree on the global root, the deeper of the peaks
    let roots: Vec<u64> = blocks
        .iter()
        .map(|b| {
            assert_eq!(b.tree.count_roots(), 1);
            b.tree.roots().next().unwrap()
        })
        .collect();
    if let Some(all_roots) = gather_to_root(&roots, &world) {
        assert!(all_roots.iter().all(|&r| r == all_roots[0]));
    }

    // route the component integrals to their owners
    let params = IntegralParams {
        iso: 0.3,
        max: 0.5,
        density_weighted: false,
    };
    let halving = SwapPartners::new(decomposer, 2, false);
    let results =
        persistent_integrals_mpi(&blocks, &halving, &params, &[], None, &assigner, &world);

    let local_total: Real = results
        .iter()
        .flat_map(|(_, mis)| mis.iter().map(|mi| mi.integral))
        .sum();

    if let Some(totals) = gather_to_root(&[local_total], &world) {
        let total: Real = totals.iter().sum();
        // reference: direct sum over the full field
        let grid = source.read(&domain);
        let mut expected = 0.0;
        for v in domain.vertices() {
            let x = grid.value(v);
            if x >= 0.3 {
                expected += x;
            }
        }
        assert!(
            (total - expected).abs() < 1e-9,
            "integral {total} vs expected {expected}"
        );
        println!("No errors were found in the local-global reduction.");
    }
}
