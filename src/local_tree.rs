//! Local merge-tree construction.
//!
//! Sweeps the cells of a block in value order and grows the triplet tree:
//! a cell with no processed neighbour opens a new branch, a cell that
//! touches several branches is the saddle where they merge. The same
//! sweep drives the masked AMR builder and the uniform-grid builder; they
//! differ only in which cells participate and how vertices are named.

use std::collections::HashMap;

use crate::grid::{Grid, GridBox, Real, Vertex};
use crate::masked_box::MaskedBox;
use crate::triplet::TripletMergeTree;
use crate::vertex::AmrVertexId;

/// The 3^D - 1 non-zero neighbour offsets.
pub(crate) fn neighbor_offsets<const D: usize>() -> Vec<Vertex<D>> {
    let mut offsets = Vec::new();
    let n = 3usize.pow(D as u32);
    for code in 0..n {
        let mut off = [0i64; D];
        let mut c = code;
        for x in off.iter_mut() {
            *x = (c % 3) as i64 - 1;
            c /= 3;
        }
        if off != [0; D] {
            offsets.push(off);
        }
    }
    offsets
}

/// Sort cells into deterministic sweep order: most extreme first, ties
/// broken by the smaller index.
fn sweep_order(cells: &mut Vec<(Real, u64)>, negate: bool) {
    cells.sort_unstable_by(|a, b| {
        let ord = a.0.total_cmp(&b.0);
        let ord = if negate { ord.reverse() } else { ord };
        ord.then_with(|| a.1.cmp(&b.1))
    });
}

/// Build the merge tree of a masked block from its active cells.
pub fn compute_masked_tree<const D: usize>(
    local: &MaskedBox<D>,
    grid: &Grid<D>,
    negate: bool,
) -> TripletMergeTree<AmrVertexId> {
    let mut tree = TripletMergeTree::new(negate);

    let mut cells: Vec<(Real, u64)> = local
        .active_indices()
        .map(|idx| (grid.value(local.position(idx)), idx))
        .collect();
    sweep_order(&mut cells, negate);

    let offsets = neighbor_offsets::<D>();
    let mut processed = vec![false; local.mask_size() as usize];

    for &(value, idx) in cells.iter() {
        let v = local.vertex(idx);
        tree.add(v, value);

        let p = local.position(idx);
        let mut roots = Vec::new();
        for off in offsets.iter() {
            let mut np = p;
            for i in 0..D {
                np[i] += off[i];
            }
            if !local.bounds().contains(np) {
                continue;
            }
            let nidx = local.index(np);
            if !processed[nidx as usize] || !local.is_active(nidx) {
                continue;
            }
            roots.push(tree.find_root_of(local.vertex(nidx)));
        }
        roots.sort_unstable();
        roots.dedup();

        if !roots.is_empty() {
            let deepest = roots
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    if tree.cmp_level(tree.level_of(a), tree.level_of(b)) {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                })
                .unwrap();
            tree.link(v, v, deepest);
            for r in roots.into_iter().filter(|&r| r != deepest) {
                tree.link(r, v, deepest);
            }
        }

        processed[idx as usize] = true;
    }

    debug_assert!(tree.validate());
    tree
}

/// Build the merge tree of a uniform-grid block. Vertices are global
/// linear indices into the domain grid, so trees of neighbouring blocks
/// agree on their shared boundary layer and can be merged directly.
pub fn compute_grid_tree<const D: usize>(
    local: &GridBox<D>,
    domain: &GridBox<D>,
    grid: &Grid<D>,
    negate: bool,
) -> TripletMergeTree<u64> {
    let mut tree = TripletMergeTree::new(negate);

    let mut cells: Vec<(Real, u64)> = local
        .vertices()
        .map(|p| (grid.value(p), domain.index(p)))
        .collect();
    sweep_order(&mut cells, negate);

    let offsets = neighbor_offsets::<D>();
    let mut processed: HashMap<u64, ()> = HashMap::with_capacity(cells.len());

    for &(value, v) in cells.iter() {
        tree.add(v, value);

        let p = domain.position(v);
        let mut roots = Vec::new();
        for off in offsets.iter() {
            let mut np = p;
            for i in 0..D {
                np[i] += off[i];
            }
            if !local.contains(np) {
                continue;
            }
            let nv = domain.index(np);
            if !processed.contains_key(&nv) {
                continue;
            }
            roots.push(tree.find_root_of(nv));
        }
        roots.sort_unstable();
        roots.dedup();

        if !roots.is_empty() {
            let deepest = roots
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    if tree.cmp_level(tree.level_of(a), tree.level_of(b)) {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                })
                .unwrap();
            tree.link(v, v, deepest);
            for r in roots.into_iter().filter(|&r| r != deepest) {
                tree.link(r, v, deepest);
            }
        }

        processed.insert(v, ());
    }

    debug_assert!(tree.validate());
    debug_assert_eq!(tree.count_roots(), 1, "local box must be connected");
    tree
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vertex::AmrLink;
    use proptest::prelude::*;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn single_block(shape: [i64; 3]) -> MaskedBox<3> {
        let mut to = shape;
        for x in to.iter_mut() {
            *x -= 1;
        }
        let mut b = MaskedBox::new(0, 1, 0, GridBox::new([0, 0, 0], to), shape);
        b.init_mask(&AmrLink::new());
        b
    }

    #[test]
    fn test_constant_field_single_root() {
        let local = single_block([4, 4, 4]);
        let grid = Grid::constant(*local.bounds(), 1.0);
        let tree = compute_masked_tree(&local, &grid, false);

        assert_eq!(tree.count_roots(), 1);
        let root = tree.roots().next().unwrap();
        // ties break by index, so the root sits at the origin
        assert_eq!(local.global_position(root.index), [0, 0, 0]);
        assert_eq!(tree.node(root).value, 1.0);
        // every other vertex is regular: no finite persistence anywhere
        for (v, birth, _, death) in tree.branches() {
            assert_eq!(birth, death, "saddle at {v}");
        }
    }

    #[test]
    fn test_two_maxima() {
        // 1 x 1 x 8 strip with peaks at both ends
        let values = [5.0, 4.0, 3.0, 2.0, 1.0, 2.5, 3.5, 4.5];
        let local = single_block([1, 1, 8]);
        let grid = Grid::from_fn(*local.bounds(), |v| values[v[2].rem_euclid(8) as usize]);
        let tree = compute_masked_tree(&local, &grid, true);

        assert_eq!(tree.count_roots(), 1);
        let root = tree.roots().next().unwrap();
        assert_eq!(tree.node(root).value, 5.0);

        // the second peak dies at the valley floor
        let finite: Vec<(Real, Real)> = tree
            .branches()
            .filter(|&(_, b, _, d)| b != d)
            .map(|(_, b, _, d)| (b, d))
            .collect();
        assert_eq!(finite, vec![(4.5, 1.0)]);
    }

    #[test]
    fn test_negate_mirror() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let local = single_block([4, 4, 4]);
        let grid = Grid::from_fn(*local.bounds(), |_| rng.gen::<f64>());
        let mirrored = Grid::from_fn(*local.bounds(), |v| -grid.value(v));

        let up = compute_masked_tree(&local, &grid, false);
        let down = compute_masked_tree(&local, &mirrored, true);

        assert_eq!(up.size(), down.size());
        for (&v, n) in up.nodes() {
            let m = down.node(v);
            assert_eq!(n.parent, m.parent, "parent of {v}");
            assert_eq!(n.through, m.through, "saddle of {v}");
            assert_eq!(n.value, -m.value);
        }
    }

    #[test]
    fn test_grid_tree_matches_masked_tree() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let domain = GridBox::new([0, 0, 0], [3, 3, 3]);
        let grid = Grid::from_fn(domain, |_| rng.gen::<f64>());

        let uniform = compute_grid_tree(&domain, &domain, &grid, false);

        let local = single_block([4, 4, 4]);
        let bgrid = Grid::from_fn(*local.bounds(), |v| {
            grid.value(crate::grid::wrap_vertex(v, [4, 4, 4]))
        });
        let masked = compute_masked_tree(&local, &bgrid, false);

        assert_eq!(uniform.size(), masked.size());
        for (&v, n) in uniform.nodes() {
            // translate the global index to the masked box's frame
            let p = domain.position(v);
            let m = masked.node(local.vertex(local.index(p)));
            assert_eq!(n.value, m.value);
            assert_eq!(domain.position(n.through), local.global_position(m.through.index));
            assert_eq!(domain.position(n.parent), local.global_position(m.parent.index));
        }
    }

    proptest! {
        /// Invariants of the sweep on arbitrary small fields; integer
        /// values make value ties common, exercising the tie-breaks.
        #[test]
        fn prop_sweep_invariants(values in proptest::collection::vec(0u8..6, 27)) {
            let local = single_block([3, 3, 3]);
            let grid = Grid::from_fn(*local.bounds(), |v| {
                let w = crate::grid::wrap_vertex(v, [3, 3, 3]);
                values[(w[0] * 9 + w[1] * 3 + w[2]) as usize] as f64
            });
            for negate in [false, true] {
                let tree = compute_masked_tree(&local, &grid, negate);
                prop_assert!(tree.validate());
                prop_assert_eq!(tree.count_roots(), 1);

                // sparsification must not change the kept triplets
                let mut sparse = tree.clone();
                sparse.sparsify(|v| v.index % 2 == 0);
                prop_assert!(sparse.validate());
                for (&v, n) in sparse.nodes() {
                    let o = tree.node(v);
                    prop_assert_eq!((n.through, n.parent), (o.through, o.parent));
                }
            }
        }
    }

    #[test]
    fn test_random_fields_validate() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..20 {
            let local = single_block([4, 4, 4]);
            let grid = Grid::from_fn(*local.bounds(), |_| rng.gen_range(0..6) as f64);
            for negate in [false, true] {
                let tree = compute_masked_tree(&local, &grid, negate);
                assert!(tree.validate());
                assert_eq!(tree.count_roots(), 1);
                for (_, birth, _, death) in tree.branches() {
                    assert!(!tree.cmp(death, birth));
                }
            }
        }
    }
}
