//! Block-local masked grids for AMR hierarchies.
//!
//! A masked box is a block's core plus a one-cell ghost rim, together with
//! a per-cell mask that says whether the cell carries topology, lies below
//! the threshold, has been refined away by a finer block, or belongs to a
//! neighbour. The domain is periodic in every dimension; the rim of a
//! block at the domain edge wraps around.

use crate::grid::{to_refinement, wrap_vertex, Grid, GridBox, Real, Vertex};
use crate::vertex::{AmrLink, AmrVertexId};

/// Per-cell mask state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mask {
    /// The cell carries topology.
    Active,
    /// The cell is below the threshold.
    Low,
    /// The cell was refined away; the finer block's gid.
    Masked(i32),
    /// The cell belongs to a neighbour; the owner's gid.
    Ghost(i32),
}

/// A block's region of the AMR hierarchy with its cell mask.
#[derive(Clone, Debug)]
pub struct MaskedBox<const D: usize> {
    gid: i32,
    refinement: i64,
    level: i32,
    core: GridBox<D>,
    bounds: GridBox<D>,
    domain_shape: Vertex<D>,
    mask: Vec<Mask>,
}

impl<const D: usize> MaskedBox<D> {
    /// Create a masked box for a block owning `core` on a lattice with the
    /// given refinement. `domain_shape` is the domain extent at level zero;
    /// the bounds are the core grown by a one-cell rim, which wraps.
    pub fn new(
        gid: i32,
        refinement: i64,
        level: i32,
        core: GridBox<D>,
        domain_shape: Vertex<D>,
    ) -> Self {
        let bounds = core.expanded(1);
        let n = bounds.size() as usize;
        Self {
            gid,
            refinement,
            level,
            core,
            bounds,
            domain_shape,
            mask: vec![Mask::Active; n],
        }
    }

    /// Owning block id.
    pub fn gid(&self) -> i32 {
        self.gid
    }

    /// Cells per unit axis length on this block's lattice.
    pub fn refinement(&self) -> i64 {
        self.refinement
    }

    /// Refinement level.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// The cells this block owns.
    pub fn core(&self) -> &GridBox<D> {
        &self.core
    }

    /// Core plus the ghost rim; the index space of the mask and of
    /// [`AmrVertexId::index`].
    pub fn bounds(&self) -> &GridBox<D> {
        &self.bounds
    }

    /// Domain extent on this block's lattice.
    pub fn extent(&self) -> Vertex<D> {
        let mut e = self.domain_shape;
        for x in e.iter_mut() {
            *x *= self.refinement;
        }
        e
    }

    /// Domain extent at level zero.
    pub fn domain_shape(&self) -> Vertex<D> {
        self.domain_shape
    }

    /// Number of cells in the masked region.
    pub fn mask_size(&self) -> u64 {
        self.bounds.size()
    }

    /// Mask of a cell by local index.
    pub fn mask_at(&self, index: u64) -> Mask {
        self.mask[index as usize]
    }

    /// True if the cell carries topology.
    pub fn is_active(&self, index: u64) -> bool {
        self.mask[index as usize] == Mask::Active
    }

    /// The vertex id of a cell of this block.
    pub fn vertex(&self, index: u64) -> AmrVertexId {
        AmrVertexId::new(self.gid, index)
    }

    /// Unwrapped position of a cell in the bounds frame.
    pub fn position(&self, index: u64) -> Vertex<D> {
        self.bounds.position(index)
    }

    /// Position of a cell wrapped into the domain, on this block's lattice.
    pub fn global_position(&self, index: u64) -> Vertex<D> {
        wrap_vertex(self.bounds.position(index), self.extent())
    }

    /// Local index of an unwrapped bounds-frame position.
    pub fn index(&self, v: Vertex<D>) -> u64 {
        self.bounds.index(v)
    }

    /// Initialize the mask from the link: cells covered by a finer block's
    /// core become `Masked`, rim cells become `Ghost` with their owner's
    /// gid, and core cells start out `Active`. Thresholding happens
    /// separately in [`MaskedBox::apply_threshold`].
    pub fn init_mask(&mut self, link: &AmrLink<D>) {
        let extent = self.extent();
        for idx in 0..self.mask_size() {
            let p = self.bounds.position(idx);
            let wp = wrap_vertex(p, extent);
            let in_core = self.core.contains(p);
            let m = if in_core {
                match self.finest_finer_owner(wp, link) {
                    Some(gid) => Mask::Masked(gid),
                    None => Mask::Active,
                }
            } else {
                let owner = self
                    .ghost_owner(wp, link)
                    .unwrap_or_else(|| panic!("gid {}: rim cell {wp:?} has no owner", self.gid));
                Mask::Ghost(owner)
            };
            self.mask[idx as usize] = m;
        }
    }

    /// The finest block above this one whose core covers `wp`.
    fn finest_finer_owner(&self, wp: Vertex<D>, link: &AmrLink<D>) -> Option<i32> {
        let mut best: Option<(i32, i32)> = None; // (level, gid)
        for n in link.neighbors() {
            if n.level <= self.level {
                continue;
            }
            let q = to_refinement(wp, self.refinement, n.refinement);
            let mut ne = self.domain_shape;
            for x in ne.iter_mut() {
                *x *= n.refinement;
            }
            if n.core.contains_wrapped(q, ne) && best.map_or(true, |(l, _)| n.level > l) {
                best = Some((n.level, n.gid));
            }
        }
        best.map(|(_, gid)| gid)
    }

    /// The owner of a rim cell: the finest block (this one included, for
    /// periodic wrap-around) whose core covers the cell.
    fn ghost_owner(&self, wp: Vertex<D>, link: &AmrLink<D>) -> Option<i32> {
        let mut best: Option<(i32, i32)> = None;
        if self.core.contains_wrapped(wp, self.extent()) {
            best = Some((self.level, self.gid));
        }
        for n in link.neighbors() {
            let q = to_refinement(wp, self.refinement, n.refinement);
            let mut ne = self.domain_shape;
            for x in ne.iter_mut() {
                *x *= n.refinement;
            }
            if n.core.contains_wrapped(q, ne) && best.map_or(true, |(l, _)| n.level > l) {
                best = Some((n.level, n.gid));
            }
        }
        best.map(|(_, gid)| gid)
    }

    /// Mark core cells below the absolute threshold as `Low`.
    /// `cmp(a, b)` is the sweep orientation: `a` more extreme than `b`.
    pub fn apply_threshold(&mut self, grid: &Grid<D>, rho: Real, negate: bool) {
        let cmp = |a: Real, b: Real| if negate { a > b } else { a < b };
        for idx in 0..self.mask_size() {
            if self.mask[idx as usize] != Mask::Active {
                continue;
            }
            let v = grid.value(self.bounds.position(idx));
            if cmp(rho, v) {
                self.mask[idx as usize] = Mask::Low;
            }
        }
    }

    /// Volume of one cell of this block relative to a level-zero cell.
    pub fn scaling_factor(&self) -> Real {
        let mut s = 1.0;
        for _ in 0..D {
            s /= self.refinement as Real;
        }
        s
    }

    /// Sum and weighted count of the unmasked core cells, the local
    /// contribution to the global mean.
    pub fn unmasked_stats(&self, grid: &Grid<D>) -> (Real, Real) {
        let scale = self.scaling_factor();
        let mut sum = 0.0;
        let mut count = 0.0;
        for idx in 0..self.mask_size() {
            if matches!(self.mask[idx as usize], Mask::Active | Mask::Low) {
                sum += grid.value(self.bounds.position(idx)) * scale;
                count += scale;
            }
        }
        (sum, count)
    }

    /// Iterate over the local indices of all active cells.
    pub fn active_indices(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.mask_size()).filter(|&i| self.is_active(i))
    }

    /// Fatal check that every gid the mask refers to appears in the link.
    pub fn check_mask_validity(&self, link: &AmrLink<D>) {
        for (i, m) in self.mask.iter().enumerate() {
            let gid = match m {
                Mask::Masked(g) | Mask::Ghost(g) => *g,
                _ => continue,
            };
            assert!(
                gid == self.gid || link.contains_gid(gid),
                "gid {}: mask cell {} refers to {} which is not in the link",
                self.gid,
                i,
                gid
            );
        }
    }

    /// The box of cells on `lattice` covered by cell `v` of this block.
    pub fn cell_footprint(v: Vertex<D>, refinement: i64, lattice: i64) -> GridBox<D> {
        debug_assert!(lattice >= refinement);
        let ratio = lattice / refinement;
        let from = to_refinement(v, refinement, lattice);
        let mut to = from;
        for x in to.iter_mut() {
            *x += ratio - 1;
        }
        GridBox::new(from, to)
    }

    /// Shift a wrapped position into the unwrapped frame of `target`, if
    /// some periodic image of it lies inside.
    pub fn unwrap_into(target: &GridBox<D>, q: Vertex<D>, extent: Vertex<D>) -> Option<Vertex<D>> {
        let mut out = q;
        for i in 0..D {
            let mut found = false;
            for k in [-1i64, 0, 1] {
                let x = q[i] + k * extent[i];
                if target.from()[i] <= x && x <= target.to()[i] {
                    out[i] = x;
                    found = true;
                    break;
                }
            }
            if !found {
                return None;
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vertex::AmrNeighbor;

    /// One coarse 8^3 block and one refined 8^3 block (refinement 2)
    /// covering the centre octant [2,6)^3 of the coarse grid.
    fn coarse_fine() -> (MaskedBox<3>, MaskedBox<3>, AmrLink<3>, AmrLink<3>) {
        let domain = [8, 8, 8];
        let coarse = MaskedBox::new(0, 1, 0, GridBox::new([0, 0, 0], [7, 7, 7]), domain);
        let fine = MaskedBox::new(1, 2, 1, GridBox::new([4, 4, 4], [11, 11, 11]), domain);

        let mut link_coarse = AmrLink::new();
        link_coarse.add(AmrNeighbor {
            gid: 1,
            refinement: 2,
            level: 1,
            core: *fine.core(),
            bounds: *fine.bounds(),
        });
        let mut link_fine = AmrLink::new();
        link_fine.add(AmrNeighbor {
            gid: 0,
            refinement: 1,
            level: 0,
            core: *coarse.core(),
            bounds: *coarse.bounds(),
        });
        (coarse, fine, link_coarse, link_fine)
    }

    #[test]
    fn test_coarse_mask() {
        let (mut coarse, _, link, _) = coarse_fine();
        coarse.init_mask(&link);
        coarse.check_mask_validity(&link);

        // the centre cells are refined away and delegate to the fine block
        let centre = coarse.index([3, 3, 3]);
        assert_eq!(coarse.mask_at(centre), Mask::Masked(1));
        // a corner cell of the coarse core stays active
        let corner = coarse.index([0, 0, 0]);
        assert_eq!(coarse.mask_at(corner), Mask::Active);
        // the rim wraps onto the block itself
        let rim = coarse.index([-1, 0, 0]);
        assert_eq!(coarse.mask_at(rim), Mask::Ghost(0));
    }

    #[test]
    fn test_fine_mask() {
        let (_, mut fine, _, link) = coarse_fine();
        fine.init_mask(&link);
        fine.check_mask_validity(&link);

        // fine core cells are active, the rim is owned by the coarse block
        assert_eq!(fine.mask_at(fine.index([4, 4, 4])), Mask::Active);
        assert_eq!(fine.mask_at(fine.index([3, 4, 4])), Mask::Ghost(0));
        assert_eq!(fine.mask_at(fine.index([12, 11, 11])), Mask::Ghost(0));
    }

    #[test]
    fn test_threshold() {
        let (mut coarse, _, link, _) = coarse_fine();
        coarse.init_mask(&link);
        let grid = Grid::from_fn(*coarse.bounds(), |v| if v[0] <= 1 { 0.9 } else { 0.1 });
        coarse.apply_threshold(&grid, 0.5, true);
        assert_eq!(coarse.mask_at(coarse.index([0, 0, 0])), Mask::Active);
        assert_eq!(coarse.mask_at(coarse.index([7, 0, 0])), Mask::Low);
        // masked cells stay masked
        assert_eq!(coarse.mask_at(coarse.index([3, 3, 3])), Mask::Masked(1));
    }

    #[test]
    fn test_footprint_and_unwrap() {
        let fp = MaskedBox::<3>::cell_footprint([3, 3, 3], 1, 2);
        assert_eq!(fp.from(), [6, 6, 6]);
        assert_eq!(fp.to(), [7, 7, 7]);

        let target = GridBox::new([-1, -1, -1], [8, 8, 8]);
        assert_eq!(
            MaskedBox::<3>::unwrap_into(&target, [7, 0, 0], [8, 8, 8]),
            Some([7, 0, 0])
        );
        // 7 can also be seen as -1 through the periodic boundary; the
        // in-box image wins per dimension
        let target = GridBox::new([-1, -1, -1], [0, 0, 0]);
        assert_eq!(
            MaskedBox::<3>::unwrap_into(&target, [7, 0, 0], [8, 8, 8]),
            Some([-1, 0, 0])
        );
    }
}
