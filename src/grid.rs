//! Regular grids, boxes and block decompositions.
//!
//! Everything in this module is index arithmetic: shapes, strides,
//! vertex-to-linear-index conversions and boundary predicates. Boxes are
//! inclusive on both ends and indexed row-major with the last dimension
//! fastest.

use itertools::Itertools;

/// Scalar field value type.
pub type Real = f64;

/// A grid vertex, given by its integer coordinates.
pub type Vertex<const D: usize> = [i64; D];

/// Wrap a coordinate vector into `[0, extent)` in every dimension.
pub fn wrap_vertex<const D: usize>(v: Vertex<D>, extent: Vertex<D>) -> Vertex<D> {
    let mut out = v;
    for i in 0..D {
        out[i] = v[i].rem_euclid(extent[i]);
    }
    out
}

/// Map a coordinate from one refinement lattice to another.
///
/// Refinements count cells per unit axis length. Coarsening floors, so a
/// fine cell maps to the coarse cell that covers it.
pub fn to_refinement<const D: usize>(v: Vertex<D>, from: i64, to: i64) -> Vertex<D> {
    let mut out = v;
    for x in out.iter_mut() {
        *x = if to >= from {
            *x * (to / from)
        } else {
            x.div_euclid(from / to)
        };
    }
    out
}

/// An axis-aligned box of grid vertices, inclusive on both ends.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GridBox<const D: usize> {
    from: Vertex<D>,
    to: Vertex<D>,
}

impl<const D: usize> GridBox<D> {
    /// Create a new box. `from` must not exceed `to` in any dimension.
    pub fn new(from: Vertex<D>, to: Vertex<D>) -> Self {
        for i in 0..D {
            assert!(from[i] <= to[i], "invalid box: {from:?} - {to:?}");
        }
        Self { from, to }
    }

    /// Lower corner.
    pub fn from(&self) -> Vertex<D> {
        self.from
    }

    /// Upper corner (inclusive).
    pub fn to(&self) -> Vertex<D> {
        self.to
    }

    /// Extent in each dimension.
    pub fn shape(&self) -> Vertex<D> {
        let mut s = [0; D];
        for i in 0..D {
            s[i] = self.to[i] - self.from[i] + 1;
        }
        s
    }

    /// Number of vertices in the box.
    pub fn size(&self) -> u64 {
        self.shape().iter().map(|&e| e as u64).product()
    }

    /// Row-major strides, last dimension fastest.
    fn strides(&self) -> [u64; D] {
        let shape = self.shape();
        let mut strides = [1u64; D];
        let mut cur = 1u64;
        for i in (0..D).rev() {
            strides[i] = cur;
            cur *= shape[i] as u64;
        }
        strides
    }

    /// True if `v` lies inside the box.
    pub fn contains(&self, v: Vertex<D>) -> bool {
        (0..D).all(|i| self.from[i] <= v[i] && v[i] <= self.to[i])
    }

    /// True if `v`, wrapped modulo `extent`, lies inside the box.
    pub fn contains_wrapped(&self, v: Vertex<D>, extent: Vertex<D>) -> bool {
        self.contains(wrap_vertex(v, extent))
    }

    /// Linear index of a contained vertex.
    pub fn index(&self, v: Vertex<D>) -> u64 {
        debug_assert!(self.contains(v), "{v:?} outside {self:?}");
        let strides = self.strides();
        let mut idx = 0;
        for i in 0..D {
            idx += (v[i] - self.from[i]) as u64 * strides[i];
        }
        idx
    }

    /// Vertex corresponding to a linear index. Inverse of [`GridBox::index`].
    pub fn position(&self, mut idx: u64) -> Vertex<D> {
        let strides = self.strides();
        let mut v = [0; D];
        for i in 0..D {
            v[i] = self.from[i] + (idx / strides[i]) as i64;
            idx %= strides[i];
        }
        v
    }

    /// True if `v` lies on a face of the box.
    pub fn on_boundary(&self, v: Vertex<D>) -> bool {
        self.contains(v) && (0..D).any(|i| v[i] == self.from[i] || v[i] == self.to[i])
    }

    /// The box grown by `r` in every direction.
    pub fn expanded(&self, r: i64) -> Self {
        let mut from = self.from;
        let mut to = self.to;
        for i in 0..D {
            from[i] -= r;
            to[i] += r;
        }
        Self { from, to }
    }

    /// The box grown by `r` but clamped to `domain`.
    pub fn expanded_clamped(&self, r: i64, domain: &GridBox<D>) -> Self {
        let grown = self.expanded(r);
        let mut from = grown.from;
        let mut to = grown.to;
        for i in 0..D {
            from[i] = from[i].max(domain.from[i]);
            to[i] = to[i].min(domain.to[i]);
        }
        Self { from, to }
    }

    /// Smallest box containing both `self` and `other`.
    pub fn hull(&self, other: &GridBox<D>) -> Self {
        let mut from = self.from;
        let mut to = self.to;
        for i in 0..D {
            from[i] = from[i].min(other.from[i]);
            to[i] = to[i].max(other.to[i]);
        }
        Self { from, to }
    }

    /// Intersection of two boxes, or `None` if they are disjoint.
    pub fn intersection(&self, other: &GridBox<D>) -> Option<Self> {
        let mut from = self.from;
        let mut to = self.to;
        for i in 0..D {
            from[i] = from[i].max(other.from[i]);
            to[i] = to[i].min(other.to[i]);
            if from[i] > to[i] {
                return None;
            }
        }
        Some(Self { from, to })
    }

    /// Iterate over all vertices of the box in linear-index order.
    pub fn vertices(&self) -> impl Iterator<Item = Vertex<D>> + '_ {
        (0..self.size()).map(|idx| self.position(idx))
    }
}

impl<const D: usize> std::fmt::Display for GridBox<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?} - {:?}]", self.from, self.to)
    }
}

/// Scalar values stored over a box.
pub struct Grid<const D: usize> {
    bounds: GridBox<D>,
    data: Vec<Real>,
}

impl<const D: usize> Grid<D> {
    /// Create a grid over `bounds` from a row-major data vector.
    pub fn new(bounds: GridBox<D>, data: Vec<Real>) -> Self {
        assert_eq!(bounds.size() as usize, data.len());
        Self { bounds, data }
    }

    /// Create a grid filled with a constant.
    pub fn constant(bounds: GridBox<D>, value: Real) -> Self {
        let n = bounds.size() as usize;
        Self {
            bounds,
            data: vec![value; n],
        }
    }

    /// Create a grid by evaluating `f` at every vertex.
    pub fn from_fn(bounds: GridBox<D>, mut f: impl FnMut(Vertex<D>) -> Real) -> Self {
        let data = bounds.vertices().map(&mut f).collect_vec();
        Self { bounds, data }
    }

    /// The box the grid is defined over.
    pub fn bounds(&self) -> &GridBox<D> {
        &self.bounds
    }

    /// Value at a vertex.
    pub fn value(&self, v: Vertex<D>) -> Real {
        self.data[self.bounds.index(v) as usize]
    }

    /// Value at a linear index.
    pub fn value_at(&self, idx: u64) -> Real {
        self.data[idx as usize]
    }

    /// Raw data slice.
    pub fn data(&self) -> &[Real] {
        &self.data
    }
}

/// A source of scalar values over a domain; the interface the readers
/// implement. File-backed readers live outside this crate.
pub trait FieldSource<const D: usize> {
    /// Shape of the full domain.
    fn shape(&self) -> Vertex<D>;

    /// Physical size of a level-zero cell in each dimension.
    fn cell_size(&self) -> [Real; D];

    /// Read the values over `bounds` into a fresh grid.
    fn read(&self, bounds: &GridBox<D>) -> Grid<D>;
}

/// An in-memory field, used by tests and demo drivers.
pub struct GridSource<const D: usize> {
    grid: Grid<D>,
    cell_size: [Real; D],
}

impl<const D: usize> GridSource<D> {
    /// Wrap a fully materialized domain grid.
    pub fn new(grid: Grid<D>, cell_size: [Real; D]) -> Self {
        Self { grid, cell_size }
    }
}

impl<const D: usize> FieldSource<D> for GridSource<D> {
    fn shape(&self) -> Vertex<D> {
        self.grid.bounds().shape()
    }

    fn cell_size(&self) -> [Real; D] {
        self.cell_size
    }

    fn read(&self, bounds: &GridBox<D>) -> Grid<D> {
        Grid::from_fn(*bounds, |v| self.grid.value(v))
    }
}

/// A regular decomposition of a domain box into a grid of blocks.
///
/// Block gids are assigned row-major over the block grid, last dimension
/// fastest, matching the vertex index order.
#[derive(Clone, Debug)]
pub struct Decomposer<const D: usize> {
    domain: GridBox<D>,
    divisions: [i64; D],
}

impl<const D: usize> Decomposer<D> {
    /// Decompose `domain` into a block grid with the given per-dimension
    /// divisions. Extents must divide evenly.
    pub fn new(domain: GridBox<D>, divisions: [i64; D]) -> Self {
        let shape = domain.shape();
        for i in 0..D {
            assert!(divisions[i] > 0);
            assert_eq!(
                shape[i] % divisions[i],
                0,
                "divisions {divisions:?} do not tile {shape:?}"
            );
        }
        Self { domain, divisions }
    }

    /// Choose divisions for `nblocks` by repeatedly splitting the dimension
    /// with the largest remaining extent.
    pub fn divisions_for(shape: Vertex<D>, nblocks: i64) -> [i64; D] {
        let mut divisions = [1i64; D];
        let mut rest = nblocks;
        let mut extent = shape;
        let mut factor = 2;
        while rest > 1 {
            while rest % factor != 0 {
                factor += 1;
            }
            let dim = (0..D).max_by_key(|&i| extent[i]).unwrap();
            divisions[dim] *= factor;
            extent[dim] /= factor;
            rest /= factor;
        }
        divisions
    }

    /// The decomposed domain.
    pub fn domain(&self) -> &GridBox<D> {
        &self.domain
    }

    /// Per-dimension divisions of the block grid.
    pub fn divisions(&self) -> [i64; D] {
        self.divisions
    }

    /// Total number of blocks.
    pub fn nblocks(&self) -> i32 {
        self.divisions.iter().product::<i64>() as i32
    }

    /// Block-grid coordinates of a gid.
    pub fn gid_to_coords(&self, gid: i32) -> Vertex<D> {
        let mut idx = gid as i64;
        let mut coords = [0; D];
        for i in (0..D).rev() {
            coords[i] = idx % self.divisions[i];
            idx /= self.divisions[i];
        }
        coords
    }

    /// Gid of a block-grid coordinate.
    pub fn coords_to_gid(&self, coords: Vertex<D>) -> i32 {
        let mut gid = 0i64;
        for i in 0..D {
            gid = gid * self.divisions[i] + coords[i];
        }
        gid as i32
    }

    /// The vertices owned by a block. Cores of distinct blocks are disjoint.
    pub fn core(&self, gid: i32) -> GridBox<D> {
        let coords = self.gid_to_coords(gid);
        let shape = self.domain.shape();
        let mut from = [0; D];
        let mut to = [0; D];
        for i in 0..D {
            let w = shape[i] / self.divisions[i];
            from[i] = self.domain.from()[i] + coords[i] * w;
            to[i] = from[i] + w - 1;
        }
        GridBox::new(from, to)
    }

    /// The block's core grown by a one-vertex rim, clamped to the domain.
    pub fn bounds(&self, gid: i32) -> GridBox<D> {
        self.core(gid).expanded_clamped(1, &self.domain)
    }

    /// Gid of the block whose core contains `v`.
    pub fn point_to_gid(&self, v: Vertex<D>) -> i32 {
        debug_assert!(self.domain.contains(v));
        let shape = self.domain.shape();
        let mut coords = [0; D];
        for i in 0..D {
            let w = shape[i] / self.divisions[i];
            coords[i] = (v[i] - self.domain.from()[i]) / w;
        }
        self.coords_to_gid(coords)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        let b = GridBox::new([2, -1, 0], [5, 3, 7]);
        for idx in 0..b.size() {
            let v = b.position(idx);
            assert!(b.contains(v));
            assert_eq!(b.index(v), idx);
        }
    }

    #[test]
    fn test_boundary() {
        let b = GridBox::new([0, 0, 0], [3, 3, 3]);
        assert!(b.on_boundary([0, 1, 2]));
        assert!(b.on_boundary([3, 3, 3]));
        assert!(!b.on_boundary([1, 2, 1]));
    }

    #[test]
    fn test_wrap() {
        let extent = [8, 8, 8];
        assert_eq!(wrap_vertex([-1, 8, 3], extent), [7, 0, 3]);
        let b = GridBox::new([6, 6, 6], [7, 7, 7]);
        assert!(b.contains_wrapped([-1, -2, 14], extent));
    }

    #[test]
    fn test_refinement_mapping() {
        assert_eq!(to_refinement([3, 5, 0], 1, 2), [6, 10, 0]);
        assert_eq!(to_refinement([6, 11, 1], 2, 1), [3, 5, 0]);
        // round trip coarse -> fine -> coarse
        assert_eq!(to_refinement(to_refinement([3i64, 4, 5], 1, 4), 4, 1), [3, 4, 5]);
    }

    #[test]
    fn test_decomposer() {
        let domain = GridBox::new([0, 0, 0], [7, 7, 7]);
        let d = Decomposer::new(domain, [2, 2, 2]);
        assert_eq!(d.nblocks(), 8);
        for gid in 0..8 {
            let core = d.core(gid);
            assert_eq!(core.size(), 64);
            for v in core.vertices() {
                assert_eq!(d.point_to_gid(v), gid);
            }
            assert_eq!(d.coords_to_gid(d.gid_to_coords(gid)), gid);
        }
        // bounds overlap their neighbours by one vertex layer
        let b0 = d.bounds(0);
        assert_eq!(b0.from(), [0, 0, 0]);
        assert_eq!(b0.to(), [4, 4, 4]);
    }

    #[test]
    fn test_divisions_for() {
        let divs = Decomposer::<3>::divisions_for([8, 8, 8], 8);
        assert_eq!(divs.iter().product::<i64>(), 8);
        let d = Decomposer::new(GridBox::new([0, 0, 0], [7, 7, 7]), divs);
        assert_eq!(d.nblocks(), 8);
    }
}
