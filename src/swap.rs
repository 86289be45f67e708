//! K-ary swap partner schedules over a block grid.
//!
//! A schedule factors every dimension of the block grid into rounds of
//! size at most `k`. In each round a block exchanges with the `k - 1`
//! other members of its group along the round's dimension. The contiguous
//! order starts with immediate neighbours and doubles the distance every
//! round (the merge fan-in); the non-contiguous order runs the same
//! factorization backwards, halving the distance (the routing reduce).

use crate::grid::Decomposer;

#[derive(Copy, Clone, Debug)]
struct Round {
    dim: usize,
    k: i64,
    step: i64,
}

/// A swap schedule over the blocks of a [`Decomposer`].
pub struct SwapPartners<const D: usize> {
    decomposer: Decomposer<D>,
    rounds: Vec<Round>,
}

impl<const D: usize> SwapPartners<D> {
    /// Build a schedule with group size `k`. `contiguous` selects
    /// distance doubling; otherwise distances halve.
    pub fn new(decomposer: Decomposer<D>, k: i64, contiguous: bool) -> Self {
        assert!(k >= 2);
        let mut rounds = Vec::new();
        for dim in 0..D {
            let n = decomposer.divisions()[dim];
            let factors = factorize(n, k);
            let mut per_dim = Vec::new();
            let mut step = 1;
            for &f in factors.iter() {
                per_dim.push(Round { dim, k: f, step });
                step *= f;
            }
            if !contiguous {
                // mirror the strides so the first round spans the farthest
                for r in per_dim.iter_mut() {
                    r.step = n / (r.step * r.k);
                }
            }
            rounds.extend(per_dim);
        }
        Self { decomposer, rounds }
    }

    /// Number of exchange rounds.
    pub fn nrounds(&self) -> usize {
        self.rounds.len()
    }

    /// Dimension along which groups form in `round`.
    pub fn dim(&self, round: usize) -> usize {
        self.rounds[round].dim
    }

    /// Group size in `round`.
    pub fn k(&self, round: usize) -> i64 {
        self.rounds[round].k
    }

    /// The gids of the group containing `gid` in `round`, ordered by
    /// ascending coordinate along the round's dimension.
    pub fn group(&self, gid: i32, round: usize) -> Vec<i32> {
        let Round { dim, k, step } = self.rounds[round];
        let coords = self.decomposer.gid_to_coords(gid);
        let x = coords[dim];
        let base = (x / (step * k)) * (step * k) + x % step;
        (0..k)
            .map(|j| {
                let mut c = coords;
                c[dim] = base + j * step;
                self.decomposer.coords_to_gid(c)
            })
            .collect()
    }

    /// The position of `gid` inside its group in `round`.
    pub fn position(&self, gid: i32, round: usize) -> usize {
        let Round { dim, k, step } = self.rounds[round];
        let x = self.decomposer.gid_to_coords(gid)[dim];
        ((x / step) % k) as usize
    }

    /// The underlying decomposition.
    pub fn decomposer(&self) -> &Decomposer<D> {
        &self.decomposer
    }
}

/// Factor `n` greedily into rounds of size at most `k`.
fn factorize(mut n: i64, k: i64) -> Vec<i64> {
    let mut factors = Vec::new();
    while n > 1 {
        let f = if n % k == 0 {
            k
        } else {
            (2..=n).find(|f| n % f == 0).unwrap()
        };
        factors.push(f);
        n /= f;
    }
    factors
}
