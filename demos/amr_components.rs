//! Connected-components driver.
//!
//! Computes the local-global component structure of a scalar field split
//! into blocks, and optionally writes persistence diagrams and
//! per-component integrals. File readers and the block serialization
//! format live outside this crate, so the input is a synthetic field:
//! `sin:N` (a product of sines on an N^3 grid) or `gaussians:N` (two
//! Gaussians on an N^3 grid). Pass the literal `none` to skip an
//! optional output.
//!
//! Example:
//!
//! ```text
//! mpirun -n 2 amr_components gaussians:32 none diagrams.txt integral.txt \
//!     -b 8 -i 0.3 -x 0.35 -a -n
//! ```

use clap::Parser;
use mpi::traits::Communicator;

use amr_mergetree::components::{
    compute_connected_components_mpi, exchange_integrals_mpi, ComponentBlock,
};
use amr_mergetree::diagram::{diagram_lines, write_lines_root};
use amr_mergetree::error::validate_thresholds;
use amr_mergetree::exchange::{all_reduce_sum, Assigner};
use amr_mergetree::grid::{wrap_vertex, Decomposer, Grid, GridBox, Real, Vertex};
use amr_mergetree::vertex::{AmrLink, AmrNeighbor};

#[derive(Parser, Debug)]
#[command(
    name = "amr_components",
    about = "Compute local-global merge trees and connected components"
)]
struct Options {
    /// Input field: `sin:N`, `gaussians:N`, or a file path (readers are
    /// external; missing files are an error)
    input: String,
    /// Output for the block summaries, or `none`
    output: String,
    /// Output for the persistence diagrams, or `none`
    out_diagrams: Option<String>,
    /// Output for the per-component integrals, or `none`
    out_integral: Option<String>,

    /// Number of blocks to use
    #[arg(short = 'b', long = "blocks")]
    blocks: Option<i64>,
    /// Maximum blocks to store in memory (-1 for unlimited)
    #[arg(short = 'm', long = "memory", default_value_t = -1)]
    memory: i64,
    /// Threads to use during the computation
    #[arg(short = 'j', long = "jobs", default_value_t = 1)]
    jobs: usize,
    /// Storage prefix
    #[arg(short = 's', long = "storage", default_value = "./DIY.XXXXXX")]
    storage: String,
    /// Iso threshold
    #[arg(short = 'i', long = "rho", default_value_t = 81.66)]
    rho: Real,
    /// Integral threshold
    #[arg(short = 'x', long = "theta", default_value_t = 90.0)]
    theta: Real,
    /// Path to keep the execution profile
    #[arg(short = 'p', long = "profile")]
    profile: Option<String>,
    /// Log level
    #[arg(short = 'l', long = "log", default_value = "info")]
    log: String,
    /// Use absolute values for thresholds (instead of multiples of mean)
    #[arg(short = 'a', long = "absolute")]
    absolute: bool,
    /// Sweep superlevel sets
    #[arg(short = 'n', long = "negate")]
    negate: bool,
    /// Wrap the domain (always assumed)
    #[arg(short = 'w', long = "wrap")]
    wrap: bool,
    /// Use split IO
    #[arg(long = "split")]
    split: bool,
}

fn synthetic_field(input: &str) -> Option<(Vertex<3>, Box<dyn Fn(Vertex<3>) -> Real>)> {
    let (kind, n) = input.split_once(':')?;
    let n: i64 = n.parse().ok()?;
    let shape = [n, n, n];
    match kind {
        "sin" => {
            let f = move |v: Vertex<3>| {
                use std::f64::consts::PI;
                (PI * v[0] as Real / n as Real).sin()
                    * (PI * v[1] as Real / n as Real).sin()
                    * (PI * v[2] as Real / n as Real).sin()
            };
            Some((shape, Box::new(f)))
        }
        "gaussians" => {
            let q = n as Real / 4.0;
            let sigma = n as Real / 4.0;
            let f = move |v: Vertex<3>| {
                let g = |c: Real| {
                    let mut d2 = 0.0;
                    for i in 0..3 {
                        let d = v[i] as Real - c;
                        d2 += d * d;
                    }
                    (-d2 / (2.0 * sigma * sigma)).exp()
                };
                g(q) + g(3.0 * q)
            };
            Some((shape, Box::new(f)))
        }
        _ => None,
    }
}

fn main() {
    let opts = match Options::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            e.print().ok();
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .parse_filters(&opts.log)
        .init();
    log::debug!(
        "memory = {}, jobs = {}, storage = {}, profile = {:?}, split = {}, wrap = {}",
        opts.memory,
        opts.jobs,
        opts.storage,
        opts.profile,
        opts.split,
        opts.wrap
    );

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();

    let write_diagrams = opts
        .out_diagrams
        .as_deref()
        .is_some_and(|p| p != "none");
    let write_integral = opts
        .out_integral
        .as_deref()
        .is_some_and(|p| p != "none");

    if write_integral {
        if let Err(e) = validate_thresholds(opts.rho, opts.theta, opts.negate) {
            eprintln!("{e}");
            std::process::exit(2);
        }
    }

    let Some((shape, field)) = synthetic_field(&opts.input) else {
        eprintln!("cannot read input {}", opts.input);
        std::process::exit(2);
    };

    let nblocks = opts.blocks.unwrap_or(world.size() as i64);
    let domain = GridBox::new([0; 3], [shape[0] - 1, shape[1] - 1, shape[2] - 1]);
    let decomposer = Decomposer::new(domain, Decomposer::<3>::divisions_for(shape, nblocks));
    let assigner = Assigner::new(world.size(), decomposer.nblocks());

    log::info!(
        "starting computation, input = {}, nblocks = {}, rho = {}",
        opts.input,
        decomposer.nblocks(),
        opts.rho
    );

    // every block of the uniform decomposition links every other block;
    // the edge enumeration keeps only the geometric neighbours
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
            let grid = Grid::from_fn(core.expanded(1), |v| field(wrap_vertex(v, shape)));
            ComponentBlock::new(gid, 1, 0, core, shape, link, grid, opts.negate)
        })
        .collect();

    let (mut rho, mut theta) = (opts.rho, opts.theta);
    if !opts.absolute {
        let (sum, count) = blocks
            .iter()
            .map(|b| b.unmasked_stats())
            .fold((0.0, 0.0), |(s, c), (bs, bc)| (s + bs, c + bc));
        let total_sum: Real = all_reduce_sum(sum, &world);
        let total_count: Real = all_reduce_sum(count, &world);
        let mean = total_sum / total_count;
        rho *= mean;
        theta *= mean;
        log::info!("average = {mean}, rho = {rho}");
    }

    for b in blocks.iter_mut() {
        b.init(rho);
    }

    let history = compute_connected_components_mpi(&mut blocks, &assigner, &world);
    log::info!("fixed point converged after {} rounds", history.len());

    for b in blocks.iter_mut() {
        b.compute_final_components(rho);
    }

    if opts.output != "none" {
        let lines: Vec<String> = blocks
            .iter()
            .map(|b| {
                format!(
                    "gid {} tree_size {} components {}",
                    b.gid,
                    b.tree.size(),
                    b.components.len()
                )
            })
            .collect();
        if let Err(e) = write_lines_root(&opts.output, &lines, &world) {
            eprintln!("cannot write {}: {e}", opts.output);
            std::process::exit(2);
        }
    }

    if write_diagrams {
        let lines: Vec<String> = blocks.iter().flat_map(|b| diagram_lines(b)).collect();
        let path = opts.out_diagrams.as_deref().unwrap();
        if let Err(e) = write_lines_root(path, &lines, &world) {
            eprintln!("cannot write {path}: {e}");
            std::process::exit(2);
        }
    }

    if write_integral {
        for b in blocks.iter_mut() {
            b.compute_local_integral(theta, &[1.0; 3]);
        }
        exchange_integrals_mpi(&mut blocks, &assigner, &world);

        let mut lines = Vec::new();
        for b in blocks.iter() {
            let mut roots: Vec<_> = b.global_integral.keys().copied().collect();
            roots.sort_unstable();
            for root in roots {
                let pos = b.physical_position(root, &[1.0; 3]);
                lines.push(format!(
                    "{} {} {} {}",
                    pos[0], pos[1], pos[2], b.global_integral[&root]
                ));
            }
        }
        let path = opts.out_integral.as_deref().unwrap();
        if let Err(e) = write_lines_root(path, &lines, &world) {
            eprintln!("cannot write {path}: {e}");
            std::process::exit(2);
        }
    }

    if rank == 0 {
        log::info!("done");
    }
}
