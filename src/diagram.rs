//! Text output of persistence diagrams.
//!
//! One `birth death` pair per line, grouped per component root. Deaths of
//! essential classes print as `inf` (or `-inf` for superlevel sweeps).

use std::io::Write;

use mpi::traits::CommunicatorCollectives;

use crate::components::ComponentBlock;
use crate::exchange::gather_to_root;
use crate::grid::Real;

/// The diagram lines a block contributes, deterministically ordered.
pub fn diagram_lines<const D: usize>(block: &ComponentBlock<D>) -> Vec<String> {
    let mut roots: Vec<_> = block.local_diagrams.keys().copied().collect();
    roots.sort_unstable();

    let mut lines = Vec::new();
    for root in roots {
        let mut pairs = block.local_diagrams[&root].clone();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
        for (birth, death) in pairs {
            lines.push(format!("{birth} {death}"));
        }
    }
    lines
}

/// Write lines to a file from this process.
pub fn write_lines(path: &str, lines: &[String]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(())
}

/// Gather every rank's lines to the root rank and write them there.
pub fn write_lines_root<C: CommunicatorCollectives>(
    path: &str,
    lines: &[String],
    comm: &C,
) -> std::io::Result<()> {
    let mut bytes = Vec::new();
    for line in lines {
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
    }
    if let Some(all) = gather_to_root(&bytes, comm) {
        std::fs::write(path, all)?;
    }
    Ok(())
}

/// Total persistence of a block's local diagram points, infinite classes
/// excluded. A cheap summary used by the drivers' log output.
pub fn total_persistence<const D: usize>(block: &ComponentBlock<D>) -> Real {
    block
        .local_diagrams
        .values()
        .flatten()
        .filter(|(_, d)| d.is_finite())
        .map(|(b, d)| (b - d).abs())
        .sum()
}
