//! Block-to-rank assignment and the collective plumbing.
//!
//! Blocks are addressed by gid and distributed contiguously over ranks.
//! All variable-size payloads travel as flat typed streams through
//! `all_to_all_varcount_into`; message structs carry their own source and
//! destination gids, so no side channel is needed to route them to blocks
//! within a rank.

use mpi::datatype::{Partition, PartitionMut};
use mpi::{collective::SystemOperation, traits::*};

/// Contiguous assignment of `nblocks` gids to `nranks` ranks.
#[derive(Copy, Clone, Debug)]
pub struct Assigner {
    nranks: i32,
    nblocks: i32,
}

impl Assigner {
    /// Create an assigner. Ranks `0..nblocks % nranks` hold one extra block.
    pub fn new(nranks: i32, nblocks: i32) -> Self {
        assert!(nranks > 0 && nblocks > 0);
        Self { nranks, nblocks }
    }

    /// Total number of blocks.
    pub fn nblocks(&self) -> i32 {
        self.nblocks
    }

    /// The rank holding a gid.
    pub fn rank_of(&self, gid: i32) -> i32 {
        debug_assert!(0 <= gid && gid < self.nblocks);
        let base = self.nblocks / self.nranks;
        let rem = self.nblocks % self.nranks;
        let split = rem * (base + 1);
        if gid < split {
            gid / (base + 1)
        } else {
            rem + (gid - split) / base
        }
    }

    /// The gids held by a rank, in increasing order.
    pub fn gids_of(&self, rank: i32) -> Vec<i32> {
        (0..self.nblocks).filter(|&g| self.rank_of(g) == rank).collect()
    }
}

/// Compute displacements from a vector of counts: `[3, 4, 5] -> [0, 3, 7]`.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Gather an array to all processes.
pub fn gather_to_all<T: Equivalence + Default + Clone, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Vec<T> {
    let size = comm.size();
    let local_len = arr.len() as i32;

    let mut counts = vec![0_i32; size as usize];
    comm.all_gather_into(&local_len, &mut counts);

    let total = counts.iter().sum::<i32>() as usize;
    let mut recvbuffer = vec![T::default(); total];
    let displs = displacements(&counts);

    let mut partition = PartitionMut::new(&mut recvbuffer[..], counts, &displs[..]);
    comm.all_gather_varcount_into(arr, &mut partition);

    recvbuffer
}

/// Gather an array to the root rank; `None` elsewhere.
pub fn gather_to_root<T: Equivalence + Default + Clone, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Option<Vec<T>> {
    let n = arr.len() as i32;
    let rank = comm.rank();
    let size = comm.size();
    let root = comm.process_at_rank(0);

    if rank == 0 {
        let mut counts = vec![0_i32; size as usize];
        root.gather_into_root(&n, &mut counts);

        let total = counts.iter().sum::<i32>() as usize;
        let mut recvbuffer = vec![T::default(); total];
        let displs = displacements(&counts);
        let mut partition = PartitionMut::new(&mut recvbuffer[..], counts, &displs[..]);
        root.gather_varcount_into_root(arr, &mut partition);
        Some(recvbuffer)
    } else {
        root.gather_into(&n);
        root.gather_varcount_into(arr);
        None
    }
}

/// Sum a local value over all ranks.
pub fn all_reduce_sum<T, C>(local: T, comm: &C) -> T
where
    T: Equivalence + Default,
    C: CommunicatorCollectives,
{
    let mut global = T::default();
    comm.all_reduce_into(&local, &mut global, SystemOperation::sum());
    global
}

/// Exchange a typed stream: `send[r]` goes to rank `r`; the returned
/// vector concatenates the contributions of all ranks in rank order.
pub fn exchange_stream<T: Equivalence + Default + Clone, C: CommunicatorCollectives>(
    send: Vec<Vec<T>>,
    comm: &C,
) -> Vec<T> {
    let size = comm.size() as usize;
    assert_eq!(send.len(), size);

    let counts = send.iter().map(|v| v.len() as i32).collect::<Vec<_>>();
    let mut recv_counts = vec![0_i32; size];
    comm.all_to_all_into(&counts, &mut recv_counts);

    let sendbuffer = send.into_iter().flatten().collect::<Vec<_>>();
    let send_displs = displacements(&counts);
    let send_partition = Partition::new(&sendbuffer, counts, &send_displs[..]);

    let total = recv_counts.iter().sum::<i32>() as usize;
    let mut recvbuffer = vec![T::default(); total];
    let recv_displs = displacements(&recv_counts);
    let mut recv_partition = PartitionMut::new(&mut recvbuffer[..], recv_counts, &recv_displs[..]);

    comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    recvbuffer
}

/// Group messages by destination rank for [`exchange_stream`].
pub fn bucket_by_rank<T>(
    msgs: impl IntoIterator<Item = (i32, T)>,
    assigner: &Assigner,
    nranks: i32,
) -> Vec<Vec<T>> {
    let mut buckets: Vec<Vec<T>> = (0..nranks).map(|_| Vec::new()).collect();
    for (gid, msg) in msgs {
        buckets[assigner.rank_of(gid) as usize].push(msg);
    }
    buckets
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_assigner_contiguous() {
        let a = Assigner::new(3, 8);
        let gids: Vec<Vec<i32>> = (0..3).map(|r| a.gids_of(r)).collect();
        assert_eq!(gids[0], vec![0, 1, 2]);
        assert_eq!(gids[1], vec![3, 4, 5]);
        assert_eq!(gids[2], vec![6, 7]);
        for r in 0..3 {
            for &g in &gids[r as usize] {
                assert_eq!(a.rank_of(g), r);
            }
        }
    }

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[]), Vec::<i32>::new());
    }
}
