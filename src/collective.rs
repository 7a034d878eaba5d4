//! Collective assembly and reduction over a distributed array.
//!
//! All participants must call these together; they are synchronization
//! points. A participant whose reported shape drifts from the declared
//! decomposition fails the whole operation — a single process cannot safely
//! continue while its peers' state is unknown.

use std::ops::{Add, Mul};

use bytemuck::{Pod, Zeroable};
use num_traits::{Bounded, One, Zero};

use crate::array::DistributedArray;
use crate::communicator::{
    AssemblyTags, Communicator, DEFAULT_ASSEMBLY_TAG, DEFAULT_REDUCE_TAG, DEFAULT_REPLICA_TAG,
    ReduceTags, ReplicaTags, Wait,
};
use crate::error::MpiArrayError;
use crate::indexing::{pack_region, region_len, unpack_region};
use crate::wire::{self, WireCount, WireRange};

/// Element types reductions can operate on: each operator tag is bound to
/// an explicit identity element through these bounds.
pub trait ReduceElem:
    Copy + PartialOrd + Zero + One + Bounded + Add<Output = Self> + Mul<Output = Self>
{
}

impl<T> ReduceElem for T where
    T: Copy + PartialOrd + Zero + One + Bounded + Add<Output = Self> + Mul<Output = Self>
{
}

/// Closed set of associative, commutative reduction operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl ReduceOp {
    /// Identity element: contributed by empty interiors and secondary
    /// replicas.
    pub fn identity<V: ReduceElem>(self) -> V {
        match self {
            ReduceOp::Sum => V::zero(),
            ReduceOp::Prod => V::one(),
            ReduceOp::Min => V::max_value(),
            ReduceOp::Max => V::min_value(),
        }
    }

    pub fn combine<V: ReduceElem>(self, a: V, b: V) -> V {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Prod => a * b,
            ReduceOp::Min => {
                if b < a {
                    b
                } else {
                    a
                }
            }
            ReduceOp::Max => {
                if b > a {
                    b
                } else {
                    a
                }
            }
        }
    }
}

fn check_group<V: Pod, C: Communicator>(
    array: &DistributedArray<V>,
    comm: &C,
) -> Result<(), MpiArrayError> {
    let decomp = array.decomposition();
    if comm.size() != decomp.num_ranks() {
        return Err(MpiArrayError::AssemblyFailed(format!(
            "communicator spans {} processes but the decomposition declares {}",
            comm.size(),
            decomp.num_ranks()
        )));
    }
    if comm.rank() != array.rank() {
        return Err(MpiArrayError::AssemblyFailed(format!(
            "array belongs to rank {} but the communicator is rank {}",
            array.rank(),
            comm.rank()
        )));
    }
    Ok(())
}

/// Assemble the global array at `root` from every primary replica's
/// interior (ghosts excluded). Returns `Some(buffer)` on the root, `None`
/// elsewhere.
pub fn gather<V, C>(
    array: &DistributedArray<V>,
    comm: &C,
    root: usize,
) -> Result<Option<Vec<V>>, MpiArrayError>
where
    V: Pod,
    C: Communicator,
{
    gather_with_tags(array, comm, root, AssemblyTags::from_base(DEFAULT_ASSEMBLY_TAG))
}

pub fn gather_with_tags<V, C>(
    array: &DistributedArray<V>,
    comm: &C,
    root: usize,
    tags: AssemblyTags,
) -> Result<Option<Vec<V>>, MpiArrayError>
where
    V: Pod,
    C: Communicator,
{
    check_group(array, comm)?;
    let decomp = array.decomposition().clone();
    let me = array.rank();
    if root >= decomp.num_ranks() {
        return Err(MpiArrayError::OutOfRange(format!(
            "root rank {root} outside process group of size {}",
            decomp.num_ranks()
        )));
    }
    let ndim = decomp.shape().ndim();

    let contributes =
        |rank: usize| -> Result<bool, MpiArrayError> {
            Ok(decomp.is_primary_replica(rank)? && !decomp.extent(rank)?.is_empty())
        };

    if me != root {
        if contributes(me)? {
            let ext = decomp.extent(me)?;
            let header: Vec<WireRange> = ext
                .interior()
                .ranges()
                .iter()
                .map(|r| WireRange::new(r.start, r.end))
                .collect();
            let payload = array.interior_view().to_vec();
            log::trace!("rank {me}: contribute {} elems to gather", payload.len());
            let hh = comm.isend(root, tags.header.base(), wire::cast_slice(&header));
            let hd = comm.isend(root, tags.data.base(), wire::cast_slice(&payload));
            let _ = hh.wait();
            let _ = hd.wait();
        }
        return Ok(None);
    }

    // root: post every receive up front, then verify and scatter in rank order
    let mut out = vec![V::zeroed(); decomp.shape().num_elements()];
    let global = decomp.shape().axes().to_vec();
    let mut pending = Vec::new();
    for rank in 0..decomp.num_ranks() {
        if rank == me || !contributes(rank)? {
            continue;
        }
        let expected = decomp.extent(rank)?.interior().num_elements();
        let mut header = vec![WireRange::zeroed(); ndim];
        let hh = comm.irecv(rank, tags.header.base(), wire::cast_slice_mut(&mut header));
        let mut payload = vec![V::zeroed(); expected];
        let hd = comm.irecv(rank, tags.data.base(), wire::cast_slice_mut(&mut payload));
        pending.push((rank, hh, header, hd, payload));
    }

    for (rank, hh, mut header, hd, mut payload) in pending {
        let ext = decomp.extent(rank)?;
        let expected_ranges = ext.interior().ranges();

        let hdr_bytes = hh.wait().ok_or_else(|| {
            MpiArrayError::AssemblyFailed(format!("no extent header from rank {rank}"))
        })?;
        if hdr_bytes.len() != std::mem::size_of::<WireRange>() * ndim {
            return Err(MpiArrayError::AssemblyFailed(format!(
                "malformed extent header from rank {rank}"
            )));
        }
        wire::cast_slice_mut(&mut header).copy_from_slice(&hdr_bytes);
        let drifted = header
            .iter()
            .zip(expected_ranges.iter())
            .any(|(w, r)| w.start() != r.start || w.stop() != r.end);
        if drifted {
            return Err(MpiArrayError::AssemblyFailed(format!(
                "rank {rank} reported an extent inconsistent with the declared partition"
            )));
        }

        let expected = region_len(&expected_ranges);
        let data = hd.wait().ok_or_else(|| {
            MpiArrayError::AssemblyFailed(format!("no payload from rank {rank}"))
        })?;
        if data.len() != expected * std::mem::size_of::<V>() {
            return Err(MpiArrayError::AssemblyFailed(format!(
                "rank {rank} sent {} bytes, expected {}",
                data.len(),
                expected * std::mem::size_of::<V>()
            )));
        }
        wire::cast_slice_mut(&mut payload).copy_from_slice(&data);
        unpack_region(&mut out, &global, &expected_ranges, &payload);
    }

    if contributes(me)? {
        let ext = decomp.extent(me)?;
        let own = array.interior_view().to_vec();
        unpack_region(&mut out, &global, &ext.interior().ranges(), &own);
    }
    Ok(Some(out))
}

/// Reduce every interior element of the global array to a single value,
/// returned on every rank. Empty interiors and secondary replicas
/// contribute the operator's identity.
pub fn reduce<V, C>(
    array: &DistributedArray<V>,
    comm: &C,
    op: ReduceOp,
) -> Result<V, MpiArrayError>
where
    V: Pod + ReduceElem,
    C: Communicator,
{
    reduce_with_tags(array, comm, op, ReduceTags::from_base(DEFAULT_REDUCE_TAG))
}

pub fn reduce_with_tags<V, C>(
    array: &DistributedArray<V>,
    comm: &C,
    op: ReduceOp,
    tags: ReduceTags,
) -> Result<V, MpiArrayError>
where
    V: Pod + ReduceElem,
    C: Communicator,
{
    check_group(array, comm)?;
    let decomp = array.decomposition();
    let me = array.rank();
    let nranks = decomp.num_ranks();

    let mut partial = op.identity::<V>();
    if decomp.is_primary_replica(me)? && !decomp.extent(me)?.is_empty() {
        partial = local_fold(array, op);
    }
    if nranks == 1 {
        return Ok(partial);
    }

    if me != 0 {
        let h = comm.isend(0, tags.partial.base(), wire::cast_slice(std::slice::from_ref(&partial)));
        let _ = h.wait();
        let mut result = [op.identity::<V>()];
        let hr = comm.irecv(0, tags.result.base(), wire::cast_slice_mut(&mut result));
        let data = hr.wait().ok_or_else(|| {
            MpiArrayError::AssemblyFailed("no reduction result from rank 0".into())
        })?;
        if data.len() != std::mem::size_of::<V>() {
            return Err(MpiArrayError::AssemblyFailed(
                "malformed reduction result from rank 0".into(),
            ));
        }
        wire::cast_slice_mut(&mut result).copy_from_slice(&data);
        return Ok(result[0]);
    }

    // rank 0: combine partials in rank order for a deterministic result
    let mut pending = Vec::new();
    for rank in 1..nranks {
        let mut buf = [op.identity::<V>()];
        let h = comm.irecv(rank, tags.partial.base(), wire::cast_slice_mut(&mut buf));
        pending.push((rank, h, buf));
    }
    let mut acc = partial;
    for (rank, h, mut buf) in pending {
        let data = h.wait().ok_or_else(|| {
            MpiArrayError::AssemblyFailed(format!("no reduction partial from rank {rank}"))
        })?;
        if data.len() != std::mem::size_of::<V>() {
            return Err(MpiArrayError::AssemblyFailed(format!(
                "malformed reduction partial from rank {rank}"
            )));
        }
        wire::cast_slice_mut(&mut buf).copy_from_slice(&data);
        acc = op.combine(acc, buf[0]);
    }
    let mut handles = Vec::new();
    for rank in 1..nranks {
        handles.push(comm.isend(rank, tags.result.base(), wire::cast_slice(std::slice::from_ref(&acc))));
    }
    for h in handles {
        let _ = h.wait();
    }
    Ok(acc)
}

/// Fuse the interiors of replica groups element-wise with `op`, leaving
/// every replica with the combined values. A no-op when nothing is
/// replicated. Shapes within a group match by construction; a drifted
/// element count fails with `ShapeMismatch`.
pub fn reduce_replicated<V, C>(
    array: &mut DistributedArray<V>,
    comm: &C,
    op: ReduceOp,
) -> Result<(), MpiArrayError>
where
    V: Pod + ReduceElem,
    C: Communicator,
{
    reduce_replicated_with_tags(array, comm, op, ReplicaTags::from_base(DEFAULT_REPLICA_TAG))
}

pub fn reduce_replicated_with_tags<V, C>(
    array: &mut DistributedArray<V>,
    comm: &C,
    op: ReduceOp,
    tags: ReplicaTags,
) -> Result<(), MpiArrayError>
where
    V: Pod + ReduceElem,
    C: Communicator,
{
    check_group(array, comm)?;
    let decomp = array.decomposition().clone();
    let me = array.rank();
    let ext = decomp.extent(me)?.clone();
    if ext.is_empty() {
        return Ok(());
    }

    let group = replica_group(&decomp, me)?;
    if group.len() == 1 {
        return Ok(());
    }
    let leader = group[0];
    let count = ext.interior().num_elements();
    let shape_h = ext.shape_h();
    let interior = ext.interior_local_ranges();

    if me != leader {
        let header = WireCount::new(count);
        let payload = pack_region(array.data(), &shape_h, &interior);
        let h1 = comm.isend(leader, tags.count.base(), wire::cast_slice(std::slice::from_ref(&header)));
        let h2 = comm.isend(leader, tags.data.base(), wire::cast_slice(&payload));
        let _ = h1.wait();
        let _ = h2.wait();

        let mut fused = vec![V::zeroed(); count];
        let hr = comm.irecv(leader, tags.result.base(), wire::cast_slice_mut(&mut fused));
        let data = hr.wait().ok_or_else(|| {
            MpiArrayError::AssemblyFailed(format!("no fused replica data from rank {leader}"))
        })?;
        if data.len() != count * std::mem::size_of::<V>() {
            return Err(MpiArrayError::AssemblyFailed(format!(
                "malformed fused replica data from rank {leader}"
            )));
        }
        wire::cast_slice_mut(&mut fused).copy_from_slice(&data);
        unpack_region(array.data_mut(), &shape_h, &interior, &fused);
        return Ok(());
    }

    // group leader: post receives, fuse in rank order, distribute
    let mut pending = Vec::new();
    for &peer in &group[1..] {
        let mut header = WireCount::zeroed();
        let hh = comm.irecv(peer, tags.count.base(), wire::cast_slice_mut(std::slice::from_mut(&mut header)));
        let mut payload = vec![V::zeroed(); count];
        let hd = comm.irecv(peer, tags.data.base(), wire::cast_slice_mut(&mut payload));
        pending.push((peer, hh, header, hd, payload));
    }

    let mut acc = pack_region(array.data(), &shape_h, &interior);
    for (peer, hh, mut header, hd, mut payload) in pending {
        let hdr = hh.wait().ok_or_else(|| {
            MpiArrayError::AssemblyFailed(format!("no replica header from rank {peer}"))
        })?;
        if hdr.len() != std::mem::size_of::<WireCount>() {
            return Err(MpiArrayError::AssemblyFailed(format!(
                "malformed replica header from rank {peer}"
            )));
        }
        wire::cast_slice_mut(std::slice::from_mut(&mut header)).copy_from_slice(&hdr);
        if header.get() != count {
            return Err(MpiArrayError::ShapeMismatch {
                expected: count,
                found: header.get(),
            });
        }
        let data = hd.wait().ok_or_else(|| {
            MpiArrayError::AssemblyFailed(format!("no replica payload from rank {peer}"))
        })?;
        if data.len() != count * std::mem::size_of::<V>() {
            return Err(MpiArrayError::AssemblyFailed(format!(
                "malformed replica payload from rank {peer}"
            )));
        }
        wire::cast_slice_mut(&mut payload).copy_from_slice(&data);
        for (a, b) in acc.iter_mut().zip(payload.iter()) {
            *a = op.combine(*a, *b);
        }
    }

    let mut handles = Vec::new();
    for &peer in &group[1..] {
        handles.push(comm.isend(peer, tags.result.base(), wire::cast_slice(&acc)));
    }
    for h in handles {
        let _ = h.wait();
    }
    unpack_region(array.data_mut(), &shape_h, &interior, &acc);
    Ok(())
}

/// Ranks holding replicas of `rank`'s tile (including `rank`), ascending.
fn replica_group(
    decomp: &crate::decomposition::BlockDecomposition,
    rank: usize,
) -> Result<Vec<usize>, MpiArrayError> {
    let topo = decomp.topology();
    let cfg = decomp.config();
    let home = topo.rank_to_coord(rank)?;
    let mut group = Vec::new();
    for r in 0..topo.size() {
        let c = topo.rank_to_coord(r)?;
        let same_tile = c
            .iter()
            .zip(home.iter())
            .enumerate()
            .all(|(a, (ci, hi))| !cfg.split()[a] || ci == hi);
        if same_tile {
            group.push(r);
        }
    }
    Ok(group)
}

fn local_fold<V>(array: &DistributedArray<V>, op: ReduceOp) -> V
where
    V: Pod + ReduceElem,
{
    let ext = array.extent();
    let shape_h = ext.shape_h();
    let ranges = ext.interior_local_ranges();
    let data = array.data();
    let mut acc = op.identity::<V>();
    crate::indexing::for_each_run(&shape_h, &ranges, |off, len| {
        for &v in &data[off..off + len] {
            acc = op.combine(acc, v);
        }
    });
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_match_operators() {
        assert_eq!(ReduceOp::Sum.identity::<i32>(), 0);
        assert_eq!(ReduceOp::Prod.identity::<i32>(), 1);
        assert_eq!(ReduceOp::Min.identity::<i32>(), i32::MAX);
        assert_eq!(ReduceOp::Max.identity::<i32>(), i32::MIN);
    }

    #[test]
    fn combine_is_elementary() {
        assert_eq!(ReduceOp::Sum.combine(2, 3), 5);
        assert_eq!(ReduceOp::Prod.combine(2.0, 3.0), 6.0);
        assert_eq!(ReduceOp::Min.combine(2, 3), 2);
        assert_eq!(ReduceOp::Max.combine(2, 3), 3);
    }
}
