//! Halo exchange engine: fills each rank's ghost slabs from the owning
//! neighbours' interiors.
//!
//! The plan is cached per (axis, side) at construction: the peer rank and
//! the pack/unpack regions, or a purely local action (boundary clamp,
//! periodic self-wrap). One `exchange` call runs the axes in ascending
//! order; for exchange axis `a` the perpendicular ranges include the ghost
//! slabs of axes `< a` (already fresh this epoch) and only the interior of
//! axes `> a`, so corner ghosts converge without diagonal messages.
//!
//! Protocol per axis: post *all* receives, then all sends, wait the
//! receives (optionally under a watchdog timeout), unpack, and always drain
//! the send handles before returning — even on error. A receive that fails
//! or times out surfaces [`MpiArrayError::ExchangeFailed`] naming the peer
//! rank, axis and side; such a failure is fatal for the distributed
//! computation.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use itertools::izip;

use crate::array::DistributedArray;
use crate::communicator::{Communicator, DEFAULT_EXCHANGE_TAG, ExchangeTags, Wait};
use crate::decomposition::{BlockDecomposition, BoundaryPolicy};
use crate::error::MpiArrayError;
use crate::indexing::{Dir, LocalExtent, pack_region, region_len, unpack_region};
use crate::wire;

/// A pack or unpack region of the local buffer.
#[derive(Clone, Debug)]
struct Region {
    ranges: Box<[Range<usize>]>,
    count: usize,
}

impl Region {
    fn new(ranges: Vec<Range<usize>>) -> Self {
        let count = region_len(&ranges);
        Self {
            ranges: ranges.into_boxed_slice(),
            count,
        }
    }
}

/// Communication with the neighbour on one side of one axis.
#[derive(Clone, Debug)]
struct CommSide {
    peer: usize,
    /// Ghost slab to fill from the peer; `None` when this side has no halo.
    recv: Option<Region>,
    /// Interior edge slab serving the peer's facing halo; `None` when the
    /// peer has no halo on that side.
    send: Option<Region>,
}

/// A local ghost fill: copy `src` into `dst` without communication.
#[derive(Clone, Debug)]
struct CopyPair {
    src: Box<[Range<usize>]>,
    dst: Box<[Range<usize>]>,
}

#[derive(Clone, Debug)]
enum SideAction {
    Skip,
    Comm(CommSide),
    Local(Vec<CopyPair>),
}

#[derive(Clone, Debug)]
struct AxisPlan {
    axis: usize,
    sides: [SideAction; 2],
}

/// Cached halo-exchange plan for one rank of a decomposition.
#[derive(Debug)]
pub struct HaloExchange {
    decomp: Arc<BlockDecomposition>,
    rank: usize,
    shape_h: Box<[usize]>,
    axes: Box<[AxisPlan]>,
    tags: ExchangeTags,
    timeout: Option<Duration>,
}

impl HaloExchange {
    /// Build the neighbour set and slab regions for `rank`.
    pub fn new(decomp: Arc<BlockDecomposition>, rank: usize) -> Result<Self, MpiArrayError> {
        let ext = decomp.extent(rank)?.clone();
        let shape_h = ext.shape_h().into_boxed_slice();
        let ndim = ext.ndim();
        let mut axes = Vec::with_capacity(ndim);
        for axis in 0..ndim {
            let sides = if ext.is_empty() {
                [SideAction::Skip, SideAction::Skip]
            } else {
                let lo = plan_side(&decomp, rank, &ext, &shape_h, axis, Dir::Lo)?;
                let hi = plan_side(&decomp, rank, &ext, &shape_h, axis, Dir::Hi)?;
                [lo, hi]
            };
            axes.push(AxisPlan { axis, sides });
        }
        log::debug!("rank {rank}: halo plan over {ndim} axes built");
        Ok(Self {
            decomp,
            rank,
            shape_h,
            axes: axes.into_boxed_slice(),
            tags: ExchangeTags::from_base(DEFAULT_EXCHANGE_TAG),
            timeout: None,
        })
    }

    /// Arm the watchdog: a receive that does not complete within `timeout`
    /// fails instead of hanging.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a caller-chosen tag block for this engine's messages.
    pub fn with_tags(mut self, tags: ExchangeTags) -> Self {
        self.tags = tags;
        self
    }

    /// Refresh every ghost slab, axis by axis in ascending order. Idempotent
    /// while interior data is unchanged (though it still communicates).
    pub fn exchange<V, C>(
        &self,
        array: &mut DistributedArray<V>,
        comm: &C,
    ) -> Result<(), MpiArrayError>
    where
        V: Pod,
        C: Communicator,
    {
        self.check_array(array)?;
        for plan in self.axes.iter() {
            self.run_axis(plan, array, comm)?;
        }
        Ok(())
    }

    /// Refresh the ghost slabs of a single axis. Corner ghosts are only
    /// fresh when lower axes were exchanged earlier in the same epoch.
    pub fn exchange_axis<V, C>(
        &self,
        axis: usize,
        array: &mut DistributedArray<V>,
        comm: &C,
    ) -> Result<(), MpiArrayError>
    where
        V: Pod,
        C: Communicator,
    {
        self.check_array(array)?;
        let plan = self.axes.get(axis).ok_or_else(|| {
            MpiArrayError::OutOfRange(format!(
                "axis {axis} outside array of rank {}",
                self.axes.len()
            ))
        })?;
        self.run_axis(plan, array, comm)
    }

    fn check_array<V: Pod>(&self, array: &DistributedArray<V>) -> Result<(), MpiArrayError> {
        if !Arc::ptr_eq(&self.decomp, array.decomposition()) || array.rank() != self.rank {
            return Err(MpiArrayError::InvalidPartition(
                "array was built from a different decomposition or rank than this plan".into(),
            ));
        }
        Ok(())
    }

    fn run_axis<V, C>(
        &self,
        plan: &AxisPlan,
        array: &mut DistributedArray<V>,
        comm: &C,
    ) -> Result<(), MpiArrayError>
    where
        V: Pod,
        C: Communicator,
    {
        let axis = plan.axis;

        // 1) post every receive before any send; the matched posting order
        //    on both ends rules out the same-direction deadlock
        let mut pending: Vec<(Dir, usize, C::RecvHandle, Vec<V>, &Region)> = Vec::new();
        for (side, dir) in izip!(plan.sides.iter(), Dir::BOTH) {
            if let SideAction::Comm(cs) = side {
                if let Some(region) = &cs.recv {
                    let mut buf = vec![V::zeroed(); region.count];
                    let h = comm.irecv(
                        cs.peer,
                        self.tags.slab(axis, dir),
                        wire::cast_slice_mut(&mut buf),
                    );
                    pending.push((dir, cs.peer, h, buf, region));
                }
            }
        }

        // 2) post the sends, keeping payloads alive until drained
        let mut send_handles = Vec::new();
        let mut send_bufs = Vec::new();
        for (side, dir) in izip!(plan.sides.iter(), Dir::BOTH) {
            if let SideAction::Comm(cs) = side {
                if let Some(region) = &cs.send {
                    let payload = pack_region(array.data(), &self.shape_h, &region.ranges);
                    log::trace!(
                        "rank {}: send {} elems to {} (axis {axis}, {dir} side)",
                        self.rank,
                        region.count,
                        cs.peer
                    );
                    send_handles.push(comm.isend(
                        cs.peer,
                        self.tags.slab(axis, dir.opposite()),
                        wire::cast_slice(&payload),
                    ));
                    send_bufs.push(payload);
                }
            }
        }

        // 3) wait and unpack; collect the first failure but keep draining
        let mut maybe_err: Option<MpiArrayError> = None;
        for (dir, peer, handle, mut buf, region) in pending {
            let expected = region.count * std::mem::size_of::<V>();
            let got = match self.timeout {
                Some(t) => handle.wait_timeout(t),
                None => handle.wait(),
            };
            match got {
                Some(data) if data.len() == expected => {
                    if maybe_err.is_none() {
                        wire::cast_slice_mut(&mut buf).copy_from_slice(&data);
                        unpack_region(array.data_mut(), &self.shape_h, &region.ranges, &buf);
                    }
                }
                Some(data) => {
                    if maybe_err.is_none() {
                        maybe_err = Some(MpiArrayError::ExchangeFailed {
                            neighbor: peer,
                            axis,
                            dir,
                            detail: format!("expected {expected} bytes, got {}", data.len()),
                        });
                    }
                }
                None => {
                    if maybe_err.is_none() {
                        maybe_err = Some(MpiArrayError::ExchangeFailed {
                            neighbor: peer,
                            axis,
                            dir,
                            detail: "receive timed out or transport failed".into(),
                        });
                    }
                }
            }
        }

        // 4) always drain send handles before returning
        for handle in send_handles {
            let _ = handle.wait();
        }
        drop(send_bufs);
        if let Some(err) = maybe_err {
            return Err(err);
        }

        // 5) purely local ghost fills (boundary clamp, periodic self-wrap)
        for side in plan.sides.iter() {
            if let SideAction::Local(copies) = side {
                for cp in copies {
                    let tmp = pack_region(array.data(), &self.shape_h, &cp.src);
                    unpack_region(array.data_mut(), &self.shape_h, &cp.dst, &tmp);
                }
            }
        }
        Ok(())
    }
}

/// Per-axis slab ranges for exchange axis `axis`: perpendicular axes below
/// it span the halo-inclusive range, axes above it the interior only.
fn slab_ranges(
    ext: &LocalExtent,
    shape_h: &[usize],
    axis: usize,
    axis_range: Range<usize>,
) -> Vec<Range<usize>> {
    (0..ext.ndim())
        .map(|b| {
            if b == axis {
                axis_range.clone()
            } else if b < axis {
                0..shape_h[b]
            } else {
                let (lo, _) = ext.halo(b);
                lo..lo + ext.interior_len(b)
            }
        })
        .collect()
}

/// Ghost slab of `dir` on `axis`, `depth` slots deep.
fn ghost_slab(ext: &LocalExtent, shape_h: &[usize], axis: usize, dir: Dir, depth: usize) -> Vec<Range<usize>> {
    let (lo, _) = ext.halo(axis);
    let n = ext.interior_len(axis);
    let range = match dir {
        Dir::Lo => lo - depth..lo,
        Dir::Hi => lo + n..lo + n + depth,
    };
    slab_ranges(ext, shape_h, axis, range)
}

/// Interior slab adjacent to the `dir` edge of `axis`, `depth` slots deep.
fn edge_slab(ext: &LocalExtent, shape_h: &[usize], axis: usize, dir: Dir, depth: usize) -> Vec<Range<usize>> {
    let (lo, _) = ext.halo(axis);
    let n = ext.interior_len(axis);
    let range = match dir {
        Dir::Lo => lo..lo + depth,
        Dir::Hi => lo + n - depth..lo + n,
    };
    slab_ranges(ext, shape_h, axis, range)
}

fn wrap_self_copies(
    ext: &LocalExtent,
    shape_h: &[usize],
    axis: usize,
    dir: Dir,
    depth: usize,
) -> Vec<CopyPair> {
    if depth == 0 {
        return Vec::new();
    }
    vec![CopyPair {
        src: edge_slab(ext, shape_h, axis, dir.opposite(), depth).into_boxed_slice(),
        dst: ghost_slab(ext, shape_h, axis, dir, depth).into_boxed_slice(),
    }]
}

fn clamp_copies(
    ext: &LocalExtent,
    shape_h: &[usize],
    axis: usize,
    dir: Dir,
    depth: usize,
) -> Vec<CopyPair> {
    let (lo, _) = ext.halo(axis);
    let n = ext.interior_len(axis);
    let edge = match dir {
        Dir::Lo => lo,
        Dir::Hi => lo + n - 1,
    };
    (0..depth)
        .map(|k| {
            let slot = match dir {
                Dir::Lo => lo - 1 - k,
                Dir::Hi => lo + n + k,
            };
            CopyPair {
                src: slab_ranges(ext, shape_h, axis, edge..edge + 1).into_boxed_slice(),
                dst: slab_ranges(ext, shape_h, axis, slot..slot + 1).into_boxed_slice(),
            }
        })
        .collect()
}

fn plan_side(
    decomp: &Arc<BlockDecomposition>,
    rank: usize,
    ext: &LocalExtent,
    shape_h: &[usize],
    axis: usize,
    dir: Dir,
) -> Result<SideAction, MpiArrayError> {
    let (h_lo, h_hi) = ext.halo(axis);
    let (recv_depth, send_depth) = match dir {
        Dir::Lo => (h_lo, h_hi),
        Dir::Hi => (h_hi, h_lo),
    };
    let policy = decomp.config().boundary(axis);
    let n = decomp.shape().axis_len(axis);
    let full_axis =
        ext.interior().start()[axis] == 0 && ext.interior().stop()[axis] == n;

    let local_fill = |depth: usize| -> SideAction {
        if depth == 0 {
            return SideAction::Skip;
        }
        match policy {
            BoundaryPolicy::Periodic => {
                SideAction::Local(wrap_self_copies(ext, shape_h, axis, dir, depth))
            }
            BoundaryPolicy::Clamped => {
                SideAction::Local(clamp_copies(ext, shape_h, axis, dir, depth))
            }
            BoundaryPolicy::None => SideAction::Skip,
        }
    };

    if full_axis {
        return Ok(local_fill(recv_depth));
    }
    match decomp.neighbor(rank, axis, dir)? {
        Some(peer) if peer == rank => {
            // periodic walk found only this rank; wrap onto ourselves
            Ok(local_fill(recv_depth))
        }
        Some(peer) => {
            let recv = (recv_depth > 0)
                .then(|| Region::new(ghost_slab(ext, shape_h, axis, dir, recv_depth)));
            let send = (send_depth > 0)
                .then(|| Region::new(edge_slab(ext, shape_h, axis, dir, send_depth)));
            if recv.is_none() && send.is_none() {
                Ok(SideAction::Skip)
            } else {
                Ok(SideAction::Comm(CommSide { peer, recv, send }))
            }
        }
        None => Ok(local_fill(recv_depth)),
    }
}
