//! Index-range arithmetic for tiles of a cartesian decomposition.
//!
//! [`IndexingExtent`] is a half-open `[start, stop)` box in global
//! coordinates; [`LocalExtent`] adds per-axis ghost depths and the
//! global↔local mapping into the halo-inclusive local buffer. Region
//! helpers iterate row-major sub-boxes of a flat buffer as contiguous
//! last-axis runs so pack/unpack stay `copy_from_slice` loops.

use std::fmt;
use std::ops::Range;

use itertools::izip;

use crate::error::MpiArrayError;

/// Low/high side of an axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Dir {
    Lo,
    Hi,
}

impl Dir {
    /// Both sides, low first. Plans and tags iterate in this order.
    pub const BOTH: [Dir; 2] = [Dir::Lo, Dir::Hi];

    #[inline]
    pub fn opposite(self) -> Dir {
        match self {
            Dir::Lo => Dir::Hi,
            Dir::Hi => Dir::Lo,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Dir::Lo => 0,
            Dir::Hi => 1,
        }
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dir::Lo => write!(f, "low"),
            Dir::Hi => write!(f, "high"),
        }
    }
}

/// Shape of the full logical array, independent of any distribution.
///
/// Immutable once created; every axis has length ≥ 1 (local tiles may still
/// be empty when processes outnumber elements along an axis).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GlobalShape(Box<[usize]>);

impl GlobalShape {
    pub fn new(axes: impl Into<Vec<usize>>) -> Result<Self, MpiArrayError> {
        let axes: Vec<usize> = axes.into();
        if axes.is_empty() {
            return Err(MpiArrayError::InvalidPartition(
                "global shape must have at least one axis".into(),
            ));
        }
        if let Some(a) = axes.iter().position(|&n| n == 0) {
            return Err(MpiArrayError::InvalidPartition(format!(
                "global axis {a} has zero length"
            )));
        }
        Ok(Self(axes.into_boxed_slice()))
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn axes(&self) -> &[usize] {
        &self.0
    }

    #[inline]
    pub fn axis_len(&self, axis: usize) -> usize {
        self.0[axis]
    }

    /// Total number of elements in the logical array.
    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }

    /// True if `idx` addresses an element of the logical array.
    pub fn contains(&self, idx: &[usize]) -> bool {
        idx.len() == self.0.len() && izip!(idx, self.0.iter()).all(|(i, n)| i < n)
    }
}

/// Half-open index range per axis for a single tile, in global coordinates.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexingExtent {
    start: Box<[usize]>,
    stop: Box<[usize]>,
}

impl IndexingExtent {
    /// `start[a] <= stop[a]` must hold on every axis.
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Self {
        debug_assert_eq!(start.len(), stop.len());
        debug_assert!(izip!(&start, &stop).all(|(b, e)| b <= e));
        Self {
            start: start.into_boxed_slice(),
            stop: stop.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    #[inline]
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    #[inline]
    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    pub fn shape(&self) -> Vec<usize> {
        izip!(self.stop.iter(), self.start.iter())
            .map(|(e, b)| e - b)
            .collect()
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if any axis has zero length.
    pub fn is_empty(&self) -> bool {
        izip!(self.start.iter(), self.stop.iter()).any(|(b, e)| b == e)
    }

    /// Intersection with `other`, or `None` when the boxes do not overlap.
    pub fn intersection(&self, other: &IndexingExtent) -> Option<IndexingExtent> {
        debug_assert_eq!(self.ndim(), other.ndim());
        let start: Vec<usize> = izip!(self.start.iter(), other.start.iter())
            .map(|(a, b)| (*a).max(*b))
            .collect();
        let stop: Vec<usize> = izip!(self.stop.iter(), other.stop.iter())
            .map(|(a, b)| (*a).min(*b))
            .collect();
        if izip!(&start, &stop).any(|(b, e)| b >= e) {
            None
        } else {
            Some(IndexingExtent::new(start, stop))
        }
    }

    pub fn contains(&self, idx: &[usize]) -> bool {
        idx.len() == self.ndim()
            && izip!(idx, self.start.iter(), self.stop.iter()).all(|(i, b, e)| b <= i && i < e)
    }

    /// Per-axis global ranges of this extent.
    pub fn ranges(&self) -> Vec<Range<usize>> {
        izip!(self.start.iter(), self.stop.iter())
            .map(|(b, e)| *b..*e)
            .collect()
    }
}

/// Tile extent plus per-axis ghost depths.
///
/// `interior` excludes ghost elements; local (buffer) indices address the
/// halo-inclusive box, so an interior position `g` lives at local index
/// `g - start + halo_lo` on each axis.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LocalExtent {
    interior: IndexingExtent,
    halo_lo: Box<[usize]>,
    halo_hi: Box<[usize]>,
}

impl LocalExtent {
    pub fn new(interior: IndexingExtent, halo_lo: Vec<usize>, halo_hi: Vec<usize>) -> Self {
        debug_assert_eq!(interior.ndim(), halo_lo.len());
        debug_assert_eq!(interior.ndim(), halo_hi.len());
        Self {
            interior,
            halo_lo: halo_lo.into_boxed_slice(),
            halo_hi: halo_hi.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.interior.ndim()
    }

    #[inline]
    pub fn interior(&self) -> &IndexingExtent {
        &self.interior
    }

    /// Ghost depth `(low, high)` on `axis`.
    #[inline]
    pub fn halo(&self, axis: usize) -> (usize, usize) {
        (self.halo_lo[axis], self.halo_hi[axis])
    }

    /// Interior length along `axis`.
    #[inline]
    pub fn interior_len(&self, axis: usize) -> usize {
        self.interior.stop()[axis] - self.interior.start()[axis]
    }

    /// Shape of the interior ("no halo").
    pub fn shape_n(&self) -> Vec<usize> {
        self.interior.shape()
    }

    /// Shape of the halo-inclusive local buffer.
    pub fn shape_h(&self) -> Vec<usize> {
        izip!(
            self.interior.start().iter(),
            self.interior.stop().iter(),
            self.halo_lo.iter(),
            self.halo_hi.iter()
        )
        .map(|(b, e, lo, hi)| (e - b) + lo + hi)
        .collect()
    }

    pub fn num_elements_n(&self) -> usize {
        self.shape_n().iter().product()
    }

    pub fn num_elements_h(&self) -> usize {
        self.shape_h().iter().product()
    }

    /// True if the interior has zero length on any axis.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.interior.is_empty()
    }

    /// Local buffer index of a global position held by this tile (interior
    /// or ghost), or `None` when the position falls outside both.
    ///
    /// The mapping is pure index arithmetic over the halo-inclusive box;
    /// whether a position exists in the logical array is checked against
    /// [`GlobalShape`] by the caller. Ghost slots below global index 0 are
    /// unaddressable here and only reachable through the local views.
    pub fn global_to_local(&self, gidx: &[usize]) -> Option<Vec<usize>> {
        if gidx.len() != self.ndim() {
            return None;
        }
        let mut out = Vec::with_capacity(gidx.len());
        for (g, b, e, lo, hi) in izip!(
            gidx,
            self.interior.start().iter(),
            self.interior.stop().iter(),
            self.halo_lo.iter(),
            self.halo_hi.iter()
        ) {
            // `g + lo >= b` is the underflow-safe form of `g >= b - lo`.
            if g + lo < *b || *g >= e + hi {
                return None;
            }
            out.push(g + lo - b);
        }
        Some(out)
    }

    /// Global position of a local buffer index. `None` for ghost slots that
    /// sit below global index 0; high-side slots past the domain edge map to
    /// positions the caller must check against [`GlobalShape`].
    pub fn local_to_global(&self, lidx: &[usize]) -> Option<Vec<usize>> {
        if lidx.len() != self.ndim() {
            return None;
        }
        let mut out = Vec::with_capacity(lidx.len());
        for (l, b, lo) in izip!(lidx, self.interior.start().iter(), self.halo_lo.iter()) {
            if l + b < *lo {
                return None; // ghost slot below global index 0
            }
            out.push(l + b - lo);
        }
        Some(out)
    }

    /// Per-axis local ranges of the interior inside the halo-inclusive buffer.
    pub fn interior_local_ranges(&self) -> Vec<Range<usize>> {
        izip!(
            self.halo_lo.iter(),
            self.interior.start().iter(),
            self.interior.stop().iter()
        )
        .map(|(lo, b, e)| *lo..lo + (e - b))
        .collect()
    }
}

// --- row-major region helpers -------------------------------------------

/// Row-major strides of a buffer with extents `shape`.
pub(crate) fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let ndim = shape.len();
    let mut strides = vec![1usize; ndim];
    for a in (0..ndim.saturating_sub(1)).rev() {
        strides[a] = strides[a + 1] * shape[a + 1];
    }
    strides
}

/// Number of elements addressed by `ranges`.
pub(crate) fn region_len(ranges: &[Range<usize>]) -> usize {
    ranges.iter().map(|r| r.end - r.start).product()
}

/// Visit the sub-box `ranges` of a row-major buffer with extents `shape`
/// as `(offset, len)` runs contiguous along the last axis, in row-major
/// order. Deterministic; both ends of an exchange rely on it.
pub(crate) fn for_each_run(
    shape: &[usize],
    ranges: &[Range<usize>],
    mut f: impl FnMut(usize, usize),
) {
    debug_assert_eq!(shape.len(), ranges.len());
    let ndim = shape.len();
    if ndim == 0 {
        f(0, 1);
        return;
    }
    if ranges.iter().any(|r| r.is_empty()) {
        return;
    }
    let run = ranges[ndim - 1].end - ranges[ndim - 1].start;
    let strides = row_major_strides(shape);
    let mut idx: Vec<usize> = ranges.iter().map(|r| r.start).collect();
    loop {
        let off: usize = izip!(&idx, &strides).map(|(i, s)| i * s).sum();
        f(off, run);
        if ndim == 1 {
            return;
        }
        // advance the odometer over all axes but the last
        let mut a = ndim - 1;
        loop {
            if a == 0 {
                return;
            }
            a -= 1;
            idx[a] += 1;
            if idx[a] < ranges[a].end {
                break;
            }
            idx[a] = ranges[a].start;
        }
    }
}

/// Copy the sub-box `ranges` of `data` into a fresh contiguous buffer.
pub(crate) fn pack_region<V: Copy>(data: &[V], shape: &[usize], ranges: &[Range<usize>]) -> Vec<V> {
    let mut out = Vec::with_capacity(region_len(ranges));
    for_each_run(shape, ranges, |off, len| {
        out.extend_from_slice(&data[off..off + len]);
    });
    out
}

/// Scatter a contiguous buffer back into the sub-box `ranges` of `data`.
/// `src` must hold exactly `region_len(ranges)` elements.
pub(crate) fn unpack_region<V: Copy>(
    data: &mut [V],
    shape: &[usize],
    ranges: &[Range<usize>],
    src: &[V],
) {
    debug_assert_eq!(src.len(), region_len(ranges));
    let mut k = 0usize;
    for_each_run(shape, ranges, |off, len| {
        data[off..off + len].copy_from_slice(&src[k..k + len]);
        k += len;
    });
}
