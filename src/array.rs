//! The user-facing distributed container: one rank's halo-inclusive buffer
//! bound to its partition descriptor.
//!
//! Interior cells are authoritative and freely mutable by the owning rank.
//! Ghost cells are scratch space between exchanges: `set` on a ghost cell is
//! permitted but its value is undefined until the next halo exchange
//! overwrites it.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use itertools::izip;

use crate::decomposition::BlockDecomposition;
use crate::error::MpiArrayError;
use crate::indexing::{LocalExtent, pack_region, row_major_strides};

/// N-dimensional array partitioned over a process group; this value is the
/// local piece held by `rank`, stored row-major including ghost slots.
#[derive(Debug)]
pub struct DistributedArray<V> {
    decomp: Arc<BlockDecomposition>,
    rank: usize,
    shape_h: Box<[usize]>,
    strides: Box<[usize]>,
    data: Vec<V>,
}

impl<V: Pod> DistributedArray<V> {
    /// Zero-initialized local buffer for `rank`'s extent.
    pub fn new(decomp: Arc<BlockDecomposition>, rank: usize) -> Result<Self, MpiArrayError> {
        let extent = decomp.extent(rank)?;
        let shape_h = extent.shape_h().into_boxed_slice();
        let strides = row_major_strides(&shape_h).into_boxed_slice();
        let len = shape_h.iter().product();
        Ok(Self {
            decomp,
            rank,
            shape_h,
            strides,
            data: vec![V::zeroed(); len],
        })
    }

    #[inline]
    pub fn decomposition(&self) -> &Arc<BlockDecomposition> {
        &self.decomp
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// This rank's extent descriptor.
    pub fn extent(&self) -> &LocalExtent {
        self.decomp
            .extent(self.rank)
            .expect("rank validated at construction")
    }

    /// Shape of the halo-inclusive local buffer.
    #[inline]
    pub fn shape_h(&self) -> &[usize] {
        &self.shape_h
    }

    fn local_offset(&self, lidx: &[usize]) -> usize {
        izip!(lidx, self.strides.iter()).map(|(i, s)| i * s).sum()
    }

    /// Value at a global index held by this rank (interior or ghost).
    pub fn get(&self, gidx: &[usize]) -> Result<V, MpiArrayError> {
        let ext = self.extent();
        if gidx.len() != ext.ndim() {
            return Err(MpiArrayError::ShapeMismatch {
                expected: ext.ndim(),
                found: gidx.len(),
            });
        }
        match ext.global_to_local(gidx) {
            Some(lidx) => Ok(self.data[self.local_offset(&lidx)]),
            None => Err(MpiArrayError::OutOfLocalRange {
                rank: self.rank,
                index: gidx.to_vec(),
            }),
        }
    }

    /// Store a value at a global index held by this rank. Writing a ghost
    /// cell is allowed; the next exchange overwrites it.
    pub fn set(&mut self, gidx: &[usize], value: V) -> Result<(), MpiArrayError> {
        let ext = self.extent();
        if gidx.len() != ext.ndim() {
            return Err(MpiArrayError::ShapeMismatch {
                expected: ext.ndim(),
                found: gidx.len(),
            });
        }
        match ext.global_to_local(gidx) {
            Some(lidx) => {
                let off = self.local_offset(&lidx);
                self.data[off] = value;
                Ok(())
            }
            None => Err(MpiArrayError::OutOfLocalRange {
                rank: self.rank,
                index: gidx.to_vec(),
            }),
        }
    }

    /// Full local buffer including ghost slots.
    pub fn local_view(&self) -> LocalView<'_, V> {
        LocalView {
            data: &self.data,
            shape: &self.shape_h,
            strides: &self.strides,
        }
    }

    /// Mutable full local buffer including ghost slots.
    pub fn local_view_mut(&mut self) -> LocalViewMut<'_, V> {
        LocalViewMut {
            data: &mut self.data,
            shape: &self.shape_h,
            strides: &self.strides,
        }
    }

    /// Interior (authoritative) region, ghost slots excluded.
    pub fn interior_view(&self) -> InteriorView<'_, V> {
        let ext = self.extent();
        InteriorView {
            data: &self.data,
            shape_h: &self.shape_h,
            strides: &self.strides,
            ranges: ext.interior_local_ranges().into_boxed_slice(),
        }
    }

    /// Populate every interior cell from its global index.
    pub fn fill_interior(&mut self, mut f: impl FnMut(&[usize]) -> V) {
        let ext = self.extent().clone();
        if ext.is_empty() {
            return;
        }
        let ndim = ext.ndim();
        let start = ext.interior().start().to_vec();
        let stop = ext.interior().stop().to_vec();
        let halo_lo: Vec<usize> = (0..ndim).map(|a| ext.halo(a).0).collect();
        let mut g = start.clone();
        loop {
            let off: usize = izip!(&g, &start, &halo_lo, self.strides.iter())
                .map(|(gi, b, lo, s)| (gi - b + lo) * s)
                .sum();
            self.data[off] = f(&g);
            let mut a = ndim;
            loop {
                if a == 0 {
                    return;
                }
                a -= 1;
                g[a] += 1;
                if g[a] < stop[a] {
                    break;
                }
                g[a] = start[a];
            }
        }
    }

    /// Parallel interior fill, one first-axis plane per task.
    #[cfg(feature = "rayon")]
    pub fn par_fill_interior(&mut self, f: impl Fn(&[usize]) -> V + Sync) {
        use rayon::prelude::*;
        let ext = self.extent().clone();
        if ext.is_empty() {
            return;
        }
        let ndim = ext.ndim();
        let start = ext.interior().start().to_vec();
        let stop = ext.interior().stop().to_vec();
        let halo_lo: Vec<usize> = (0..ndim).map(|a| ext.halo(a).0).collect();
        let strides = self.strides.clone();
        let plane = if ndim > 1 { strides[0] } else { 1 };
        self.data
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(p0, chunk)| {
                // plane index back to the global first-axis coordinate
                if p0 < halo_lo[0] || p0 >= halo_lo[0] + (stop[0] - start[0]) {
                    return;
                }
                let g0 = start[0] + (p0 - halo_lo[0]);
                if ndim == 1 {
                    chunk[0] = f(&[g0]);
                    return;
                }
                let mut g: Vec<usize> = start.clone();
                g[0] = g0;
                loop {
                    let off: usize = izip!(&g[1..], &start[1..], &halo_lo[1..], &strides[1..])
                        .map(|(gi, b, lo, s)| (gi - b + lo) * s)
                        .sum();
                    chunk[off] = f(&g);
                    let mut a = ndim;
                    loop {
                        if a == 1 {
                            return;
                        }
                        a -= 1;
                        g[a] += 1;
                        if g[a] < stop[a] {
                            break;
                        }
                        g[a] = start[a];
                    }
                }
            });
    }

    pub(crate) fn data(&self) -> &[V] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [V] {
        &mut self.data
    }
}

/// Read-only view of the halo-inclusive local buffer.
#[derive(Copy, Clone)]
pub struct LocalView<'a, V> {
    data: &'a [V],
    shape: &'a [usize],
    strides: &'a [usize],
}

impl<'a, V> LocalView<'a, V> {
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.shape
    }

    #[inline]
    pub fn as_slice(&self) -> &'a [V] {
        self.data
    }

    /// Element at a local (buffer) index.
    pub fn get(&self, lidx: &[usize]) -> Option<&'a V> {
        if lidx.len() != self.shape.len() || izip!(lidx, self.shape).any(|(i, n)| i >= n) {
            return None;
        }
        let off: usize = izip!(lidx, self.strides).map(|(i, s)| i * s).sum();
        self.data.get(off)
    }
}

/// Mutable view of the halo-inclusive local buffer.
pub struct LocalViewMut<'a, V> {
    data: &'a mut [V],
    shape: &'a [usize],
    strides: &'a [usize],
}

impl<V> LocalViewMut<'_, V> {
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.shape
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [V] {
        self.data
    }

    pub fn get_mut(&mut self, lidx: &[usize]) -> Option<&mut V> {
        if lidx.len() != self.shape.len() || izip!(lidx, self.shape.iter()).any(|(i, n)| i >= n) {
            return None;
        }
        let off: usize = izip!(lidx, self.strides).map(|(i, s)| i * s).sum();
        self.data.get_mut(off)
    }
}

/// Read-only view of the interior region.
pub struct InteriorView<'a, V> {
    data: &'a [V],
    shape_h: &'a [usize],
    strides: &'a [usize],
    ranges: Box<[std::ops::Range<usize>]>,
}

impl<V: Copy> InteriorView<'_, V> {
    /// Interior shape.
    pub fn shape(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.end - r.start).collect()
    }

    /// Element at an interior-relative index.
    pub fn get(&self, idx: &[usize]) -> Option<&V> {
        if idx.len() != self.ranges.len() {
            return None;
        }
        let mut off = 0usize;
        for (i, r, s) in izip!(idx, self.ranges.iter(), self.strides) {
            if i + r.start >= r.end {
                return None;
            }
            off += (i + r.start) * s;
        }
        self.data.get(off)
    }

    /// Pack the interior into a contiguous row-major vector.
    pub fn to_vec(&self) -> Vec<V> {
        pack_region(self.data, self.shape_h, &self.ranges)
    }
}
