//! Block decomposition of a global shape over a cartesian process grid.
//!
//! Split axes divide as evenly as possible; when the length is not evenly
//! divisible the first `length mod grid_dim` coordinates along that axis
//! receive one extra element (low ranks own the remainder). Non-split axes
//! are replicated in full on every process along that grid dimension; ranks
//! with coordinate 0 on every replicated dimension are *primary replicas*
//! and their interiors tile the global shape exactly.

use itertools::izip;

use crate::error::MpiArrayError;
use crate::indexing::{Dir, GlobalShape, IndexingExtent, LocalExtent};
use crate::topology::CartTopology;

/// Rule for ghost-cell content at the edge of the global domain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BoundaryPolicy {
    /// Ghost slots are allocated but never written by the exchange engine.
    #[default]
    None,
    /// Ghosts reuse the nearest interior value.
    Clamped,
    /// Ghosts wrap to the opposite edge of the domain.
    Periodic,
}

/// Immutable per-axis decomposition settings: which axes are split, ghost
/// depths (low, high) and the boundary rule at the domain edge.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DecompConfig {
    split: Box<[bool]>,
    halo: Box<[(usize, usize)]>,
    boundary: Box<[BoundaryPolicy]>,
}

impl DecompConfig {
    /// All axes split, zero halo, `BoundaryPolicy::None` everywhere.
    pub fn new(ndim: usize) -> Self {
        Self {
            split: vec![true; ndim].into_boxed_slice(),
            halo: vec![(0, 0); ndim].into_boxed_slice(),
            boundary: vec![BoundaryPolicy::None; ndim].into_boxed_slice(),
        }
    }

    /// Symmetric ghost depth on every axis.
    pub fn with_halo(mut self, depth: usize) -> Self {
        for h in self.halo.iter_mut() {
            *h = (depth, depth);
        }
        self
    }

    /// Asymmetric ghost depth on one axis.
    pub fn with_halo_axis(mut self, axis: usize, lo: usize, hi: usize) -> Self {
        assert!(axis < self.ndim(), "axis {axis} out of range");
        self.halo[axis] = (lo, hi);
        self
    }

    /// Boundary rule on every axis.
    pub fn with_boundary(mut self, policy: BoundaryPolicy) -> Self {
        for b in self.boundary.iter_mut() {
            *b = policy;
        }
        self
    }

    /// Boundary rule on one axis.
    pub fn with_boundary_axis(mut self, axis: usize, policy: BoundaryPolicy) -> Self {
        assert!(axis < self.ndim(), "axis {axis} out of range");
        self.boundary[axis] = policy;
        self
    }

    /// Replace the split flags.
    pub fn with_split(mut self, split: &[bool]) -> Self {
        assert_eq!(split.len(), self.ndim(), "split flags must cover every axis");
        self.split = split.to_vec().into_boxed_slice();
        self
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.split.len()
    }

    #[inline]
    pub fn split(&self) -> &[bool] {
        &self.split
    }

    #[inline]
    pub fn halo(&self, axis: usize) -> (usize, usize) {
        self.halo[axis]
    }

    #[inline]
    pub fn boundary(&self, axis: usize) -> BoundaryPolicy {
        self.boundary[axis]
    }
}

/// Partition of a global shape over a cartesian grid: the per-rank extent
/// table, computed identically on every process.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct BlockDecomposition {
    shape: GlobalShape,
    topology: CartTopology,
    config: DecompConfig,
    extents: Box<[LocalExtent]>,
}

impl BlockDecomposition {
    pub fn new(
        shape: GlobalShape,
        topology: CartTopology,
        config: DecompConfig,
    ) -> Result<Self, MpiArrayError> {
        if topology.ndims() != shape.ndim() {
            return Err(MpiArrayError::ShapeMismatch {
                expected: shape.ndim(),
                found: topology.ndims(),
            });
        }
        if config.ndim() != shape.ndim() {
            return Err(MpiArrayError::ShapeMismatch {
                expected: shape.ndim(),
                found: config.ndim(),
            });
        }

        let ndim = shape.ndim();
        let mut extents = Vec::with_capacity(topology.size());
        for rank in 0..topology.size() {
            let coord = topology.rank_to_coord(rank)?;
            let mut start = Vec::with_capacity(ndim);
            let mut stop = Vec::with_capacity(ndim);
            for (a, &c) in coord.iter().enumerate() {
                let n = shape.axis_len(a);
                if config.split()[a] {
                    let d = topology.dims()[a];
                    let (b, e) = block_bounds(n, d, c);
                    start.push(b);
                    stop.push(e);
                } else {
                    start.push(0);
                    stop.push(n);
                }
            }
            let interior = IndexingExtent::new(start, stop);
            // ranks with no interior carry no ghost slots at all
            let (halo_lo, halo_hi) = if interior.is_empty() {
                (vec![0; ndim], vec![0; ndim])
            } else {
                let mut lo = Vec::with_capacity(ndim);
                let mut hi = Vec::with_capacity(ndim);
                for a in 0..ndim {
                    let (l, h) = config.halo(a);
                    lo.push(l);
                    hi.push(h);
                }
                (lo, hi)
            };
            extents.push(LocalExtent::new(interior, halo_lo, halo_hi));
        }

        // A ghost slab deeper than the interior it would be served from has
        // no single owner; reject it.
        for (rank, ext) in extents.iter().enumerate() {
            if ext.is_empty() {
                continue;
            }
            for a in 0..ndim {
                let (lo, hi) = config.halo(a);
                let len = ext.interior_len(a);
                if lo.max(hi) > len {
                    return Err(MpiArrayError::InvalidPartition(format!(
                        "halo depth ({lo},{hi}) exceeds interior extent {len} on axis {a} of rank {rank}"
                    )));
                }
            }
        }

        let decomp = Self {
            shape,
            topology,
            config,
            extents: extents.into_boxed_slice(),
        };
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        decomp.validate_tiling()?;
        log::debug!(
            "decomposed {:?} over grid {:?}",
            decomp.shape.axes(),
            decomp.topology.dims()
        );
        Ok(decomp)
    }

    #[inline]
    pub fn shape(&self) -> &GlobalShape {
        &self.shape
    }

    #[inline]
    pub fn topology(&self) -> &CartTopology {
        &self.topology
    }

    #[inline]
    pub fn config(&self) -> &DecompConfig {
        &self.config
    }

    #[inline]
    pub fn num_ranks(&self) -> usize {
        self.extents.len()
    }

    pub fn extent(&self, rank: usize) -> Result<&LocalExtent, MpiArrayError> {
        self.extents.get(rank).ok_or_else(|| {
            MpiArrayError::OutOfRange(format!(
                "rank {rank} outside process group of size {}",
                self.extents.len()
            ))
        })
    }

    pub fn extents(&self) -> impl Iterator<Item = &LocalExtent> {
        self.extents.iter()
    }

    /// True when `rank` sits at grid coordinate 0 on every replicated
    /// dimension; primary replicas define the tiling and contribute to
    /// global collectives.
    pub fn is_primary_replica(&self, rank: usize) -> Result<bool, MpiArrayError> {
        let coord = self.topology.rank_to_coord(rank)?;
        Ok(izip!(&coord, self.config.split(), self.topology.dims())
            .all(|(c, split, d)| *split || *d == 1 || *c == 0))
    }

    /// Nearest rank with a non-empty interior one or more steps along
    /// `axis` in direction `dir`, wrapping when the axis is periodic.
    ///
    /// `Ok(None)` at the domain edge; `Ok(Some(rank))` — the rank itself —
    /// when a periodic walk wraps all the way around.
    pub fn neighbor(
        &self,
        rank: usize,
        axis: usize,
        dir: Dir,
    ) -> Result<Option<usize>, MpiArrayError> {
        if axis >= self.shape.ndim() {
            return Err(MpiArrayError::OutOfRange(format!(
                "axis {axis} outside array of rank {}",
                self.shape.ndim()
            )));
        }
        let periodic = self.config.boundary(axis) == BoundaryPolicy::Periodic;
        let home = self.topology.rank_to_coord(rank)?;
        let mut coord = home.clone();
        loop {
            coord = match self.topology.shift(&coord, axis, dir, periodic) {
                Some(c) => c,
                None => return Ok(None),
            };
            if coord == home {
                return Ok(Some(rank));
            }
            let r = self.topology.coord_to_rank(&coord)?;
            if !self.extents[r].is_empty() {
                return Ok(Some(r));
            }
        }
    }

    /// Interiors of primary replicas must tile the global shape exactly:
    /// no overlap, no gaps.
    #[cfg(any(debug_assertions, feature = "check-invariants"))]
    pub fn validate_tiling(&self) -> Result<(), MpiArrayError> {
        let mut covered = 0usize;
        for rank in 0..self.num_ranks() {
            if !self.is_primary_replica(rank)? {
                continue;
            }
            let ext = &self.extents[rank];
            covered += ext.interior().num_elements();
            for other in rank + 1..self.num_ranks() {
                if !self.is_primary_replica(other)? {
                    continue;
                }
                if !ext.interior().is_empty()
                    && !self.extents[other].interior().is_empty()
                    && ext
                        .interior()
                        .intersection(self.extents[other].interior())
                        .is_some()
                {
                    return Err(MpiArrayError::InvalidPartition(format!(
                        "interiors of ranks {rank} and {other} overlap"
                    )));
                }
            }
        }
        if covered != self.shape.num_elements() {
            return Err(MpiArrayError::InvalidPartition(format!(
                "interiors cover {covered} of {} elements",
                self.shape.num_elements()
            )));
        }
        Ok(())
    }
}

/// Per-axis block bounds: coordinate `c` of `d` blocks over `n` elements;
/// the first `n mod d` coordinates get one extra element.
fn block_bounds(n: usize, d: usize, c: usize) -> (usize, usize) {
    let base = n / d;
    let rem = n % d;
    let start = c * base + c.min(rem);
    let extra = usize::from(c < rem);
    (start, start + base + extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decomp_1d(n: usize, p: usize, halo: usize) -> BlockDecomposition {
        let shape = GlobalShape::new(vec![n]).unwrap();
        let topo = CartTopology::with_dims(p, &[p]).unwrap();
        let cfg = DecompConfig::new(1).with_halo(halo);
        BlockDecomposition::new(shape, topo, cfg).unwrap()
    }

    #[test]
    fn remainder_goes_to_low_ranks() {
        let d = decomp_1d(9, 4, 0);
        let bounds: Vec<_> = d
            .extents()
            .map(|e| (e.interior().start()[0], e.interior().stop()[0]))
            .collect();
        assert_eq!(bounds, vec![(0, 3), (3, 5), (5, 7), (7, 9)]);
    }

    #[test]
    fn even_split_of_ten_over_two() {
        let d = decomp_1d(10, 2, 1);
        assert_eq!(d.extent(0).unwrap().interior().stop()[0], 5);
        assert_eq!(d.extent(1).unwrap().interior().start()[0], 5);
        assert_eq!(d.extent(0).unwrap().shape_h(), vec![7]);
    }

    #[test]
    fn more_ranks_than_elements_yields_empty_extents() {
        let d = decomp_1d(3, 5, 1);
        let lens: Vec<_> = d.extents().map(|e| e.interior_len(0)).collect();
        assert_eq!(lens, vec![1, 1, 1, 0, 0]);
        // empty ranks carry no ghost slots
        assert_eq!(d.extent(4).unwrap().num_elements_h(), 0);
        assert_eq!(d.extent(0).unwrap().shape_h(), vec![3]);
    }

    #[test]
    fn halo_deeper_than_interior_is_rejected() {
        let shape = GlobalShape::new(vec![10]).unwrap();
        let topo = CartTopology::with_dims(8, &[8]).unwrap();
        let cfg = DecompConfig::new(1).with_halo(2);
        assert!(matches!(
            BlockDecomposition::new(shape, topo, cfg),
            Err(MpiArrayError::InvalidPartition(_))
        ));
    }

    #[test]
    fn rank_count_mismatch_is_shape_mismatch() {
        let shape = GlobalShape::new(vec![10, 10]).unwrap();
        let topo = CartTopology::with_dims(4, &[4]).unwrap();
        let cfg = DecompConfig::new(2);
        assert!(matches!(
            BlockDecomposition::new(shape, topo, cfg),
            Err(MpiArrayError::ShapeMismatch {
                expected: 2,
                found: 1
            })
        ));
        let shape = GlobalShape::new(vec![10]).unwrap();
        let topo = CartTopology::with_dims(4, &[4]).unwrap();
        let cfg = DecompConfig::new(2);
        assert!(matches!(
            BlockDecomposition::new(shape, topo, cfg),
            Err(MpiArrayError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn neighbor_walk_skips_empty_interiors() {
        let d = decomp_1d(3, 5, 1);
        // rank 2 is the last non-empty rank; nothing beyond it
        assert_eq!(d.neighbor(2, 0, Dir::Hi).unwrap(), None);
        assert_eq!(d.neighbor(2, 0, Dir::Lo).unwrap(), Some(1));
        // rank 3 is empty but the walk from rank 4 still skips it
        assert_eq!(d.neighbor(4, 0, Dir::Lo).unwrap(), Some(2));
    }

    #[test]
    fn periodic_walk_wraps_to_opposite_edge() {
        let shape = GlobalShape::new(vec![8]).unwrap();
        let topo = CartTopology::with_dims(4, &[4]).unwrap();
        let cfg = DecompConfig::new(1)
            .with_halo(1)
            .with_boundary(BoundaryPolicy::Periodic);
        let d = BlockDecomposition::new(shape, topo, cfg).unwrap();
        assert_eq!(d.neighbor(0, 0, Dir::Lo).unwrap(), Some(3));
        assert_eq!(d.neighbor(3, 0, Dir::Hi).unwrap(), Some(0));
    }

    #[test]
    fn periodic_walk_with_single_owner_returns_self() {
        let shape = GlobalShape::new(vec![2]).unwrap();
        let topo = CartTopology::with_dims(3, &[3]).unwrap();
        let cfg = DecompConfig::new(1)
            .with_halo(1)
            .with_boundary(BoundaryPolicy::Periodic);
        let d = BlockDecomposition::new(shape, topo, cfg).unwrap();
        // extents are [1, 1, 0]; from rank 0 the low walk skips rank 2
        assert_eq!(d.neighbor(0, 0, Dir::Lo).unwrap(), Some(1));
        let shape = GlobalShape::new(vec![1]).unwrap();
        let topo = CartTopology::with_dims(3, &[3]).unwrap();
        let cfg = DecompConfig::new(1)
            .with_halo(1)
            .with_boundary(BoundaryPolicy::Periodic);
        let d = BlockDecomposition::new(shape, topo, cfg).unwrap();
        assert_eq!(d.neighbor(0, 0, Dir::Lo).unwrap(), Some(0));
    }

    #[test]
    fn replicated_axis_has_one_primary() {
        let shape = GlobalShape::new(vec![4, 6]).unwrap();
        let topo = CartTopology::with_dims(4, &[2, 2]).unwrap();
        let cfg = DecompConfig::new(2).with_split(&[true, false]);
        let d = BlockDecomposition::new(shape, topo, cfg).unwrap();
        // axis 1 replicated over two grid columns
        assert_eq!(d.extent(1).unwrap().interior().shape(), vec![2, 6]);
        assert!(d.is_primary_replica(0).unwrap());
        assert!(!d.is_primary_replica(1).unwrap());
        assert!(d.is_primary_replica(2).unwrap());
    }

    #[test]
    fn two_dimensional_tiling() {
        let shape = GlobalShape::new(vec![5, 7]).unwrap();
        let topo = CartTopology::with_dims(6, &[2, 3]).unwrap();
        let cfg = DecompConfig::new(2).with_halo(1);
        let d = BlockDecomposition::new(shape, topo, cfg).unwrap();
        let total: usize = d.extents().map(|e| e.interior().num_elements()).sum();
        assert_eq!(total, 35);
        assert_eq!(d.extent(0).unwrap().interior().shape(), vec![3, 3]);
    }

    #[test]
    fn halo_one_on_unit_extents_is_allowed() {
        let d = decomp_1d(4, 4, 1);
        for e in d.extents() {
            assert_eq!(e.interior_len(0), 1);
            assert_eq!(e.halo(0), (1, 1));
        }
    }
}
