//! Cartesian process grid: rank ↔ coordinate mapping.
//!
//! Factors a process count into a grid of dimensions with product equal to
//! the count. The default factorization assigns the prime factors of the
//! count, largest first, to the currently smallest grid dimension and sorts
//! the result descending; this is deterministic, favors square/cubical
//! grids, and degrades to `[p, 1, ..]` for a prime count — the
//! one-dimensional fallback.

use crate::error::MpiArrayError;
use crate::indexing::Dir;

/// Cartesian arrangement of `size` processes.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CartTopology {
    dims: Box<[usize]>,
    strides: Box<[usize]>,
    size: usize,
}

impl CartTopology {
    /// Balanced grid of `ndims` dimensions for `size` processes.
    pub fn new(size: usize, ndims: usize) -> Result<Self, MpiArrayError> {
        if size == 0 {
            return Err(MpiArrayError::InvalidTopology(
                "process count must be positive".into(),
            ));
        }
        if ndims == 0 {
            return Err(MpiArrayError::InvalidTopology(
                "grid must have at least one dimension".into(),
            ));
        }
        Ok(Self::from_dims(balanced_dims(size, ndims)))
    }

    /// Grid with explicitly chosen dimensions.
    pub fn with_dims(size: usize, dims: &[usize]) -> Result<Self, MpiArrayError> {
        if dims.is_empty() || dims.contains(&0) {
            return Err(MpiArrayError::InvalidTopology(format!(
                "grid dimensions {dims:?} must all be positive"
            )));
        }
        let product: usize = dims.iter().product();
        if product != size {
            return Err(MpiArrayError::InvalidTopology(format!(
                "{size} processes cannot fill a {dims:?} grid (product {product})"
            )));
        }
        Ok(Self::from_dims(dims.to_vec()))
    }

    /// Grid aligned with a set of split axes: all factors of `size` land on
    /// the split axes (balanced among them), non-split axes get dimension 1.
    pub fn for_split(size: usize, split: &[bool]) -> Result<Self, MpiArrayError> {
        if size == 0 {
            return Err(MpiArrayError::InvalidTopology(
                "process count must be positive".into(),
            ));
        }
        if split.is_empty() {
            return Err(MpiArrayError::InvalidTopology(
                "grid must have at least one dimension".into(),
            ));
        }
        let nsplit = split.iter().filter(|s| **s).count();
        if nsplit == 0 && size > 1 {
            return Err(MpiArrayError::InvalidTopology(format!(
                "no split axes to place {size} processes on"
            )));
        }
        let sub = if nsplit == 0 {
            Vec::new()
        } else {
            balanced_dims(size, nsplit)
        };
        let mut dims = Vec::with_capacity(split.len());
        let mut k = 0;
        for &s in split {
            if s {
                dims.push(sub[k]);
                k += 1;
            } else {
                dims.push(1);
            }
        }
        Ok(Self::from_dims(dims))
    }

    fn from_dims(dims: Vec<usize>) -> Self {
        let size = dims.iter().product();
        let ndims = dims.len();
        let mut strides = vec![1usize; ndims];
        for a in (0..ndims.saturating_sub(1)).rev() {
            strides[a] = strides[a + 1] * dims[a + 1];
        }
        log::debug!("cartesian grid {dims:?} for {size} processes");
        Self {
            dims: dims.into_boxed_slice(),
            strides: strides.into_boxed_slice(),
            size,
        }
    }

    #[inline]
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Grid coordinate of `rank`.
    pub fn rank_to_coord(&self, rank: usize) -> Result<Vec<usize>, MpiArrayError> {
        if rank >= self.size {
            return Err(MpiArrayError::OutOfRange(format!(
                "rank {rank} outside process group of size {}",
                self.size
            )));
        }
        let mut rem = rank;
        let coord = self
            .strides
            .iter()
            .map(|s| {
                let c = rem / s;
                rem %= s;
                c
            })
            .collect();
        Ok(coord)
    }

    /// Rank at grid coordinate `coord`.
    pub fn coord_to_rank(&self, coord: &[usize]) -> Result<usize, MpiArrayError> {
        if coord.len() != self.ndims() {
            return Err(MpiArrayError::ShapeMismatch {
                expected: self.ndims(),
                found: coord.len(),
            });
        }
        for (a, (&c, &d)) in coord.iter().zip(self.dims.iter()).enumerate() {
            if c >= d {
                return Err(MpiArrayError::OutOfRange(format!(
                    "coordinate {c} exceeds grid dimension {d} on axis {a}"
                )));
            }
        }
        Ok(coord.iter().zip(self.strides.iter()).map(|(c, s)| c * s).sum())
    }

    /// Coordinate one step along `axis` in direction `dir`, wrapping when
    /// `periodic`. `None` at the grid edge otherwise.
    pub fn shift(
        &self,
        coord: &[usize],
        axis: usize,
        dir: Dir,
        periodic: bool,
    ) -> Option<Vec<usize>> {
        let d = self.dims[axis];
        let c = coord[axis];
        let next = match dir {
            Dir::Hi => {
                if c + 1 < d {
                    c + 1
                } else if periodic {
                    0
                } else {
                    return None;
                }
            }
            Dir::Lo => {
                if c > 0 {
                    c - 1
                } else if periodic {
                    d - 1
                } else {
                    return None;
                }
            }
        };
        let mut out = coord.to_vec();
        out[axis] = next;
        Some(out)
    }
}

/// Balanced factorization of `size` into `ndims` grid dimensions.
fn balanced_dims(size: usize, ndims: usize) -> Vec<usize> {
    let mut dims = vec![1usize; ndims];
    let mut factors = prime_factors(size);
    factors.reverse(); // largest first
    for p in factors {
        // multiply into the currently smallest dimension (first on ties)
        let i = (0..ndims).min_by_key(|&i| dims[i]).unwrap_or(0);
        dims[i] *= p;
    }
    dims.sort_unstable_by(|a, b| b.cmp(a));
    dims
}

/// Prime factors of `n` in ascending order; empty for `n <= 1`.
fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            out.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        out.push(n);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_factorizations() {
        assert_eq!(balanced_dims(12, 2), vec![4, 3]);
        assert_eq!(balanced_dims(8, 3), vec![2, 2, 2]);
        assert_eq!(balanced_dims(6, 2), vec![3, 2]);
        assert_eq!(balanced_dims(1, 2), vec![1, 1]);
    }

    #[test]
    fn prime_count_falls_back_to_one_dimension() {
        let t = CartTopology::new(7, 2).unwrap();
        assert_eq!(t.dims(), &[7, 1]);
    }

    #[test]
    fn explicit_dims_must_factor_the_count() {
        assert!(matches!(
            CartTopology::with_dims(7, &[2, 3]),
            Err(MpiArrayError::InvalidTopology(_))
        ));
        assert!(matches!(
            CartTopology::with_dims(6, &[0, 6]),
            Err(MpiArrayError::InvalidTopology(_))
        ));
        let t = CartTopology::with_dims(6, &[2, 3]).unwrap();
        assert_eq!(t.size(), 6);
    }

    #[test]
    fn rank_coord_bijection() {
        let t = CartTopology::with_dims(6, &[2, 3]).unwrap();
        for rank in 0..6 {
            let c = t.rank_to_coord(rank).unwrap();
            assert_eq!(t.coord_to_rank(&c).unwrap(), rank);
        }
        assert_eq!(t.rank_to_coord(5).unwrap(), vec![1, 2]);
        assert!(matches!(
            t.rank_to_coord(6),
            Err(MpiArrayError::OutOfRange(_))
        ));
        assert!(matches!(
            t.coord_to_rank(&[2, 0]),
            Err(MpiArrayError::OutOfRange(_))
        ));
        assert!(matches!(
            t.coord_to_rank(&[0]),
            Err(MpiArrayError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn shift_wraps_only_when_periodic() {
        let t = CartTopology::with_dims(3, &[3]).unwrap();
        assert_eq!(t.shift(&[0], 0, Dir::Lo, false), None);
        assert_eq!(t.shift(&[0], 0, Dir::Lo, true), Some(vec![2]));
        assert_eq!(t.shift(&[2], 0, Dir::Hi, false), None);
        assert_eq!(t.shift(&[2], 0, Dir::Hi, true), Some(vec![0]));
        assert_eq!(t.shift(&[1], 0, Dir::Hi, false), Some(vec![2]));
    }

    #[test]
    fn for_split_places_factors_on_split_axes() {
        let t = CartTopology::for_split(6, &[true, false, true]).unwrap();
        assert_eq!(t.dims(), &[3, 1, 2]);
        assert!(CartTopology::for_split(4, &[false, false]).is_err());
        let t1 = CartTopology::for_split(1, &[false, false]).unwrap();
        assert_eq!(t1.dims(), &[1, 1]);
    }
}
