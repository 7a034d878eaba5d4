//! Property tests for the block partitioner: for every valid input the
//! primary-replica interiors tile the global shape exactly, with the
//! documented remainder placement.

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use mpi_array::decomposition::{BlockDecomposition, DecompConfig};
use mpi_array::error::MpiArrayError;
use mpi_array::indexing::GlobalShape;
use mpi_array::topology::CartTopology;

/// Mark every cell of `ranges` in a row-major occupancy grid, failing on
/// double coverage.
fn mark(
    grid: &mut [bool],
    shape: &[usize],
    start: &[usize],
    stop: &[usize],
) -> Result<(), TestCaseError> {
    let ndim = shape.len();
    let mut strides = vec![1usize; ndim];
    for a in (0..ndim - 1).rev() {
        strides[a] = strides[a + 1] * shape[a + 1];
    }
    if start.iter().zip(stop).any(|(b, e)| b == e) {
        return Ok(());
    }
    let mut idx = start.to_vec();
    loop {
        let off: usize = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
        prop_assert!(!grid[off], "cell {idx:?} covered twice");
        grid[off] = true;
        let mut a = ndim;
        loop {
            if a == 0 {
                return Ok(());
            }
            a -= 1;
            idx[a] += 1;
            if idx[a] < stop[a] {
                break;
            }
            idx[a] = start[a];
        }
    }
}

proptest! {
    #[test]
    fn interiors_tile_the_global_shape(
        axes in prop::collection::vec(1usize..12, 1..4),
        nprocs in 1usize..9,
        halo in 0usize..3,
    ) {
        let shape = GlobalShape::new(axes.clone()).unwrap();
        let topo = CartTopology::new(nprocs, axes.len()).unwrap();
        let cfg = DecompConfig::new(axes.len()).with_halo(halo);
        let decomp = match BlockDecomposition::new(shape, topo, cfg) {
            Ok(d) => d,
            // a halo deeper than some non-empty tile is a documented reject
            Err(MpiArrayError::InvalidPartition(_)) => return Ok(()),
            Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {e}"))),
        };

        let total: usize = axes.iter().product();
        let mut grid = vec![false; total];
        for rank in 0..decomp.num_ranks() {
            prop_assert!(decomp.is_primary_replica(rank).unwrap());
            let ext = decomp.extent(rank).unwrap();
            mark(
                &mut grid,
                &axes,
                ext.interior().start(),
                ext.interior().stop(),
            )?;
        }
        prop_assert!(grid.iter().all(|c| *c), "tiling left gaps");
    }

    #[test]
    fn split_sizes_differ_by_at_most_one_and_never_increase(
        n in 1usize..64,
        p in 1usize..12,
    ) {
        let shape = GlobalShape::new(vec![n]).unwrap();
        let topo = CartTopology::with_dims(p, &[p]).unwrap();
        let decomp = BlockDecomposition::new(shape, topo, DecompConfig::new(1)).unwrap();
        let lens: Vec<usize> = (0..p)
            .map(|r| decomp.extent(r).unwrap().interior_len(0))
            .collect();
        let min = *lens.iter().min().unwrap();
        let max = *lens.iter().max().unwrap();
        prop_assert!(max - min <= 1);
        // remainder goes to the lowest coordinates
        prop_assert!(lens.windows(2).all(|w| w[0] >= w[1]));
        prop_assert_eq!(lens.iter().sum::<usize>(), n);
    }
}
