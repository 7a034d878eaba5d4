//! Gather and reduction collectives over the in-process communicator.

use std::sync::Arc;

use serial_test::serial;

use mpi_array::array::DistributedArray;
use mpi_array::collective::{
    ReduceOp, gather, gather_with_tags, reduce, reduce_replicated_with_tags, reduce_with_tags,
};
use mpi_array::communicator::{
    AssemblyTags, CommTag, NoComm, RayonComm, ReduceTags, ReplicaTags,
};
use mpi_array::decomposition::{BlockDecomposition, DecompConfig};
use mpi_array::error::MpiArrayError;
use mpi_array::indexing::GlobalShape;
use mpi_array::topology::CartTopology;

fn decomp_1d(n: usize, p: usize) -> Arc<BlockDecomposition> {
    let shape = GlobalShape::new(vec![n]).unwrap();
    let topo = CartTopology::with_dims(p, &[p]).unwrap();
    Arc::new(BlockDecomposition::new(shape, topo, DecompConfig::new(1)).unwrap())
}

fn run_ranks(p: usize, f: impl Fn(usize) + Send + Sync + 'static) {
    let f = Arc::new(f);
    let handles: Vec<_> = (0..p)
        .map(|rank| {
            let f = Arc::clone(&f);
            std::thread::spawn(move || f(rank))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
#[serial]
fn gather_reassembles_the_global_array() {
    let decomp = decomp_1d(9, 4);
    run_ranks(4, move |rank| {
        let comm = RayonComm::new(rank, 4);
        let mut array = DistributedArray::<i64>::new(decomp.clone(), rank).unwrap();
        array.fill_interior(|g| (g[0] * g[0]) as i64);
        let out = gather_with_tags(
            &array,
            &comm,
            0,
            AssemblyTags::from_base(CommTag::new(0x5000)),
        )
        .unwrap();
        if rank == 0 {
            let expected: Vec<i64> = (0..9).map(|g| g * g).collect();
            assert_eq!(out.unwrap(), expected);
        } else {
            assert!(out.is_none());
        }
    });
}

#[test]
#[serial]
fn gather_detects_extent_drift() {
    let decomp = decomp_1d(9, 4);
    let drifted = decomp_1d(8, 4); // rank 1 reports [2,4) instead of [3,5)
    run_ranks(4, move |rank| {
        let comm = RayonComm::new(rank, 4);
        if rank == 1 {
            let mut array = DistributedArray::<i64>::new(drifted.clone(), rank).unwrap();
            array.fill_interior(|g| g[0] as i64);
            let _ = gather_with_tags(
                &array,
                &comm,
                0,
                AssemblyTags::from_base(CommTag::new(0x5010)),
            );
            return;
        }
        let mut array = DistributedArray::<i64>::new(decomp.clone(), rank).unwrap();
        array.fill_interior(|g| g[0] as i64);
        let res = gather_with_tags(
            &array,
            &comm,
            0,
            AssemblyTags::from_base(CommTag::new(0x5010)),
        );
        if rank == 0 {
            assert!(matches!(res, Err(MpiArrayError::AssemblyFailed(_))));
        } else {
            assert!(res.unwrap().is_none());
        }
    });
}

#[test]
#[serial]
fn reduce_counts_every_interior_element_once() {
    // 5 ranks over 3 elements: empty ranks contribute the identity
    let decomp = decomp_1d(3, 5);
    run_ranks(5, move |rank| {
        let comm = RayonComm::new(rank, 5);
        let mut array = DistributedArray::<i64>::new(decomp.clone(), rank).unwrap();
        array.fill_interior(|g| (g[0] + 1) as i64);
        let sum = reduce_with_tags(
            &array,
            &comm,
            ReduceOp::Sum,
            ReduceTags::from_base(CommTag::new(0x5100)),
        )
        .unwrap();
        assert_eq!(sum, 6);
    });
}

#[test]
#[serial]
fn reduce_min_max_across_ranks() {
    let decomp = decomp_1d(8, 2);
    run_ranks(2, move |rank| {
        let comm = RayonComm::new(rank, 2);
        let mut array = DistributedArray::<f64>::new(decomp.clone(), rank).unwrap();
        array.fill_interior(|g| g[0] as f64 - 3.0);
        let min = reduce_with_tags(
            &array,
            &comm,
            ReduceOp::Min,
            ReduceTags::from_base(CommTag::new(0x5110)),
        )
        .unwrap();
        let max = reduce_with_tags(
            &array,
            &comm,
            ReduceOp::Max,
            ReduceTags::from_base(CommTag::new(0x5120)),
        )
        .unwrap();
        assert_eq!(min, -3.0);
        assert_eq!(max, 4.0);
    });
}

#[test]
fn reduce_on_a_single_rank_is_the_serial_fold() {
    let decomp = decomp_1d(5, 1);
    let mut array = DistributedArray::<i32>::new(decomp, 0).unwrap();
    array.fill_interior(|g| g[0] as i32 + 1);
    assert_eq!(reduce(&array, &NoComm, ReduceOp::Sum).unwrap(), 15);
    assert_eq!(reduce(&array, &NoComm, ReduceOp::Prod).unwrap(), 120);
}

#[test]
fn gather_on_a_single_rank_returns_the_interior() {
    let decomp = decomp_1d(4, 1);
    let mut array = DistributedArray::<i32>::new(decomp, 0).unwrap();
    array.fill_interior(|g| g[0] as i32 * 2);
    let out = gather(&array, &NoComm, 0).unwrap().unwrap();
    assert_eq!(out, vec![0, 2, 4, 6]);
}

#[test]
#[serial]
fn replicated_axes_fuse_elementwise_and_reduce_once() {
    // two full replicas of a 4-element axis
    let shape = GlobalShape::new(vec![4]).unwrap();
    let topo = CartTopology::with_dims(2, &[2]).unwrap();
    let cfg = DecompConfig::new(1).with_split(&[false]);
    let decomp = Arc::new(BlockDecomposition::new(shape, topo, cfg).unwrap());
    run_ranks(2, move |rank| {
        let comm = RayonComm::new(rank, 2);
        let mut array = DistributedArray::<i64>::new(decomp.clone(), rank).unwrap();
        // rank 1's replica carries larger values everywhere
        array.fill_interior(|g| g[0] as i64 + if rank == 0 { 0 } else { 10 });
        reduce_replicated_with_tags(
            &mut array,
            &comm,
            ReduceOp::Max,
            ReplicaTags::from_base(CommTag::new(0x5200)),
        )
        .unwrap();
        // both replicas now agree on the fused values
        for g in 0..4 {
            assert_eq!(array.get(&[g]).unwrap(), g as i64 + 10);
        }
        // the global reduction counts the shared tile once
        let sum = reduce_with_tags(
            &array,
            &comm,
            ReduceOp::Sum,
            ReduceTags::from_base(CommTag::new(0x5210)),
        )
        .unwrap();
        assert_eq!(sum, 10 + 11 + 12 + 13);
    });
}

#[test]
fn gather_rejects_a_mismatched_communicator() {
    // two-rank decomposition driven through a single-rank communicator
    let decomp = decomp_1d(6, 2);
    let array = DistributedArray::<f64>::new(decomp, 0).unwrap();
    assert!(matches!(
        gather(&array, &NoComm, 0),
        Err(MpiArrayError::AssemblyFailed(_))
    ));
}
