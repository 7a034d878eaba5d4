//! Halo-exchange throughput on a single rank with periodic wrap-around.
//!
//! `MPI_ARRAY_BENCH_QUICK=1` shrinks the problem sizes for smoke runs.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use mpi_array::array::DistributedArray;
use mpi_array::communicator::NoComm;
use mpi_array::decomposition::{BlockDecomposition, BoundaryPolicy, DecompConfig};
use mpi_array::exchange::HaloExchange;
use mpi_array::indexing::GlobalShape;
use mpi_array::topology::CartTopology;

fn bench_exchange(c: &mut Criterion) {
    let quick = std::env::var("MPI_ARRAY_BENCH_QUICK").is_ok();
    let sizes: &[usize] = if quick { &[64] } else { &[64, 256, 512] };

    let mut group = c.benchmark_group("periodic_exchange_2d");
    for &n in sizes {
        let shape = GlobalShape::new(vec![n, n]).unwrap();
        let topo = CartTopology::with_dims(1, &[1, 1]).unwrap();
        let cfg = DecompConfig::new(2)
            .with_halo(1)
            .with_boundary(BoundaryPolicy::Periodic);
        let decomp = Arc::new(BlockDecomposition::new(shape, topo, cfg).unwrap());
        let mut array = DistributedArray::<f64>::new(decomp.clone(), 0).unwrap();
        array.fill_interior(|g| (g[0] * n + g[1]) as f64);
        let engine = HaloExchange::new(decomp, 0).unwrap();
        let comm = NoComm;

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| engine.exchange(&mut array, &comm).unwrap());
        });
    }
    group.finish();
}

fn bench_partition(c: &mut Criterion) {
    let quick = std::env::var("MPI_ARRAY_BENCH_QUICK").is_ok();
    let procs: &[usize] = if quick { &[16] } else { &[16, 64, 256] };

    let mut group = c.benchmark_group("block_decomposition_3d");
    for &p in procs {
        group.bench_with_input(BenchmarkId::from_parameter(p), &p, |b, &p| {
            b.iter(|| {
                let shape = GlobalShape::new(vec![96, 96, 96]).unwrap();
                let topo = CartTopology::new(p, 3).unwrap();
                let cfg = DecompConfig::new(3).with_halo(1);
                BlockDecomposition::new(shape, topo, cfg).unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_exchange, bench_partition);
criterion_main!(benches);
