//! Performance benchmarks for allocation and subnet lookup

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipam_ledger::{AllocationRequest, IpamService, LedgerConfig, SubnetSpec};
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

fn create_service() -> IpamService {
    IpamService::new(LedgerConfig::new(Duration::from_secs(3600))).unwrap()
}

/// Benchmark filling a subnet with lowest-first allocation
fn bench_sequential_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_sequential");
    group.sample_size(10);

    for prefix in [26u8, 24, 22].iter() {
        let cidr = IpNet::from_str(&format!("10.100.0.0/{}", prefix)).unwrap();
        let capacity = 2u64.pow(32 - *prefix as u32) - 2;

        group.throughput(Throughput::Elements(capacity));
        group.bench_with_input(BenchmarkId::new("prefix", prefix), prefix, |b, _| {
            b.iter_batched(
                || {
                    let service = create_service();
                    let id = service
                        .create_subnet(cidr, None, SubnetSpec::new("bench"))
                        .unwrap()
                        .id;
                    (service, id)
                },
                |(service, id)| {
                    let mut count = 0u64;
                    while service.allocate(AllocationRequest::new(id)).is_ok() {
                        count += 1;
                    }
                    black_box(count)
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark allocation into a fragmented subnet
fn bench_fragmented_allocation(c: &mut Criterion) {
    let cidr = IpNet::from_str("10.100.0.0/24").unwrap();

    c.bench_function("allocation_fragmented", |b| {
        b.iter_batched(
            || {
                // Allocate half, release every other one
                let service = create_service();
                let id = service
                    .create_subnet(cidr, None, SubnetSpec::new("bench"))
                    .unwrap()
                    .id;
                let records: Vec<_> = (0..126)
                    .filter_map(|_| service.allocate(AllocationRequest::new(id)).ok())
                    .collect();
                for record in records.iter().step_by(2) {
                    service.release(record.address, "bench").unwrap();
                }
                (service, id)
            },
            |(service, id)| black_box(service.allocate(AllocationRequest::new(id))),
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Benchmark longest-prefix descent through a nested tree
fn bench_find_containing(c: &mut Criterion) {
    let service = create_service();
    let root = service
        .create_subnet(IpNet::from_str("10.0.0.0/8").unwrap(), None, SubnetSpec::new("root"))
        .unwrap();
    for i in 0..64u32 {
        let cidr = IpNet::from_str(&format!("10.{}.0.0/16", i)).unwrap();
        let site = service
            .create_subnet(cidr, Some(root.id), SubnetSpec::new(format!("site-{}", i)))
            .unwrap();
        for j in 0..16u32 {
            let lan = IpNet::from_str(&format!("10.{}.{}.0/24", i, j)).unwrap();
            service
                .create_subnet(lan, Some(site.id), SubnetSpec::new(format!("lan-{}-{}", i, j)))
                .unwrap();
        }
    }

    let lookups: Vec<IpAddr> = (0..64u32)
        .map(|i| format!("10.{}.{}.{}", i, i % 16, 1 + i).parse().unwrap())
        .collect();

    c.bench_function("find_containing_depth3", |b| {
        b.iter(|| {
            for addr in &lookups {
                black_box(service.find_containing(*addr).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_sequential_allocation,
    bench_fragmented_allocation,
    bench_find_containing,
);
criterion_main!(benches);
