//! Performance benchmarks for reconciliation batches

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipam_ledger::models::ObservationMethod;
use ipam_ledger::{AllocationRequest, IpamService, LedgerConfig, ObservedHostFact, SubnetId, SubnetSpec};
use ipnet::IpNet;
use std::str::FromStr;
use std::time::Duration;

fn populated(allocated: usize) -> (IpamService, SubnetId) {
    let service = IpamService::new(LedgerConfig::new(Duration::from_secs(3600))).unwrap();
    let id = service
        .create_subnet(IpNet::from_str("10.50.0.0/20").unwrap(), None, SubnetSpec::new("bench"))
        .unwrap()
        .id;
    for i in 0..allocated {
        service
            .allocate(AllocationRequest::new(id).with_hostname(format!("host-{}", i)))
            .unwrap();
    }
    (service, id)
}

/// Batch where every fact agrees with the ledger
fn bench_matching_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_matching");

    for size in [64usize, 512, 2048].iter() {
        let (service, id) = populated(*size);
        let facts: Vec<ObservedHostFact> = service
            .ledger()
            .records_in(id)
            .unwrap()
            .into_iter()
            .map(|r| {
                ObservedHostFact::new(r.address, ObservationMethod::Arp)
                    .with_hostname(r.identity.hostname.unwrap_or_default())
            })
            .collect();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("facts", size), size, |b, _| {
            b.iter(|| black_box(service.reconcile(id, facts.clone()).unwrap()));
        });
    }

    group.finish();
}

/// Batch of unknown hosts against an empty subnet
fn bench_unknown_hosts(c: &mut Criterion) {
    c.bench_function("reconcile_unknown_256", |b| {
        b.iter_batched(
            || {
                let (service, id) = populated(0);
                let facts: Vec<ObservedHostFact> = (1..=256u32)
                    .map(|i| {
                        let addr = format!("10.50.{}.{}", i / 200, 1 + i % 200).parse().unwrap();
                        ObservedHostFact::new(addr, ObservationMethod::Ping)
                    })
                    .collect();
                (service, id, facts)
            },
            |(service, id, facts)| black_box(service.reconcile(id, facts).unwrap()),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_matching_batch, bench_unknown_hosts);
criterion_main!(benches);
