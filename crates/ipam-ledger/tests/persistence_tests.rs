//! Snapshot persistence and configuration loading

use std::net::IpAddr;
use std::time::Duration;

use ipam_ledger::models::ObservationMethod;
use ipam_ledger::{
    AllocationRequest, ConflictFilter, IpamService, JsonFileStore, LedgerConfig, MemoryStore,
    ObservedHostFact, SnapshotStore, StateKind, SubnetSpec,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn populated(config: LedgerConfig) -> IpamService {
    let service = IpamService::new(config).unwrap();
    let site = service
        .create_subnet("10.0.0.0/16".parse().unwrap(), None, SubnetSpec::new("site"))
        .unwrap();
    let lan = service
        .create_subnet("10.0.1.0/24".parse().unwrap(), Some(site.id), SubnetSpec::new("lan"))
        .unwrap();
    service
        .allocate(AllocationRequest::new(lan.id).with_hostname("printer").with_owner("facilities"))
        .unwrap();
    service
        .reconcile(
            lan.id,
            vec![ObservedHostFact::new(ip("10.0.1.50"), ObservationMethod::Arp)],
        )
        .unwrap();
    service
}

#[test]
fn test_json_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("ledger.json"));
    let config = LedgerConfig::new(Duration::from_secs(3600));

    let original = populated(config.clone());
    original.save_to(&store).unwrap();

    let restored = IpamService::load_from(config, &store).unwrap();
    assert_eq!(restored.list_subnets().unwrap().len(), 2);

    let printer = restored.get_status(ip("10.0.1.1")).unwrap();
    let record = printer.status.record().unwrap();
    assert_eq!(record.kind(), StateKind::Allocated);
    assert_eq!(record.identity.hostname.as_deref(), Some("printer"));
    assert_eq!(record.owner.as_deref(), Some("facilities"));

    let unknown = restored.get_status(ip("10.0.1.50")).unwrap();
    assert_eq!(unknown.status.kind(), StateKind::Conflicted);
    assert!(unknown.open_conflict.is_some());

    assert_eq!(
        restored.audit_trail(None),
        original.audit_trail(None)
    );
}

#[test]
fn test_load_from_empty_store() {
    let store = MemoryStore::new();
    let service =
        IpamService::load_from(LedgerConfig::new(Duration::from_secs(60)), &store).unwrap();
    assert!(service.list_subnets().unwrap().is_empty());
}

#[test]
fn test_memory_store_keeps_latest() {
    let store = MemoryStore::new();
    let config = LedgerConfig::new(Duration::from_secs(3600));
    let service = populated(config.clone());
    service.save_to(&store).unwrap();

    let lan = service.find_containing(ip("10.0.1.1")).unwrap();
    service.allocate(AllocationRequest::new(lan)).unwrap();
    service.save_to(&store).unwrap();

    let snapshot = store.load().unwrap().unwrap();
    let restored = IpamService::from_snapshot(config, snapshot).unwrap();
    assert_eq!(restored.get_stats().unwrap().active_records, 3);
    assert_eq!(
        restored.list_conflicts(&ConflictFilter::default()).len(),
        1
    );
}

#[test]
fn test_config_file_drives_service() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ipam.toml");
    std::fs::write(
        &path,
        r#"
lock_timeout_ms = 100
exhaustion_thresholds = [50]
sweep_interval_secs = 30

[reconcile]
stale_grace_secs = 7200
"#,
    )
    .unwrap();

    let config = LedgerConfig::load(&path).unwrap();
    assert_eq!(config.reconciler().stale_grace, chrono::Duration::hours(2));

    let service = IpamService::new(config).unwrap();
    assert_eq!(service.ledger().lock_timeout(), Duration::from_millis(100));
}
