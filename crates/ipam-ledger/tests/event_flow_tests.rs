//! End-to-end event flow tests
//!
//! These tests verify that events flow from service operations through the
//! publisher to subscribers, and that the background sweeper runs.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ipam_ledger::models::{AutoAction, ObservationMethod};
use ipam_ledger::{
    AllocationPolicy, AllocationRequest, Channel, IpamService, LedgerConfig, LedgerMessage,
    ObservedHostFact, ResolutionAction, SubnetSpec,
};
use ipnet::IpNet;
use tokio::sync::broadcast::error::TryRecvError;

// ============================================================================
// Test Helpers
// ============================================================================

fn create_service() -> IpamService {
    IpamService::new(LedgerConfig::new(Duration::from_secs(3600))).unwrap()
}

fn net(s: &str) -> IpNet {
    IpNet::from_str(s).unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<LedgerMessage>) -> Vec<LedgerMessage> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(message) => out.push(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
    out
}

// ============================================================================
// Topology and Allocation Events
// ============================================================================

#[tokio::test]
async fn test_subnet_lifecycle_events() {
    let service = create_service();
    let mut topology = service.subscribe(Channel::Topology);

    let subnet = service
        .create_subnet(net("10.0.0.0/24"), None, SubnetSpec::new("lan"))
        .unwrap();
    service.remove_subnet(subnet.id).unwrap();

    match topology.recv().await.unwrap() {
        LedgerMessage::SubnetCreated(event) => {
            assert_eq!(event.subnet_id, subnet.id);
            assert_eq!(event.cidr, "10.0.0.0/24");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(
        topology.recv().await.unwrap(),
        LedgerMessage::SubnetRemoved(_)
    ));
}

#[tokio::test]
async fn test_allocation_events() {
    let service = create_service();
    let subnet = service
        .create_subnet(net("10.0.0.0/24"), None, SubnetSpec::new("lan"))
        .unwrap();
    let mut allocations = service.subscribe(Channel::Allocations);

    let record = service
        .allocate(AllocationRequest::new(subnet.id).with_hostname("web-01").by("alice"))
        .unwrap();
    service.release(record.address, "bob").unwrap();

    match allocations.recv().await.unwrap() {
        LedgerMessage::AddressAllocated(event) => {
            assert_eq!(event.address, record.address);
            assert_eq!(event.hostname.as_deref(), Some("web-01"));
            assert_eq!(event.actor, "alice");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match allocations.recv().await.unwrap() {
        LedgerMessage::AddressReleased(event) => assert_eq!(event.actor, "bob"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_threshold_fires_once_on_upward_crossing() {
    let service = create_service();
    // 4 allocatable addresses: 75% after the third, 100% after the fourth
    let subnet = service
        .create_subnet(net("10.0.0.0/29"), None, SubnetSpec::new("tiny").with_policy(
            AllocationPolicy::new().with_range(ip("10.0.0.1"), ip("10.0.0.4")),
        ))
        .unwrap();
    let mut capacity = service.subscribe(Channel::Capacity);

    let mut records = Vec::new();
    for _ in 0..3 {
        records.push(service.allocate(AllocationRequest::new(subnet.id)).unwrap());
    }
    let events = drain(&mut capacity);
    assert_eq!(events.len(), 1);
    match &events[0] {
        LedgerMessage::CapacityThresholdCrossed(event) => {
            assert_eq!(event.threshold, 75);
            assert_eq!(event.free, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Falling back under 75% re-arms the threshold
    service.release(records[2].address, "ops").unwrap();
    service.allocate(AllocationRequest::new(subnet.id)).unwrap();
    service.allocate(AllocationRequest::new(subnet.id)).unwrap();

    let thresholds: Vec<u8> = drain(&mut capacity)
        .into_iter()
        .filter_map(|m| match m {
            LedgerMessage::CapacityThresholdCrossed(e) => Some(e.threshold),
            _ => None,
        })
        .collect();
    assert_eq!(thresholds, vec![75, 90]);
}

// ============================================================================
// Conflict Events
// ============================================================================

#[tokio::test]
async fn test_conflict_events() {
    let service = create_service();
    let subnet = service
        .create_subnet(net("10.0.0.0/24"), None, SubnetSpec::new("lan"))
        .unwrap();
    let mut conflicts = service.subscribe(Channel::Conflicts);

    let detected = service
        .reconcile(
            subnet.id,
            vec![ObservedHostFact::new(ip("10.0.0.5"), ObservationMethod::Arp)
                .with_hostname("mystery")],
        )
        .unwrap();

    match conflicts.recv().await.unwrap() {
        LedgerMessage::ConflictDetected(event) => {
            assert_eq!(event.conflict_id, detected[0].id);
            assert_eq!(event.observed_hostname.as_deref(), Some("mystery"));
            assert!(event.auto_action.is_none());
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // A repeat batch updates the open conflict without a new event
    service
        .reconcile(
            subnet.id,
            vec![ObservedHostFact::new(ip("10.0.0.5"), ObservationMethod::Arp)],
        )
        .unwrap();
    assert!(drain(&mut conflicts).is_empty());

    service
        .resolve_conflict(detected[0].id, ResolutionAction::Release, "ops")
        .unwrap();
    match conflicts.recv().await.unwrap() {
        LedgerMessage::ConflictResolved(event) => {
            assert_eq!(event.action, ResolutionAction::Release);
            assert_eq!(event.actor, "ops");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_adoption_event_carries_auto_action() {
    let service = create_service();
    let subnet = service
        .create_subnet(
            net("10.0.0.0/24"),
            None,
            SubnetSpec::new("lab").with_policy(AllocationPolicy::new().trust_discovery()),
        )
        .unwrap();
    let mut all = service.subscribe_all();

    service
        .reconcile(
            subnet.id,
            vec![ObservedHostFact::new(ip("10.0.0.40"), ObservationMethod::Dhcp)],
        )
        .unwrap();

    let detected: Vec<_> = drain(&mut all)
        .into_iter()
        .filter_map(|m| match m {
            LedgerMessage::ConflictDetected(e) => Some(e),
            _ => None,
        })
        .collect();
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].auto_action, Some(AutoAction::Adopted));
}

// ============================================================================
// Background Sweeper
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_expiry_sweeper_task() {
    let mut config = LedgerConfig::new(Duration::from_secs(3600));
    config.sweep_interval_secs = 1;
    let service = Arc::new(IpamService::new(config).unwrap());

    let subnet = service
        .create_subnet(net("10.0.0.0/24"), None, SubnetSpec::new("guest"))
        .unwrap();
    let record = service
        .allocate(AllocationRequest::new(subnet.id).with_lease(chrono::Duration::zero()))
        .unwrap();
    let mut allocations = service.subscribe(Channel::Allocations);

    let handle = service.spawn_expiry_sweeper();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let expired = drain(&mut allocations)
        .into_iter()
        .any(|m| matches!(m, LedgerMessage::AddressExpired(e) if e.address == record.address));
    assert!(expired);
    assert!(service.get_status(record.address).unwrap().status.is_free());

    drop(service);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(handle.is_finished());
}
