// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Liveness aging, concurrent updates and discovery consistency.

use std::time::Duration;

use a2a_bus::bus::{
    AgentBus, CapabilityCard, DiscoveryFilter, EnvelopeKind, LivenessStatus, LivenessTracker,
    OrchestratorDescriptor, ReceiveOptions, StorageLayout,
};
use chrono::Utc;
use tempfile::TempDir;

async fn layout() -> (TempDir, StorageLayout) {
    let temp = TempDir::new().unwrap();
    let layout = StorageLayout::new(temp.path());
    layout.ensure().await.unwrap();
    (temp, layout)
}

#[tokio::test]
async fn ping_ages_out_after_staleness_window() {
    let (_temp, layout) = layout().await;
    let tracker = LivenessTracker::new(layout);
    tracker.ping("scout").await.unwrap();

    let now = Utc::now();
    assert!(tracker.is_active_at("scout", now + chrono::Duration::minutes(4)).await);
    assert!(!tracker.is_active_at("scout", now + chrono::Duration::minutes(16)).await);
    assert!(!tracker.is_active_at("never-seen", now).await);
}

#[tokio::test]
async fn sweep_marks_silent_agents_inactive() {
    let (_temp, layout) = layout().await;
    let tracker = LivenessTracker::new(layout);
    tracker.ping("quiet").await.unwrap();

    let later = Utc::now() + chrono::Duration::minutes(20);
    assert!(tracker
        .reclassify_stale(Duration::from_secs(15 * 60), Utc::now())
        .await
        .unwrap()
        .is_empty());

    let changed = tracker
        .reclassify_stale(Duration::from_secs(15 * 60), later)
        .await
        .unwrap();
    assert_eq!(changed, vec!["quiet".to_string()]);

    let entry = tracker.entry("quiet").await.unwrap();
    assert_eq!(entry.status, LivenessStatus::Inactive);

    // A second sweep has nothing left to change.
    assert!(tracker
        .reclassify_stale(Duration::from_secs(15 * 60), later)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn concurrent_pings_keep_every_entry() {
    let (_temp, layout) = layout().await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let tracker = LivenessTracker::new(layout.clone());
        tasks.push(tokio::spawn(async move {
            tracker.ping(&format!("agent-{i}")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let snapshot = LivenessTracker::new(layout).snapshot().await;
    for i in 0..8 {
        let entry = &snapshot.active_agents[&format!("agent-{i}")];
        assert_eq!(entry.status, LivenessStatus::Active);
    }
}

#[tokio::test]
async fn repeated_pings_never_go_backwards() {
    let (_temp, layout) = layout().await;
    let tracker = LivenessTracker::new(layout);

    let mut previous = None;
    for _ in 0..5 {
        tracker.ping("steady").await.unwrap();
        let current = tracker.entry("steady").await.unwrap().last_update.unwrap();
        if let Some(prev) = previous {
            assert!(current > prev);
        }
        previous = Some(current);
    }
}

#[tokio::test]
async fn deregistered_agent_disappears_from_discovery() {
    let (_temp, layout) = layout().await;
    let lead_card = CapabilityCard::new("Lead");
    let worker_card = CapabilityCard::new("Worker").with_capability("index");

    let lead = AgentBus::new(layout.clone(), lead_card.clone());
    let worker = AgentBus::new(layout.clone(), worker_card.clone());
    lead.orchestrator()
        .publish_descriptor(&OrchestratorDescriptor::from_card(&lead_card))
        .await
        .unwrap();
    lead.publish().await.unwrap();
    worker.publish().await.unwrap();

    let active = lead.discover(&DiscoveryFilter::active()).await.unwrap();
    assert_eq!(active.len(), 2);
    assert!(lead.registry().known_active().contains(&worker_card.id));

    worker.registry().deregister_self().await.unwrap();

    let remaining = lead.discover(&DiscoveryFilter::default()).await.unwrap();
    assert!(remaining.iter().all(|a| a.card.id != worker_card.id));
    assert!(!lead.is_active(&worker_card.id).await);
    assert!(!lead.registry().known_active().contains(&worker_card.id));

    // The orchestrator heard about both the join and the departure.
    let inbox = lead.receive(ReceiveOptions::default()).await.unwrap();
    assert!(inbox
        .iter()
        .any(|e| e.kind == EnvelopeKind::Announcement && e.sender_id == worker_card.id));
    assert!(inbox
        .iter()
        .any(|e| e.body.get("deregistration").is_some() && e.sender_id == worker_card.id));

    // Deregistering again is fine.
    lead.deregister(&worker_card.id).await.unwrap();
}
