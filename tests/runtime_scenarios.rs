// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end runtime scenarios with two participants on one base directory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use a2a_bus::bus::{
    handler_fn, AgentBus, AgentRuntime, CapabilityCard, Envelope, EnvelopeKind, LivenessStatus,
    ReceiveOptions, RuntimeConfig, ShutdownReason, StorageLayout,
};
use serde_json::json;
use tempfile::TempDir;

fn fast_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_poll_interval(Duration::from_millis(25))
        .with_signals(false)
}

async fn wait_for_responses(bus: &AgentBus) -> Vec<Envelope> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let responses = bus
            .receive(ReceiveOptions::default().with_kind(EnvelopeKind::Response))
            .await
            .unwrap();
        if !responses.is_empty() || tokio::time::Instant::now() > deadline {
            return responses;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn ping_gets_exactly_one_pong() {
    let temp = TempDir::new().unwrap();
    let layout = StorageLayout::new(temp.path());
    let alpha_card = CapabilityCard::new("Alpha");
    let beta_card = CapabilityCard::new("Beta").with_capability("pong");

    let alpha = AgentBus::new(layout.clone(), alpha_card.clone());
    alpha.init().await.unwrap();
    alpha.publish().await.unwrap();

    let beta = AgentBus::new(layout.clone(), beta_card.clone());
    let handler = handler_fn(|envelope: Envelope| async move {
        if envelope.text() == Some("ping") {
            Ok(Some(json!({"text": "pong"})))
        } else {
            Ok(None)
        }
    });
    let runtime = AgentRuntime::new(beta, handler, fast_config());
    let beta_task = tokio::spawn(runtime.run());

    alpha
        .send(&beta_card.id, json!({"text": "ping"}), EnvelopeKind::Query)
        .await
        .unwrap();

    let responses = wait_for_responses(&alpha).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].sender_id, beta_card.id);
    assert_eq!(responses[0].body, json!({"text": "pong"}));

    alpha
        .send(&beta_card.id, json!({"control_command": "exit_loop"}), EnvelopeKind::Control)
        .await
        .unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), beta_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(summary.responses, 1);
    assert_eq!(summary.handler_failures, 0);

    // No second pong shows up later.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alpha
        .receive(ReceiveOptions::default().with_kind(EnvelopeKind::Response))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn exit_loop_runs_callbacks_once_after_deregistering() {
    let temp = TempDir::new().unwrap();
    let layout = StorageLayout::new(temp.path());
    let lead_card = CapabilityCard::new("Lead");
    let worker_card = CapabilityCard::new("Worker");

    let lead = AgentBus::new(layout.clone(), lead_card.clone());
    lead.init().await.unwrap();

    let worker = AgentBus::new(layout.clone(), worker_card.clone());
    let runtime = AgentRuntime::new(worker, handler_fn(|_| async { Ok(None) }), fast_config());

    let calls = Arc::new(Mutex::new(Vec::new()));
    {
        let calls = Arc::clone(&calls);
        let record = layout.discovery_record(&worker_card.id);
        runtime.on_shutdown("flush", move || async move {
            let deregistered = !record.exists();
            calls.lock().unwrap().push(format!("flush deregistered={deregistered}"));
            Ok(())
        });
    }
    {
        let calls = Arc::clone(&calls);
        runtime.on_shutdown("close", move || async move {
            calls.lock().unwrap().push("close".to_string());
            Ok(())
        });
    }

    let control = runtime.control();
    let worker_task = tokio::spawn(runtime.run());

    let exit = lead
        .send(&worker_card.id, json!({"control_command": "exit_loop"}), EnvelopeKind::Control)
        .await
        .unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(summary.callbacks_run, 3);
    assert_eq!(
        summary.reason,
        Some(ShutdownReason::ControlEnvelope {
            envelope_id: exit.envelope_id,
            sender_id: lead_card.id.clone(),
            command: Some("exit_loop".to_string()),
        })
    );
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["flush deregistered=true".to_string(), "close".to_string()]
    );

    // Running them again is a no-op.
    assert_eq!(control.run_shutdown_callbacks().await, 0);
    assert_eq!(calls.lock().unwrap().len(), 2);

    assert!(!layout.discovery_record(&worker_card.id).exists());
    let entry = lead.liveness().entry(&worker_card.id).await.unwrap();
    assert_eq!(entry.status, LivenessStatus::Inactive);
}

#[tokio::test]
async fn emergency_flag_stops_the_loop() {
    let temp = TempDir::new().unwrap();
    let layout = StorageLayout::new(temp.path());
    let sender = AgentBus::new(layout.clone(), CapabilityCard::new("Monitor"));
    sender.init().await.unwrap();

    let card = CapabilityCard::new("Worker");
    sender
        .send(&card.id, json!({"text": "stop now", "emergency": true}), EnvelopeKind::Notification)
        .await
        .unwrap();

    let worker = AgentBus::new(layout, card);
    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        AgentRuntime::new(worker, handler_fn(|_| async { Ok(None) }), fast_config()).run(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(summary.cycles, 1);
    assert!(matches!(summary.reason, Some(ShutdownReason::ControlEnvelope { .. })));
}
