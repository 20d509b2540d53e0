// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! - **Tracing**: structured logging through `tracing`, with spans on the
//!   public store and registry operations when the `telemetry` feature is on
//! - **Metrics**: operation latency histograms, per-kind handler outcomes and
//!   bus counters (sent, received, replicated, archived, ...)
//!
//! # Usage
//!
//! ```rust,ignore
//! use a2a_bus::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! New bus operations should add `#[instrument]` (gated on the `telemetry`
//! feature), record only identities, counts and paths, and report their
//! latency through [`GLOBAL_METRICS`].

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    BusCounter, HandlerMetrics, Histogram, Metrics, MetricsSnapshot, OperationMetrics,
    GLOBAL_METRICS,
};
