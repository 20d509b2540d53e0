// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! a2a-bus - agent-to-agent messaging over a shared directory.
//!
//! Independent agent processes find each other and exchange JSON envelopes
//! through files under one base directory. There is no broker: every
//! participant reads and writes the same tree.
//!
//! # Architecture
//!
//! - [`bus`] - storage layout, envelopes, discovery, liveness, control plane
//!   and the agent runtime loop
//! - [`config`] - configuration loading and merging
//! - [`error`] - error types and result aliases
//! - [`telemetry`] - tracing initialization and bus metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use a2a_bus::bus::{handler_fn, AgentBus, AgentRuntime, CapabilityCard, RuntimeConfig, StorageLayout};
//! use serde_json::json;
//!
//! let card = CapabilityCard::new("Echo").with_capability("echo");
//! let bus = AgentBus::new(StorageLayout::new("/tmp/a2a-protocol"), card);
//!
//! let handler = handler_fn(|envelope| async move {
//!     Ok(envelope.text().map(|text| json!({ "text": text })))
//! });
//! let summary = AgentRuntime::new(bus, handler, RuntimeConfig::default()).run().await?;
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use bus::{
    AgentBus, AgentRuntime, CapabilityCard, CardSource, DiscoveryFilter, Envelope, EnvelopeHandler,
    EnvelopeKind, ReceiveOptions, RuntimeConfig, RuntimeError, StorageLayout,
};
pub use error::{BusError, BusResult, ConfigError, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let card = CapabilityCard::new("exports");
        let envelope = Envelope::new(&card, "peer", serde_json::json!({}), EnvelopeKind::Test);
        assert_eq!(envelope.sender_id, card.id);
        assert!(ReceiveOptions::default().mark_as_read);
    }
}
