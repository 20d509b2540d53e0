// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Records exchanged over the bus.
//!
//! Field names on disk are a stable interchange contract shared with peers
//! written in other languages. Every record keeps unknown fields in an
//! `extra` map so a round-trip through this crate never drops them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{BusError, BusResult};

/// Protocol version stamped on every outgoing envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Control commands that stop a participant's loop.
pub const EXIT_COMMANDS: [&str; 2] = ["exit_loop", "force_exit"];

fn default_card_version() -> String {
    "1.0.0".to_string()
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Loose truthiness used for flags written by dynamically-typed peers.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Deserialize a timestamp, reading anything unparsable as absent.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

// ============================================================================
// Capability Card
// ============================================================================

/// Where a participant can be reached and where its card lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardEndpoints {
    #[serde(default)]
    pub message_endpoint: String,
    #[serde(default)]
    pub discovery_endpoint: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A participant's self-description, published into the discovery area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCard {
    pub id: String,
    pub name: String,
    #[serde(default = "default_card_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub apis: CardEndpoints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CapabilityCard {
    /// Create a card with a fresh identity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            version: default_card_version(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            apis: CardEndpoints::default(),
            author: None,
            created_at: Utc::now(),
            extra: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Point the card's endpoints at a bus base directory.
    pub fn with_endpoints_under(mut self, layout: &super::layout::StorageLayout) -> Self {
        self.apis.message_endpoint = layout.inbox_dir().display().to_string();
        self.apis.discovery_endpoint = layout.discovery_dir().display().to_string();
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }

    /// Whether this card looks like a coordinator by name or capability.
    pub fn looks_like_orchestrator(&self) -> bool {
        self.name.to_lowercase().contains("orchestrator") || self.has_capability("orchestration")
    }

    /// Card file name used by `create-agent`: the display name without whitespace.
    pub fn file_name(&self) -> String {
        let compact: String = self.name.split_whitespace().collect();
        format!("{compact}Card.json")
    }
}

/// Where the local participant's card comes from.
///
/// The card is resolved on every operation that needs it, so a card file
/// that disappears makes the next `send` fail cleanly.
#[derive(Debug, Clone)]
pub enum CardSource {
    Inline(CapabilityCard),
    File(PathBuf),
}

impl CardSource {
    pub async fn load(&self) -> BusResult<CapabilityCard> {
        match self {
            Self::Inline(card) => Ok(card.clone()),
            Self::File(path) => {
                let unavailable = |reason: String| BusError::CardUnavailable {
                    path: path.display().to_string(),
                    reason,
                };
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?;
                let card: CapabilityCard =
                    serde_json::from_str(&raw).map_err(|e| unavailable(e.to_string()))?;
                if let Err(e) = super::layout::validate_identity(&card.id) {
                    return Err(unavailable(e.to_string()));
                }
                Ok(card)
            }
        }
    }
}

impl From<CapabilityCard> for CardSource {
    fn from(card: CapabilityCard) -> Self {
        Self::Inline(card)
    }
}

impl From<PathBuf> for CardSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// The purpose of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    Query,
    Response,
    Notification,
    Announcement,
    StatusUpdate,
    TaskRequest,
    TaskCompletion,
    Control,
    Emergency,
    Test,
    Action,
    /// A kind this crate does not know; carried through unchanged.
    Other(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Query => "query",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::Announcement => "announcement",
            Self::StatusUpdate => "status_update",
            Self::TaskRequest => "task_request",
            Self::TaskCompletion => "task_completion",
            Self::Control => "control",
            Self::Emergency => "emergency",
            Self::Test => "test",
            Self::Action => "action",
            Self::Other(s) => s,
        }
    }

    /// Whether this kind alone stops the receiving loop.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control | Self::Emergency)
    }
}

impl From<String> for EnvelopeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "query" => Self::Query,
            "response" => Self::Response,
            "notification" => Self::Notification,
            "announcement" => Self::Announcement,
            "status_update" => Self::StatusUpdate,
            "task_request" => Self::TaskRequest,
            "task_completion" => Self::TaskCompletion,
            "control" => Self::Control,
            "emergency" => Self::Emergency,
            "test" => Self::Test,
            "action" => Self::Action,
            _ => Self::Other(s),
        }
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::str::FromStr for EnvelopeKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the bus. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "message_id")]
    pub envelope_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    #[serde(rename = "target_id")]
    pub recipient_id: String,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "message_type")]
    pub kind: EnvelopeKind,
    #[serde(rename = "content", default)]
    pub body: Value,
    #[serde(default)]
    pub capabilities_required: Vec<String>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Build a fresh envelope from `sender` to `recipient_id`.
    pub fn new(
        sender: &CapabilityCard,
        recipient_id: impl Into<String>,
        body: Value,
        kind: EnvelopeKind,
    ) -> Self {
        Self {
            envelope_id: Uuid::new_v4().to_string(),
            sender_id: sender.id.clone(),
            sender_name: sender.name.clone(),
            recipient_id: recipient_id.into(),
            created_at: Utc::now(),
            kind,
            body,
            capabilities_required: Vec::new(),
            protocol_version: default_protocol_version(),
            extra: Map::new(),
        }
    }

    /// The `control_command` carried in the body, if any.
    pub fn control_command(&self) -> Option<&str> {
        self.body.get("control_command").and_then(Value::as_str)
    }

    /// Whether this envelope should move the receiver into shutdown.
    pub fn is_control_signal(&self) -> bool {
        if self.kind.is_control() {
            return true;
        }
        if self
            .control_command()
            .is_some_and(|cmd| EXIT_COMMANDS.contains(&cmd))
        {
            return true;
        }
        self.body.get("emergency").is_some_and(is_truthy)
    }

    pub fn is_announcement(&self) -> bool {
        self.kind == EnvelopeKind::Announcement
            || self.body.get("announcement").is_some_and(is_truthy)
    }

    /// Human-readable text of the body, when it has one.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Value::String(s) => Some(s.as_str()),
            other => other.get("text").and_then(Value::as_str),
        }
    }
}

// ============================================================================
// Liveness
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    Active,
    Inactive,
    #[default]
    #[serde(other)]
    Unknown,
}

impl LivenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for LivenessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One participant's entry in the liveness aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessEntry {
    #[serde(default)]
    pub status: LivenessStatus,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The singleton liveness document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessDocument {
    #[serde(default)]
    pub active_agents: BTreeMap<String, LivenessEntry>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// The coordinator's self-published descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "project", default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default = "default_descriptor_status")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_descriptor_status() -> String {
    "active".to_string()
}

impl OrchestratorDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project_name: None,
            status: default_descriptor_status(),
            created_at: Some(Utc::now()),
            extra: Map::new(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project_name = Some(project.into());
        self
    }

    /// Descriptor inferred from a discovered card.
    pub fn from_card(card: &CapabilityCard) -> Self {
        Self {
            id: card.id.clone(),
            name: card.name.clone(),
            project_name: None,
            status: "active".to_string(),
            created_at: Some(card.created_at),
            extra: Map::new(),
        }
    }
}

/// The coordinator's aggregate project status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn unknown_status() -> String {
    "unknown".to_string()
}

impl OrchestratorStatus {
    /// Status reported when no coordinator has written one.
    pub fn unknown() -> Self {
        Self {
            status: unknown_status(),
            last_update: None,
            message: Some("No orchestrator status available".to_string()),
            extra: Map::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.status == "unknown"
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// A discovered card left-joined with its liveness entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredAgent {
    #[serde(flatten)]
    pub card: CapabilityCard,
    pub status: LivenessStatus,
    pub active: bool,
    pub last_update: Option<DateTime<Utc>>,
}

/// Narrowing applied by `discover`. Both conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub only_active: bool,
    /// Every listed tag must be present on the card.
    pub capability_tags: Vec<String>,
}

impl DiscoveryFilter {
    pub fn active() -> Self {
        Self {
            only_active: true,
            capability_tags: Vec::new(),
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.push(tag.into());
        self
    }

    pub fn matches(&self, agent: &DiscoveredAgent) -> bool {
        if self.only_active && !agent.active {
            return false;
        }
        self.capability_tags
            .iter()
            .all(|tag| agent.card.has_capability(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_names() {
        let card = CapabilityCard::new("Alice");
        let env = Envelope::new(&card, "bob", json!({"text": "hi"}), EnvelopeKind::Query);
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["message_id"], json!(env.envelope_id));
        assert_eq!(value["target_id"], json!("bob"));
        assert_eq!(value["message_type"], json!("query"));
        assert_eq!(value["content"]["text"], json!("hi"));
        assert_eq!(value["protocol_version"], json!(PROTOCOL_VERSION));
        assert_eq!(value["capabilities_required"], json!([]));
        assert!(value.get("envelope_id").is_none());
    }

    #[test]
    fn test_envelope_preserves_unknown_fields() {
        let raw = json!({
            "message_id": "m1",
            "sender_id": "a",
            "sender_name": "A",
            "target_id": "b",
            "timestamp": "2025-03-01T10:00:00.000Z",
            "message_type": "custom_kind",
            "content": {"text": "x"},
            "protocol_version": "1.0.0",
            "priority": "high"
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Other("custom_kind".to_string()));
        assert_eq!(env.extra["priority"], json!("high"));

        let back = serde_json::to_value(&env).unwrap();
        assert_eq!(back["priority"], json!("high"));
        assert_eq!(back["message_type"], json!("custom_kind"));
    }

    #[test]
    fn test_control_detection() {
        let card = CapabilityCard::new("ctl");
        let by_kind = Envelope::new(&card, "x", json!({}), EnvelopeKind::Control);
        let by_emergency_kind = Envelope::new(&card, "x", Value::Null, EnvelopeKind::Emergency);
        let by_command = Envelope::new(
            &card,
            "x",
            json!({"control_command": "force_exit"}),
            EnvelopeKind::Notification,
        );
        let by_flag = Envelope::new(&card, "x", json!({"emergency": 1}), EnvelopeKind::Query);
        let falsy_flag = Envelope::new(&card, "x", json!({"emergency": ""}), EnvelopeKind::Query);
        let other_command = Envelope::new(
            &card,
            "x",
            json!({"control_command": "pause"}),
            EnvelopeKind::Query,
        );

        assert!(by_kind.is_control_signal());
        assert!(by_emergency_kind.is_control_signal());
        assert!(by_command.is_control_signal());
        assert!(by_flag.is_control_signal());
        assert!(!falsy_flag.is_control_signal());
        assert!(!other_command.is_control_signal());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_liveness_entry_lenient() {
        let entry: LivenessEntry = serde_json::from_value(json!({
            "status": "sleeping",
            "last_update": "not a date",
            "name": "A"
        }))
        .unwrap();
        assert_eq!(entry.status, LivenessStatus::Unknown);
        assert!(entry.last_update.is_none());

        let doc: LivenessDocument = serde_json::from_value(json!({})).unwrap();
        assert!(doc.active_agents.is_empty());
    }

    #[test]
    fn test_card_defaults_and_extra() {
        let card: CapabilityCard = serde_json::from_value(json!({
            "id": "c1",
            "name": "Scout Agent",
            "capabilities": ["search", "search", "orchestration"],
            "homepage": "https://example.invalid"
        }))
        .unwrap();
        assert_eq!(card.version, "1.0.0");
        assert_eq!(card.capabilities.len(), 2);
        assert!(card.looks_like_orchestrator());
        assert_eq!(card.file_name(), "ScoutAgentCard.json");
        assert_eq!(card.extra["homepage"], json!("https://example.invalid"));
    }

    #[tokio::test]
    async fn test_card_source_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let source = CardSource::File(temp.path().join("missing.json"));
        let err = source.load().await.unwrap_err();
        assert!(matches!(err, BusError::CardUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_card_source_rejects_path_like_id() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("card.json");
        let card = CapabilityCard::new("Sneaky").with_id("../outside");
        std::fs::write(&path, serde_json::to_string(&card).unwrap()).unwrap();

        let err = CardSource::File(path).load().await.unwrap_err();
        assert!(matches!(err, BusError::CardUnavailable { .. }));
    }

    #[test]
    fn test_discovery_filter_requires_all_tags() {
        let card = CapabilityCard::new("w").with_capabilities(["a", "b"]);
        let agent = DiscoveredAgent {
            card,
            status: LivenessStatus::Inactive,
            active: false,
            last_update: None,
        };
        assert!(DiscoveryFilter::default().with_capability("a").matches(&agent));
        assert!(!DiscoveryFilter::default()
            .with_capability("a")
            .with_capability("c")
            .matches(&agent));
        assert!(!DiscoveryFilter::active().matches(&agent));
    }
}
