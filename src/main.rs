// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `a2a` - command-line access to the agent bus.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;

use a2a_bus::bus::{
    AgentBus, CapabilityCard, DiscoveredAgent, DiscoveryFilter, Envelope, EnvelopeKind,
    LivenessStatus, ReceiveOptions,
};
use a2a_bus::config::{self, CliOptions, ResolvedConfig};
use a2a_bus::telemetry::{init_telemetry, TelemetryConfig};

/// Version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// a2a - agent-to-agent messaging over a shared directory.
#[derive(Parser)]
#[command(name = "a2a")]
#[command(author, version, about = "Agent-to-agent messaging over a shared directory", long_about = None)]
struct Cli {
    /// Base directory of the bus
    #[arg(long, global = true, env = "A2A_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Capability card of the local agent
    #[arg(long, global = true, env = "A2A_CARD")]
    card: Option<PathBuf>,

    /// Show bus activity
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the bus directories and a workspace config pointing at them
    Init {
        /// Base directory (defaults to the configured one)
        dir: Option<PathBuf>,
    },

    /// Write a new capability card and register it
    CreateAgent {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
        /// Comma-separated capability tags
        #[arg(short, long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },

    /// List registered agents
    Discover {
        /// Only agents marked active
        #[arg(long)]
        active: bool,
        /// Required capability tag (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        #[arg(long)]
        json: bool,
    },

    /// Show pending messages for the local agent
    Messages {
        #[command(subcommand)]
        action: Option<MessagesAction>,
        /// Only this message kind
        #[arg(long)]
        kind: Option<EnvelopeKind>,
        #[arg(long)]
        json: bool,
    },

    /// Send a text message
    Send {
        recipient: String,
        text: String,
        /// Message kind
        #[arg(default_value = "query")]
        kind: EnvelopeKind,
    },

    /// Print new messages as they arrive (Ctrl-C to stop)
    Watch {
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },

    /// Send the contents of a file to an agent as instructions
    Inject { recipient: String, file: PathBuf },

    /// Show the liveness table
    Status,

    /// Remove an agent from discovery (defaults to the local agent)
    Deregister { id: Option<String> },

    /// Mark agents without a recent update inactive
    Sweep,

    /// Delete messages older than the retention window
    Cleanup,

    /// Show the orchestrator and its project status
    Orchestrator,

    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand)]
enum MessagesAction {
    /// Archive the listed messages
    Mark,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(&TelemetryConfig::for_cli(cli.verbose, cli.debug))?;

    let workspace_root = std::env::current_dir()?;
    let config = config::load_config(
        &workspace_root,
        CliOptions {
            base_dir: cli.base_dir,
            card_path: cli.card,
            poll_interval_ms: None,
        },
    )?;
    tracing::debug!(base_dir = %config.base_dir.display(), "a2a {}", VERSION);

    let bus = AgentBus::from_config(&config, config.card_path.clone());

    match cli.command {
        Commands::Init { dir } => init(&workspace_root, &config, dir).await,
        Commands::CreateAgent {
            name,
            description,
            capabilities,
        } => create_agent(&config, name, description, capabilities).await,
        Commands::Discover {
            active,
            capabilities,
            json,
        } => {
            let filter = DiscoveryFilter {
                only_active: active,
                capability_tags: capabilities,
            };
            discover(&bus, &filter, json).await
        }
        Commands::Messages { action, kind, json } => {
            let options = ReceiveOptions {
                mark_as_read: matches!(action, Some(MessagesAction::Mark)),
                kind,
            };
            messages(&bus, options, json).await
        }
        Commands::Send {
            recipient,
            text,
            kind,
        } => {
            let envelope = bus.send(&recipient, json!({ "text": text }), kind).await?;
            println!(
                "{} Sent {} {} to {}",
                "✓".green(),
                envelope.kind,
                envelope.envelope_id.dimmed(),
                recipient.bright_white()
            );
            Ok(())
        }
        Commands::Watch { interval_ms } => watch(&bus, Duration::from_millis(interval_ms)).await,
        Commands::Inject { recipient, file } => inject(&bus, &recipient, &file).await,
        Commands::Status => status(&bus).await,
        Commands::Deregister { id } => {
            let id = match id {
                Some(id) => {
                    bus.deregister(&id).await?;
                    id
                }
                None => bus.registry().deregister_self().await?,
            };
            println!("{} Deregistered {}", "✓".green(), id.bright_white());
            Ok(())
        }
        Commands::Sweep => {
            let changed = bus
                .liveness()
                .reclassify_stale(config.inactivity_threshold, chrono::Utc::now())
                .await?;
            if changed.is_empty() {
                println!("No stale agents");
            }
            for id in changed {
                println!("{} {} marked inactive", "•".yellow(), id);
            }
            Ok(())
        }
        Commands::Cleanup => {
            let report = bus.store().purge_expired(config.retention).await?;
            println!(
                "Removed {} messages and {} empty directories",
                report.envelopes, report.directories
            );
            Ok(())
        }
        Commands::Orchestrator => orchestrator(&bus).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn init(workspace_root: &Path, config: &ResolvedConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let base_dir = dir.unwrap_or_else(|| config.base_dir.clone());
    let bus = AgentBus::new(a2a_bus::StorageLayout::new(&base_dir), config.card_path.clone());
    bus.init()
        .await
        .with_context(|| format!("Cannot initialize bus at {}", base_dir.display()))?;

    let path = config::init_config(workspace_root, &base_dir)?;
    println!("{} Bus ready at {}", "✓".green(), base_dir.display().to_string().bright_white());
    println!("Created config file: {}", path.display());
    Ok(())
}

async fn create_agent(
    config: &ResolvedConfig,
    name: String,
    description: Option<String>,
    capabilities: Vec<String>,
) -> anyhow::Result<()> {
    let layout = config.layout();
    let mut card = CapabilityCard::new(name)
        .with_capabilities(capabilities)
        .with_endpoints_under(&layout);
    if let Some(description) = description {
        card = card.with_description(description);
    }

    tokio::fs::create_dir_all(&config.cards_dir)
        .await
        .with_context(|| format!("Cannot create {}", config.cards_dir.display()))?;
    let path = config.cards_dir.join(card.file_name());
    tokio::fs::write(&path, serde_json::to_string_pretty(&card)?)
        .await
        .with_context(|| format!("Cannot write {}", path.display()))?;

    let bus = AgentBus::from_config(config, path.clone());
    bus.init().await?;
    let announced = bus.publish().await?;

    println!("{} Created {} ({})", "✓".green(), card.name.bright_white(), card.id);
    println!("Card: {}", path.display());
    if announced > 0 {
        println!("Announced to {announced} agent(s)");
    }
    println!(
        "{}",
        format!("Use it with: a2a --card {} <command>", path.display()).dimmed()
    );
    Ok(())
}

async fn discover(bus: &AgentBus, filter: &DiscoveryFilter, as_json: bool) -> anyhow::Result<()> {
    let agents = bus.discover(filter).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    if agents.is_empty() {
        println!("No agents found");
        return Ok(());
    }
    for agent in &agents {
        print_agent(agent);
    }
    Ok(())
}

fn print_agent(agent: &DiscoveredAgent) {
    let status = match agent.status {
        LivenessStatus::Active => agent.status.as_str().green(),
        LivenessStatus::Inactive => agent.status.as_str().red(),
        LivenessStatus::Unknown => agent.status.as_str().dimmed(),
    };
    println!("{} [{}] {}", agent.card.name.bright_white().bold(), status, agent.card.id.dimmed());
    if !agent.card.description.is_empty() {
        println!("  {}", agent.card.description);
    }
    if !agent.card.capabilities.is_empty() {
        let tags: Vec<&str> = agent.card.capabilities.iter().map(String::as_str).collect();
        println!("  capabilities: {}", tags.join(", ").cyan());
    }
}

async fn messages(bus: &AgentBus, options: ReceiveOptions, as_json: bool) -> anyhow::Result<()> {
    let marking = options.mark_as_read;
    let envelopes = bus.receive(options).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&envelopes)?);
        return Ok(());
    }
    if envelopes.is_empty() {
        println!("No messages");
        return Ok(());
    }
    for envelope in &envelopes {
        print_envelope(envelope);
    }
    if marking {
        println!("{}", format!("Marked {} message(s) as read", envelopes.len()).dimmed());
    }
    Ok(())
}

fn print_envelope(envelope: &Envelope) {
    let kind = if envelope.is_control_signal() {
        envelope.kind.as_str().red().bold()
    } else {
        envelope.kind.as_str().cyan()
    };
    let body = match envelope.text() {
        Some(text) => text.to_string(),
        None => envelope.body.to_string(),
    };
    println!(
        "{} [{}] {} ({}): {}",
        envelope.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        kind,
        envelope.sender_name.bright_white(),
        envelope.sender_id.dimmed(),
        body
    );
}

async fn watch(bus: &AgentBus, interval: Duration) -> anyhow::Result<()> {
    let card = bus.card().load().await?;
    println!(
        "Watching messages for {} ({}). Press Ctrl-C to stop.",
        card.name.bright_white(),
        card.id.dimmed()
    );

    let mut seen = HashSet::new();
    loop {
        match bus.receive(ReceiveOptions::peek()).await {
            Ok(envelopes) => {
                for envelope in envelopes {
                    if seen.insert(envelope.envelope_id.clone()) {
                        print_envelope(&envelope);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Receive failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    #[cfg(feature = "telemetry")]
    tracing::debug!("\n{}", a2a_bus::telemetry::GLOBAL_METRICS.snapshot().format_report());
    Ok(())
}

async fn inject(bus: &AgentBus, recipient: &str, file: &Path) -> anyhow::Result<()> {
    let instructions = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Cannot read {}", file.display()))?;
    let body = json!({
        "text": "Instructions from file",
        "instructions": instructions,
        "inject": true,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "priority": "high",
    });
    let envelope = bus.send(recipient, body, EnvelopeKind::Action).await?;
    println!(
        "{} Injected {} into {} ({})",
        "✓".green(),
        file.display(),
        recipient.bright_white(),
        envelope.envelope_id.dimmed()
    );
    Ok(())
}

async fn status(bus: &AgentBus) -> anyhow::Result<()> {
    let document = bus.liveness().snapshot().await;
    if document.active_agents.is_empty() {
        println!("No liveness entries");
        return Ok(());
    }
    let now = chrono::Utc::now();
    for (id, entry) in &document.active_agents {
        let status = match entry.status {
            LivenessStatus::Active => entry.status.as_str().green(),
            LivenessStatus::Inactive => entry.status.as_str().red(),
            LivenessStatus::Unknown => entry.status.as_str().dimmed(),
        };
        let age = entry
            .last_update
            .map(|at| format!("{}s ago", (now - at).num_seconds().max(0)))
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<38} {:<9} {:<12} {}",
            id,
            status,
            age,
            entry.name.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn orchestrator(bus: &AgentBus) -> anyhow::Result<()> {
    match bus.orchestrator().get_orchestrator().await {
        Some(descriptor) => {
            println!("{} ({})", descriptor.name.bright_white().bold(), descriptor.id.dimmed());
            if let Some(project) = &descriptor.project_name {
                println!("Project: {project}");
            }
        }
        None => println!("No orchestrator registered"),
    }
    let status = bus.orchestrator().get_orchestrator_status().await;
    println!("Status: {}", status.status.cyan());
    if let Some(message) = &status.message {
        println!("  {message}");
    }
    Ok(())
}
