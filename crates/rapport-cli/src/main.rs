//! CLI binary for inspecting, validating, and replaying Rapport flow files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Serialize;

use rapport_flow::{AgentConfig, ChannelTransport, FlowFile, Severity};
use rapport_route::{parse_route, ArrowStyle};
use rapport_types::{Envelope, Message};

#[derive(Parser)]
#[command(name = "rapport", version, about = "Per-agent flow engine for chatty agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the states, edges, and triggers of a flow file
    Describe {
        /// Path to the flow .json file
        flow: PathBuf,

        /// Print the graph descriptor as JSON
        #[arg(long)]
        json: bool,
    },

    /// Lint a flow file and its handlers
    Validate {
        /// Path to the flow .json file
        flow: PathBuf,

        /// Agent config .json file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Parse a route expression and print its structure
    ParseRoute {
        /// Route text, e.g. "register --[ ok ]--> contact"
        route: String,

        /// Use the arrow style of this flow file
        #[arg(long)]
        flow: Option<PathBuf>,
    },

    /// Feed recorded envelopes (one JSON object per line) through an agent
    Replay {
        /// Path to the flow .json file
        flow: PathBuf,

        /// JSONL file of `{ "remote_addr": ..., "content": ... }` envelopes
        envelopes: PathBuf,

        /// Agent config .json file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Also run periodic senders once after every envelope
        #[arg(long)]
        tick: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Describe { flow, json } => {
            cmd_describe(&flow, json).await?;
        }
        Commands::Validate { flow, config } => {
            cmd_validate(&flow, config.as_deref()).await?;
        }
        Commands::ParseRoute { route, flow } => {
            cmd_parse_route(&route, flow.as_deref()).await?;
        }
        Commands::Replay {
            flow,
            envelopes,
            config,
            tick,
        } => {
            cmd_replay(&flow, &envelopes, config.as_deref(), tick).await?;
        }
    }

    Ok(())
}

async fn load_flow(path: &Path) -> anyhow::Result<FlowFile> {
    FlowFile::load(path)
        .await
        .with_context(|| format!("failed to load flow file {}", path.display()))
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::load(path)
            .await
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(AgentConfig::default()),
    }
}

async fn cmd_describe(path: &Path, json: bool) -> anyhow::Result<()> {
    let graph = load_flow(path).await?.graph()?;
    let descriptor = graph.descriptor();

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptor)?);
        return Ok(());
    }

    println!("States: {}", descriptor.nodes.len());
    for node in &descriptor.nodes {
        println!("  {node}");
    }
    println!("Edges: {}", descriptor.edges.len());
    for edge in &descriptor.edges {
        println!("  {}", edge.route);
    }
    println!("Triggers: {}", descriptor.triggers.join(", "));
    Ok(())
}

async fn cmd_validate(path: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let flow = load_flow(path).await?;
    let config = load_config(config).await?;
    let diagnostics = flow.builder(config)?.diagnostics();

    if diagnostics.is_empty() {
        println!("Flow is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
        if let Some(fix) = &diag.fix {
            println!("    fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_parse_route(text: &str, flow: Option<&Path>) -> anyhow::Result<()> {
    let style = match flow {
        Some(path) => load_flow(path).await?.arrow,
        None => ArrowStyle::default(),
    };
    let route = parse_route(text, &style)?;
    println!("{}", serde_json::to_string_pretty(&route)?);
    println!("{}", route.render(&style));
    Ok(())
}

/// One line of replay output.
#[derive(Serialize)]
struct ReplayLine {
    line: usize,
    accepted: bool,
    transitions: Vec<String>,
    sent: Vec<Message>,
}

async fn cmd_replay(
    flow_path: &Path,
    envelopes_path: &Path,
    config: Option<&Path>,
    tick: bool,
) -> anyhow::Result<()> {
    let flow = load_flow(flow_path).await?;
    let config = load_config(config).await?;
    let (transport, mut outbound) = ChannelTransport::new();
    let agent = flow.agent(config, Arc::new(transport))?;

    let source = tokio::fs::read_to_string(envelopes_path)
        .await
        .with_context(|| format!("failed to read {}", envelopes_path.display()))?;

    let mut replayed = 0;
    for (index, raw) in source.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        replayed += 1;
        let envelope: Envelope = serde_json::from_str(raw)
            .with_context(|| format!("line {}: not an envelope", index + 1))?;

        let report = agent.handle_envelope(envelope).await;
        agent.run_gated_sends().await;
        if tick {
            agent.run_periodic_all().await;
        }

        let mut sent = Vec::new();
        while let Ok(message) = outbound.try_recv() {
            sent.push(message);
        }
        let transitions = report
            .transitions()
            .map(|d| format!("{}: {} -> {}", d.key, d.state, d.next_state()))
            .collect();
        let line = ReplayLine {
            line: index + 1,
            accepted: report.accepted,
            transitions,
            sent,
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    let snapshot = agent.store().snapshot().await?;
    tracing::info!(
        envelopes = replayed,
        peers = snapshot.peers.len(),
        "replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
