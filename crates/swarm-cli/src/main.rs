use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use swarm_core::transport::events;
use swarm_core::{
    ChannelTransport, DispatchStatus, LocalMemory, MemoryStore, ModelBackend, NoopMemory,
    NullTransport, OpenAiCompatBackend, SupermemoryClient, Swarm, Transport,
};
use swarm_gateway::{EventBus, GatewayServer};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{MemoryKind, SwarmConfig};

#[derive(Parser)]
#[command(name = "swarm")]
#[command(version)]
#[command(about = "Swarm — route messages to a team of AI agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket gateway
    Start,

    /// Send a one-shot message; @mentions pick the agents
    Ask {
        /// The message to send
        message: String,

        /// Stream the reply chunk by chunk
        #[arg(short, long)]
        stream: bool,

        /// Send to this agent instead of routing
        #[arg(short, long)]
        agent: Option<String>,

        /// Override the agent's model (streaming only)
        #[arg(short, long)]
        model: Option<String>,
    },

    /// List the agent catalog
    Agents,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Agents => cmd_agents(&cli.config),
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Ask {
            message,
            stream,
            agent,
            model,
        } => {
            if stream {
                cmd_ask_stream(&cli.config, &message, agent, model).await
            } else {
                cmd_ask(&cli.config, &message, agent).await
            }
        }
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config::default_config_path();
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, config::DEFAULT_CONFIG)
            .await
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Loading refuses group/world readable files
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Swarm initialized at {}", config_dir.display());
    println!(
        "Set OPENROUTER_API_KEY or edit {} to configure the backend and agents.",
        config_path.display()
    );
    Ok(())
}

fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    // Debug output masks every secret
    println!("{:#?}", cfg);
    Ok(())
}

fn cmd_agents(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    cfg.registry()?;

    for agent in &cfg.agents {
        println!(
            "@{:<12} {:<22} {:<32} {}",
            agent.id,
            agent.name,
            agent.role,
            agent.model_or(&cfg.backend.default_model)
        );
        for cap in &agent.capabilities {
            println!("    {:<28} {:.2}  [{}]", cap.name, cap.confidence, cap.tags.join(", "));
        }
    }
    Ok(())
}

/// Wire the collaborators named in the config into a swarm
fn build_swarm(cfg: &SwarmConfig, transport: Arc<dyn Transport>) -> Result<Swarm> {
    let registry = Arc::new(cfg.registry()?);

    if cfg.backend.api_key.trim().is_empty() {
        warn!(
            "No API key for backend '{}'; every call will fail until one is configured",
            cfg.backend.provider
        );
    }
    let backend: Arc<dyn ModelBackend> = Arc::new(
        OpenAiCompatBackend::new(
            cfg.backend.provider.clone(),
            cfg.backend.api_key.clone(),
            cfg.backend.base_url.clone(),
        )
        .context("Failed to create model backend")?,
    );

    let memory: Arc<dyn MemoryStore> = match cfg.memory.kind {
        MemoryKind::None => Arc::new(NoopMemory),
        MemoryKind::Local => Arc::new(LocalMemory::new(cfg.memory.capacity)),
        MemoryKind::Supermemory => Arc::new(
            SupermemoryClient::new(cfg.memory.api_key.clone(), cfg.memory.base_url.clone())
                .context("Failed to create Supermemory client")?,
        ),
    };
    info!(
        "Backend: {} ({}), memory: {:?}",
        backend.provider_name(),
        cfg.backend.default_model,
        cfg.memory.kind
    );

    Ok(Swarm::new(
        registry,
        backend,
        memory,
        transport,
        cfg.swarm_options(),
    ))
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    info!("Starting swarm gateway...");

    let bind: SocketAddr = cfg
        .gateway
        .bind
        .parse()
        .with_context(|| format!("Invalid gateway bind address '{}'", cfg.gateway.bind))?;

    let events = EventBus::new(cfg.gateway.event_capacity);
    let swarm = Arc::new(build_swarm(&cfg, Arc::new(events.clone()))?);
    let server = GatewayServer::new(bind, swarm.clone(), events);
    let mut gateway = server.spawn();

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Received Ctrl+C, shutting down...");
        }
        res = &mut gateway => {
            res.context("Gateway task panicked")??;
        }
    }

    let sessions = swarm.sessions().await;
    for session in &sessions {
        let _ = swarm.stop_stream(&session.session_id).await;
    }
    if !sessions.is_empty() {
        info!("Stopped {} active streams", sessions.len());
    }
    gateway.abort();

    println!("Swarm stopped.");
    Ok(())
}

async fn cmd_ask(config_path: &Option<PathBuf>, message: &str, agent: Option<String>) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    let swarm = build_swarm(&cfg, Arc::new(NullTransport))?;

    let result = swarm
        .handle_message(message, agent.map(|a| vec![a]), &[], None)
        .await?;

    for outcome in &result.results {
        match outcome.status {
            DispatchStatus::Success => {
                println!(
                    "[{}]\n{}\n",
                    outcome.agent_name,
                    outcome.content.as_deref().unwrap_or_default()
                );
            }
            DispatchStatus::Failure => {
                println!(
                    "[{}] failed: {}\n",
                    outcome.agent_name,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    info!(
        "{} succeeded, {} failed in {}ms",
        result.success_count(),
        result.failure_count(),
        result.elapsed_ms
    );
    Ok(())
}

async fn cmd_ask_stream(
    config_path: &Option<PathBuf>,
    message: &str,
    agent: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let cfg = SwarmConfig::load(config_path)?;
    let (transport, mut rx) = ChannelTransport::new();
    let swarm = build_swarm(&cfg, Arc::new(transport))?;

    let handle = swarm.start_stream("cli", message, agent, &[], model).await?;
    let session_id = handle.session_id.clone();
    println!("[{}]", handle.agent_id);

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event.event.as_str() {
                    events::STREAM_CHUNK => {
                        if let Some(chunk) = event.data["chunk"].as_str() {
                            print!("{}", chunk);
                            stdout.flush()?;
                        }
                    }
                    events::STREAM_END => {
                        println!();
                        break;
                    }
                    events::STREAM_CANCELLED => {
                        println!("\n[stopped]");
                        break;
                    }
                    events::STREAM_ERROR => {
                        println!();
                        anyhow::bail!(
                            "stream failed: {}",
                            event.data["error"].as_str().unwrap_or("unknown error")
                        );
                    }
                    _ => {}
                }
            }
            res = signal::ctrl_c() => {
                res?;
                let _ = swarm.stop_stream(&session_id).await;
            }
        }
    }

    let state = handle.finished().await;
    info!("Session {} finished: {}", session_id, state);
    Ok(())
}
