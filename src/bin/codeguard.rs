//! CodeGuard CLI binary.
//!
//! # Commands
//!
//! - `serve` - Start the HTTP API and real-time server
//! - `scan` - Scan text for prompt injection and jailbreaks
//! - `validate` - Validate an analysis request JSON offline
//! - `dashboard` - Fetch the security dashboard from a running server
//! - `watch` - Follow a project's real-time broadcasts

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use codeguard::{
    client::{ClientConnector, ClientEvent},
    config::{Config, LoggingSection},
    security::{SecurityConfig, SecurityIntegration, ThreatDetectionEngine, ThreatLevel},
    server::create_router,
    transport::{TcpTransport, Transport},
    AnalysisRequest, AppState, VERSION,
};

#[derive(Parser)]
#[command(name = "codeguard")]
#[command(version = VERSION)]
#[command(about = "CodeGuard - security and real-time layer for AI code analysis", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/codeguard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Enable debug logging
        #[arg(short, long)]
        verbose: bool,

        /// Emit JSON logs
        #[arg(long)]
        json_logs: bool,
    },

    /// Scan text for threats
    Scan {
        /// Text input (or - for stdin)
        input: Option<String>,

        /// Input file path
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Level at which content is flagged (LOW, MEDIUM, HIGH, CRITICAL)
        #[arg(short, long, default_value = "HIGH")]
        threshold: ThreatLevel,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate an analysis request offline
    Validate {
        /// Request JSON (or - for stdin)
        input: Option<String>,

        /// Request file path
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show the security dashboard of a running server
    Dashboard {
        /// Server base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },

    /// Follow real-time broadcasts
    Watch {
        /// Real-time endpoint
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,

        /// Projects to follow
        #[arg(short, long)]
        project: Vec<String>,

        /// Channels to follow
        #[arg(long)]
        channel: Vec<String>,

        /// User id sent at handshake
        #[arg(long)]
        user: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            verbose,
            json_logs,
        } => cmd_serve(config, port, host, verbose, json_logs),

        Commands::Scan {
            input,
            file,
            threshold,
            json,
        } => cmd_scan(&config, input, file, threshold, json),

        Commands::Validate { input, file } => cmd_validate(&config, input, file),

        Commands::Dashboard { url } => cmd_dashboard(&url),

        Commands::Watch {
            url,
            project,
            channel,
            user,
        } => cmd_watch(&config, url, project, channel, user),
    }
}

fn init_logging(logging: &LoggingSection) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn cmd_serve(
    mut config: Config,
    port: Option<u16>,
    host: Option<String>,
    verbose: bool,
    json_logs: bool,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    if verbose {
        config.logging.level = "debug".to_string();
    }
    if json_logs {
        config.logging.json = true;
    }
    init_logging(&config.logging);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let state = Arc::new(AppState::new(&config)?);
        state.start();

        let transport = TcpTransport::new(state.config.addr);
        tracing::info!(
            addr = %transport.listen_addr(),
            security = config.security.enabled,
            max_connections = state.config.broadcast.max_connections,
            "Starting CodeGuard server"
        );

        let shutdown = Box::pin(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        });
        transport
            .serve_with_shutdown(create_router(Arc::clone(&state)), shutdown)
            .await?;

        state.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_scan(
    config: &Config,
    input: Option<String>,
    file: Option<PathBuf>,
    threshold: ThreatLevel,
    json_output: bool,
) -> anyhow::Result<()> {
    let content = read_input(input, file)?;

    let scanner_config = SecurityConfig {
        logging: false,
        ..config.integration_config()?.global
    }
    .with_threshold(threshold);
    let engine = ThreatDetectionEngine::new("cli", scanner_config)?;
    let result = engine.scan(&content, "cli");

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.is_secure {
        println!(
            "SECURE (level: {}, confidence: {:.2})",
            result.threat_level, result.confidence
        );
    } else {
        println!(
            "THREATS DETECTED (level: {}, confidence: {:.2})",
            result.threat_level, result.confidence
        );
        println!();
        for threat in &result.detected_threats {
            println!(
                "  - {} [{}] at {}..{}",
                threat.threat_type, threat.severity, threat.location.start, threat.location.end
            );
            println!("    {}", threat.description);
            println!("    Suggestion: {}", threat.suggestion);
        }

        if let Some(sanitized) = &result.sanitized_content {
            println!();
            println!("Sanitized:");
            println!("{sanitized}");
        }
    }

    if !result.is_secure {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_validate(
    config: &Config,
    input: Option<String>,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let content = read_input(input, file)?;
    let request: AnalysisRequest = serde_json::from_str(&content)?;

    let integration = SecurityIntegration::new(config.integration_config()?)?;
    let decision = integration.validate_analysis_request(&request)?;

    println!("{}", serde_json::to_string_pretty(&decision)?);
    if !decision.is_allowed {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_dashboard(url: &str) -> anyhow::Result<()> {
    let endpoint = format!("{}/security/dashboard", url.trim_end_matches('/'));

    let runtime = tokio::runtime::Runtime::new()?;
    let dashboard: serde_json::Value = runtime.block_on(async {
        let response = reqwest::get(&endpoint).await?.error_for_status()?;
        response.json().await
    })?;

    println!("{}", serde_json::to_string_pretty(&dashboard)?);
    Ok(())
}

fn cmd_watch(
    config: &Config,
    url: String,
    projects: Vec<String>,
    channels: Vec<String>,
    user: Option<String>,
) -> anyhow::Result<()> {
    init_logging(&config.logging);

    let mut client_config = config.client_config(url)?;
    if let Some(user) = user {
        client_config = client_config.with_user(user);
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = ClientConnector::new(client_config);
        let mut events = client.events();
        for project in &projects {
            client.subscribe_project(project);
        }
        for channel in &channels {
            client.subscribe_channel(channel);
        }
        client.connect()?;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ClientEvent::Progress(msg)
                    | ClientEvent::Completed(msg)
                    | ClientEvent::Failed(msg)
                    | ClientEvent::SecurityAlert(msg)) => {
                        println!("{}", msg.to_json()?);
                    },
                    Ok(ClientEvent::MaxAttemptsReached { attempts }) => {
                        anyhow::bail!("Gave up after {attempts} reconnect attempts");
                    },
                    Ok(other) => tracing::info!(event = ?other, "Client event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event stream lagged");
                    },
                    Err(_) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    client.disconnect();
                    break;
                },
            }
        }
        Ok::<_, anyhow::Error>(())
    })
}

fn read_input(input: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    if let Some(path) = file {
        Ok(std::fs::read_to_string(path)?)
    } else if let Some(s) = input {
        if s == "-" {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        } else {
            Ok(s)
        }
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    }
}
