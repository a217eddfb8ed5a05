//! frpgate
//!
//! Exposes a local port on a public URL through a supervised frpc tunnel.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;

use frpgate::{
    AcquirerOptions, BinaryAcquirer, BinarySource, ProcessSupervisor, SupervisorOptions,
    TunnelConfig, TunnelEvent, TunnelState, resolve_platform,
};
use frpgate_core::Settings;
use frpgate_core::config::load_settings;
use frpgate_core::tracing_init::{filter_for, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "frpgate")]
#[command(version, about = "frpgate - expose a local service through a supervised frpc tunnel")]
struct Args {
    /// Log level filter (e.g. "info", "debug").
    #[arg(long, global = true, env = "FRPGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, global = true, env = "FRPGATE_LOG_JSON")]
    log_json: bool,

    /// frpc release to use.
    #[arg(long, global = true)]
    frpc_version: Option<String>,

    /// Binary cache directory (default: ~/.frpgate/frpc).
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Use this frpc executable instead of downloading one.
    #[arg(long, global = true)]
    frpc_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expose a local port and keep the tunnel up until interrupted.
    Expose {
        /// Local port of the service.
        #[arg(long, short)]
        port: u16,

        /// Local host of the service.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Requested subdomain (random when omitted).
        #[arg(long)]
        subdomain: Option<String>,

        /// Proxy type: http, https or tcp.
        #[arg(long, default_value = "http")]
        protocol: String,

        /// frps control endpoint (host:port).
        #[arg(long)]
        server: Option<String>,

        /// Public base domain of the tunnel server.
        #[arg(long)]
        domain: Option<String>,

        /// Encrypt the client-server control connection.
        #[arg(long)]
        tls: bool,
    },
    /// Download (if needed) the frpc binary and print its path.
    Fetch {
        /// Re-download even when cached.
        #[arg(long)]
        force: bool,
    },
    /// Print the resolved platform tokens.
    Platform,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = load_settings().context("Failed to load settings")?;
    apply_cli_overrides(&mut settings, &args);

    init_tracing(
        &filter_for("frpgate", &settings.log.level),
        settings.log.json,
    );

    match args.command {
        Command::Expose {
            port,
            host,
            subdomain,
            protocol,
            server,
            domain,
            tls,
        } => {
            let mut builder = TunnelConfig::builder(
                server.unwrap_or_else(|| settings.tunnel.server_address.clone()),
                domain.unwrap_or_else(|| settings.tunnel.tunnel_domain.clone()),
            )
            .protocol(protocol)
            .use_tls(tls)
            .local_host(host)
            .local_port(port);
            if let Some(subdomain) = subdomain {
                builder = builder.subdomain(subdomain);
            }
            expose(&settings, builder.build()?).await
        }
        Command::Fetch { force } => fetch(&settings, force).await,
        Command::Platform => {
            print_line(&resolve_platform().to_string());
            Ok(())
        }
    }
}

fn apply_cli_overrides(settings: &mut Settings, args: &Args) {
    if let Some(level) = &args.log_level {
        settings.log.level.clone_from(level);
    }
    if args.log_json {
        settings.log.json = true;
    }
    if let Some(version) = &args.frpc_version {
        settings.tunnel.frpc_version.clone_from(version);
    }
    if let Some(dir) = &args.cache_dir {
        settings.tunnel.cache_dir = Some(dir.clone());
    }
    if let Some(path) = &args.frpc_path {
        settings.tunnel.frpc_path = Some(path.clone());
    }
}

fn acquirer(settings: &Settings) -> anyhow::Result<BinaryAcquirer> {
    Ok(BinaryAcquirer::new(
        settings.tunnel.resolved_cache_dir()?,
        AcquirerOptions::from_settings(&settings.tunnel),
    )?)
}

fn binary_source(settings: &Settings) -> anyhow::Result<BinarySource> {
    if let Some(path) = &settings.tunnel.frpc_path {
        info!(path = %path.display(), "Using preinstalled frpc");
        return Ok(BinarySource::Fixed(path.clone()));
    }
    Ok(BinarySource::Managed {
        acquirer: acquirer(settings)?,
        version: settings.tunnel.frpc_version.clone(),
        platform: resolve_platform(),
    })
}

async fn expose(settings: &Settings, config: TunnelConfig) -> anyhow::Result<()> {
    let supervisor = ProcessSupervisor::new(
        binary_source(settings)?,
        SupervisorOptions::from_settings(&settings.supervisor),
    );
    let mut events = supervisor.subscribe();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server_address(),
        local_port = ?config.local_port(),
        "Starting frpgate"
    );
    let handle = supervisor.start(config).await?;
    if let Some(url) = handle.public_url() {
        print_line(&url);
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        tracing::warn!(error = %e, "Failed to notify systemd");
    }

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            Ok(())
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            Ok(())
        }
        () = tunnel_failed(&mut events, handle.id()) => {
            let status = handle.status();
            Err(anyhow::anyhow!(
                "Tunnel failed: {}",
                status.last_error.unwrap_or_else(|| "unknown error".to_string())
            ))
        }
    };

    supervisor.shutdown().await;
    info!("frpgate stopped");
    outcome
}

/// Resolves once the tunnel `id` reaches `Failed`.
async fn tunnel_failed(events: &mut broadcast::Receiver<TunnelEvent>, id: &str) {
    loop {
        match events.recv().await {
            Ok(event) if event.tunnel_id == id && event.to == TunnelState::Failed => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn fetch(settings: &Settings, force: bool) -> anyhow::Result<()> {
    let platform = resolve_platform();
    let artifact = acquirer(settings)?
        .ensure_artifact(&settings.tunnel.frpc_version, &platform, force)
        .await?;
    info!(
        version = %artifact.version,
        %platform,
        verified = artifact.verified,
        "frpc binary ready"
    );
    print_line(&artifact.local_path.display().to_string());
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_line(line: &str) {
    println!("{line}");
}
