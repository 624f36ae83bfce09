// Camio node: finds peers on the LAN, connects by invitation, exchanges calibration points
// and camera images.

mod commands;
mod config;
mod coordinator;
mod discovery;
mod media;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use camio_core::session::DEFAULT_MAX_BLOB_LEN;
use camio_core::{InvitePolicy, PeerIdentity, SessionCore};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Overrides};
use crate::coordinator::{Coordinator, Event, MediaSettings};
use crate::discovery::Discovery;
use crate::media::ImageStore;
use crate::transport::{Transport, TransportSettings};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "camio-node", version, about = "Camio peer session node")]
struct Cli {
    /// Config file (default: ~/.config/camio/config.toml, then /etc/camio/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display name advertised to peers
    #[arg(short, long)]
    name: Option<String>,

    /// Discovery UDP port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Session TCP port (0 picks a free one)
    #[arg(long)]
    transport_port: Option<u16>,

    /// accept-all or prompt
    #[arg(long, value_parser = parse_policy)]
    invite_policy: Option<InvitePolicy>,

    /// Image file served as the camera
    #[arg(long)]
    frame: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_policy(s: &str) -> Result<InvitePolicy, String> {
    config::parse_invite_policy(s).ok_or_else(|| format!("expected accept-all or prompt, got {s}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = config::load(cli.config.as_deref());
    cfg.apply_overrides(Overrides {
        display_name: cli.name,
        discovery_port: cli.discovery_port,
        transport_port: cli.transport_port,
        invite_policy: cli.invite_policy,
        frame_path: cli.frame,
    });

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "debug"
    } else {
        "info,camio_core=debug,camio_node=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .try_init();
}

async fn run(cfg: Config) -> Result<()> {
    let identity = PeerIdentity::from_seed(cfg.display_name.clone(), cfg.id_seed().as_bytes());
    info!(peer = %identity.id, name = %identity.display_name, "camio node starting");

    let listener = Transport::listen(cfg.transport_port)
        .await
        .with_context(|| format!("cannot bind session port {}", cfg.transport_port))?;
    let listen_port = listener.local_addr()?.port();

    let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = Transport::new(
        identity.clone(),
        listen_port,
        transport_tx,
        TransportSettings {
            invite_timeout: cfg.invite_timeout(),
            max_blob_len: DEFAULT_MAX_BLOB_LEN,
        },
    );
    transport.spawn_accept_loop(listener);
    forward(transport_rx, events_tx.clone(), Event::Transport);
    info!(port = listen_port, "accepting sessions");

    let discovery = match Discovery::bind(
        identity.clone(),
        &cfg.service_type,
        cfg.discovery_port,
        listen_port,
    ) {
        Ok(mut d) => {
            if let Err(e) = d.start_advertising() {
                warn!(error = %e, "not advertising");
            }
            forward(d.browse(), events_tx.clone(), Event::Discovery);
            Some(d)
        }
        Err(e) => {
            warn!(error = %e, "peers will not be discovered; inbound invitations still work");
            None
        }
    };

    spawn_frame_loop(&cfg, events_tx.clone());
    spawn_ticker(events_tx.clone());

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    forward(cmd_rx, events_tx.clone(), Event::Command);
    let stdin_task = tokio::spawn(commands::read_stdin(cmd_tx));

    let core = SessionCore::new(identity, cfg.to_session_config());
    let coordinator = Coordinator::new(
        core,
        transport,
        events_tx,
        MediaSettings {
            transfer: cfg.image_transfer.into(),
            stream_quality: cfg.stream_quality,
            chunk_quality: cfg.chunk_quality,
        },
        ImageStore::new(&cfg.output_dir),
    );
    let shutdown = CancellationToken::new();
    let coordinator_task = tokio::spawn(coordinator.run(events_rx, shutdown.clone()));
    info!("{}", commands::HELP);

    let quit = async {
        match stdin_task.await {
            Ok(true) => {}
            _ => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        res = shutdown_signal() => res?,
        _ = quit => info!("quit requested"),
    }

    info!("shutting down");
    shutdown.cancel();
    let _ = coordinator_task.await;
    if let Some(d) = discovery {
        d.shutdown().await;
    }
    Ok(())
}

/// Pipe one producer's events into the coordinator inbox.
fn forward<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    inbox: mpsc::UnboundedSender<Event>,
    wrap: fn(T) -> Event,
) {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if inbox.send(wrap(item)).is_err() {
                break;
            }
        }
    });
}

fn spawn_frame_loop(cfg: &Config, inbox: mpsc::UnboundedSender<Event>) {
    let mut source = media::frame_source(cfg.frame_path.as_deref());
    let period = cfg.frame_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Some(frame) = source.capture() {
                if inbox.send(Event::Frame(frame)).is_err() {
                    break;
                }
            }
        }
    });
}

fn spawn_ticker(inbox: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            if inbox.send(Event::Tick).is_err() {
                break;
            }
        }
    });
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
