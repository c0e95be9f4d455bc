//! PCM Relay
//!
//! `pcm-relay list` prints the device listing on stdout.
//! `pcm-relay capture` captures an endpoint and relays it to the selected
//! destinations until the chain closes or the duration elapses.
//!
//! Diagnostics go to stderr; stdout carries only the listing or raw audio.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_relay::{
    audio::device::{list_devices, write_listing, DataFlow, DeviceState, Role, StateMask},
    config::{CaptureConfig, ListConfig},
    lifetime,
    pipeline::Pipeline,
    Error,
};

#[derive(Parser, Debug)]
#[command(name = "pcm-relay")]
#[command(about = "Capture endpoint audio and relay it to devices, the network or stdout")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List audio endpoints
    List(ListArgs),
    /// Capture and relay audio
    Capture(CaptureArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Endpoint direction
    #[arg(value_enum, default_value = "all")]
    flow: DataFlow,

    /// States to include, all if none given
    #[arg(value_enum)]
    states: Vec<DeviceState>,
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Configuration file, `<config dir>/pcm-relay/capture.toml` if unset
    #[arg(long, env = "PCM_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Source device id
    #[arg(long, conflicts_with_all = ["from_flow", "from_role"])]
    from_device: Option<String>,

    /// Source direction; render endpoints are captured in loopback
    #[arg(long, value_enum)]
    from_flow: Option<DataFlow>,

    /// Source default-device role
    #[arg(long, value_enum)]
    from_role: Option<Role>,

    /// Play on this render device
    #[arg(long, conflicts_with = "to_role")]
    to_device: Option<String>,

    /// Play on the default render device for this role
    #[arg(long, value_enum)]
    to_role: Option<Role>,

    /// Stream over UDP
    #[arg(long)]
    to_network: bool,

    /// Peer address for the UDP stream
    #[arg(long, requires = "to_network")]
    peer: Option<String>,

    /// Peer port for the UDP stream
    #[arg(long, requires = "to_network")]
    service: Option<String>,

    /// Local address to send from
    #[arg(long, requires = "to_network")]
    bind: Option<String>,

    /// Write raw f32 samples to stdout
    #[arg(long)]
    to_stdout: bool,

    /// Shared-memory control block name
    #[arg(long)]
    shm: Option<String>,

    /// Skip the shared-memory tap stage
    #[arg(long, requires = "shm")]
    no_shm_tap: bool,

    /// Skip the shared-memory averaging stage
    #[arg(long, requires = "shm")]
    no_shm_averaging: bool,

    /// Chain sample rate in Hz
    #[arg(long)]
    samplerate: Option<u32>,

    /// Chain channel count (lowest positions of the mask)
    #[arg(long, conflicts_with = "channel_mask")]
    channels: Option<u32>,

    /// Chain channel mask, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_mask)]
    channel_mask: Option<u32>,

    /// Seconds to run, unbounded if unset
    #[arg(long)]
    duration: Option<f64>,

    /// Exit when this process id exits
    #[arg(long)]
    lifetime: Option<u32>,
}

fn parse_mask(value: &str) -> std::result::Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid channel mask {}: {}", value, e))
}

impl CaptureArgs {
    /// Overlay flags on top of file settings
    fn apply(&self, config: &mut CaptureConfig) -> Result<()> {
        if let Some(device) = &self.from_device {
            config.source_device = Some(device.clone());
        }
        if let Some(flow) = self.from_flow {
            config.source_device = None;
            config.source_flow = flow;
        }
        if let Some(role) = self.from_role {
            config.source_device = None;
            config.source_role = role;
        }

        if let Some(device) = &self.to_device {
            config.render.enabled = true;
            config.render.device = Some(device.clone());
        }
        if let Some(role) = self.to_role {
            config.render.enabled = true;
            config.render.device = None;
            config.render.role = role;
        }

        if self.to_network {
            config.network.enabled = true;
        }
        if let Some(peer) = &self.peer {
            config.network.target.peer_address = Some(peer.clone());
        }
        if let Some(service) = &self.service {
            config.network.target.peer_service = Some(service.clone());
        }
        if let Some(bind) = &self.bind {
            config.network.target.bind_address = Some(bind.clone());
        }

        config.stdout |= self.to_stdout;

        if let Some(name) = &self.shm {
            config.shared_memory.name = Some(name.clone());
        }
        if self.no_shm_tap {
            config.shared_memory.tap = false;
        }
        if self.no_shm_averaging {
            config.shared_memory.averaging = false;
        }

        if let Some(rate) = self.samplerate {
            config.sample_rate = Some(rate);
        }
        if let Some(channels) = self.channels {
            config.set_channels(channels).map_err(Error::from)?;
        }
        if let Some(mask) = self.channel_mask {
            config.channel_mask = Some(mask);
        }
        if let Some(duration) = self.duration {
            config.duration = Some(duration);
        }
        if let Some(pid) = self.lifetime {
            config.lifetime = Some(pid);
        }

        Ok(())
    }
}

fn list(args: ListArgs) -> Result<()> {
    let config = ListConfig {
        flow: args.flow,
        states: args.states,
    };
    let devices = list_devices(config.flow, StateMask::from_states(&config.states))
        .map_err(Error::from)
        .context("Failed to enumerate devices")?;

    write_listing(&mut io::stdout().lock(), &devices).context("Failed to write listing")?;
    Ok(())
}

fn capture(args: CaptureArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::load(path).map_err(Error::from)?,
        None => CaptureConfig::load_default().map_err(Error::from)?,
    };
    args.apply(&mut config)?;

    tracing::info!("Initializing capture (PID {})", std::process::id());

    if let Some(pid) = config.lifetime {
        lifetime::bind_to_process(pid).context("Failed to start lifetime watcher")?;
    }

    let mut pipeline = Pipeline::from_config(&config).context("Failed to initialize capture")?;
    tracing::info!("Capture initialized");

    pipeline.run(config.duration).context("Capture failed")?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::List(args) => list(args),
        Command::Capture(args) => capture(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            match e.downcast_ref::<Error>() {
                Some(Error::Config(_)) => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}
