//! Control client for an IP Webcam device.
//!
//! Usage:
//!   ipcam --ip 192.168.0.103 --port 8080            # poll sensors until Ctrl-C
//!   ipcam --ip 192.168.0.103 zoom in
//!   ipcam -c /etc/ipcam.conf preview --out /tmp/preview.jpg

mod client;
mod config;
mod error;
mod model;
mod preview;
mod sensors;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::CameraClient;
use crate::config::ClientConfig;
use crate::error::{CamError, Result};
use crate::model::{classify_orientation, Orientation, PowerState};
use crate::preview::JpegFileSink;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "ipcam", about = "IP Webcam control client")]
struct Cli {
    /// IP address of the camera [default: 192.168.0.103].
    #[arg(long)]
    ip: Option<String>,

    /// HTTP port of the camera [default: 8080].
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Path to a key = value configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log to syslog instead of stderr.
    #[arg(long)]
    syslog: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the sensors until interrupted (the default).
    ///
    /// Logs the latest accelerometer sample per poll; `RUST_LOG=debug` also
    /// shows the raw `sensors.json` snapshots.
    Sensors,
    /// Print the current settings.
    Status,
    /// Print the legal values of every setting.
    Avail,
    /// Set the orientation, or `auto` to derive it from the accelerometer.
    Orientation { value: String },
    Torch { state: PowerState },
    Focus { state: PowerState },
    /// Focus, hold, then release.
    HoldFocus {
        #[arg(long, default_value_t = 2.0)]
        secs: f64,
    },
    Zoom {
        #[command(subcommand)]
        action: ZoomAction,
    },
    /// Write the live stream, timestamped, to a JPEG file until Ctrl-C.
    Preview {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the mean brightness of one video frame.
    Brightness,
}

#[derive(Debug, Subcommand)]
enum ZoomAction {
    In,
    Out,
    /// Zoom to a level listed by `avail`.
    Set { value: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match build_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ipcam: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("ipcam: config validation: {e}");
        process::exit(1);
    }

    if let Err(e) = setup_logging(cfg.log_syslog) {
        eprintln!("ipcam: logging: {e}");
        process::exit(1);
    }

    let client = match CameraClient::connect(&cfg).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ipcam: {e}");
            process::exit(1);
        }
    };

    let command = cli.command.unwrap_or(Command::Sensors);
    if let Err(e) = run(&client, &cfg, command).await {
        warn!("{e}");
    }
}

/// Defaults, then the config file, then command-line flags.
fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => ClientConfig::default(),
    };
    if let Some(ip) = &cli.ip             { cfg.connection.host     = ip.clone(); }
    if let Some(port) = cli.port          { cfg.connection.port     = port; }
    if let Some(user) = &cli.username     { cfg.connection.username = user.clone(); }
    if let Some(pass) = &cli.password     { cfg.connection.password = pass.clone(); }
    if cli.syslog                         { cfg.log_syslog          = true; }
    Ok(cfg)
}

async fn run(client: &CameraClient, cfg: &ClientConfig, command: Command) -> Result<()> {
    match command {
        Command::Sensors => run_sensors(client).await,
        Command::Status => {
            let snap = client.get_current_status().await?;
            println!("{}", serde_json::to_string_pretty(&snap.0)?);
        }
        Command::Avail => {
            let avail = client.get_available_values().await?;
            println!("{}", serde_json::to_string_pretty(&avail.0)?);
        }
        Command::Orientation { value } if value.eq_ignore_ascii_case("auto") => {
            match client.auto_orientation().await? {
                Some(o) => println!("{o}"),
                None => println!("unknown"),
            }
        }
        Command::Orientation { value } => {
            client.set_orientation(value.parse::<Orientation>()?).await?;
        }
        Command::Torch { state } => client.set_torch(state).await?,
        Command::Focus { state } => client.set_focus(state).await?,
        Command::HoldFocus { secs } => {
            let cancel = cancel_on_ctrl_c();
            let hold = Duration::try_from_secs_f64(secs)
                .map_err(|e| CamError::InvalidArgument(format!("--secs {secs}: {e}")))?;
            client.hold_focus(hold, &cancel).await?;
        }
        Command::Zoom { action } => {
            let idx = match action {
                ZoomAction::In => client.zoom_in().await?,
                ZoomAction::Out => client.zoom_out().await?,
                ZoomAction::Set { value } => client.zoom_set(value).await?,
            };
            if let Some(idx) = idx {
                println!("zoom index {idx}");
            }
        }
        Command::Preview { out } => {
            let path = out.unwrap_or_else(|| cfg.preview_file.clone());
            let mut sink = JpegFileSink::create(&path)?;
            info!("writing preview to {} (Ctrl-C to stop)", path.display());
            client.stream_preview(&mut sink, &cancel_on_ctrl_c()).await?;
        }
        Command::Brightness => println!("{:.1}", client.brightness().await?),
    }
    Ok(())
}

/// Run the sensor poller on a background task and report orientation changes
/// until Ctrl-C.
async fn run_sensors(client: &CameraClient) {
    let cancel = cancel_on_ctrl_c();
    let (tx, mut rx) = watch::channel(None);
    let poller = tokio::spawn(sensors::run_sensor_poller(client.clone(), cancel.clone(), tx));

    let mut last = None;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let Some(sample) = *rx.borrow_and_update() else { continue };
        let orientation = classify_orientation(&sample);
        if orientation != last {
            match orientation {
                Some(o) => info!("device orientation: {o} (ax={:.2}, ay={:.2})", sample.ax, sample.ay),
                None => info!("device orientation: undetermined"),
            }
            last = orientation;
        }
    }

    if let Err(e) = poller.await {
        warn!("sensor poller task: {e}");
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
        }
        trigger.cancel();
    });
    cancel
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "ipcam".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }
    Ok(())
}
