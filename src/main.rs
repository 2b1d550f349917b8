#![warn(clippy::pedantic)]

use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

mod catalog;
mod config;
mod content;
mod display;
mod epc;
mod error;
mod figbox;
mod figurine;
mod frame;
mod pipe;
mod printer;
mod ratelimit;
mod reader;
mod shapes;
mod slip;
mod store;

use catalog::Catalog;
use config::Config;
use content::{ContentClient, ContentSettings, FallbackTable};
use display::Matrix;
use error::{Error, Result};
use figbox::Figbox;
use pipe::serve_control_pipe;
use printer::Printer;
use ratelimit::RateLimiter;
use reader::{Reader, ReaderHandle};
use store::{RecordStoreClient, SlipStore};

#[derive(Clone, Copy, Serialize)]
pub(crate) struct BuildInfo {
    version: &'static str,
    profile: &'static str,
    target: &'static str,
    commit: &'static str,
    dirty: &'static str,
    rustc: &'static str,
    built_at: &'static str,
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    profile: match (option_env!("BUILD_PROFILE"), option_env!("PROFILE")) {
        (Some(value), _) | (None, Some(value)) => value,
        (None, None) => "unknown",
    },
    target: match (option_env!("BUILD_TARGET"), option_env!("TARGET")) {
        (Some(value), _) | (None, Some(value)) => value,
        (None, None) => "unknown",
    },
    commit: match option_env!("GIT_COMMIT") {
        Some(value) => value,
        None => "unknown",
    },
    dirty: match option_env!("GIT_DIRTY") {
        Some(value) => value,
        None => "unknown",
    },
    rustc: match option_env!("RUSTC_VERSION") {
        Some(value) => value,
        None => "unknown",
    },
    built_at: match option_env!("BUILD_TIMESTAMP") {
        Some(value) => value,
        None => "unknown",
    },
};

#[derive(Parser)]
#[command(version, about = "Figbox installation controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Server(ServerArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// Path to the TOML configuration file
    config: PathBuf,

    /// Paper-saving dry run: compose slips but never print them
    #[arg(long)]
    no_print: bool,

    /// RFID regulatory region (EU, US, CN, IN, JP)
    #[arg(long)]
    region: Option<String>,

    /// RFID transmit power in dBm
    #[arg(long)]
    power: Option<u16>,

    /// Number of distinct tokens that start a cycle
    #[arg(long)]
    target_tags: Option<usize>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    init_tracing();
    log_build_info();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Server(args) => run_server(&args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Error: {err}");
            match err {
                Error::DeviceUnavailable { .. } => ExitCode::from(2),
                Error::Config(_) | Error::Csv(_) => ExitCode::from(3),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run_server(args: &ServerArgs) -> Result<()> {
    dotenvy::dotenv().ok();

    let mut config = Config::load(&args.config)?;
    config.apply_cli(
        args.no_print,
        args.region.as_deref(),
        args.power,
        args.target_tags,
    )?;

    let catalog = Catalog::load(&config.catalog)?;
    let fallback = FallbackTable::load(&config.fallback)?;

    let reader = Reader::open(
        config.devices.region,
        config.devices.tx_power_dbm,
        config.devices.rfid_port.as_deref(),
    )?;
    let reader = ReaderHandle::spawn(reader, config.poll_interval());

    let matrix = open_matrix(&config);

    let printer = if config.cycle.print_enabled {
        Some(Printer::open(&config.devices.printer_device)?)
    } else {
        info!("Printing disabled");
        None
    };

    let limiter = RateLimiter::new(
        &config.window_file(),
        config.content.rpm_limit,
        config.content.daily_limit,
        config.content_max_wait(),
    );
    let content = ContentClient::new(
        ContentSettings {
            api_url: config.content.api_url.clone(),
            api_key: config.content.api_key.clone(),
            model: config.content.model.clone(),
        },
        limiter,
        fallback,
    );

    let remote = config
        .record_store
        .as_ref()
        .map(|store| RecordStoreClient::new(&store.url, &store.key));
    let store = SlipStore::new(&config.slip_dir(), remote)?;

    let (op_tx, op_rx) = mpsc::channel(8);
    if let Some(pipe_path) = config
        .pipe
        .as_deref()
        .filter(|path| !path.as_os_str().is_empty())
    {
        info!("Starting control pipe at {}", pipe_path.display());
        let path = pipe_path.to_owned();
        tokio::spawn(async move {
            if let Err(err) = serve_control_pipe(path, op_tx).await {
                error!("Control pipe failed: {err}");
            }
        });
    }

    let mut figbox = Figbox::new(config, catalog, reader, matrix, printer, content, store, op_rx);
    figbox.run().await
}

fn open_matrix(config: &Config) -> Option<Matrix> {
    let Some(path) = config.devices.display_port.as_deref() else {
        info!("No display_port configured, running without the LED matrix");
        return None;
    };

    match Matrix::open(path) {
        Ok(mut matrix) => {
            if let Some(level) = config.devices.display_brightness {
                if let Err(err) = matrix.set_brightness(level) {
                    warn!("Could not set matrix brightness: {err}");
                }
            }
            if let Some(level) = config.devices.display_speed {
                if let Err(err) = matrix.set_speed(level) {
                    warn!("Could not set matrix speed: {err}");
                }
            }
            Some(matrix)
        }
        Err(err) => {
            warn!("Running without the LED matrix: {err}");
            None
        }
    }
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set global tracing subscriber");
}

fn log_build_info() {
    info!(
        version = BUILD_INFO.version,
        profile = BUILD_INFO.profile,
        target = BUILD_INFO.target,
        commit = BUILD_INFO.commit,
        dirty = BUILD_INFO.dirty,
        rustc = BUILD_INFO.rustc,
        built_at = BUILD_INFO.built_at,
        "Figbox build metadata",
    );
}
