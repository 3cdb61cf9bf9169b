mod axis;
mod commit;
mod model;
mod probe;
mod watch;

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use axis::AxisCommand;
use clap::{Parser, Subcommand};
use commit::CommitCommand;
use model::ModelCommand;
use owo_colors::OwoColorize;
use probe::ProbeCommand;
use sccal::{
    config::PollConfig,
    context::{ContextState, DeviceContext},
    discovery::HidBackend,
    manager::HardwareManager,
    sim::{DEFAULT_AXES, SimulatedBackend, SimulatedDevice},
};
use serde_json::json;
use tokio::{runtime::Handle, time::Instant};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use watch::WatchCommand;

use crate::hidapi_impl::HidapiBackend;

/// The time between two ticks of the poll loop.
const FRAME: Duration = Duration::from_millis(16);

/// How long to wait for a device to show up, on top of the request timeout.
const BIND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    color: colorchoice_clap::Color,

    #[command(subcommand)]
    command: Commands,

    /// Output plain JSON without color and interactivity
    #[arg(short, long, global = true)]
    json: bool,

    /// Log every packet sent and received
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load the poll configuration from a JSON file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Minimum time between two device scans
    #[arg(long, global = true, value_name = "MS")]
    scan_interval_ms: Option<u64>,

    /// How long to wait for the reply to a request
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Talk to simulated devices instead of real hardware
    #[arg(long, global = true, value_name = "N")]
    simulate: Option<u8>,

    /// Only talk to the device with this serial number
    #[arg(short, long, global = true)]
    serial: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    Probe(ProbeCommand),
    Watch(WatchCommand),
    Axis(AxisCommand),
    Model(ModelCommand),
    Commit(CommitCommand),
}

pub async fn execute() -> Result<()> {
    let cli = Cli::parse();

    cli.color.write_global();
    init_tracing(&cli);

    let config = cli.poll_config()?;
    match cli.simulate {
        Some(count) => {
            let backend = SimulatedBackend::new();
            let devices = (0..count)
                .map(|i| backend.add_device(format!("sim-{i}"), format!("SC-SIM-{i:04}")))
                .collect();
            tokio::spawn(sweep_inputs(devices));

            run(&cli, backend, config).await
        },
        None => run(&cli, HidapiBackend::new()?, config).await,
    }
}

async fn run<B: HidBackend>(cli: &Cli, backend: B, config: PollConfig) -> Result<()> {
    match &cli.command {
        Commands::Probe(cmd) => cmd.execute(cli, backend, config).await,
        Commands::Watch(cmd) => cmd.execute(cli, backend, config).await,
        Commands::Axis(cmd) => cmd.execute(cli, backend, config).await,
        Commands::Model(cmd) => cmd.execute(cli, backend, config).await,
        Commands::Commit(cmd) => cmd.execute(cli, backend, config).await,
    }
}

impl Cli {
    fn poll_config(&self) -> Result<PollConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("could not open {}", path.display()))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("could not parse {}", path.display()))?
            },
            None => PollConfig::default(),
        };

        if let Some(ms) = self.scan_interval_ms {
            config.discovery_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn init_tracing(cli: &Cli) {
    let default = match (cli.verbose, cli.json) {
        (true, _) => "info,sccal=trace",
        (false, true) => "warn",
        (false, false) => "info",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Creates a manager and ticks it until the selected device is fully read.
///
/// Without `--serial`, the first device found is selected.
async fn bind<B: HidBackend>(
    root: &Cli,
    backend: B,
    config: PollConfig,
) -> Result<(HardwareManager<B>, Arc<DeviceContext<B::Channel>>)> {
    let timeout = BIND_TIMEOUT + config.request_timeout;
    let mut manager = HardwareManager::new(backend, config, Handle::current());
    let mut frames = tokio::time::interval(FRAME);
    let started = Instant::now();

    loop {
        frames.tick().await;
        manager.tick();

        let selected = match &root.serial {
            Some(serial) => manager.context(serial),
            None => manager.contexts().next(),
        };
        if let Some(context) = selected {
            if context.state() == ContextState::BoundSynced {
                let context = Arc::clone(context);
                return Ok((manager, context));
            }
        }

        if started.elapsed() > timeout {
            match &root.serial {
                Some(serial) => bail!("no device with serial number {serial} was found"),
                None => bail!("no devices were found"),
            }
        }
    }
}

/// Prints the outcome of a command that changed a device.
fn report_success(root: &Cli, serial: &str, message: &str) -> Result<()> {
    let mut stdout = BufWriter::new(anstream::stdout());

    if root.json {
        writeln!(stdout, "{}", json!({ "serial": serial, "ok": true }))?;
    } else {
        writeln!(stdout, "{} {}: {message}", "✓".green(), serial.bright_black())?;
    }

    stdout.flush()?;
    Ok(())
}

/// Moves the raw inputs of simulated devices back and forth.
async fn sweep_inputs(devices: Vec<SimulatedDevice>) {
    let mut frames = tokio::time::interval(FRAME);
    let mut phase = 0u32;

    loop {
        frames.tick().await;
        phase = phase.wrapping_add(1);

        for device in &devices {
            for axis in 0..DEFAULT_AXES {
                let step = phase.wrapping_add(u32::from(axis) * 40) % 256;
                let triangle = if step < 128 { step } else { 255 - step };
                device.nudge_input(axis, (triangle * 516) as u16);
            }
        }
    }
}
