//! CLI entry point for keithley-didv.
//!
//! # Usage
//!
//! Run a delta measurement against a GPIB-Ethernet bridge:
//! ```bash
//! KEITHLEY_DIDV_INSTRUMENT__ADDRESS=192.168.0.50:1234 keithley-didv run --mode delta -o delta.txt
//! ```
//!
//! Print the command sequence a mode would send:
//! ```bash
//! keithley-didv plan --mode spd
//! ```
//!
//! Try the whole flow without hardware:
//! ```bash
//! keithley-didv run --mode didv --simulate -o sim.txt
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keithley_didv::acquisition::{AcquisitionController, ControllerEvent, EventOutcome, UiEvent};
use keithley_didv::config::Settings;
use keithley_didv::instrument::mock::SimulatedInstrument;
use keithley_didv::instrument::stream::StreamLink;
use keithley_didv::instrument::InstrumentLink;
use keithley_didv::logging;
use keithley_didv::measurement::{CommandBuilder, MeasurementMode, ModeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "keithley-didv")]
#[command(about = "Keithley 6221/2182A measurement sequencing", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = keithley_didv::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one measurement and write the records
    Run {
        /// Measurement mode (defaults to acquisition.mode)
        #[arg(long, value_parser = parse_mode)]
        mode: Option<MeasurementMode>,

        /// Output file, relative to storage.output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Use the simulated source instead of hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Print the command sequence for a mode without connecting
    Plan {
        #[arg(long, value_parser = parse_mode)]
        mode: Option<MeasurementMode>,
    },

    /// List the resources the configured link reports
    Resources {
        #[arg(long)]
        simulate: bool,
    },
}

fn parse_mode(s: &str) -> Result<MeasurementMode, String> {
    s.parse::<MeasurementMode>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Run {
            mode,
            output,
            simulate,
        } => run(settings, mode, output, simulate).await,
        Commands::Plan { mode } => plan(&settings, mode),
        Commands::Resources { simulate } => {
            let link = connect(&settings, simulate).await?;
            for resource in link.list_resources().await {
                println!("{resource}");
            }
            Ok(())
        }
    }
}

async fn connect(settings: &Settings, simulate: bool) -> Result<Arc<dyn InstrumentLink>> {
    let instrument = &settings.instrument;
    if simulate {
        info!("Using simulated source");
        return Ok(Arc::new(
            SimulatedInstrument::new()
                .with_resources(vec![instrument.resource.clone()])
                .with_fill_per_poll(64),
        ));
    }
    if let Some(address) = &instrument.address {
        let link = StreamLink::connect_tcp(address, &instrument.resource, instrument.timeout())
            .await
            .with_context(|| format!("connecting to {address}"))?
            .with_terminator(&instrument.terminator);
        return Ok(Arc::new(link));
    }
    if let Some(path) = &instrument.serial_port {
        return open_serial(settings, path).await;
    }
    bail!("no instrument.address or instrument.serial_port configured (or pass --simulate)")
}

#[cfg(feature = "serial")]
async fn open_serial(settings: &Settings, path: &str) -> Result<Arc<dyn InstrumentLink>> {
    let instrument = &settings.instrument;
    let link = StreamLink::open_serial(path, instrument.baud_rate, &instrument.resource)
        .await
        .with_context(|| format!("opening {path}"))?
        .with_terminator(&instrument.terminator)
        .with_timeout(instrument.timeout());
    Ok(Arc::new(link))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(_settings: &Settings, path: &str) -> Result<Arc<dyn InstrumentLink>> {
    bail!("serial port {path} configured but built without the `serial` feature")
}

fn plan(settings: &Settings, mode: Option<MeasurementMode>) -> Result<()> {
    let mode = mode.unwrap_or(settings.acquisition.mode);
    let config = ModeConfig::from_parameters(&settings.modes.get(mode))?;
    let plan = CommandBuilder::build(&config, &settings.source);
    println!("# {} ({} points)", mode.title(), config.point_count());
    println!("# {}", config.summary(&settings.source));
    for line in plan.wire_sequence() {
        println!("{line}");
    }
    Ok(())
}

async fn run(
    settings: Settings,
    mode: Option<MeasurementMode>,
    output: Option<PathBuf>,
    simulate: bool,
) -> Result<()> {
    let link = connect(&settings, simulate).await?;
    let controller = Arc::new(AcquisitionController::new(link, &settings));
    controller
        .initialize_instrument(settings.instrument.reset_on_connect)
        .await?;

    if let Some(mode) = mode {
        controller.dispatch(UiEvent::SetMode(mode)).await?;
    }
    controller.dispatch(UiEvent::SelectSink(output)).await?;

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ControllerEvent::Progress {
                    filled,
                    expected,
                    polls,
                } => info!(filled, expected, polls, "Buffer progress"),
                ControllerEvent::Failed { message } => warn!(%message, "Run failed"),
                _ => {}
            }
        }
    });

    let stopper = Arc::clone(&controller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping run");
            if let Err(e) = stopper.stop().await {
                warn!(error = %e, "Stop failed");
            }
        }
    });

    let EventOutcome::Started(handle) = controller.dispatch(UiEvent::Start).await? else {
        bail!("start did not spawn a run");
    };
    let outcome = handle.await.context("run task panicked")??;

    println!(
        "{:?}: {} of {} points after {} polls",
        outcome.status,
        outcome.records.len(),
        outcome.point_count,
        outcome.polls
    );
    if let Some(path) = outcome.output {
        println!("data: {}", path.display());
    }
    if let Some(path) = outcome.metadata {
        println!("metadata: {}", path.display());
    }
    Ok(())
}
