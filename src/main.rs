use std::path::PathBuf;
use std::sync::Arc;

use arm_zenoh_runtime::config::{ArmConfig, MOTOR_PORT};
use arm_zenoh_runtime::controller::{Connector, Controller, SerialConnector, SimConnector};
use arm_zenoh_runtime::messages::Command;
use arm_zenoh_runtime::motion::ProgramStore;
use arm_zenoh_runtime::motor::SimulatedBus;
use arm_zenoh_runtime::runtime;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Arm motion controller bridged to Zenoh
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial port of the servo bus adapter
    #[arg(long, default_value = MOTOR_PORT)]
    port: String,

    /// Override the configured bus baudrate
    #[arg(long)]
    baud: Option<u32>,

    /// Run against a simulated servo bus
    #[arg(long)]
    sim: bool,

    /// Arm description (JSON); built-in defaults otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding saved programs
    #[arg(long, default_value = "programs")]
    programs: PathBuf,

    /// Override the control loop rate
    #[arg(long)]
    hz: Option<u64>,

    /// Connect and home right after startup
    #[arg(long)]
    connect: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => ArmConfig::from_json_file(path)?,
        None => ArmConfig::default(),
    };
    if let Some(hz) = args.hz {
        config.loop_hz = hz;
    }
    if let Some(baud) = args.baud {
        config.bus.baudrate = baud;
    }
    config.validate()?;
    let config = Arc::new(config);

    let connector: Box<dyn Connector> = if args.sim {
        info!("Using simulated servo bus");
        Box::new(SimConnector::new(SimulatedBus::from_config(&config)))
    } else {
        Box::new(SerialConnector::new(&args.port, &config.bus))
    };
    let programs = ProgramStore::open(&args.programs)?;
    info!("Programs stored in {}", programs.dir().display());

    let controller = Controller::new(config.clone(), connector).with_programs(programs);
    let (handle, control_thread) = runtime::spawn_control_loop(controller, config.tick())?;
    info!(
        "Arm runtime started: {} joints, {}Hz loop",
        config.joint_count(),
        config.loop_hz
    );

    if args.connect {
        match handle.send(Command::Connect).await {
            Ok(outcome) => info!("Connect: {:?}", outcome),
            Err(e) => warn!("Connect failed: {}", e),
        }
    }

    let result = runtime::run(handle, config.tick()).await;

    // Dropping the last handle stops the loop, which halts the motors
    if control_thread.join().is_err() {
        warn!("Control loop thread panicked");
    }
    result
}
