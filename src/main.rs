use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hexapod_runtime::config::{DEFAULT_CONFIG_PATH, RobotConfig};
use hexapod_runtime::servo::{Lx16aBus, SimulatedTransport};

#[derive(Parser, Debug)]
#[command(name = "hexapod-runtime", about = "Gait runtime for an LX-16A hexapod")]
struct Args {
    /// Robot parameter file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Serial port, overrides the parameter file
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate, overrides the parameter file
    #[arg(short, long)]
    baud: Option<u32>,

    /// Drive an in-memory bus instead of the serial port
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    if let Err(e) = start(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn start(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut config = RobotConfig::from_path(&args.config)?;
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baudrate = baud;
    }
    info!("Loaded robot parameters from {}", args.config);

    let bus = if args.dry_run {
        info!("Dry run: using simulated servo bus");
        // Nothing inspects the frame log outside tests
        Lx16aBus::new(SimulatedTransport::new().with_log_capacity(0))
    } else {
        info!("Opening {} at {} baud", config.serial.port, config.serial.baudrate);
        Lx16aBus::open_with_baudrate(&config.serial.port, config.serial.baudrate)?
    };
    let bus = bus.with_timeout(Duration::from_millis(config.serial.timeout_ms));

    hexapod_runtime::runtime::run(config, bus).await
}
