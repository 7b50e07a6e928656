use clap::Parser;
use pinchkit::{
    init_logging, simulated_backend, OperatorConsole, PortScanner, SettingsManager, SharedBackend,
    SystemSerialBackend, BUILD_DATE, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "pinchkit")]
#[command(about = "Operator console for a serial-controlled pinch-gripper robotic arm")]
#[command(version)]
struct Args {
    /// Settings file (.toml or .json); defaults to the per-user config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port description fragment marking the controller (repeatable)
    #[arg(long = "port-marker", value_name = "TEXT")]
    port_markers: Vec<String>,

    /// Baud rate override
    #[arg(short, long)]
    baud: Option<u32>,

    /// Talk to a simulated controller instead of real serial ports
    #[arg(long)]
    simulate: bool,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs)?;
    tracing::info!("PinchKit {} (built {})", VERSION, BUILD_DATE);

    let mut config = SettingsManager::open(args.config)?.into_config();
    if !args.port_markers.is_empty() {
        config.connection.port_markers = args.port_markers;
    }
    if let Some(baud) = args.baud {
        config.connection.baud_rate = baud;
    }
    config.validate()?;

    let backend: SharedBackend = if args.simulate {
        tracing::info!("Using the simulated controller");
        Arc::new(simulated_backend(&config))
    } else {
        Arc::new(SystemSerialBackend)
    };

    if args.list_ports {
        let scanner = PortScanner::new(Arc::clone(&backend), &config.connection.port_markers);
        for port in scanner.scan() {
            let mark = if scanner.is_candidate(&port) { '*' } else { ' ' };
            println!("{} {}", mark, port);
        }
        return Ok(());
    }

    let mut console = OperatorConsole::start(config, backend);
    let result = console
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;
    console.shutdown().await;
    result
}
