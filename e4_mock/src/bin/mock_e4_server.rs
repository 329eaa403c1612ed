use clap::Parser;
use e4_mock::{MockE4Server, MockServerConfig};
use e4_protocol::Device;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mock_e4_server")]
#[command(about = "Mock E4 streaming server that emits synthetic sensor data")]
struct Args {
    /// Address to bind the TCP server to
    #[arg(short, long, default_value = "127.0.0.1:28000")]
    address: String,

    /// Connected device as UID:NAME (repeatable)
    #[arg(short, long = "device", value_parser = parse_device)]
    devices: Vec<Device>,

    /// Milliseconds between samples of each subscribed stream
    #[arg(long, default_value = "10")]
    interval_ms: u64,

    /// Terminate lines with a bare \n instead of \r\n
    #[arg(long)]
    bare_newlines: bool,

    /// Split every line into writes of at most this many bytes
    #[arg(long)]
    fragment: Option<usize>,
}

fn parse_device(value: &str) -> Result<Device, String> {
    let (uid, name) = value
        .split_once(':')
        .ok_or_else(|| format!("expected UID:NAME, got '{}'", value))?;
    Ok(Device {
        uid: uid.to_string(),
        name: name.to_string(),
        allowed: true,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    info!("🚀 Starting mock E4 server with args: {:?}", args);

    let mut config = MockServerConfig {
        bind_address: args.address,
        sample_interval: Duration::from_millis(args.interval_ms.max(1)),
        write_fragment_size: args.fragment,
        ..MockServerConfig::default()
    };
    if !args.devices.is_empty() {
        config.discoverable_devices = args.devices.clone();
        config.connected_devices = args.devices;
    }
    if args.bare_newlines {
        config.line_ending = "\n".to_string();
    }

    // Handle Ctrl+C gracefully
    let should_stop = Arc::new(AtomicBool::new(false));
    let should_stop_clone = should_stop.clone();
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down...");
        should_stop_clone.store(true, Ordering::Relaxed);
    })?;

    let server = MockE4Server::new(config).start()?;
    info!("📡 Mock E4 server started on {}", server.address());

    // Wait for shutdown signal
    while !should_stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(server);
    info!("🛑 Mock E4 server stopped");

    Ok(())
}
