use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use e4_protocol::{load_config, E4Client, StreamId};
use std::time::Duration;

mod commands;
mod stats;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Streaming server host [env: E4_SERVER_HOST, default 127.0.0.1]
    #[arg(long, global = true)]
    host: Option<String>,

    /// Streaming server port [env: E4_SERVER_PORT, default 28000]
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Connection attempts before giving up [env: E4_MAX_CONNECT_ATTEMPTS]
    #[arg(long, global = true)]
    attempts: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices connected to the streaming server
    Devices {
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// List devices the streaming server can see over Bluetooth
    Discover {
        #[arg(long)]
        json: bool,
    },
    /// Print samples from one or more streams
    Stream {
        /// Device UID (first connected device if omitted)
        #[arg(long)]
        device: Option<String>,

        /// Comma-separated streams, e.g. acc,temp
        #[arg(long, value_delimiter = ',', required = true)]
        streams: Vec<StreamId>,

        /// Stop after this many seconds (runs until Ctrl+C if omitted)
        #[arg(long)]
        duration: Option<f64>,

        #[arg(long)]
        json: bool,
    },
    /// Measure frame rate and timestamp spacing of a stream
    Bench {
        #[arg(long)]
        device: Option<String>,

        #[arg(long, default_value = "bvp")]
        stream: StreamId,

        /// Length of each measurement window
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,

        #[arg(long, default_value_t = 5)]
        repetitions: u32,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    log::info!("🚀 Starting e4-stream with args: {:?}", args);

    let mut config = load_config().context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(attempts) = args.attempts {
        config = config.with_max_connect_attempts(attempts);
    }

    let address = config.address();
    let client = E4Client::connect(config)
        .with_context(|| format!("Failed to connect to streaming server at {}", address))?;

    match args.command {
        Commands::Devices { json } => {
            let devices = client
                .list_connected_devices()
                .context("Failed to list connected devices")?;
            commands::print_devices(&devices, json)?;
        }
        Commands::Discover { json } => {
            let devices = client
                .discover_devices()
                .context("Failed to discover devices")?;
            commands::print_devices(&devices, json)?;
        }
        Commands::Stream {
            device,
            streams,
            duration,
            json,
        } => {
            let should_stop = commands::stop_flag()?;
            let duration = duration.map(|secs| Duration::from_secs_f64(secs.max(0.0)));
            commands::stream(&client, device, &streams, duration, json, should_stop)?;
        }
        Commands::Bench {
            device,
            stream,
            seconds,
            repetitions,
            json,
        } => {
            let should_stop = commands::stop_flag()?;
            let window = Duration::from_secs_f64(seconds.max(0.1));
            let report =
                commands::bench(&client, device, stream, window, repetitions, should_stop)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
        }
    }

    client.close();
    log::info!("👋 Done");
    Ok(())
}
