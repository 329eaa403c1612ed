//! # E4 Protocol
//!
//! TCP protocol and client for the Empatica E4 streaming server.
//!
//! This crate provides:
//! - Wire codec for commands, replies and data frames
//! - Line framing over an unbounded byte stream
//! - A thread-safe client that correlates replies and fans samples out per stream
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use e4_protocol::{load_config, E4Client, StreamId};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Connect using E4_SERVER_HOST / E4_SERVER_PORT or defaults
//! let client = E4Client::connect(load_config()?)?;
//!
//! for device in client.list_connected_devices()? {
//!     println!("Found {}", device);
//! }
//!
//! // Stream skin temperature from the first device
//! let mut device = client.connect_to_device("9ff167")?;
//! let temperature = device.subscribe_to_stream(StreamId::Temp)?;
//! for sample in temperature.iter().take(4) {
//!     println!("{:.3} {:?}", sample.timestamp, sample.values);
//! }
//!
//! // Unsubscribes and disconnects
//! device.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod framer;
pub mod protocol;
pub mod stream;

mod correlator;
mod receiver;
mod router;

// Re-export commonly used types
pub use client::{E4Client, SessionState};
pub use command::{ArgType, ArgValue, Command, CommandKind, LINE_DELIMITER};
pub use config::{load_config, ClientConfig, ConfigError, StreamBuffer};
pub use device::DeviceConnection;
pub use error::{ClientError, Result};
pub use framer::{FrameReader, LineFramer};
pub use protocol::{
    decode_frame, parse_device_list, parse_message, CommandStatus, Device, ProtocolError,
    QueryReply, Reply, ServerMessage, StatusResponse, StreamSample,
};
pub use stream::{StreamDefinition, StreamId, STREAM_DEFINITIONS};
