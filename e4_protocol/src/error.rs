use crate::command::CommandKind;
use crate::protocol::ProtocolError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to {address} after {attempts} attempts: {source}")]
    ConnectionFailed {
        address: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Connection to the streaming server is closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Protocol desynchronized: sent {expected} but received a reply to {received}")]
    ProtocolDesync {
        expected: CommandKind,
        received: CommandKind,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error(
        "{command} failed for device {device}: {}",
        reason.as_deref().unwrap_or("no reason given")
    )]
    DeviceRequest {
        device: String,
        command: CommandKind,
        reason: Option<String>,
    },

    #[error("Server rejected {command}: {}", reason.as_deref().unwrap_or("no reason given"))]
    ServerRequest {
        command: CommandKind,
        reason: Option<String>,
    },

    #[error("Device {0} is already connected on this session")]
    DeviceAlreadyConnected(String),

    #[error("Teardown of device {device} failed with {} errors", failures.len())]
    Teardown {
        device: String,
        failures: Vec<ClientError>,
    },
}

impl ClientError {
    /// Whether the error leaves the session unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionFailed { .. }
                | ClientError::Transport(_)
                | ClientError::ConnectionClosed
                | ClientError::ProtocolDesync { .. }
        )
    }
}
