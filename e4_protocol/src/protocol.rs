//! Decoding of server messages.
//!
//! Messages from the server are UTF-8 lines. Responses to commands start
//! with `R` followed by the command name:
//!
//! ```text
//! R device_connect OK
//! R device_subscribe acc OK
//! R device_connect_btle ERR could not connect device over BTLE
//! R device_list 2 | 9ff167 Empatica_E4 | 7a3166 Empatica_E4
//! ```
//!
//! Data frames start with a stream prefix, a timestamp and the sample values:
//!
//! ```text
//! E4_Acc 123345627891.123 51 -2 -10
//! ```

use crate::command::CommandKind;
use crate::stream::StreamId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const RESPONSE_MARKER: &str = "R";
const STATUS_OK: &str = "OK";
const DEVICE_LIST_SEPARATOR: char = '|';
const DEVICE_ALLOWED: &str = "allowed";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed {command} command: {reason}")]
    MalformedCommand { command: CommandKind, reason: String },

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Unrecognized message: {0}")]
    UnrecognizedMessage(String),

    #[error("Malformed sample '{line}': {reason}")]
    MalformedSample { line: String, reason: String },

    #[error("Invalid string encoding: {0}")]
    InvalidEncoding(#[from] std::str::Utf8Error),

    #[error("Invalid device list '{payload}': {reason}")]
    InvalidDeviceList { payload: String, reason: String },

    #[error("Frame exceeds {limit} bytes without a delimiter")]
    FrameTooLong { limit: usize },

    #[error("Stream table conflict: '{token}' used by both {first} and {second}")]
    StreamTableConflict {
        token: String,
        first: StreamId,
        second: StreamId,
    },
}

impl ProtocolError {
    pub(crate) fn malformed_command(command: CommandKind, reason: String) -> Self {
        ProtocolError::MalformedCommand { command, reason }
    }

    fn malformed_sample(line: &str, reason: impl Into<String>) -> Self {
        ProtocolError::MalformedSample {
            line: line.to_string(),
            reason: reason.into(),
        }
    }

    fn invalid_device_list(payload: &str, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidDeviceList {
            payload: payload.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Error,
}

/// Acknowledgement of a non-query command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub command: CommandKind,
    pub status: CommandStatus,
    /// Text following `ERR`, when the server sent any
    pub reason: Option<String>,
}

impl StatusResponse {
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Reply to a query command, payload kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryReply {
    pub command: CommandKind,
    pub payload: String,
}

/// One decoded data frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSample {
    pub stream: StreamId,
    pub timestamp: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Status(StatusResponse),
    Query(QueryReply),
    Sample(StreamSample),
}

/// A server message that answers a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(StatusResponse),
    Query(QueryReply),
}

impl Reply {
    pub fn command(&self) -> CommandKind {
        match self {
            Reply::Status(status) => status.command,
            Reply::Query(query) => query.command,
        }
    }
}

/// A device known to the streaming server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub uid: String,
    pub name: String,
    pub allowed: bool,
}

impl AsRef<str> for Device {
    fn as_ref(&self) -> &str {
        &self.uid
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uid, self.name)?;
        if !self.allowed {
            write!(f, " [not allowed]")?;
        }
        Ok(())
    }
}

/// Decode one raw frame, delimiter already removed
pub fn decode_frame(frame: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let line = std::str::from_utf8(frame)?;
    parse_message(line)
}

/// Classify and decode one line of server output
pub fn parse_message(line: &str) -> Result<ServerMessage, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (head, rest) = split_token(line);

    if head == RESPONSE_MARKER {
        return parse_response(line, rest);
    }

    match StreamId::from_prefix(head) {
        Some(stream) => parse_sample(line, stream, rest).map(ServerMessage::Sample),
        None => Err(ProtocolError::UnrecognizedMessage(line.to_string())),
    }
}

fn parse_response(line: &str, rest: &str) -> Result<ServerMessage, ProtocolError> {
    let (name, rest) = split_token(rest);
    if name.is_empty() {
        return Err(ProtocolError::UnrecognizedMessage(line.to_string()));
    }

    let command = CommandKind::from_wire_name(name)
        .ok_or_else(|| ProtocolError::UnknownCommand(name.to_string()))?;

    if command.is_query() {
        return Ok(ServerMessage::Query(QueryReply {
            command,
            payload: rest.to_string(),
        }));
    }

    let rest = match command {
        // Subscription replies echo the stream abbreviation before the status
        CommandKind::DeviceSubscribe => split_token(rest).1,
        // Pause echoes ON/OFF instead of OK/ERR
        CommandKind::Pause => {
            return Ok(ServerMessage::Status(StatusResponse {
                command,
                status: CommandStatus::Success,
                reason: None,
            }))
        }
        _ => rest,
    };

    let (status, reason) = split_token(rest);
    let response = if status == STATUS_OK {
        StatusResponse {
            command,
            status: CommandStatus::Success,
            reason: None,
        }
    } else {
        StatusResponse {
            command,
            status: CommandStatus::Error,
            reason: (!reason.is_empty()).then(|| reason.to_string()),
        }
    };

    Ok(ServerMessage::Status(response))
}

fn parse_sample(line: &str, stream: StreamId, rest: &str) -> Result<StreamSample, ProtocolError> {
    let mut tokens = rest.split_whitespace();

    let timestamp = tokens
        .next()
        .ok_or_else(|| ProtocolError::malformed_sample(line, "missing timestamp"))?;
    let timestamp: f64 = timestamp.parse().map_err(|_| {
        ProtocolError::malformed_sample(line, format!("invalid timestamp '{}'", timestamp))
    })?;

    let values = tokens
        .map(|token| {
            token.parse::<f64>().map_err(|_| {
                ProtocolError::malformed_sample(line, format!("invalid value '{}'", token))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StreamSample {
        stream,
        timestamp,
        values,
    })
}

/// Decode a device list payload: `<count> | <uid> <name> [allowed] | ...`
pub fn parse_device_list(payload: &str) -> Result<Vec<Device>, ProtocolError> {
    let mut segments = payload.split(DEVICE_LIST_SEPARATOR).map(str::trim);

    let count_token = segments.next().unwrap_or_default();
    let count: usize = count_token.parse().map_err(|_| {
        ProtocolError::invalid_device_list(payload, format!("invalid count '{}'", count_token))
    })?;

    let entries: Vec<&str> = segments.filter(|segment| !segment.is_empty()).collect();
    if entries.len() != count {
        return Err(ProtocolError::invalid_device_list(
            payload,
            format!("announced {} devices but listed {}", count, entries.len()),
        ));
    }

    Ok(entries.into_iter().map(parse_device_entry).collect())
}

fn parse_device_entry(entry: &str) -> Device {
    let (uid, rest) = split_token(entry);
    let (name, flag) = split_token(rest);

    Device {
        uid: uid.to_string(),
        name: name.to_string(),
        allowed: flag.is_empty() || flag == DEVICE_ALLOWED,
    }
}

/// Split off the first whitespace-delimited token
fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(end) => (&input[..end], input[end..].trim_start()),
        None => (input, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use strum::IntoEnumIterator;

    fn status(line: &str) -> StatusResponse {
        match parse_message(line) {
            Ok(ServerMessage::Status(status)) => status,
            other => panic!("expected status response for '{}', got {:?}", line, other),
        }
    }

    fn sample(line: &str) -> StreamSample {
        match parse_message(line) {
            Ok(ServerMessage::Sample(sample)) => sample,
            other => panic!("expected sample for '{}', got {:?}", line, other),
        }
    }

    #[test]
    fn test_generic_status_responses() {
        let ok = status("R device_connect OK");
        assert_eq!(ok.command, CommandKind::DeviceConnect);
        assert!(ok.is_success());
        assert_eq!(ok.reason, None);

        let err = status("R device_connect_btle ERR could not connect device over BTLE");
        assert_eq!(err.command, CommandKind::DeviceConnectBtle);
        assert_eq!(err.status, CommandStatus::Error);
        assert_eq!(
            err.reason.as_deref(),
            Some("could not connect device over BTLE")
        );

        let bare_err = status("R device_disconnect ERR");
        assert_eq!(bare_err.status, CommandStatus::Error);
        assert_eq!(bare_err.reason, None);
    }

    #[test]
    fn test_pause_echo_is_success() {
        for line in ["R pause ON", "R pause OFF"] {
            let response = status(line);
            assert_eq!(response.command, CommandKind::Pause);
            assert!(response.is_success());
            assert_eq!(response.reason, None);
        }
    }

    #[test]
    fn test_subscribe_echo_is_consumed() {
        let response = status("R device_subscribe acc OK");
        assert_eq!(
            response,
            StatusResponse {
                command: CommandKind::DeviceSubscribe,
                status: CommandStatus::Success,
                reason: None,
            }
        );

        let failed = status("R device_subscribe gsr ERR You are not connected to any device");
        assert_eq!(failed.status, CommandStatus::Error);
        assert_eq!(
            failed.reason.as_deref(),
            Some("You are not connected to any device")
        );
    }

    #[test]
    fn test_query_reply_keeps_payload_verbatim() {
        match parse_message("R device_list 2 | A1 DeviceOne | A2 DeviceTwo not_allowed\r") {
            Ok(ServerMessage::Query(reply)) => {
                assert_eq!(reply.command, CommandKind::DeviceList);
                assert_eq!(reply.payload, "2 | A1 DeviceOne | A2 DeviceTwo not_allowed");
            }
            other => panic!("expected query reply, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_in_response() {
        assert!(matches!(
            parse_message("R device_teleport OK"),
            Err(ProtocolError::UnknownCommand(name)) if name == "device_teleport"
        ));
    }

    #[test]
    fn test_unrecognized_messages() {
        for line in ["hello world", "E4_Nope 1.0 2.0", "R", ""] {
            assert!(
                matches!(parse_message(line), Err(ProtocolError::UnrecognizedMessage(_))),
                "line '{}' should be unrecognized",
                line
            );
        }
    }

    #[test]
    fn test_sample_decoding() {
        let temp = sample("E4_Temp 123.456 36.6");
        assert_eq!(temp.stream, StreamId::Temp);
        assert_eq!(temp.timestamp, 123.456);
        assert_eq!(temp.values, vec![36.6]);

        let acc = sample("E4_Acc 123.456 1.0 2.0 3.0");
        assert_eq!(acc.stream, StreamId::Acc);
        assert_eq!(acc.values, vec![1.0, 2.0, 3.0]);

        let tag = sample("E4_Tag 1577836800.25");
        assert_eq!(tag.stream, StreamId::Tag);
        assert!(tag.values.is_empty());

        let hr = sample("E4_Hr 10.0 72.5");
        assert_eq!(hr.stream, StreamId::Hr);
    }

    #[test]
    fn test_malformed_samples() {
        for line in ["E4_Bvp", "E4_Bvp abc 1.0", "E4_Bvp 1.0 x"] {
            assert!(
                matches!(parse_message(line), Err(ProtocolError::MalformedSample { .. })),
                "line '{}' should be a malformed sample",
                line
            );
        }
    }

    #[test]
    fn test_invalid_encoding() {
        assert!(matches!(
            decode_frame(b"E4_Temp \xff\xfe 1.0"),
            Err(ProtocolError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_device_list() {
        let devices = parse_device_list("2 | A1 DeviceOne | A2 DeviceTwo not_allowed").unwrap();
        assert_eq!(
            devices,
            vec![
                Device {
                    uid: "A1".into(),
                    name: "DeviceOne".into(),
                    allowed: true
                },
                Device {
                    uid: "A2".into(),
                    name: "DeviceTwo".into(),
                    allowed: false
                },
            ]
        );

        let explicit = parse_device_list("1 | 9ff167 Empatica_E4 allowed").unwrap();
        assert!(explicit[0].allowed);

        assert!(parse_device_list("0").unwrap().is_empty());
    }

    #[test]
    fn test_device_list_count_mismatch() {
        assert!(matches!(
            parse_device_list("3 | A1 DeviceOne | A2 DeviceTwo"),
            Err(ProtocolError::InvalidDeviceList { .. })
        ));
        assert!(matches!(
            parse_device_list("many | A1 DeviceOne"),
            Err(ProtocolError::InvalidDeviceList { .. })
        ));
    }

    // Every command, paired with a synthetic server acknowledgement, decodes
    // back into a reply for the same command.
    #[test]
    fn test_encoded_commands_pair_with_replies() {
        let commands: Vec<Command> = StreamId::iter()
            .flat_map(|stream| {
                [
                    Command::subscribe(stream, true),
                    Command::subscribe(stream, false),
                ]
            })
            .chain([
                Command::discover_devices(),
                Command::list_devices(),
                Command::connect_device("9ff167"),
                Command::disconnect_device(),
                Command::ble_connect("9ff167", 5000),
                Command::ble_disconnect("9ff167"),
                Command::pause(true),
                Command::pause(false),
            ])
            .collect();

        for command in commands {
            let encoded = command.encode();
            let mut tokens = encoded.trim_end().split(' ');
            let name = tokens.next().unwrap();
            let args: Vec<&str> = tokens.collect();

            let reply_line = match command.kind() {
                CommandKind::DeviceSubscribe => format!("R {} {} OK", name, args[0]),
                CommandKind::Pause => format!("R {} {}", name, args[0]),
                kind if kind.is_query() => format!("R {} 0", name),
                _ => format!("R {} OK", name),
            };

            match parse_message(&reply_line).unwrap() {
                ServerMessage::Status(status) => {
                    assert_eq!(status.command, command.kind());
                    assert!(status.is_success());
                }
                ServerMessage::Query(query) => assert_eq!(query.command, command.kind()),
                other => panic!("unexpected {:?} for '{}'", other, reply_line),
            }
        }
    }
}
