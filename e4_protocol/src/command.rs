use crate::protocol::ProtocolError;
use crate::stream::StreamId;
use std::collections::HashMap;
use std::fmt;
use strum::EnumIter;

/// Line delimiter used for every command sent to the server
pub const LINE_DELIMITER: &str = "\r\n";

/// Commands understood by the streaming server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum CommandKind {
    DeviceDiscoverList,
    DeviceConnectBtle,
    DeviceDisconnectBtle,
    DeviceList,
    DeviceConnect,
    DeviceDisconnect,
    DeviceSubscribe,
    Pause,
}

/// Type of a single command argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Int,
    Bool,
    Stream,
}

/// A typed command argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Stream(StreamId),
}

impl ArgValue {
    pub fn arg_type(&self) -> ArgType {
        match self {
            ArgValue::Str(_) => ArgType::Str,
            ArgValue::Int(_) => ArgType::Int,
            ArgValue::Bool(_) => ArgType::Bool,
            ArgValue::Stream(_) => ArgType::Stream,
        }
    }

    /// Token written on the wire for this value
    pub fn wire_token(&self) -> String {
        match self {
            ArgValue::Str(value) => value.clone(),
            ArgValue::Int(value) => value.to_string(),
            ArgValue::Bool(true) => "ON".to_string(),
            ArgValue::Bool(false) => "OFF".to_string(),
            ArgValue::Stream(stream) => stream.abbreviation().to_string(),
        }
    }
}

/// Fixed wire name and ordered argument schema of a command
#[derive(Debug)]
pub struct CommandDefinition {
    pub kind: CommandKind,
    pub wire_name: &'static str,
    pub args: &'static [(&'static str, ArgType)],
    /// Query replies carry a payload instead of an OK/ERR status
    pub is_query: bool,
}

/// Command table, indexed by `CommandKind` discriminant
pub const COMMAND_DEFINITIONS: [CommandDefinition; 8] = [
    CommandDefinition {
        kind: CommandKind::DeviceDiscoverList,
        wire_name: "device_discover_list",
        args: &[],
        is_query: true,
    },
    CommandDefinition {
        kind: CommandKind::DeviceConnectBtle,
        wire_name: "device_connect_btle",
        args: &[("dev", ArgType::Str), ("timeout", ArgType::Int)],
        is_query: false,
    },
    CommandDefinition {
        kind: CommandKind::DeviceDisconnectBtle,
        wire_name: "device_disconnect_btle",
        args: &[("dev", ArgType::Str)],
        is_query: false,
    },
    CommandDefinition {
        kind: CommandKind::DeviceList,
        wire_name: "device_list",
        args: &[],
        is_query: true,
    },
    CommandDefinition {
        kind: CommandKind::DeviceConnect,
        wire_name: "device_connect",
        args: &[("dev", ArgType::Str)],
        is_query: false,
    },
    CommandDefinition {
        kind: CommandKind::DeviceDisconnect,
        wire_name: "device_disconnect",
        args: &[],
        is_query: false,
    },
    CommandDefinition {
        kind: CommandKind::DeviceSubscribe,
        wire_name: "device_subscribe",
        args: &[("stream", ArgType::Stream), ("on", ArgType::Bool)],
        is_query: false,
    },
    CommandDefinition {
        kind: CommandKind::Pause,
        wire_name: "pause",
        args: &[("on", ArgType::Bool)],
        is_query: false,
    },
];

impl CommandKind {
    pub fn definition(self) -> &'static CommandDefinition {
        &COMMAND_DEFINITIONS[self as usize]
    }

    pub fn wire_name(self) -> &'static str {
        self.definition().wire_name
    }

    pub fn is_query(self) -> bool {
        self.definition().is_query
    }

    pub fn from_wire_name(name: &str) -> Option<CommandKind> {
        COMMAND_DEFINITIONS
            .iter()
            .find(|def| def.wire_name == name)
            .map(|def| def.kind)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A command whose arguments match its schema.
///
/// Arguments are stored in schema order, so encoding cannot fail once a
/// `Command` exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    args: Vec<ArgValue>,
}

impl Command {
    /// Build a command from named arguments, checking them against the schema
    pub fn new<'a, I>(kind: CommandKind, args: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = (&'a str, ArgValue)>,
    {
        let schema = kind.definition().args;
        let mut supplied: HashMap<&str, ArgValue> = HashMap::new();

        for (name, value) in args {
            let expected = match schema.iter().find(|(arg, _)| *arg == name) {
                Some((_, arg_type)) => *arg_type,
                None => {
                    return Err(ProtocolError::malformed_command(
                        kind,
                        format!("unexpected argument '{}'", name),
                    ))
                }
            };

            if value.arg_type() != expected {
                return Err(ProtocolError::malformed_command(
                    kind,
                    format!(
                        "wrong type for argument '{}': expected {:?}, got {:?}",
                        name,
                        expected,
                        value.arg_type()
                    ),
                ));
            }

            if supplied.insert(name, value).is_some() {
                return Err(ProtocolError::malformed_command(
                    kind,
                    format!("argument '{}' given more than once", name),
                ));
            }
        }

        let mut ordered = Vec::with_capacity(schema.len());
        for (name, _) in schema {
            match supplied.remove(name) {
                Some(value) => ordered.push(value),
                None => {
                    return Err(ProtocolError::malformed_command(
                        kind,
                        format!("missing argument '{}'", name),
                    ))
                }
            }
        }

        Ok(Self {
            kind,
            args: ordered,
        })
    }

    pub fn discover_devices() -> Self {
        Self::unchecked(CommandKind::DeviceDiscoverList, vec![])
    }

    pub fn list_devices() -> Self {
        Self::unchecked(CommandKind::DeviceList, vec![])
    }

    pub fn connect_device(device: &str) -> Self {
        Self::unchecked(
            CommandKind::DeviceConnect,
            vec![ArgValue::Str(device.to_string())],
        )
    }

    pub fn disconnect_device() -> Self {
        Self::unchecked(CommandKind::DeviceDisconnect, vec![])
    }

    pub fn ble_connect(device: &str, timeout_ms: i64) -> Self {
        Self::unchecked(
            CommandKind::DeviceConnectBtle,
            vec![ArgValue::Str(device.to_string()), ArgValue::Int(timeout_ms)],
        )
    }

    pub fn ble_disconnect(device: &str) -> Self {
        Self::unchecked(
            CommandKind::DeviceDisconnectBtle,
            vec![ArgValue::Str(device.to_string())],
        )
    }

    pub fn subscribe(stream: StreamId, on: bool) -> Self {
        Self::unchecked(
            CommandKind::DeviceSubscribe,
            vec![ArgValue::Stream(stream), ArgValue::Bool(on)],
        )
    }

    pub fn pause(on: bool) -> Self {
        Self::unchecked(CommandKind::Pause, vec![ArgValue::Bool(on)])
    }

    // Callers must pass arguments in schema order with schema types.
    fn unchecked(kind: CommandKind, args: Vec<ArgValue>) -> Self {
        Self { kind, args }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Arguments paired with their schema names, in wire order
    pub fn args(&self) -> impl Iterator<Item = (&'static str, &ArgValue)> {
        self.kind
            .definition()
            .args
            .iter()
            .map(|(name, _)| *name)
            .zip(self.args.iter())
    }

    pub fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args()
            .find(|(arg, _)| *arg == name)
            .map(|(_, value)| value)
    }

    /// Serialize to a single delimited wire line
    pub fn encode(&self) -> String {
        let mut line = self.kind.wire_name().to_string();
        for value in &self.args {
            line.push(' ');
            line.push_str(&value.wire_token());
        }
        line.push_str(LINE_DELIMITER);
        line
    }

    /// Parse a command line as received by a server
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = line.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| ProtocolError::UnrecognizedMessage(line.to_string()))?;
        let kind = CommandKind::from_wire_name(name)
            .ok_or_else(|| ProtocolError::UnknownCommand(name.to_string()))?;

        let schema = kind.definition().args;
        let tokens: Vec<&str> = tokens.collect();
        if tokens.len() != schema.len() {
            return Err(ProtocolError::malformed_command(
                kind,
                format!("expected {} arguments, got {}", schema.len(), tokens.len()),
            ));
        }

        let mut args = Vec::with_capacity(schema.len());
        for ((name, arg_type), token) in schema.iter().zip(tokens) {
            let value = match arg_type {
                ArgType::Str => Some(ArgValue::Str(token.to_string())),
                ArgType::Int => token.parse().ok().map(ArgValue::Int),
                ArgType::Bool => match token {
                    "ON" => Some(ArgValue::Bool(true)),
                    "OFF" => Some(ArgValue::Bool(false)),
                    _ => None,
                },
                ArgType::Stream => StreamId::from_abbreviation(token).map(ArgValue::Stream),
            };

            match value {
                Some(value) => args.push(value),
                None => {
                    return Err(ProtocolError::malformed_command(
                        kind,
                        format!("invalid value '{}' for argument '{}'", token, name),
                    ))
                }
            }
        }

        Ok(Self { kind, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_table_is_indexed_by_discriminant() {
        for kind in CommandKind::iter() {
            assert_eq!(kind.definition().kind, kind);
            assert_eq!(CommandKind::from_wire_name(kind.wire_name()), Some(kind));
        }
    }

    #[test]
    fn test_encode_lines() {
        assert_eq!(Command::list_devices().encode(), "device_list\r\n");
        assert_eq!(
            Command::connect_device("9ff167").encode(),
            "device_connect 9ff167\r\n"
        );
        assert_eq!(
            Command::ble_connect("9ff167", 3000).encode(),
            "device_connect_btle 9ff167 3000\r\n"
        );
        assert_eq!(
            Command::subscribe(StreamId::Gsr, true).encode(),
            "device_subscribe gsr ON\r\n"
        );
        assert_eq!(
            Command::subscribe(StreamId::Temp, false).encode(),
            "device_subscribe tmp OFF\r\n"
        );
        assert_eq!(Command::pause(true).encode(), "pause ON\r\n");
    }

    #[test]
    fn test_hr_subscription_uses_shared_abbreviation() {
        assert_eq!(
            Command::subscribe(StreamId::Hr, true).encode(),
            "device_subscribe ibi ON\r\n"
        );
        // The caller's identifier is kept on the command itself
        assert_eq!(
            Command::subscribe(StreamId::Hr, true).arg("stream"),
            Some(&ArgValue::Stream(StreamId::Hr))
        );
    }

    #[test]
    fn test_checked_construction_orders_arguments() {
        let command = Command::new(
            CommandKind::DeviceConnectBtle,
            [("timeout", ArgValue::Int(10)), ("dev", ArgValue::Str("abc".into()))],
        )
        .unwrap();
        assert_eq!(command.encode(), "device_connect_btle abc 10\r\n");
        assert_eq!(command, Command::ble_connect("abc", 10));
    }

    #[test]
    fn test_typed_constructors_match_schema() {
        let built = [
            Command::discover_devices(),
            Command::list_devices(),
            Command::connect_device("a"),
            Command::disconnect_device(),
            Command::ble_connect("a", 1),
            Command::ble_disconnect("a"),
            Command::subscribe(StreamId::Bvp, true),
            Command::pause(false),
        ];
        for command in built {
            let args: Vec<(&str, ArgValue)> = command
                .args()
                .map(|(name, value)| (name, value.clone()))
                .collect();
            assert_eq!(Command::new(command.kind(), args).unwrap(), command);
        }
    }

    #[test]
    fn test_unexpected_argument_is_rejected() {
        let result = Command::new(
            CommandKind::DeviceList,
            [("dev", ArgValue::Str("abc".into()))],
        );
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedCommand { command: CommandKind::DeviceList, .. })
        ));
    }

    #[test]
    fn test_wrong_argument_type_is_rejected() {
        let result = Command::new(
            CommandKind::DeviceSubscribe,
            [
                ("stream", ArgValue::Str("acc".into())),
                ("on", ArgValue::Bool(true)),
            ],
        );
        match result {
            Err(ProtocolError::MalformedCommand { reason, .. }) => {
                assert!(reason.contains("wrong type"), "{}", reason)
            }
            other => panic!("expected malformed command, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_argument_is_rejected() {
        let result = Command::new(CommandKind::Pause, Vec::<(&str, ArgValue)>::new());
        match result {
            Err(ProtocolError::MalformedCommand { reason, .. }) => {
                assert!(reason.contains("missing argument 'on'"), "{}", reason)
            }
            other => panic!("expected malformed command, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_command_lines() {
        assert_eq!(
            Command::parse("device_subscribe acc ON").unwrap(),
            Command::subscribe(StreamId::Acc, true)
        );
        assert_eq!(
            Command::parse("device_connect_btle 9ff167 10\r").unwrap(),
            Command::ble_connect("9ff167", 10)
        );
        assert!(matches!(
            Command::parse("device_explode now"),
            Err(ProtocolError::UnknownCommand(name)) if name == "device_explode"
        ));
        assert!(matches!(
            Command::parse("pause MAYBE"),
            Err(ProtocolError::MalformedCommand { .. })
        ));
        assert!(matches!(
            Command::parse("device_connect"),
            Err(ProtocolError::MalformedCommand { .. })
        ));
    }
}
