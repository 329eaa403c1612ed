use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumIter, EnumString};

/// Sensor channels the streaming server can push samples for
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StreamId {
    /// 3-axis acceleration
    Acc,
    /// Blood volume pulse
    Bvp,
    /// Galvanic skin response
    Gsr,
    /// Skin temperature
    Temp,
    /// Inter-beat interval
    Ibi,
    /// Heart rate (derived from the inter-beat interval)
    Hr,
    /// Device battery level
    Battery,
    /// Tag button events
    Tag,
}

/// Wire-level identifiers for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDefinition {
    pub id: StreamId,
    /// Token used in `device_subscribe` commands
    pub abbreviation: &'static str,
    /// First token of every data frame of this stream
    pub prefix: &'static str,
}

const fn define(
    id: StreamId,
    abbreviation: &'static str,
    prefix: &'static str,
) -> StreamDefinition {
    StreamDefinition {
        id,
        abbreviation,
        prefix,
    }
}

/// Stream table, indexed by `StreamId` discriminant.
///
/// `Ibi` and `Hr` share the `ibi` abbreviation: the server toggles both
/// streams with a single subscription.
pub const STREAM_DEFINITIONS: [StreamDefinition; 8] = [
    define(StreamId::Acc, "acc", "E4_Acc"),
    define(StreamId::Bvp, "bvp", "E4_Bvp"),
    define(StreamId::Gsr, "gsr", "E4_Gsr"),
    define(StreamId::Temp, "tmp", "E4_Temp"),
    define(StreamId::Ibi, "ibi", "E4_Ibi"),
    define(StreamId::Hr, "ibi", "E4_Hr"),
    define(StreamId::Battery, "bat", "E4_Battery"),
    define(StreamId::Tag, "tag", "E4_Tag"),
];

impl StreamId {
    pub fn definition(self) -> &'static StreamDefinition {
        &STREAM_DEFINITIONS[self as usize]
    }

    pub fn abbreviation(self) -> &'static str {
        self.definition().abbreviation
    }

    pub fn prefix(self) -> &'static str {
        self.definition().prefix
    }

    /// Look up the stream whose data frames start with `prefix`
    pub fn from_prefix(prefix: &str) -> Option<StreamId> {
        STREAM_DEFINITIONS
            .iter()
            .find(|def| def.prefix == prefix)
            .map(|def| def.id)
    }

    /// Look up a stream by its subscription abbreviation.
    ///
    /// For a shared abbreviation the first stream in table order wins.
    pub fn from_abbreviation(abbreviation: &str) -> Option<StreamId> {
        STREAM_DEFINITIONS
            .iter()
            .find(|def| def.abbreviation == abbreviation)
            .map(|def| def.id)
    }

    /// The other stream toggled by subscribing to this one, if any
    pub fn paired_stream(self) -> Option<StreamId> {
        match self {
            StreamId::Ibi => Some(StreamId::Hr),
            StreamId::Hr => Some(StreamId::Ibi),
            _ => None,
        }
    }

    pub fn shares_subscription_with(self, other: StreamId) -> bool {
        self.paired_stream() == Some(other)
    }

    /// Nominal sampling rate of the E4 for periodic streams
    pub fn nominal_rate_hz(self) -> Option<f64> {
        match self {
            StreamId::Acc => Some(32.0),
            StreamId::Bvp => Some(64.0),
            StreamId::Gsr => Some(4.0),
            StreamId::Temp => Some(4.0),
            StreamId::Ibi | StreamId::Hr | StreamId::Battery | StreamId::Tag => None,
        }
    }
}

/// Check a stream table for wire identifier collisions.
///
/// Prefixes must be unique. Abbreviations must be unique unless the two
/// streams are a declared subscription pair.
pub fn validate_stream_table(definitions: &[StreamDefinition]) -> Result<(), ProtocolError> {
    let mut prefixes: HashMap<&str, StreamId> = HashMap::new();
    let mut abbreviations: HashMap<&str, StreamId> = HashMap::new();

    for def in definitions {
        if let Some(existing) = prefixes.insert(def.prefix, def.id) {
            return Err(ProtocolError::StreamTableConflict {
                token: def.prefix.to_string(),
                first: existing,
                second: def.id,
            });
        }

        if let Some(&existing) = abbreviations.get(def.abbreviation) {
            if !existing.shares_subscription_with(def.id) {
                return Err(ProtocolError::StreamTableConflict {
                    token: def.abbreviation.to_string(),
                    first: existing,
                    second: def.id,
                });
            }
        } else {
            abbreviations.insert(def.abbreviation, def.id);
        }
    }

    Ok(())
}
