use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::WavereqError;

/// One location/channel descriptor as delivered by the metadata service,
/// e.g. "00.BHZ" or ".LHN". The three channel letters are the sampling-rate,
/// gain and orientation codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamCode {
    pub location: String,
    pub sampling: char,
    pub gain: char,
    pub orientation: char,
}

impl StreamCode {
    pub fn channel(&self) -> String {
        let mut s = String::with_capacity(3);
        s.push(self.sampling);
        s.push(self.gain);
        s.push(self.orientation);
        s
    }
}

impl fmt::Display for StreamCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}{}{}",
            self.location, self.sampling, self.gain, self.orientation
        )
    }
}

impl FromStr for StreamCode {
    type Err = WavereqError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (location, channel) = trimmed
            .split_once('.')
            .ok_or_else(|| WavereqError::InvalidStreamCode(value.to_string()))?;
        if channel.contains('.') {
            return Err(WavereqError::InvalidStreamCode(value.to_string()));
        }
        let mut chars = channel.chars();
        match (chars.next(), chars.next(), chars.next(), chars.next()) {
            (Some(sampling), Some(gain), Some(orientation), None) => Ok(Self {
                location: location.to_string(),
                sampling,
                gain,
                orientation,
            }),
            _ => Err(WavereqError::InvalidStreamCode(value.to_string())),
        }
    }
}

impl TryFrom<String> for StreamCode {
    type Error = WavereqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamCode> for String {
    fn from(value: StreamCode) -> Self {
        value.to_string()
    }
}

/// Access restriction bits. The aggregate flag of a station is the bitwise OR
/// of the bits of its retained streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Restriction(pub u8);

impl Restriction {
    pub const NONE: Restriction = Restriction(0);
    pub const RESTRICTED: Restriction = Restriction(1);
    pub const OPEN: Restriction = Restriction(2);
    pub const OPEN_AND_RESTRICTED: Restriction = Restriction(3);

    pub fn merge(self, other: Restriction) -> Restriction {
        Restriction(self.0 | other.0)
    }

    pub fn is_restricted(self) -> bool {
        self.0 & Self::RESTRICTED.0 != 0
    }

    pub fn is_open(self) -> bool {
        self.0 & Self::OPEN.0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Permanent,
    Temporary,
}

impl FromStr for NetworkClass {
    type Err = WavereqError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "p" | "permanent" => Ok(NetworkClass::Permanent),
            "t" | "temporary" => Ok(NetworkClass::Temporary),
            other => Err(WavereqError::MalformedBatch {
                kind: "station",
                message: format!("unknown network class {other:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationRow {
    pub key: String,
    pub network: String,
    pub station: String,
    pub latitude: f64,
    pub longitude: f64,
    pub restriction: Restriction,
    pub net_class: NetworkClass,
    pub archive: String,
    pub operator: String,
    pub streams: Vec<StreamCode>,
    pub stream_restrictions: Vec<Restriction>,
    pub filtered_streams: Vec<StreamCode>,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub key: String,
    pub datetime: String,
    pub magnitude: Option<f64>,
    pub magnitude_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub region: String,
    pub selected: bool,
}

/// A header-tagged result batch as produced by the service layer. The header
/// travels with the rows so the Pack can verify the column schema it was
/// parsed from.
#[derive(Debug, Clone)]
pub struct StationBatch {
    pub header: Vec<String>,
    pub rows: Vec<StationRow>,
}

#[derive(Debug, Clone)]
pub struct EventBatch {
    pub header: Vec<String>,
    pub rows: Vec<EventRow>,
}

pub const STATION_HEADER: [&str; 11] = [
    "key",
    "netcode",
    "statcode",
    "latitude",
    "longitude",
    "restricted",
    "netclass",
    "archive",
    "netoperator",
    "streams",
    "streams_restricted",
];

pub const EVENT_HEADER: [&str; 8] = [
    "datetime",
    "magnitude",
    "magtype",
    "latitude",
    "longitude",
    "depth",
    "key",
    "region",
];

/// One requestable segment: the unit the time-window service produces and the
/// routing/download path consumes. On the wire it is the tuple
/// `[start, end, net, sta, cha, loc, size]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub start: String,
    pub end: String,
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location: String,
    pub size: Option<u64>,
}

impl LineItem {
    pub fn from_value(value: &Value) -> Result<Self, WavereqError> {
        let tuple = value
            .as_array()
            .ok_or_else(|| malformed("timewindow", "expected an array"))?;
        if tuple.len() < 6 {
            return Err(malformed("timewindow", "expected at least 6 fields"));
        }
        let text = |i: usize| -> Result<String, WavereqError> {
            tuple[i]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed("timewindow", &format!("field {i} is not a string")))
        };
        Ok(Self {
            start: text(0)?,
            end: text(1)?,
            network: text(2)?,
            station: text(3)?,
            channel: text(4)?,
            location: text(5)?,
            size: tuple.get(6).and_then(Value::as_u64),
        })
    }

    pub fn to_value(&self) -> Value {
        match self.size {
            Some(size) => json!([
                self.start,
                self.end,
                self.network,
                self.station,
                self.channel,
                self.location,
                size
            ]),
            None => json!([
                self.start,
                self.end,
                self.network,
                self.station,
                self.channel,
                self.location
            ]),
        }
    }

    /// Empty location codes go out as the two-dash placeholder.
    pub fn location_or_dashes(&self) -> &str {
        if self.location.is_empty() {
            "--"
        } else {
            &self.location
        }
    }

    /// One `NET STA LOC CHA START END` request line.
    pub fn request_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.network,
            self.station,
            self.location_or_dashes(),
            self.channel,
            self.start,
            self.end
        )
    }
}

fn malformed(kind: &'static str, message: &str) -> WavereqError {
    WavereqError::MalformedBatch {
        kind,
        message: message.to_string(),
    }
}

/// Selected-event projection for the time-window call.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLine {
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub time: String,
}

impl EventLine {
    pub fn to_value(&self) -> Value {
        json!([self.latitude, self.longitude, self.depth_km, self.time])
    }
}

/// Selected-stream projection for the time-window call, one entry per unique
/// filtered stream of a selected station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationLine {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location: String,
}

impl StationLine {
    pub fn to_value(&self) -> Value {
        json!([self.network, self.station, self.channel, self.location])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataLevel {
    Station,
    Channel,
    Response,
}

impl fmt::Display for MetadataLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataLevel::Station => write!(f, "station"),
            MetadataLevel::Channel => write!(f, "channel"),
            MetadataLevel::Response => write!(f, "response"),
        }
    }
}

/// The request type selected at submission time. FDSNWS kinds carry their
/// download presets as data; legacy kinds go through the request service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    Dataselect,
    StationXml,
    StationText,
    LegacyMseed,
    LegacyFseed,
    LegacyInventory,
}

impl RequestKind {
    pub fn is_fdsnws(self) -> bool {
        matches!(
            self,
            RequestKind::Dataselect | RequestKind::StationXml | RequestKind::StationText
        )
    }

    pub fn is_waveform(self) -> bool {
        matches!(
            self,
            RequestKind::Dataselect | RequestKind::LegacyMseed | RequestKind::LegacyFseed
        )
    }

    pub fn presets(self, description: &str, level: Option<MetadataLevel>) -> Option<Presets> {
        let stem = description.replace(' ', "_");
        let level = level.unwrap_or(MetadataLevel::Station);

        match self {
            RequestKind::Dataselect => Some(Presets {
                service: "dataselect",
                options: BTreeMap::new(),
                bulk: false,
                merge: true,
                content_type: "application/vnd.fdsn.mseed",
                filename: format!("{stem}.mseed"),
            }),
            RequestKind::StationXml => Some(Presets {
                service: "station",
                options: BTreeMap::from([
                    ("format".to_string(), "xml".to_string()),
                    ("level".to_string(), level.to_string()),
                ]),
                bulk: true,
                merge: false,
                content_type: "application/xml",
                filename: format!("{stem}.xml"),
            }),
            RequestKind::StationText => Some(Presets {
                service: "station",
                options: BTreeMap::from([
                    ("format".to_string(), "text".to_string()),
                    ("level".to_string(), level.to_string()),
                ]),
                bulk: true,
                merge: true,
                content_type: "text/plain",
                filename: format!("{stem}.txt"),
            }),
            _ => None,
        }
    }
}

/// Download presets attached to a FDSNWS request kind.
#[derive(Debug, Clone)]
pub struct Presets {
    pub service: &'static str,
    pub options: BTreeMap<String, String>,
    pub bulk: bool,
    pub merge: bool,
    pub content_type: &'static str,
    pub filename: String,
}

/// Normalize an origin time from the event service to UTC ISO with a trailing
/// `Z`, accepting both `T` and space separated forms with optional fractions.
pub fn to_utc_iso(value: &str) -> Result<String, WavereqError> {
    let trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(format_utc(dt.with_timezone(&Utc)));
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for format in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(format_utc(naive.and_utc()));
        }
    }
    Err(WavereqError::InvalidTimestamp(value.to_string()))
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
