use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

/// Wire format of `offline_mode_at` in heartbeat messages.
pub const HEARTBEAT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One protocol version a party speaks, and where it speaks it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VersionUrl {
    pub version: String,
    pub base_url: String,
}

impl FromStr for VersionUrl {
    type Err = String;

    /// Parses `VERSION=BASE_URL`, as given on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (version, base_url) = s
            .split_once('=')
            .ok_or_else(|| format!("expected VERSION=BASE_URL, got '{}'", s))?;
        let version = version.trim();
        let base_url = base_url.trim().trim_end_matches('/');
        if version.is_empty() || base_url.is_empty() {
            return Err(format!("expected VERSION=BASE_URL, got '{}'", s));
        }
        Ok(Self {
            version: version.to_string(),
            base_url: base_url.to_string(),
        })
    }
}

/// A peer to start registering with: the token it handed us out of band
/// and the version it serves, written `TOKEN@VERSION=BASE_URL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub token: String,
    pub version_url: VersionUrl,
}

impl FromStr for ConnectTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, version_url) = s
            .split_once('@')
            .ok_or_else(|| format!("expected TOKEN@VERSION=BASE_URL, got '{}'", s))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(format!("expected TOKEN@VERSION=BASE_URL, got '{}'", s));
        }
        Ok(Self {
            token: token.to_string(),
            version_url: version_url.parse()?,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementConfiguration {
    Continuous,
    Intermittent,
}

/// Runtime behaviour negotiated by a handshake.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequiredBehaviour {
    /// Seconds between heartbeats; absent or zero means no heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measurement_configuration: Vec<MeasurementConfiguration>,
}

impl RequiredBehaviour {
    pub fn heartbeat_interval(&self) -> Option<u64> {
        self.heartbeat_interval.filter(|secs| *secs > 0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegisterPayload {
    pub token: String,
    pub version_url: Vec<VersionUrl>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HandshakePayload {
    pub required_behaviour: RequiredBehaviour,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeAckPayload {
    #[serde(default)]
    pub required_behaviour: Option<RequiredBehaviour>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub offline_mode_at: String,
}

/// Headers every inbound protocol call carries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Bearer credential with any `Token ` prefix removed.
    pub credential: Option<String>,
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new(credential: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            credential: Some(credential.into()),
            request_id: Some(request_id.into()),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Format an instant the way heartbeat payloads carry it.
pub fn format_heartbeat_time(at: DateTime<Utc>) -> String {
    at.format(HEARTBEAT_TIME_FORMAT).to_string()
}

/// Parse `offline_mode_at`, accepting RFC 3339 as a fallback.
pub fn parse_heartbeat_time(raw: &str) -> Result<DateTime<Utc>, InvalidTimestamp> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, HEARTBEAT_TIME_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| InvalidTimestamp(raw.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTimestamp(pub String);

impl fmt::Display for InvalidTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a valid timestamp", self.0)
    }
}

impl std::error::Error for InvalidTimestamp {}

pub type GenericBoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;
