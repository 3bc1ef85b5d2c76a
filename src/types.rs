use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime},
};

use crate::telemetry::{HeartRateMeasurement, IndoorBikeData};
use crate::transport::AttemptId;

/// A controllable peripheral parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameter {
    /// Climb incline in percent grade
    Incline,
    /// Trainer resistance level
    Resistance,
    /// Headwind fan speed in percent
    Fan,
}

impl Parameter {
    /// Every controllable parameter
    pub const ALL: [Self; 3] = [Self::Incline, Self::Resistance, Self::Fan];

    /// Topic and payload name of the parameter
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Incline => "incline",
            Self::Resistance => "resistance",
            Self::Fan => "fan",
        }
    }

    /// Unit name reported alongside values of this parameter
    #[must_use]
    pub const fn unit_name(self) -> &'static str {
        match self {
            Self::Incline | Self::Fan => "percent",
            Self::Resistance => "level",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link to the peripheral
    Disconnected,
    /// Connect requested, waiting for the outcome
    Connecting,
    /// Link established, services not yet enumerated
    Connected,
    /// Enumerating services and claiming characteristics
    ServicesResolving,
    /// Accepting commands and forwarding telemetry
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::ServicesResolving => write!(f, "Resolving Services"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Write state of a control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Nothing in flight
    Idle,
    /// Waiting for the acknowledgement of the given attempt
    Writing(AttemptId),
    /// Last attempt was acknowledged by the peripheral
    Committed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Writing(id) => write!(f, "Writing ({id})"),
            Self::Committed => write!(f, "Committed"),
        }
    }
}

/// Capability set of a peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceProfile {
    /// KICKR trainer with Climb accessory
    Trainer,
    /// TICKR heart-rate strap
    HeartRate,
    /// Headwind fan
    Fan,
}

impl DeviceProfile {
    /// Parameters this profile can be commanded on
    #[must_use]
    pub const fn parameters(self) -> &'static [Parameter] {
        match self {
            Self::Trainer => &[Parameter::Incline, Parameter::Resistance],
            Self::HeartRate => &[],
            Self::Fan => &[Parameter::Fan],
        }
    }

    /// Whether the profile owns a control channel for `parameter`
    #[must_use]
    pub fn controls(self, parameter: Parameter) -> bool {
        self.parameters().contains(&parameter)
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trainer => write!(f, "KICKR"),
            Self::HeartRate => write!(f, "TICKR"),
            Self::Fan => write!(f, "Headwind"),
        }
    }
}

/// Outcome of a command on a control channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelReport {
    /// The peripheral acknowledged the write
    Committed {
        /// Parameter that changed
        parameter: Parameter,
        /// Value now in effect
        value: f64,
        /// Acknowledgement time
        timestamp: SystemTime,
    },
    /// The value failed validation and was never written
    Rejected {
        /// Parameter the value was meant for
        parameter: Parameter,
        /// The offending value
        value: f64,
        /// Why it was rejected
        reason: String,
        /// Rejection time
        timestamp: SystemTime,
    },
    /// The write failed on every retry
    Abandoned {
        /// Parameter that was being written
        parameter: Parameter,
        /// Value that never took effect
        value: f64,
        /// Number of failed writes
        failures: u32,
        /// Time the channel gave up
        timestamp: SystemTime,
    },
}

impl ChannelReport {
    /// Parameter the report concerns
    #[must_use]
    pub const fn parameter(&self) -> Parameter {
        match self {
            Self::Committed { parameter, .. }
            | Self::Rejected { parameter, .. }
            | Self::Abandoned { parameter, .. } => *parameter,
        }
    }

    /// Value the report carries
    #[must_use]
    pub const fn value(&self) -> f64 {
        match self {
            Self::Committed { value, .. }
            | Self::Rejected { value, .. }
            | Self::Abandoned { value, .. } => *value,
        }
    }

    /// When the outcome happened
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::Committed { timestamp, .. }
            | Self::Rejected { timestamp, .. }
            | Self::Abandoned { timestamp, .. } => *timestamp,
        }
    }

    /// Failure description for rejected and abandoned commands
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Committed { .. } => None,
            Self::Rejected { reason, .. } => Some(reason.clone()),
            Self::Abandoned { failures, .. } => {
                Some(format!("write abandoned after {failures} failed attempts"))
            }
        }
    }
}

/// Everything a device session hands to the message bridge
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Decoded Indoor Bike Data sample
    Telemetry(IndoorBikeData),
    /// Decoded heart-rate sample
    HeartRate(HeartRateMeasurement),
    /// Control channel outcome
    Report(ChannelReport),
}

/// Topic layout used by a pub/sub transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicScheme {
    /// `bike/<id>/<name>/control`, used over MQTT
    Hierarchical,
    /// `bike.<id>.<name>.control`, used by log-style brokers
    Dotted,
}

impl TopicScheme {
    /// Separator between topic segments
    #[must_use]
    pub const fn separator(self) -> char {
        match self {
            Self::Hierarchical => '/',
            Self::Dotted => '.',
        }
    }
}

/// BLE connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// How long to scan for the peripheral before giving up, in milliseconds
    pub scan_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
        }
    }
}

/// Per-session policy knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Failed writes tolerated before a command is abandoned
    pub retry_limit: u32,
    /// Consecutive zero heart-rate readings that force a reconnect
    pub zero_limit: u32,
    /// Pause between a forced disconnect and the reconnect, in milliseconds
    pub reconnect_cooldown_ms: u64,
    /// Publish only the first sample while the trainer is idle
    pub suppress_idle_telemetry: bool,
}

impl SessionConfig {
    /// Reconnect cooldown as a [`Duration`]
    #[must_use]
    pub const fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_limit: 10,
            zero_limit: 10,
            reconnect_cooldown_ms: 5_000,
            suppress_idle_telemetry: true,
        }
    }
}

/// Identity and peripheral addresses of one bike
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bike identifier embedded in every topic
    pub device_id: String,
    /// Host name reported in payload metadata
    pub device_name: String,
    /// First topic segment
    pub topic_prefix: String,
    /// KICKR trainer link address
    pub kickr_address: Option<String>,
    /// TICKR heart-rate strap link address
    pub tickr_address: Option<String>,
    /// Headwind fan link address
    pub fan_address: Option<String>,
}

impl BridgeConfig {
    /// Build a configuration from a variable lookup
    ///
    /// Reads `DEVICE_ID`, `HOSTNAME`, `KICKR_MAC_ADDRESS`,
    /// `TICKR_MAC_ADDRESS` and `FAN_MAC_ADDRESS`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        Self {
            device_id: get("DEVICE_ID").unwrap_or(defaults.device_id),
            device_name: get("HOSTNAME").unwrap_or(defaults.device_name),
            topic_prefix: defaults.topic_prefix,
            kickr_address: get("KICKR_MAC_ADDRESS"),
            tickr_address: get("TICKR_MAC_ADDRESS"),
            fan_address: get("FAN_MAC_ADDRESS"),
        }
    }

    /// Build a configuration from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Link address configured for `profile`
    #[must_use]
    pub fn address_for(&self, profile: DeviceProfile) -> Option<&str> {
        match profile {
            DeviceProfile::Trainer => self.kickr_address.as_deref(),
            DeviceProfile::HeartRate => self.tickr_address.as_deref(),
            DeviceProfile::Fan => self.fan_address.as_deref(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_id: "000001".to_string(),
            device_name: "pedalers".to_string(),
            topic_prefix: "bike".to_string(),
            kickr_address: None,
            tickr_address: None,
            fan_address: None,
        }
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker host name
    pub broker: String,
    /// Broker port
    pub port: u16,
    /// Optional user name
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Connect over TLS using the platform roots
    pub tls: bool,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Topic layout for this transport
    pub scheme: TopicScheme,
}

impl MqttConfig {
    /// Build broker settings from a variable lookup
    ///
    /// Reads `MQTT_HOSTNAME`, `MQTT_PORT`, `MQTT_USERNAME` and
    /// `MQTT_PASSWORD`. A port of 8883 switches TLS on.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let port = match get("MQTT_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| {
                crate::PedalError::InvalidParameters(format!("MQTT_PORT {raw:?}: {e}"))
            })?,
            None => defaults.port,
        };

        Ok(Self {
            broker: get("MQTT_HOSTNAME").unwrap_or(defaults.broker),
            port,
            username: get("MQTT_USERNAME"),
            password: get("MQTT_PASSWORD"),
            tls: port == 8883,
            ..defaults
        })
    }

    /// Keep-alive interval as a [`Duration`]
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: format!("pedalers-{}", std::process::id()),
            tls: false,
            keep_alive_secs: 30,
            scheme: TopicScheme::Hierarchical,
        }
    }
}

/// Kafka cluster settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Bootstrap brokers as `host:port`
    pub bootstrap_servers: Vec<String>,
    /// How long to wait for the cluster metadata on connect, in milliseconds
    pub connect_timeout_ms: u64,
    /// Topic layout for this transport
    pub scheme: TopicScheme,
}

impl KafkaConfig {
    /// Build cluster settings from a variable lookup
    ///
    /// Reads `KAFKA_BOOTSTRAP_SERVERS` as a comma separated broker list.
    /// Returns `None` when it is unset or empty, leaving Kafka off.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let servers: Vec<String> = lookup("KAFKA_BOOTSTRAP_SERVERS")?
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();

        if servers.is_empty() {
            return None;
        }
        Some(Self {
            bootstrap_servers: servers,
            ..Self::default()
        })
    }

    /// Connect timeout as a [`Duration`]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            connect_timeout_ms: 10_000,
            scheme: TopicScheme::Dotted,
        }
    }
}
