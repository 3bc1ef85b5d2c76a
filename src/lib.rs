#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pedalers 🚴
//!
//! A Rust library for driving a Wahoo smart-bike setup over Bluetooth Low
//! Energy and bridging it to publish/subscribe messaging.
//!
//! Three peripherals are supported:
//!
//! - **KICKR** trainer with **Climb**: resistance through the FTMS control
//!   point, incline through the Climb characteristic, and speed, cadence,
//!   power and friends from FTMS Indoor Bike Data
//! - **TICKR** heart-rate strap: standard Heart Rate Measurement
//! - **Headwind** fan: speed through Wahoo's fan characteristic
//!
//! Every controllable parameter gets a [`ControlChannel`] that validates the
//! requested value, writes it with response, retries a failed write a bounded
//! number of times and only commits a value once the peripheral acknowledges
//! it. A newer request always supersedes an older one, whatever order the
//! acknowledgements arrive in.
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library drives physical exercise equipment. An
//! incline or resistance command takes effect on the rider immediately; make
//! sure commands come from a trusted source.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pedalers::{
//!     BleTransport, ConnectionParams, DeviceProfile, DeviceSession, Parameter, SessionConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (outputs, mut telemetry) = mpsc::unbounded_channel();
//!     let (transport, events) =
//!         BleTransport::new("C2:71:05:AA:BB:CC", ConnectionParams::default()).await?;
//!
//!     // Connect to the trainer and wait for discovery to finish
//!     let session = DeviceSession::new(
//!         DeviceProfile::Trainer,
//!         transport,
//!         SessionConfig::default(),
//!         outputs,
//!     );
//!     let kickr = session.handle();
//!     session.spawn(events);
//!     kickr.wait_until_ready().await?;
//!
//!     // 4% grade on the Climb
//!     kickr.submit(Parameter::Incline, 4.0).await?;
//!
//!     while let Some(output) = telemetry.recv().await {
//!         println!("{output:?}");
//!     }
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Routing between device sessions and pub/sub transports
pub mod bridge;
/// Per-parameter write and retry state machine
pub mod channel;
/// Connection lifecycle and characteristic routing
pub mod device;
/// Error types and handling
pub mod error;
/// Kafka publish/subscribe transport
#[cfg(feature = "kafka")]
pub mod kafka;
/// MQTT publish/subscribe transport
#[cfg(feature = "mqtt")]
pub mod mqtt;
/// Command op codes, limits and encoding
pub mod protocol;
/// Indoor Bike Data and Heart Rate Measurement decoding
pub mod telemetry;
/// Link-layer contract and transport events
pub mod transport;
/// Type definitions and configuration
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BleTransport;
pub use bridge::{InboundMessage, MessageBridge, PubSub};
pub use channel::ControlChannel;
pub use device::{DeviceSession, SessionHandle};
pub use error::{DecodeError, PedalError, Result, ValidationError};
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;
pub use protocol::Command;
pub use telemetry::{HeartRateMeasurement, IndoorBikeData, TelemetryField};
pub use transport::{AttemptId, CharacteristicRef, Transport, TransportEvent};
pub use types::{
    BridgeConfig, ChannelReport, ChannelState, ConnectionParams, DeviceProfile, KafkaConfig,
    MqttConfig, Parameter, SessionConfig, SessionOutput, SessionState, TopicScheme,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine service (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point (0x2AD9)
///
/// Takes Request Control once after discovery, then Set Target Resistance
/// Level. Answers every write with an indication.
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Wahoo KICKR Climb service
pub const CLIMB_SERVICE_UUID: Uuid = Uuid::from_u128(0xa026_ee0b_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// Wahoo KICKR Climb incline control
pub const CLIMB_CONTROL_UUID: Uuid = Uuid::from_u128(0xa026_e037_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// Wahoo Headwind service
pub const HEADWIND_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xa026_ee0c_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// Wahoo Headwind unlock characteristic
///
/// Must receive the unlock sequence before the fan accepts speed commands.
pub const HEADWIND_UNLOCK_UUID: Uuid = Uuid::from_u128(0xa026_e002_0a7d_4ab3_97fa_f150_0f9f_eb8b);

/// Wahoo Headwind fan control
pub const HEADWIND_FAN_UUID: Uuid = Uuid::from_u128(0xa026_e038_0a7d_4ab3_97fa_f150_0f9f_eb8b);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_formatting() {
        assert_eq!(
            FTMS_CONTROL_POINT_UUID.to_string(),
            "00002ad9-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CLIMB_CONTROL_UUID.to_string(),
            "a026e037-0a7d-4ab3-97fa-f1500f9feb8b"
        );
        assert_eq!(
            HEADWIND_FAN_UUID.to_string(),
            "a026e038-0a7d-4ab3-97fa-f1500f9feb8b"
        );
    }
}
