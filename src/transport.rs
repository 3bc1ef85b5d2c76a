//! The link-layer contract the device session is written against.
//!
//! A [`Transport`] submits operations and returns immediately; how each one
//! turned out arrives later as a [`TransportEvent`] on the channel the
//! transport was created with. The session and its control channels never
//! block on an acknowledgement, so they run unchanged over real BLE or over a
//! scripted fake.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use uuid::Uuid;

use crate::error::Result;

/// Identity of a GATT characteristic
///
/// The service is part of the identity so that two services exposing the same
/// characteristic UUID never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
}

impl CharacteristicRef {
    /// Create a characteristic reference
    #[must_use]
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// A characteristic found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Where the characteristic lives
    pub characteristic: CharacteristicRef,
    /// Whether it supports reads
    pub readable: bool,
}

/// A service found during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics in discovery order
    pub characteristics: Vec<CharacteristicInfo>,
}

/// Tag carried by a write and echoed back in its acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    /// Reserved for writes the session issues on its own behalf
    pub const SESSION: Self = Self(0);

    /// Raw id
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this tags a session-level initialisation write
    #[must_use]
    pub const fn is_session(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic attempt id allocator shared by all channels of one session
#[derive(Debug, Clone, Default)]
pub struct AttemptIds(Arc<AtomicU64>);

impl AttemptIds {
    /// Create an allocator; the first id handed out is 1
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id
    #[must_use]
    pub fn allocate(&self) -> AttemptId {
        AttemptId(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Outcome of a transport operation, or unsolicited peripheral activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link is up
    ConnectSucceeded,
    /// Link could not be established
    ConnectFailed(String),
    /// Link went down
    Disconnected,
    /// A write was acknowledged
    WriteSucceeded {
        /// Characteristic written
        characteristic: CharacteristicRef,
        /// Attempt the write belonged to
        attempt: AttemptId,
    },
    /// A write was refused or lost
    WriteFailed {
        /// Characteristic written
        characteristic: CharacteristicRef,
        /// Attempt the write belonged to
        attempt: AttemptId,
        /// Stack-supplied reason
        error: String,
    },
    /// Notifications are flowing for the characteristic
    NotifyEnabled(CharacteristicRef),
    /// Enabling notifications failed
    NotifyFailed(CharacteristicRef, String),
    /// A notification or indication arrived
    ValueUpdated(CharacteristicRef, Bytes),
}

/// Link-layer operations a device session needs
///
/// Every method only submits; outcomes are reported as [`TransportEvent`]s.
/// An `Err` means the submission itself was refused.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Link address of the peripheral
    fn address(&self) -> &str;

    /// Request a connection; reports `ConnectSucceeded` or `ConnectFailed`
    async fn connect(&self) -> Result<()>;

    /// Request a disconnect; reports `Disconnected`
    async fn disconnect(&self) -> Result<()>;

    /// Enumerate services and characteristics of the connected peripheral
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>>;

    /// Write with response; reports `WriteSucceeded` or `WriteFailed`
    async fn write(
        &self,
        characteristic: &CharacteristicRef,
        payload: Bytes,
        attempt: AttemptId,
    ) -> Result<()>;

    /// Subscribe to notifications; reports `NotifyEnabled` or `NotifyFailed`
    async fn enable_notifications(&self, characteristic: &CharacteristicRef) -> Result<()>;
}
