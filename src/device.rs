use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::{
    channel::ControlChannel,
    error::{PedalError, Result},
    protocol::{self, ResultCode},
    telemetry::{decode_heart_rate, decode_indoor_bike_data},
    transport::{AttemptId, AttemptIds, CharacteristicRef, ServiceInfo, Transport, TransportEvent},
    types::{DeviceProfile, Parameter, SessionConfig, SessionOutput, SessionState},
    CLIMB_CONTROL_UUID, FTMS_CONTROL_POINT_UUID, HEADWIND_FAN_UUID, HEADWIND_UNLOCK_UUID,
    HEART_RATE_MEASUREMENT_UUID, INDOOR_BIKE_DATA_UUID,
};

/// What a discovered characteristic is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Control characteristic backing the channel for a parameter
    Control(Parameter),
    /// FTMS Indoor Bike Data notifications
    IndoorBikeData,
    /// Heart Rate Measurement notifications
    HeartRate,
    /// Characteristic that only takes an initialisation write
    Auxiliary,
}

struct ClaimRule {
    uuid: Uuid,
    route: Route,
    init: Option<&'static [u8]>,
}

const TRAINER_RULES: &[ClaimRule] = &[
    ClaimRule {
        uuid: FTMS_CONTROL_POINT_UUID,
        route: Route::Control(Parameter::Resistance),
        init: Some(&protocol::REQUEST_CONTROL),
    },
    ClaimRule {
        uuid: CLIMB_CONTROL_UUID,
        route: Route::Control(Parameter::Incline),
        init: None,
    },
    ClaimRule {
        uuid: INDOOR_BIKE_DATA_UUID,
        route: Route::IndoorBikeData,
        init: None,
    },
];

const HEART_RATE_RULES: &[ClaimRule] = &[ClaimRule {
    uuid: HEART_RATE_MEASUREMENT_UUID,
    route: Route::HeartRate,
    init: None,
}];

const FAN_RULES: &[ClaimRule] = &[
    ClaimRule {
        uuid: HEADWIND_UNLOCK_UUID,
        route: Route::Auxiliary,
        init: Some(&protocol::HEADWIND_UNLOCK),
    },
    ClaimRule {
        uuid: HEADWIND_FAN_UUID,
        route: Route::Control(Parameter::Fan),
        init: Some(&protocol::HEADWIND_START),
    },
];

/// Ordered characteristic claim rules for a profile; the first match wins
const fn claim_rules(profile: DeviceProfile) -> &'static [ClaimRule] {
    match profile {
        DeviceProfile::Trainer => TRAINER_RULES,
        DeviceProfile::HeartRate => HEART_RATE_RULES,
        DeviceProfile::Fan => FAN_RULES,
    }
}

/// What the event loop should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Keep processing events
    Continue,
    /// The session ended after an explicit disconnect
    Finished,
}

/// Connection lifecycle and characteristic routing for one peripheral
///
/// The session owns the routing table and processes every
/// [`TransportEvent`] for its link on a single task. Control channels are
/// shared with [`SessionHandle`]s so commands can be submitted from
/// elsewhere while the session keeps running.
///
/// # Examples
///
/// ```no_run
/// use pedalers::{BleTransport, ConnectionParams, DeviceProfile, DeviceSession, SessionConfig};
/// use tokio::sync::mpsc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (outputs, mut rx) = mpsc::unbounded_channel();
///     let (transport, events) =
///         BleTransport::new("C2:71:05:AA:BB:CC", ConnectionParams::default()).await?;
///
///     let session = DeviceSession::new(
///         DeviceProfile::Trainer,
///         transport,
///         SessionConfig::default(),
///         outputs,
///     );
///     let handle = session.handle();
///     let task = session.spawn(events);
///
///     handle.wait_until_ready().await?;
///     handle.submit(pedalers::Parameter::Incline, 2.5).await?;
///
///     while let Some(output) = rx.recv().await {
///         println!("{output:?}");
///     }
///     task.await??;
///     Ok(())
/// }
/// ```
pub struct DeviceSession {
    profile: DeviceProfile,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<SessionState>,
    channels: Arc<Vec<Arc<ControlChannel>>>,
    routes: HashMap<CharacteristicRef, Route>,
    outputs: mpsc::UnboundedSender<SessionOutput>,
    closing: Arc<AtomicBool>,
    zero_streak: u32,
    reconnect_requested: bool,
    idle_published: bool,
}

impl DeviceSession {
    /// Create a session for `profile` on top of `transport`
    ///
    /// Decoded telemetry and channel reports are sent to `outputs`.
    #[must_use]
    pub fn new(
        profile: DeviceProfile,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        outputs: mpsc::UnboundedSender<SessionOutput>,
    ) -> Self {
        let attempts = AttemptIds::new();
        let channels = profile
            .parameters()
            .iter()
            .map(|parameter| {
                Arc::new(ControlChannel::new(
                    *parameter,
                    transport.clone(),
                    attempts.clone(),
                    config.retry_limit,
                    outputs.clone(),
                ))
            })
            .collect();
        let (state, _) = watch::channel(SessionState::Disconnected);

        Self {
            profile,
            config,
            transport,
            state,
            channels: Arc::new(channels),
            routes: HashMap::new(),
            outputs,
            closing: Arc::new(AtomicBool::new(false)),
            zero_streak: 0,
            reconnect_requested: false,
            idle_published: false,
        }
    }

    /// Capability set of the peripheral
    #[must_use]
    pub const fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Route assigned to a characteristic during discovery
    #[must_use]
    pub fn route(&self, characteristic: &CharacteristicRef) -> Option<Route> {
        self.routes.get(characteristic).copied()
    }

    /// Cloneable handle for submitting commands and watching state
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            profile: self.profile,
            address: self.transport.address().to_string(),
            state: self.state.subscribe(),
            channels: self.channels.clone(),
            transport: self.transport.clone(),
            closing: self.closing.clone(),
        }
    }

    /// Run the session on its own task
    pub fn spawn(self, events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(events))
    }

    /// Connect and process transport events until the session ends
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::ConnectionFailed`] or
    /// [`PedalError::DiscoveryFailed`] if the link cannot be brought up.
    /// These are never retried.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> Result<()> {
        self.start().await?;

        while let Some(event) = events.recv().await {
            if self.handle_event(event).await? == Next::Finished {
                info!("[{}] {} session finished", self.transport.address(), self.profile);
                return Ok(());
            }
        }

        debug!("[{}] transport event stream closed", self.transport.address());
        self.set_state(SessionState::Disconnected);
        Ok(())
    }

    /// Request a connection to the peripheral
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::ConnectionFailed`] if the transport refuses the
    /// request.
    pub async fn start(&mut self) -> Result<()> {
        info!("[{}] connecting to {}", self.transport.address(), self.profile);
        self.set_state(SessionState::Connecting);

        if let Err(e) = self.transport.connect().await {
            error!("[{}] connect request failed: {}", self.transport.address(), e);
            self.set_state(SessionState::Disconnected);
            return Err(PedalError::ConnectionFailed(e.to_string()));
        }
        Ok(())
    }

    /// Process one transport event
    ///
    /// # Errors
    ///
    /// Connect and discovery failures are fatal and returned; everything
    /// else is logged and absorbed.
    pub async fn handle_event(&mut self, event: TransportEvent) -> Result<Next> {
        match event {
            TransportEvent::ConnectSucceeded => {
                info!("[{}] connected", self.transport.address());
                self.set_state(SessionState::Connected);
                self.resolve_services().await?;
            }
            TransportEvent::ConnectFailed(reason) => {
                error!("[{}] connection failed: {}", self.transport.address(), reason);
                self.set_state(SessionState::Disconnected);
                return Err(PedalError::ConnectionFailed(reason));
            }
            TransportEvent::Disconnected => return self.on_disconnected().await,
            TransportEvent::WriteSucceeded {
                characteristic,
                attempt,
            } => self.on_write_succeeded(characteristic, attempt).await,
            TransportEvent::WriteFailed {
                characteristic,
                attempt,
                error,
            } => self.on_write_failed(characteristic, attempt, &error).await,
            TransportEvent::NotifyEnabled(characteristic) => {
                self.on_notify_enabled(characteristic).await;
            }
            TransportEvent::NotifyFailed(characteristic, error) => {
                self.on_notify_failed(characteristic, &error).await;
            }
            TransportEvent::ValueUpdated(characteristic, value) => {
                self.on_value_updated(characteristic, &value).await;
            }
        }
        Ok(Next::Continue)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                "[{}] session state {} -> {}",
                self.transport.address(),
                previous,
                state
            );
        }
    }

    fn channel(&self, parameter: Parameter) -> Option<&Arc<ControlChannel>> {
        self.channels.iter().find(|c| c.parameter() == parameter)
    }

    async fn resolve_services(&mut self) -> Result<()> {
        self.set_state(SessionState::ServicesResolving);
        self.zero_streak = 0;
        self.idle_published = false;

        let services = match self.transport.discover_services().await {
            Ok(services) => services,
            Err(e) => {
                error!("[{}] service discovery failed: {}", self.transport.address(), e);
                self.set_state(SessionState::Disconnected);
                return Err(PedalError::DiscoveryFailed(e.to_string()));
            }
        };

        self.routes.clear();
        let claims = self.claim(&services);

        for (rule, characteristic) in &claims {
            self.routes.insert(*characteristic, rule.route);
            info!(
                "[{}] {:?} on {}",
                self.transport.address(),
                rule.route,
                characteristic
            );
        }

        for rule in claim_rules(self.profile) {
            if !claims.iter().any(|(claimed, _)| claimed.uuid == rule.uuid) {
                warn!(
                    "[{}] {} has no {:?} characteristic ({})",
                    self.transport.address(),
                    self.profile,
                    rule.route,
                    rule.uuid
                );
            }
        }

        for (rule, characteristic) in claims {
            if let Route::Control(parameter) = rule.route {
                if let Some(channel) = self.channel(parameter) {
                    channel.bind(characteristic).await;
                }
            }

            if let Err(e) = self.transport.enable_notifications(&characteristic).await {
                warn!(
                    "[{}] could not request notifications on {}: {}",
                    self.transport.address(),
                    characteristic,
                    e
                );
            }

            if let Some(init) = rule.init {
                debug!(
                    "[{}] initialising {} with {:02X?}",
                    self.transport.address(),
                    characteristic,
                    init
                );
                if let Err(e) = self
                    .transport
                    .write(&characteristic, Bytes::from_static(init), AttemptId::SESSION)
                    .await
                {
                    warn!(
                        "[{}] initialisation write to {} refused: {}",
                        self.transport.address(),
                        characteristic,
                        e
                    );
                }
            }
        }

        self.set_state(SessionState::Ready);
        info!("[{}] {} ready", self.transport.address(), self.profile);
        Ok(())
    }

    /// Match discovered characteristics against the profile's rules
    fn claim(&self, services: &[ServiceInfo]) -> Vec<(&'static ClaimRule, CharacteristicRef)> {
        let mut claims: Vec<(&'static ClaimRule, CharacteristicRef)> = Vec::new();

        for service in services {
            trace!("[{}] service {}", self.transport.address(), service.uuid);
            for info in &service.characteristics {
                let characteristic = info.characteristic;
                let rule = claim_rules(self.profile).iter().find(|rule| {
                    rule.uuid == characteristic.uuid
                        && !claims.iter().any(|(claimed, _)| claimed.uuid == rule.uuid)
                });
                if let Some(rule) = rule {
                    claims.push((rule, characteristic));
                }
            }
        }

        // Initialisation order follows the rule order, not discovery order
        let rules = claim_rules(self.profile);
        claims.sort_by_key(|(rule, _)| {
            rules
                .iter()
                .position(|r| r.uuid == rule.uuid)
                .unwrap_or(usize::MAX)
        });
        claims
    }

    async fn on_disconnected(&mut self) -> Result<Next> {
        self.set_state(SessionState::Disconnected);
        for channel in self.channels.iter() {
            channel.cancel().await;
        }

        if self.closing.load(Ordering::SeqCst) {
            info!("[{}] disconnected", self.transport.address());
            return Ok(Next::Finished);
        }

        if std::mem::take(&mut self.reconnect_requested) {
            info!(
                "[{}] reconnecting in {} ms",
                self.transport.address(),
                self.config.reconnect_cooldown_ms
            );
        } else {
            warn!(
                "[{}] link lost, reconnecting in {} ms",
                self.transport.address(),
                self.config.reconnect_cooldown_ms
            );
        }

        tokio::time::sleep(self.config.reconnect_cooldown()).await;
        if self.closing.load(Ordering::SeqCst) {
            info!(
                "[{}] disconnect requested during cooldown, not reconnecting",
                self.transport.address()
            );
            return Ok(Next::Finished);
        }
        self.start().await?;
        Ok(Next::Continue)
    }

    async fn on_write_succeeded(&self, characteristic: CharacteristicRef, attempt: AttemptId) {
        if attempt.is_session() {
            info!(
                "[{}] initialisation write to {} acknowledged",
                self.transport.address(),
                characteristic
            );
            return;
        }
        if let Some(Route::Control(parameter)) = self.route(&characteristic) {
            if let Some(channel) = self.channel(parameter) {
                channel.on_write_succeeded(&characteristic, attempt).await;
            }
        }
    }

    async fn on_write_failed(&self, characteristic: CharacteristicRef, attempt: AttemptId, error: &str) {
        if attempt.is_session() {
            warn!(
                "[{}] initialisation write to {} failed: {}",
                self.transport.address(),
                characteristic,
                error
            );
            return;
        }
        if let Some(Route::Control(parameter)) = self.route(&characteristic) {
            if let Some(channel) = self.channel(parameter) {
                channel.on_write_failed(&characteristic, attempt, error).await;
            }
        }
    }

    async fn on_notify_enabled(&self, characteristic: CharacteristicRef) {
        match self.route(&characteristic) {
            Some(Route::Control(parameter)) => {
                if let Some(channel) = self.channel(parameter) {
                    channel.on_notify_enabled(&characteristic).await;
                }
            }
            Some(route) => info!(
                "[{}] {:?} notifications enabled",
                self.transport.address(),
                route
            ),
            None => {}
        }
    }

    async fn on_notify_failed(&self, characteristic: CharacteristicRef, error: &str) {
        match self.route(&characteristic) {
            Some(Route::Control(parameter)) => {
                if let Some(channel) = self.channel(parameter) {
                    channel.on_notify_failed(&characteristic, error).await;
                }
            }
            Some(route) => {
                warn!(
                    "[{}] {:?} notifications failed ({}), retrying",
                    self.transport.address(),
                    route,
                    error
                );
                if let Err(e) = self.transport.enable_notifications(&characteristic).await {
                    warn!(
                        "[{}] could not re-request notifications: {}",
                        self.transport.address(),
                        e
                    );
                }
            }
            None => {}
        }
    }

    async fn on_value_updated(&mut self, characteristic: CharacteristicRef, value: &[u8]) {
        match self.route(&characteristic) {
            Some(Route::IndoorBikeData) => self.on_indoor_bike_data(value),
            Some(Route::HeartRate) => self.on_heart_rate(value).await,
            Some(Route::Control(Parameter::Resistance)) => {
                match protocol::parse_control_point_response(value) {
                    Some(response) if response.result == ResultCode::Success => debug!(
                        "[{}] control point accepted op code {:#04x}",
                        self.transport.address(),
                        response.request
                    ),
                    Some(response) => warn!(
                        "[{}] control point answered op code {:#04x} with {}",
                        self.transport.address(),
                        response.request,
                        response.result
                    ),
                    None => debug!(
                        "[{}] control point indication {:02X?}",
                        self.transport.address(),
                        value
                    ),
                }
            }
            Some(route) => debug!(
                "[{}] {:?} notification {:02X?}",
                self.transport.address(),
                route,
                value
            ),
            None => trace!(
                "[{}] ignoring notification on {}",
                self.transport.address(),
                characteristic
            ),
        }
    }

    fn on_indoor_bike_data(&mut self, value: &[u8]) {
        let sample = match decode_indoor_bike_data(value) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(
                    "[{}] discarding Indoor Bike Data {:02X?}: {}",
                    self.transport.address(),
                    value,
                    e
                );
                return;
            }
        };

        if self.config.suppress_idle_telemetry {
            if sample.is_idle() {
                if self.idle_published {
                    trace!("[{}] idle sample suppressed", self.transport.address());
                    return;
                }
                self.idle_published = true;
            } else {
                self.idle_published = false;
            }
        }

        self.emit(SessionOutput::Telemetry(sample));
    }

    async fn on_heart_rate(&mut self, value: &[u8]) {
        let measurement = match decode_heart_rate(value) {
            Ok(measurement) => measurement,
            Err(e) => {
                warn!(
                    "[{}] discarding Heart Rate Measurement {:02X?}: {}",
                    self.transport.address(),
                    value,
                    e
                );
                return;
            }
        };

        if measurement.heart_rate != 0 {
            self.zero_streak = 0;
            self.emit(SessionOutput::HeartRate(measurement));
            return;
        }

        self.zero_streak = self.zero_streak.saturating_add(1);
        trace!(
            "[{}] zero heart rate ({} in a row)",
            self.transport.address(),
            self.zero_streak
        );

        if self.zero_streak >= self.config.zero_limit && !self.reconnect_requested {
            warn!(
                "[{}] {} consecutive zero heart rate readings, reconnecting",
                self.transport.address(),
                self.zero_streak
            );
            self.reconnect_requested = true;
            if let Err(e) = self.transport.disconnect().await {
                warn!("[{}] disconnect request failed: {}", self.transport.address(), e);
                self.reconnect_requested = false;
            }
        }
    }

    fn emit(&self, output: SessionOutput) {
        if self.outputs.send(output).is_err() {
            debug!("[{}] output dropped, no listener", self.transport.address());
        }
    }
}

/// Cloneable access to a running [`DeviceSession`]
#[derive(Clone)]
pub struct SessionHandle {
    profile: DeviceProfile,
    address: String,
    state: watch::Receiver<SessionState>,
    channels: Arc<Vec<Arc<ControlChannel>>>,
    transport: Arc<dyn Transport>,
    closing: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Capability set of the peripheral
    #[must_use]
    pub const fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Link address of the peripheral
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `Ready`
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::Disconnected`] if the session ends first.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == SessionState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| PedalError::Disconnected)
    }

    /// Control channel for `parameter`, if the profile has one
    #[must_use]
    pub fn channel(&self, parameter: Parameter) -> Option<&Arc<ControlChannel>> {
        self.channels.iter().find(|c| c.parameter() == parameter)
    }

    /// Submit a command value
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::NotReady`] unless the session is `Ready`,
    /// [`PedalError::InvalidParameters`] if the profile cannot control
    /// `parameter`, or [`PedalError::Validation`] if the value is rejected.
    pub async fn submit(&self, parameter: Parameter, value: f64) -> Result<AttemptId> {
        let channel = self.channel(parameter).ok_or_else(|| {
            PedalError::InvalidParameters(format!("{} has no {} control", self.profile, parameter))
        })?;

        let state = self.state();
        if state != SessionState::Ready {
            return Err(PedalError::NotReady {
                reason: format!("{} session is {}", self.profile, state),
            });
        }

        channel.submit(value).await
    }

    /// Last acknowledged value for `parameter`
    pub async fn committed(&self, parameter: Parameter) -> Option<f64> {
        match self.channel(parameter) {
            Some(channel) => channel.committed().await,
            None => None,
        }
    }

    /// End the session; it will not reconnect
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the disconnect cannot be requested.
    pub async fn disconnect(&self) -> Result<()> {
        info!("[{}] disconnect requested", self.address);
        self.closing.store(true, Ordering::SeqCst);
        self.transport.disconnect().await
    }
}
