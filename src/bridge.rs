//! Routing between device sessions and publish/subscribe transports.
//!
//! Inbound command messages are matched to a parameter by topic and handed
//! to the session that controls it. Session output (telemetry, heart rate,
//! channel reports) is turned into one JSON payload per value and published
//! on every attached transport, each with its own topic scheme.
//!
//! Each transport publishes from its own queue and worker task, so a broker
//! that stalls only delays its own publications.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, trace, warn};

use crate::{
    device::SessionHandle,
    error::{PedalError, Result},
    transport::AttemptId,
    types::{BridgeConfig, Parameter, SessionOutput, TopicScheme},
};

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic it arrived on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

/// A publish/subscribe transport the bridge can publish to and receive
/// commands from
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Topic layout this transport expects
    fn scheme(&self) -> TopicScheme;

    /// Publish `payload` on `topic`
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Forward every message on `topic` to `handler`
    async fn subscribe(
        &self,
        topic: &str,
        handler: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<()>;
}

/// Topic for inbound commands
#[must_use]
pub fn control_topic(scheme: TopicScheme, config: &BridgeConfig, name: &str) -> String {
    topic(scheme, config, &[name, "control"])
}

/// Topic for channel reports
#[must_use]
pub fn report_topic(scheme: TopicScheme, config: &BridgeConfig, name: &str) -> String {
    topic(scheme, config, &[name, "report"])
}

/// Topic for telemetry values
#[must_use]
pub fn data_topic(scheme: TopicScheme, config: &BridgeConfig, name: &str) -> String {
    topic(scheme, config, &[name])
}

fn topic(scheme: TopicScheme, config: &BridgeConfig, segments: &[&str]) -> String {
    let separator = scheme.separator().to_string();
    [config.topic_prefix.as_str(), config.device_id.as_str()]
        .iter()
        .chain(segments)
        .copied()
        .collect::<Vec<_>>()
        .join(&separator)
}

/// Parameter addressed by a command topic
///
/// Matches `/<name>` or `.<name>` anywhere in the topic, ignoring case.
#[must_use]
pub fn route_topic(topic: &str) -> Option<Parameter> {
    let topic = topic.to_lowercase();
    Parameter::ALL.into_iter().find(|parameter| {
        let name = parameter.name();
        topic.contains(&format!("/{name}")) || topic.contains(&format!(".{name}"))
    })
}

/// Extract the commanded value from a payload
///
/// Accepts a bare number, or a JSON object carrying the value under the
/// parameter's name, under `value`, or under `power` for the fan.
///
/// # Errors
///
/// Returns [`PedalError::MalformedPayload`] if no numeric value is found.
pub fn parse_command(topic: &str, parameter: Parameter, payload: &[u8]) -> Result<f64> {
    let malformed = |reason: String| PedalError::MalformedPayload {
        topic: topic.to_string(),
        reason,
    };

    let json: Value =
        serde_json::from_slice(payload).map_err(|e| malformed(format!("not JSON: {e}")))?;

    match &json {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| malformed(format!("{number} is not representable"))),
        Value::Object(fields) => {
            let mut keys = vec![parameter.name(), "value"];
            if parameter == Parameter::Fan {
                keys.push("power");
            }
            let found = keys
                .iter()
                .find_map(|key| fields.get(*key).map(|value| (*key, value)));

            match found {
                Some((_, value)) if value.is_number() => value
                    .as_f64()
                    .ok_or_else(|| malformed(format!("{value} is not representable"))),
                Some((key, value)) => Err(malformed(format!("{key} is {value}, not a number"))),
                None => Err(malformed(format!("no {} value", parameter.name()))),
            }
        }
        other => Err(malformed(format!("unexpected payload {other}"))),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata<'a> {
    device_name: &'a str,
}

/// JSON body of every outbound publication
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Publication<'a> {
    value: f64,
    unit_name: &'a str,
    timestamp: f64,
    metadata: Metadata<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicKind {
    Data,
    Report,
}

fn encode(publication: &Publication<'_>) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(publication)?))
}

fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

/// Publications a transport may have queued before new ones are dropped
const OUTLET_CAPACITY: usize = 256;

/// Longest a single publish may take before it is abandoned
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// A transport together with the queue feeding its publish worker
struct Outlet {
    transport: Arc<dyn PubSub>,
    queue: mpsc::Sender<(String, Bytes)>,
}

impl Outlet {
    fn spawn(transport: Arc<dyn PubSub>) -> Self {
        let (queue, pending) = mpsc::channel(OUTLET_CAPACITY);
        tokio::spawn(drain(transport.clone(), pending));
        Self { transport, queue }
    }

    fn enqueue(&self, topic: String, payload: Bytes) {
        match self.queue.try_send((topic, payload)) {
            Ok(()) => {}
            Err(TrySendError::Full((topic, _))) => {
                warn!("{} is backed up, dropping {}", self.transport.name(), topic);
            }
            Err(TrySendError::Closed((topic, _))) => {
                debug!("{} worker gone, dropping {}", self.transport.name(), topic);
            }
        }
    }
}

async fn drain(transport: Arc<dyn PubSub>, mut pending: mpsc::Receiver<(String, Bytes)>) {
    while let Some((topic, payload)) = pending.recv().await {
        match tokio::time::timeout(PUBLISH_TIMEOUT, transport.publish(&topic, payload)).await {
            Ok(Ok(())) => trace!("{} published {}", transport.name(), topic),
            Ok(Err(e)) => warn!("{} could not publish {}: {}", transport.name(), topic, e),
            Err(_) => warn!(
                "{} gave up on {} after {:?}",
                transport.name(),
                topic,
                PUBLISH_TIMEOUT
            ),
        }
    }
    debug!("{} publish queue closed", transport.name());
}

/// Connects device sessions to zero or more pub/sub transports
pub struct MessageBridge {
    config: BridgeConfig,
    outlets: Vec<Outlet>,
    sessions: Vec<SessionHandle>,
}

impl MessageBridge {
    /// Create a bridge with no transports and no sessions
    #[must_use]
    pub const fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            outlets: Vec::new(),
            sessions: Vec::new(),
        }
    }

    /// Bridge configuration
    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Add a pub/sub transport
    ///
    /// Starts the transport's publish worker, so this must be called from
    /// within a Tokio runtime.
    pub fn add_transport(&mut self, transport: Arc<dyn PubSub>) {
        info!(
            "Bridging over {} ({:?} topics)",
            transport.name(),
            transport.scheme()
        );
        self.outlets.push(Outlet::spawn(transport));
    }

    /// Route commands for the session's parameters to it
    pub fn attach(&mut self, session: SessionHandle) {
        info!("Attached {} at {}", session.profile(), session.address());
        self.sessions.push(session);
    }

    /// Subscribe every transport to the control topics of the attached
    /// sessions
    ///
    /// # Errors
    ///
    /// Returns the first subscription error.
    pub async fn subscribe_controls(
        &self,
        handler: &mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<()> {
        for Outlet { transport, .. } in &self.outlets {
            for session in &self.sessions {
                for parameter in session.profile().parameters() {
                    let topic = control_topic(transport.scheme(), &self.config, parameter.name());
                    debug!("{} subscribing to {}", transport.name(), topic);
                    transport.subscribe(&topic, handler.clone()).await?;
                }
            }
        }
        Ok(())
    }

    /// Route one inbound command to its session
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::UnroutableTopic`] if no attached session controls
    /// the addressed parameter, [`PedalError::MalformedPayload`] if the value
    /// cannot be read, or the session's error if the command is refused.
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Result<AttemptId> {
        let parameter = route_topic(&message.topic)
            .ok_or_else(|| PedalError::UnroutableTopic(message.topic.clone()))?;
        let value = parse_command(&message.topic, parameter, &message.payload)?;

        let session = self
            .sessions
            .iter()
            .find(|s| s.profile().controls(parameter))
            .ok_or_else(|| PedalError::UnroutableTopic(message.topic.clone()))?;

        info!("{} command {} -> {}", parameter, value, session.profile());
        session.submit(parameter, value).await
    }

    /// Queue one piece of session output on every transport
    ///
    /// Never waits on a broker. A transport whose queue is full drops the
    /// publication.
    pub fn publish_output(&self, output: &SessionOutput) {
        let now = SystemTime::now();
        let publications: Vec<(TopicKind, &str, Publication<'_>)> = match output {
            SessionOutput::Telemetry(sample) => sample
                .fields()
                .into_iter()
                .map(|(field, value)| {
                    let publication = self.publication(value, field.unit_name(), now, None);
                    (TopicKind::Data, field.name(), publication)
                })
                .collect(),
            SessionOutput::HeartRate(measurement) => measurement
                .fields()
                .into_iter()
                .map(|(field, value)| {
                    let publication = self.publication(value, field.unit_name(), now, None);
                    (TopicKind::Data, field.name(), publication)
                })
                .collect(),
            SessionOutput::Report(report) => {
                let parameter = report.parameter();
                vec![(
                    TopicKind::Report,
                    parameter.name(),
                    self.publication(
                        report.value(),
                        parameter.unit_name(),
                        report.timestamp(),
                        report.error(),
                    ),
                )]
            }
        };

        for (kind, name, publication) in publications {
            let payload = match encode(&publication) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Could not serialize {}: {}", name, e);
                    continue;
                }
            };

            if self.outlets.is_empty() {
                debug!("{} = {} (no transport)", name, publication.value);
                continue;
            }

            for outlet in &self.outlets {
                let scheme = outlet.transport.scheme();
                let topic = match kind {
                    TopicKind::Data => data_topic(scheme, &self.config, name),
                    TopicKind::Report => report_topic(scheme, &self.config, name),
                };
                trace!("{} <- {}", topic, publication.value);
                outlet.enqueue(topic, payload.clone());
            }
        }
    }

    fn publication<'a>(
        &'a self,
        value: f64,
        unit_name: &'a str,
        timestamp: SystemTime,
        error: Option<String>,
    ) -> Publication<'a> {
        Publication {
            value,
            unit_name,
            timestamp: unix_seconds(timestamp),
            metadata: Metadata {
                device_name: &self.config.device_name,
            },
            error,
        }
    }

    /// Subscribe to control topics, then route commands and publish session
    /// output until every session has dropped its output sender
    ///
    /// # Errors
    ///
    /// Returns an error if a control topic subscription fails. Errors from
    /// individual messages are logged and dropped.
    pub async fn run(self, mut outputs: mpsc::UnboundedReceiver<SessionOutput>) -> Result<()> {
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        self.subscribe_controls(&inbound_tx).await?;
        info!(
            "Bridge running for bike {} with {} session(s)",
            self.config.device_id,
            self.sessions.len()
        );

        loop {
            tokio::select! {
                Some(message) = inbound.recv() => {
                    match self.handle_inbound(&message).await {
                        Ok(attempt) => debug!("{} accepted as attempt {}", message.topic, attempt),
                        Err(e) if e.is_recoverable() => {
                            warn!("Dropping message on {}: {}", message.topic, e);
                        }
                        Err(e) => error!("Command on {} failed: {}", message.topic, e),
                    }
                }
                output = outputs.recv() => match output {
                    Some(output) => self.publish_output(&output),
                    None => {
                        info!("All sessions closed, bridge stopping");
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::DeviceSession,
        telemetry::decode_indoor_bike_data,
        transport::{
            fake::FakeTransport, CharacteristicInfo, CharacteristicRef, ServiceInfo,
        },
        types::{ChannelReport, DeviceProfile, SessionConfig},
        CLIMB_CONTROL_UUID, CLIMB_SERVICE_UUID,
    };
    use std::{sync::Mutex, time::Duration};
    use tokio_test::assert_ok;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Broker {
        Healthy,
        Failing,
        Stalled,
    }

    /// Pub/sub transport that records publications and lets tests inject
    /// messages on subscribed topics
    struct MemoryPubSub {
        scheme: TopicScheme,
        broker: Broker,
        published: Mutex<Vec<(String, Bytes)>>,
        subscriptions: Mutex<Vec<(String, mpsc::UnboundedSender<InboundMessage>)>>,
    }

    impl MemoryPubSub {
        fn with_broker(scheme: TopicScheme, broker: Broker) -> Arc<Self> {
            Arc::new(Self {
                scheme,
                broker,
                published: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            })
        }

        fn new(scheme: TopicScheme) -> Arc<Self> {
            Self::with_broker(scheme, Broker::Healthy)
        }

        fn failing(scheme: TopicScheme) -> Arc<Self> {
            Self::with_broker(scheme, Broker::Failing)
        }

        fn stalled(scheme: TopicScheme) -> Arc<Self> {
            Self::with_broker(scheme, Broker::Stalled)
        }

        /// Wait for the publish worker to deliver `count` publications
        async fn settle(&self, count: usize) -> Vec<(String, Value)> {
            let wait = async {
                while self.published.lock().unwrap().len() < count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            };
            assert_ok!(tokio::time::timeout(Duration::from_secs(2), wait).await);
            self.published()
        }

        fn published(&self) -> Vec<(String, Value)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, payload)| (topic.clone(), serde_json::from_slice(payload).unwrap()))
                .collect()
        }

        fn topics(&self) -> Vec<String> {
            self.subscriptions
                .lock()
                .unwrap()
                .iter()
                .map(|(topic, _)| topic.clone())
                .collect()
        }

        fn deliver(&self, topic: &str, payload: &'static str) {
            for (subscribed, handler) in self.subscriptions.lock().unwrap().iter() {
                if subscribed == topic {
                    handler
                        .send(InboundMessage {
                            topic: topic.to_string(),
                            payload: Bytes::from_static(payload.as_bytes()),
                        })
                        .unwrap();
                }
            }
        }
    }

    #[async_trait]
    impl PubSub for MemoryPubSub {
        fn name(&self) -> &str {
            "memory"
        }

        fn scheme(&self) -> TopicScheme {
            self.scheme
        }

        async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
            match self.broker {
                Broker::Healthy => {}
                Broker::Failing => {
                    return Err(PedalError::PubSub("broker unavailable".to_string()));
                }
                Broker::Stalled => std::future::pending::<()>().await,
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            Ok(())
        }

        async fn subscribe(
            &self,
            topic: &str,
            handler: mpsc::UnboundedSender<InboundMessage>,
        ) -> Result<()> {
            self.subscriptions
                .lock()
                .unwrap()
                .push((topic.to_string(), handler));
            Ok(())
        }
    }

    fn climb() -> CharacteristicRef {
        CharacteristicRef::new(CLIMB_SERVICE_UUID, CLIMB_CONTROL_UUID)
    }

    async fn ready_trainer() -> (SessionHandle, Arc<FakeTransport>) {
        let services = vec![ServiceInfo {
            uuid: CLIMB_SERVICE_UUID,
            characteristics: vec![CharacteristicInfo {
                characteristic: climb(),
                readable: false,
            }],
        }];
        let (transport, events) = FakeTransport::new(services);
        let (outputs, _rx) = mpsc::unbounded_channel();
        let session = DeviceSession::new(
            DeviceProfile::Trainer,
            transport.clone(),
            SessionConfig::default(),
            outputs,
        );
        let handle = session.handle();
        session.spawn(events);
        handle.wait_until_ready().await.unwrap();
        (handle, transport)
    }

    #[test]
    fn test_topic_schemes() {
        let config = BridgeConfig::default();

        assert_eq!(
            control_topic(TopicScheme::Hierarchical, &config, "incline"),
            "bike/000001/incline/control"
        );
        assert_eq!(
            report_topic(TopicScheme::Dotted, &config, "fan"),
            "bike.000001.fan.report"
        );
        assert_eq!(
            data_topic(TopicScheme::Hierarchical, &config, "heartrate"),
            "bike/000001/heartrate"
        );
    }

    #[test]
    fn test_route_topic() {
        assert_eq!(
            route_topic("bike/000001/incline/control"),
            Some(Parameter::Incline)
        );
        assert_eq!(
            route_topic("bike.000001.RESISTANCE.control"),
            Some(Parameter::Resistance)
        );
        assert_eq!(route_topic("bike/000001/fan/control"), Some(Parameter::Fan));
        assert_eq!(route_topic("bike/000001/speed"), None);
    }

    #[test]
    fn test_parse_command_payloads() {
        let topic = "bike/000001/incline/control";
        assert_eq!(
            parse_command(topic, Parameter::Incline, br#"{"incline": 2.5, "timestamp": 1}"#)
                .unwrap(),
            2.5
        );
        assert_eq!(
            parse_command(topic, Parameter::Incline, br#"{"value": -3}"#).unwrap(),
            -3.0
        );
        assert_eq!(parse_command(topic, Parameter::Incline, b"4.5").unwrap(), 4.5);
        assert_eq!(
            parse_command(topic, Parameter::Fan, br#"{"power": 60}"#).unwrap(),
            60.0
        );

        for payload in [
            &br#"{"power": 60}"#[..],
            br#"{"incline": "steep"}"#,
            b"[1, 2]",
            b"not json",
        ] {
            assert!(matches!(
                parse_command(topic, Parameter::Incline, payload),
                Err(PedalError::MalformedPayload { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_speed_and_cadence_yield_two_publications() {
        let memory = MemoryPubSub::new(TopicScheme::Hierarchical);
        let mut bridge = MessageBridge::new(BridgeConfig::default());
        bridge.add_transport(memory.clone());

        let sample = decode_indoor_bike_data(&[0x04, 0x00, 0x10, 0x0E, 0x84, 0x03]).unwrap();
        bridge.publish_output(&SessionOutput::Telemetry(sample));

        let published = memory.settle(2).await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "bike/000001/speed");
        assert_eq!(published[0].1["value"], 10.0);
        assert_eq!(published[0].1["unitName"], "m/s");
        assert_eq!(published[0].1["metadata"]["deviceName"], "pedalers");
        assert!(published[0].1["timestamp"].as_f64().unwrap() > 0.0);
        assert!(published[0].1.get("error").is_none());
        assert_eq!(published[1].0, "bike/000001/cadence");
        assert_eq!(published[1].1["value"], 90.0);
        assert_eq!(published[1].1["unitName"], "rpm");
    }

    #[tokio::test]
    async fn test_reports_carry_errors() {
        let memory = MemoryPubSub::new(TopicScheme::Dotted);
        let mut bridge = MessageBridge::new(BridgeConfig::default());
        bridge.add_transport(memory.clone());

        let report = ChannelReport::Abandoned {
            parameter: Parameter::Incline,
            value: 3.0,
            failures: 10,
            timestamp: SystemTime::now(),
        };
        bridge.publish_output(&SessionOutput::Report(report));

        let published = memory.settle(1).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "bike.000001.incline.report");
        assert_eq!(published[0].1["unitName"], "percent");
        assert_eq!(
            published[0].1["error"],
            "write abandoned after 10 failed attempts"
        );
    }

    #[tokio::test]
    async fn test_failing_transport_does_not_block_the_other() {
        let healthy = MemoryPubSub::new(TopicScheme::Hierarchical);
        let broken = MemoryPubSub::failing(TopicScheme::Dotted);
        let mut bridge = MessageBridge::new(BridgeConfig::default());
        bridge.add_transport(broken);
        bridge.add_transport(healthy.clone());

        let sample = decode_indoor_bike_data(&[0x04, 0x00, 0x10, 0x0E, 0x84, 0x03]).unwrap();
        bridge.publish_output(&SessionOutput::Telemetry(sample));

        assert_eq!(healthy.settle(2).await.len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_transport_does_not_hold_up_the_bridge() {
        let (handle, transport) = ready_trainer().await;
        let healthy = MemoryPubSub::new(TopicScheme::Hierarchical);
        let stalled = MemoryPubSub::stalled(TopicScheme::Dotted);
        let mut bridge = MessageBridge::new(BridgeConfig::default());
        bridge.add_transport(stalled.clone());
        bridge.add_transport(healthy.clone());
        bridge.attach(handle);

        let (outputs_tx, outputs) = mpsc::unbounded_channel();
        let task = tokio::spawn(bridge.run(outputs));

        for _ in 0..3 {
            let sample = decode_indoor_bike_data(&[0x04, 0x00, 0x10, 0x0E, 0x84, 0x03]).unwrap();
            outputs_tx.send(SessionOutput::Telemetry(sample)).unwrap();
        }
        let published = healthy.settle(6).await;
        assert_eq!(published.len(), 6);
        assert!(stalled.published().is_empty());

        // Commands keep flowing while the stalled broker holds its publishes
        healthy.deliver("bike/000001/incline/control", "1.0");
        let wait = async {
            while transport.writes_to(&climb()).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        assert_ok!(tokio::time::timeout(Duration::from_secs(2), wait).await);

        drop(outputs_tx);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_bridge_without_transports() {
        let bridge = MessageBridge::new(BridgeConfig::default());
        let sample = decode_indoor_bike_data(&[0x04, 0x00, 0x10, 0x0E, 0x84, 0x03]).unwrap();
        bridge.publish_output(&SessionOutput::Telemetry(sample));

        let message = InboundMessage {
            topic: "bike/000001/incline/control".to_string(),
            payload: Bytes::from_static(b"2.0"),
        };
        assert!(matches!(
            bridge.handle_inbound(&message).await,
            Err(PedalError::UnroutableTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_command_reaches_the_trainer() {
        let (handle, transport) = ready_trainer().await;
        let mut bridge = MessageBridge::new(BridgeConfig::default());
        bridge.attach(handle);

        let message = InboundMessage {
            topic: "bike/000001/incline/control".to_string(),
            payload: Bytes::from_static(br#"{"incline": 2.5}"#),
        };
        let attempt = assert_ok!(bridge.handle_inbound(&message).await);

        assert_eq!(
            transport.writes_to(&climb()),
            vec![(Bytes::from_static(&[0x66, 0xFA, 0x00]), attempt)]
        );

        let rejected = InboundMessage {
            topic: "bike/000001/incline/control".to_string(),
            payload: Bytes::from_static(br#"{"incline": 40}"#),
        };
        assert!(matches!(
            bridge.handle_inbound(&rejected).await,
            Err(PedalError::Validation(_))
        ));
        assert_eq!(transport.writes_to(&climb()).len(), 1);
    }

    #[tokio::test]
    async fn test_run_routes_subscribed_commands() {
        let (handle, transport) = ready_trainer().await;
        let memory = MemoryPubSub::new(TopicScheme::Dotted);
        let mut bridge = MessageBridge::new(BridgeConfig::default());
        bridge.add_transport(memory.clone());
        bridge.attach(handle);

        let (outputs_tx, outputs) = mpsc::unbounded_channel();
        let task = tokio::spawn(bridge.run(outputs));

        while memory.topics().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            memory.topics(),
            vec![
                "bike.000001.incline.control".to_string(),
                "bike.000001.resistance.control".to_string(),
            ]
        );

        memory.deliver("bike.000001.incline.control", r#"{"value": -2.5}"#);
        while transport.writes_to(&climb()).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            transport.writes_to(&climb())[0].0,
            Bytes::from_static(&[0x66, 0x06, 0xFF])
        );

        drop(outputs_tx);
        assert!(task.await.unwrap().is_ok());
    }
}
