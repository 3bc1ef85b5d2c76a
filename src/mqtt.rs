use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport as Wire};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    bridge::{InboundMessage, PubSub},
    error::Result,
    types::{MqttConfig, TopicScheme},
};

type Handlers = Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<InboundMessage>>>>>;

/// Delay before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// [`PubSub`] over an MQTT broker
///
/// Publishes and subscribes with QoS 1. The client's event loop runs on its
/// own task and reconnects on its own; subscriptions are replayed after every
/// `ConnAck`.
pub struct MqttTransport {
    name: String,
    scheme: TopicScheme,
    client: AsyncClient,
    handlers: Handlers,
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    /// Create the client and start its event loop
    #[must_use]
    pub fn connect(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(config.keep_alive());

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        if config.tls {
            options.set_transport(Wire::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(options, 10);
        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));
        let name = format!("mqtt://{}:{}", config.broker, config.port);
        info!("Connecting to {}", name);

        let event_loop = tokio::spawn(poll(
            name.clone(),
            event_loop,
            client.clone(),
            handlers.clone(),
        ));

        Self {
            name,
            scheme: config.scheme,
            client,
            handlers,
            event_loop,
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

async fn poll(name: String, mut event_loop: EventLoop, client: AsyncClient, handlers: Handlers) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("{} connected", name);
                let topics: Vec<String> = handlers.read().await.keys().cloned().collect();
                let backlog = try_resubscribe(&client, topics);
                if !backlog.is_empty() {
                    // The request queue only drains while this loop polls
                    tokio::spawn(resubscribe(name.clone(), client.clone(), backlog));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!("{} <- {} ({} bytes)", name, publish.topic, publish.payload.len());
                let handlers = handlers.read().await;
                let Some(targets) = handlers.get(&publish.topic) else {
                    debug!("{} no handler for {}", name, publish.topic);
                    continue;
                };
                for target in targets {
                    let message = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                    };
                    if target.send(message).is_err() {
                        debug!("{} handler for {} is gone", name, publish.topic);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("{} connection error: {}", name, e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Queue a subscription for each topic without waiting, returning the topics
/// the client's request queue had no room for
fn try_resubscribe(client: &AsyncClient, topics: Vec<String>) -> Vec<String> {
    topics
        .into_iter()
        .filter(|topic| client.try_subscribe(topic.as_str(), QoS::AtLeastOnce).is_err())
        .collect()
}

async fn resubscribe(name: String, client: AsyncClient, topics: Vec<String>) {
    for topic in topics {
        if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
            warn!("{} could not resubscribe to {}: {}", name, topic, e);
        }
    }
}

#[async_trait]
impl PubSub for MqttTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> TopicScheme {
        self.scheme
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<()> {
        self.handlers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        debug!("{} subscribed to {}", self.name, topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriptions_are_recorded_before_connecting() {
        let config = MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 1,
            scheme: TopicScheme::Dotted,
            ..MqttConfig::default()
        };
        let transport = MqttTransport::connect(&config);
        let (tx, _rx) = mpsc::unbounded_channel();

        transport
            .subscribe("bike.000001.fan.control", tx)
            .await
            .unwrap();

        assert_eq!(transport.name(), "mqtt://127.0.0.1:1");
        assert_eq!(transport.scheme(), TopicScheme::Dotted);
        assert!(transport
            .handlers
            .read()
            .await
            .contains_key("bike.000001.fan.control"));
    }

    #[tokio::test]
    async fn test_resubscribe_never_waits_on_a_full_queue() {
        let options = MqttOptions::new("pedalers-test", "127.0.0.1", 1);
        // Nothing polls this event loop, so its request queue never drains
        let (client, _event_loop) = AsyncClient::new(options, 2);
        let topics = vec![
            "bike/000001/incline/control".to_string(),
            "bike/000001/resistance/control".to_string(),
            "bike/000001/fan/control".to_string(),
        ];

        let backlog = try_resubscribe(&client, topics);
        assert_eq!(backlog, vec!["bike/000001/fan/control".to_string()]);

        let backlog = try_resubscribe(&client, backlog);
        assert_eq!(backlog.len(), 1);
    }
}
