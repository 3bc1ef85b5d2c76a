use pedalers::{
    BleTransport, BridgeConfig, ConnectionParams, DeviceProfile, DeviceSession, MessageBridge,
    MqttConfig, MqttTransport, Result, SessionConfig,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Pedalers bridge v{}", pedalers::VERSION);

    let config = BridgeConfig::from_env();
    let mqtt = MqttConfig::from_lookup(|key| std::env::var(key).ok())?;

    let mut bridge = MessageBridge::new(config.clone());
    bridge.add_transport(Arc::new(MqttTransport::connect(&mqtt)));

    #[cfg(feature = "kafka")]
    if let Some(kafka) = pedalers::KafkaConfig::from_lookup(|key| std::env::var(key).ok()) {
        match pedalers::KafkaTransport::connect(&kafka).await {
            Ok(transport) => bridge.add_transport(Arc::new(transport)),
            Err(e) => error!("❌ Kafka unavailable, continuing on MQTT only: {}", e),
        }
    }

    let (outputs, session_output) = mpsc::unbounded_channel();
    let mut sessions = Vec::new();

    for profile in [
        DeviceProfile::Trainer,
        DeviceProfile::HeartRate,
        DeviceProfile::Fan,
    ] {
        let Some(address) = config.address_for(profile) else {
            warn!("⚠️ No address configured for {}, skipping", profile);
            continue;
        };

        let (transport, events) = BleTransport::new(address, ConnectionParams::default()).await?;
        let session = DeviceSession::new(
            profile,
            transport,
            SessionConfig::default(),
            outputs.clone(),
        );
        bridge.attach(session.handle());
        info!("📡 {} at {}", profile, address);
        sessions.push((profile, session.spawn(events)));
    }
    drop(outputs);

    if sessions.is_empty() {
        error!("❌ No peripherals configured; set KICKR_MAC_ADDRESS, TICKR_MAC_ADDRESS or FAN_MAC_ADDRESS");
        return Ok(());
    }

    let bridge = tokio::spawn(bridge.run(session_output));

    for (profile, session) in sessions {
        match session.await {
            Ok(Ok(())) => info!("✅ {} session finished", profile),
            Ok(Err(e)) if e.is_connection_error() => {
                error!("❌ {} unreachable: {}", profile, e);
            }
            Ok(Err(e)) => error!("❌ {} session failed: {}", profile, e),
            Err(e) => error!("❌ {} session panicked: {}", profile, e),
        }
    }

    match bridge.await {
        Ok(result) => result,
        Err(e) => {
            error!("❌ Bridge task failed: {}", e);
            Ok(())
        }
    }
}
