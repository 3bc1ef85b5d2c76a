use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, Service, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{PedalError, Result},
    transport::{
        AttemptId, CharacteristicInfo, CharacteristicRef, ServiceInfo, Transport, TransportEvent,
    },
    types::ConnectionParams,
};

/// Parse a `AA:BB:CC:DD:EE:FF` style address
fn parse_address(address: &str) -> Result<BDAddr> {
    address
        .parse::<BDAddr>()
        .map_err(|e| PedalError::InvalidParameters(format!("Invalid address {address}: {e}")))
}

fn service_info(service: &Service) -> ServiceInfo {
    ServiceInfo {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| CharacteristicInfo {
                characteristic: CharacteristicRef::new(c.service_uuid, c.uuid),
                readable: c.properties.contains(CharPropFlags::READ),
            })
            .collect(),
    }
}

/// Active link to the peripheral
struct Link {
    peripheral: Peripheral,
    characteristics: HashMap<CharacteristicRef, Characteristic>,
    notifications: Option<JoinHandle<()>>,
    watcher: JoinHandle<()>,
}

impl Link {
    fn stop(self) {
        if let Some(task) = self.notifications {
            task.abort();
        }
        self.watcher.abort();
    }
}

/// [`Transport`] over a Bluetooth Low Energy adapter
///
/// One instance drives one peripheral, identified by its address. The first
/// adapter reported by the platform is used.
pub struct BleTransport {
    address: String,
    bd_addr: BDAddr,
    params: ConnectionParams,
    central: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Arc<Mutex<Option<Link>>>,
}

impl BleTransport {
    /// Create a transport for the peripheral at `address`
    ///
    /// Returns the transport and the stream its events are delivered on.
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidParameters`] if `address` is malformed,
    /// [`PedalError::DeviceNotFound`] if there is no Bluetooth adapter, or
    /// [`PedalError::Ble`] if the adapter cannot be initialized.
    pub async fn new(
        address: &str,
        params: ConnectionParams,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let bd_addr = parse_address(address)?;
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PedalError::DeviceNotFound {
                address: address.to_string(),
            })?;

        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            address: bd_addr.to_string(),
            bd_addr,
            params,
            central,
            events,
            link: Arc::new(Mutex::new(None)),
        });
        Ok((transport, rx))
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("[{}] transport event dropped, no listener", self.address);
        }
    }

    /// Look for the peripheral among known devices, scanning if needed
    async fn find_peripheral(&self) -> Result<Peripheral> {
        if let Some(peripheral) = self.known_peripheral().await? {
            return Ok(peripheral);
        }

        info!("[{}] scanning...", self.address);
        self.central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(self.params.scan_timeout_ms)).await;
        self.central.stop_scan().await?;

        self.known_peripheral()
            .await?
            .ok_or_else(|| PedalError::DeviceNotFound {
                address: self.address.clone(),
            })
    }

    async fn known_peripheral(&self) -> Result<Option<Peripheral>> {
        Ok(self
            .central
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == self.bd_addr))
    }

    async fn establish(&self) -> Result<Link> {
        let peripheral = self.find_peripheral().await?;

        timeout(
            Duration::from_millis(self.params.timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| PedalError::Timeout {
            timeout_ms: self.params.timeout_ms,
        })?
        .map_err(|e| PedalError::ConnectionFailed(e.to_string()))?;

        let watcher = self.watch_disconnect(&peripheral).await?;

        Ok(Link {
            peripheral,
            characteristics: HashMap::new(),
            notifications: None,
            watcher,
        })
    }

    /// Report the link going down without being asked to
    async fn watch_disconnect(&self, peripheral: &Peripheral) -> Result<JoinHandle<()>> {
        let mut central_events = self.central.events().await?;
        let id = peripheral.id();
        let link = self.link.clone();
        let events = self.events.clone();
        let address = self.address.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone != id {
                        continue;
                    }
                    warn!("[{}] peripheral dropped the link", address);
                    if let Some(link) = link.lock().await.take() {
                        if let Some(task) = link.notifications {
                            task.abort();
                        }
                    }
                    if events.send(TransportEvent::Disconnected).is_err() {
                        debug!("[{}] link loss not delivered, session gone", address);
                    }
                    return;
                }
            }
        }))
    }

    async fn forward_notifications(
        &self,
        peripheral: &Peripheral,
        routes: HashMap<Uuid, CharacteristicRef>,
    ) -> Result<JoinHandle<()>> {
        let mut stream = peripheral.notifications().await?;
        let events = self.events.clone();
        let address = self.address.clone();

        Ok(tokio::spawn(async move {
            while let Some(data) = stream.next().await {
                let Some(characteristic) = routes.get(&data.uuid) else {
                    trace!("[{}] notification from unknown {}", address, data.uuid);
                    continue;
                };
                trace!("[{}] {} -> {:02X?}", address, characteristic, data.value);
                if events
                    .send(TransportEvent::ValueUpdated(
                        *characteristic,
                        Bytes::from(data.value),
                    ))
                    .is_err()
                {
                    break;
                }
            }
        }))
    }

    async fn lookup(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<(Peripheral, Characteristic)> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(PedalError::Disconnected)?;
        let found = link.characteristics.get(characteristic).ok_or_else(|| {
            PedalError::Transport(format!("Characteristic {characteristic} not discovered"))
        })?;
        Ok((link.peripheral.clone(), found.clone()))
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        if let Some(stale) = self.link.lock().await.take() {
            stale.stop();
        }

        match self.establish().await {
            Ok(link) => {
                *self.link.lock().await = Some(link);
                info!("[{}] link established", self.address);
                self.emit(TransportEvent::ConnectSucceeded);
            }
            Err(e) => {
                warn!("[{}] could not connect: {}", self.address, e);
                self.emit(TransportEvent::ConnectFailed(e.to_string()));
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            let peripheral = link.peripheral.clone();
            link.stop();
            if let Err(e) = peripheral.disconnect().await {
                warn!("[{}] disconnect failed: {}", self.address, e);
            }
        }
        self.emit(TransportEvent::Disconnected);
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(PedalError::Disconnected)?;

        link.peripheral.discover_services().await?;
        let services = link.peripheral.services();

        link.characteristics = services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .map(|c| (CharacteristicRef::new(c.service_uuid, c.uuid), c.clone()))
            .collect();

        let mut routes = HashMap::new();
        for characteristic in link.characteristics.keys() {
            routes.entry(characteristic.uuid).or_insert(*characteristic);
        }
        if let Some(previous) = link.notifications.take() {
            previous.abort();
        }
        link.notifications = Some(self.forward_notifications(&link.peripheral, routes).await?);

        debug!(
            "[{}] discovered {} services, {} characteristics",
            self.address,
            services.len(),
            link.characteristics.len()
        );
        Ok(services.iter().map(service_info).collect())
    }

    async fn write(
        &self,
        characteristic: &CharacteristicRef,
        payload: Bytes,
        attempt: AttemptId,
    ) -> Result<()> {
        let (peripheral, target) = self.lookup(characteristic).await?;
        let characteristic = *characteristic;
        let events = self.events.clone();
        let address = self.address.clone();
        debug!(
            "[{}] writing {:02X?} to {} ({})",
            self.address, payload, characteristic, attempt
        );

        tokio::spawn(async move {
            let event = match peripheral
                .write(&target, &payload, WriteType::WithResponse)
                .await
            {
                Ok(()) => TransportEvent::WriteSucceeded {
                    characteristic,
                    attempt,
                },
                Err(e) => TransportEvent::WriteFailed {
                    characteristic,
                    attempt,
                    error: e.to_string(),
                },
            };
            if events.send(event).is_err() {
                debug!("[{}] outcome of {} dropped, no listener", address, attempt);
            }
        });
        Ok(())
    }

    async fn enable_notifications(&self, characteristic: &CharacteristicRef) -> Result<()> {
        let (peripheral, target) = self.lookup(characteristic).await?;
        let characteristic = *characteristic;
        let events = self.events.clone();
        let address = self.address.clone();

        tokio::spawn(async move {
            let event = match peripheral.subscribe(&target).await {
                Ok(()) => TransportEvent::NotifyEnabled(characteristic),
                Err(e) => TransportEvent::NotifyFailed(characteristic, e.to_string()),
            };
            if events.send(event).is_err() {
                debug!("[{}] subscribe outcome for {} dropped, no listener", address, characteristic);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing() {
        let parsed = parse_address("C2:71:05:AA:BB:CC").unwrap();
        assert_eq!(parsed.to_string(), "C2:71:05:AA:BB:CC");

        assert!(matches!(
            parse_address("not-an-address"),
            Err(PedalError::InvalidParameters(_))
        ));
        assert!(parse_address("C2:71:05:AA:BB").is_err());
    }
}
