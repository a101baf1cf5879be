//! `Transport` implementation on top of BlueZ, the Linux Bluetooth daemon.

use async_trait::async_trait;
use bluez_async::{
    BluetoothError, BluetoothEvent, BluetoothSession, CharacteristicEvent, CharacteristicId,
    DeviceEvent, DeviceId, DeviceInfo, SpawnError,
};
use esp32_telemetry::{
    PeripheralHandle, Permission, Transport, TransportError, TransportEvent, TransportEventStream,
};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// The BlueZ objects which peripherals and characteristics handed out so far correspond to.
#[derive(Debug)]
struct Registry<D = DeviceId, C = CharacteristicId> {
    devices: HashMap<String, D>,
    addresses: HashMap<D, String>,
    characteristics: HashMap<C, Uuid>,
}

impl<D, C> Default for Registry<D, C> {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            addresses: HashMap::new(),
            characteristics: HashMap::new(),
        }
    }
}

impl<D: Clone + Eq + Hash, C: Eq + Hash> Registry<D, C> {
    fn insert_device(&mut self, id: D, address: String) {
        self.devices.insert(address.clone(), id.clone());
        self.addresses.insert(id, address);
    }

    fn clear(&mut self) {
        self.devices.clear();
        self.addresses.clear();
        self.characteristics.clear();
    }
}

#[derive(Debug)]
pub struct BluezTransport {
    session: BluetoothSession,
    registry: Arc<Mutex<Registry>>,
    /// Advertisements for devices which BlueZ already knew about when scanning started.
    known: mpsc::UnboundedSender<TransportEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl BluezTransport {
    /// Connect to BlueZ over D-Bus.
    ///
    /// Returns a tuple of (join handle, Self). If the join handle ever completes then the D-Bus
    /// connection has been lost.
    pub async fn new(
    ) -> Result<(impl Future<Output = Result<(), SpawnError>>, Self), BluetoothError> {
        let (dbus_handle, session) = BluetoothSession::new().await?;
        let (known, receiver) = mpsc::unbounded_channel();
        Ok((
            dbus_handle,
            BluezTransport {
                session,
                registry: Default::default(),
                known,
                receiver: Mutex::new(Some(receiver)),
            },
        ))
    }

    fn device_id(&self, peripheral: &PeripheralHandle) -> Result<DeviceId, TransportError> {
        lock(&self.registry)
            .devices
            .get(&peripheral.address)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected {
                address: peripheral.address.clone(),
            })
    }

    async fn characteristic_id(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicId, TransportError> {
        let device = self.device_id(peripheral)?;
        let info = self
            .session
            .get_service_characteristic_by_uuid(&device, service, characteristic)
            .await
            .map_err(|e| characteristic_error(characteristic, e))?;
        lock(&self.registry)
            .characteristics
            .insert(info.id.clone(), characteristic);
        Ok(info.id)
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

fn platform(e: BluetoothError) -> TransportError {
    TransportError::Platform(Box::new(e))
}

fn characteristic_error(uuid: Uuid, e: BluetoothError) -> TransportError {
    TransportError::Characteristic {
        uuid,
        reason: e.to_string(),
    }
}

fn remember(registry: &Mutex<Registry>, info: &DeviceInfo) -> PeripheralHandle {
    let address = info.mac_address.to_string();
    lock(registry).insert_device(info.id.clone(), address.clone());
    PeripheralHandle {
        name: info.name.clone(),
        address,
    }
}

async fn translate(
    session: &BluetoothSession,
    registry: &Mutex<Registry>,
    event: BluetoothEvent,
) -> Option<TransportEvent> {
    match event {
        BluetoothEvent::Device {
            id,
            event: DeviceEvent::Discovered,
        } => match session.get_device_info(&id).await {
            Ok(info) => Some(TransportEvent::Advertisement(remember(registry, &info))),
            Err(e) => {
                log::warn!("Error getting info for {}: {}", id, e);
                None
            }
        },
        BluetoothEvent::Device {
            id,
            event: DeviceEvent::Connected { connected: false },
        } => {
            let address = lock(registry).addresses.get(&id).cloned()?;
            Some(TransportEvent::Disconnected { address })
        }
        BluetoothEvent::Characteristic {
            id,
            event: CharacteristicEvent::Value { value },
        } => {
            let characteristic = *lock(registry).characteristics.get(&id)?;
            Some(TransportEvent::Notification {
                characteristic,
                value,
            })
        }
        _ => None,
    }
}

#[async_trait]
impl Transport for BluezTransport {
    /// BlueZ enforces access through D-Bus policy, so refusals show up as errors from the
    /// operations themselves.
    async fn has_permission(&self, _permission: Permission) -> bool {
        true
    }

    async fn event_stream(&self) -> Result<TransportEventStream, TransportError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Unavailable("Event stream already taken".to_owned()))?;
        let events = self.session.event_stream().await.map_err(platform)?;
        let session = self.session.clone();
        let registry = self.registry.clone();
        let bluez_events = events.filter_map(move |event| {
            let session = session.clone();
            let registry = registry.clone();
            async move {
                log::trace!("BlueZ event: {:?}", event);
                translate(&session, &registry, event).await
            }
        });
        Ok(Box::pin(stream::select(
            bluez_events,
            UnboundedReceiverStream::new(receiver),
        )))
    }

    /// Nothing is connected while scanning, so this also forgets every device seen so far.
    async fn start_scan(&self) -> Result<(), TransportError> {
        lock(&self.registry).clear();
        self.session.start_discovery().await.map_err(platform)?;
        // Devices which BlueZ has seen before won't be reported as discovered again.
        for info in self.session.get_devices().await.map_err(platform)? {
            let peripheral = remember(&self.registry, &info);
            let _ = self.known.send(TransportEvent::Advertisement(peripheral));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.session.stop_discovery().await.map_err(platform)
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let id = self.device_id(peripheral)?;
        self.session.connect(&id).await.map_err(platform)
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<Uuid>, TransportError> {
        let id = self.device_id(peripheral)?;
        let services = self.session.get_services(&id).await.map_err(platform)?;
        Ok(services.into_iter().map(|service| service.uuid).collect())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let id = self
            .characteristic_id(peripheral, service, characteristic)
            .await?;
        self.session
            .start_notify(&id)
            .await
            .map_err(|e| characteristic_error(characteristic, e))
    }

    async fn read(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        let id = self
            .characteristic_id(peripheral, service, characteristic)
            .await?;
        self.session
            .read_characteristic_value(&id)
            .await
            .map_err(|e| characteristic_error(characteristic, e))
    }

    async fn close(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let id = self.device_id(peripheral)?;
        self.session.disconnect(&id).await.map_err(platform)
    }
}
