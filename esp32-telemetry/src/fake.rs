//! A scriptable in-memory `Transport`, for testing code which uses a `TelemetryLink` without any
//! Bluetooth hardware.

use crate::transport::{
    PeripheralHandle, Permission, Transport, TransportError, TransportEvent, TransportEventStream,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// A fake transport. Clones share the same state, so a test can keep one to script the platform
/// and inspect what was done after passing another to `TelemetryLink::new`.
#[derive(Clone, Debug)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>>,
}

#[derive(Debug, Default)]
struct FakeState {
    peripherals: Vec<PeripheralHandle>,
    services: Vec<Uuid>,
    denied: HashSet<Permission>,
    refuse_scan: bool,
    refuse_connect: bool,
    connect_delay: Duration,
    values: HashMap<Uuid, Vec<u8>>,
    failing_reads: HashSet<Uuid>,
    scanning: bool,
    scans_started: usize,
    linked: Option<String>,
    open: HashSet<String>,
    max_open: usize,
    subscriptions: Vec<Uuid>,
    reads: Vec<(Uuid, Instant)>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            state: Default::default(),
            events: Arc::new(Mutex::new(Some(events))),
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    fn state(&self) -> MutexGuard<FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(events) = events.as_ref() {
            // Nobody is listening once the link has gone, which is fine.
            let _ = events.send(event);
        }
    }

    /// End the event stream, as if the platform's Bluetooth stack went away. Later events are
    /// dropped.
    pub fn end_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Add a peripheral which will be advertised every time a scan starts.
    pub fn add_peripheral(&self, peripheral: PeripheralHandle) {
        self.state().peripherals.push(peripheral);
    }

    /// Set the services which connected peripherals report.
    pub fn set_services(&self, services: Vec<Uuid>) {
        self.state().services = services;
    }

    pub fn deny(&self, permission: Permission) {
        self.state().denied.insert(permission);
    }

    pub fn grant(&self, permission: Permission) {
        self.state().denied.remove(&permission);
    }

    /// Make `start_scan` fail until this is called again with `false`.
    pub fn refuse_scan(&self, refuse: bool) {
        self.state().refuse_scan = refuse;
    }

    /// Make `connect` fail until this is called again with `false`.
    pub fn refuse_connect(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    /// Make `connect` take this long to complete.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// Set the value which reads of the given characteristic return.
    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.state().values.insert(characteristic, value.to_owned());
    }

    /// Make reads of the given characteristic fail.
    pub fn fail_reads(&self, characteristic: Uuid) {
        self.state().failing_reads.insert(characteristic);
    }

    /// Report that the running scan failed.
    pub fn fail_scan(&self, reason: &str) {
        self.state().scanning = false;
        self.send(TransportEvent::ScanFailed {
            reason: reason.to_owned(),
        });
    }

    /// Push a notification for the given characteristic.
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) {
        self.send(TransportEvent::Notification {
            characteristic,
            value: value.to_owned(),
        });
    }

    /// Drop the link to the connected peripheral, as if it went out of range. The connection
    /// resource stays open until it is closed.
    pub fn drop_link(&self) {
        let linked = self.state().linked.take();
        if let Some(address) = linked {
            self.send(TransportEvent::Disconnected { address });
        }
    }

    /// Take away all permissions.
    pub fn revoke_permissions(&self) {
        {
            let mut state = self.state();
            state.denied.insert(Permission::Scan);
            state.denied.insert(Permission::Connect);
        }
        self.send(TransportEvent::PermissionRevoked);
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    /// How many times scanning has been started.
    pub fn scans_started(&self) -> usize {
        self.state().scans_started
    }

    /// How many connection resources are currently open.
    pub fn open_connections(&self) -> usize {
        self.state().open.len()
    }

    /// The most connection resources which have been open at the same time.
    pub fn max_open(&self) -> usize {
        self.state().max_open
    }

    /// The characteristics which have been subscribed to, in order.
    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.state().subscriptions.clone()
    }

    /// Every read attempt so far, with the time it was made.
    pub fn reads(&self) -> Vec<(Uuid, Instant)> {
        self.state().reads.clone()
    }

    fn check_linked(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        if self.state().linked.as_ref() == Some(&peripheral.address) {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                address: peripheral.address.clone(),
            })
        }
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn has_permission(&self, permission: Permission) -> bool {
        !self.state().denied.contains(&permission)
    }

    async fn event_stream(&self) -> Result<TransportEventStream, TransportError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Unavailable("Event stream already taken".to_owned()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        let peripherals = {
            let mut state = self.state();
            if state.denied.contains(&Permission::Scan) {
                return Err(TransportError::PermissionDenied(Permission::Scan));
            }
            if state.refuse_scan {
                return Err(TransportError::Unavailable("Scanning refused".to_owned()));
            }
            state.scanning = true;
            state.scans_started += 1;
            state.peripherals.clone()
        };
        for peripheral in peripherals {
            self.send(TransportEvent::Advertisement(peripheral));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state().scanning = false;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state();
            if state.denied.contains(&Permission::Connect) {
                return Err(TransportError::PermissionDenied(Permission::Connect));
            }
            state.open.insert(peripheral.address.clone());
            state.max_open = state.max_open.max(state.open.len());
            state.connect_delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let mut state = self.state();
        if state.refuse_connect {
            return Err(TransportError::Platform("Connection refused".into()));
        }
        state.linked = Some(peripheral.address.clone());
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<Uuid>, TransportError> {
        self.check_linked(peripheral)?;
        Ok(self.state().services.clone())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.check_linked(peripheral)?;
        self.state().subscriptions.push(characteristic);
        Ok(())
    }

    async fn read(
        &self,
        peripheral: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.state().reads.push((characteristic, Instant::now()));
        self.check_linked(peripheral)?;
        let state = self.state();
        if state.failing_reads.contains(&characteristic) {
            return Err(TransportError::Characteristic {
                uuid: characteristic,
                reason: "Read failed".to_owned(),
            });
        }
        state
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| TransportError::Characteristic {
                uuid: characteristic,
                reason: "Not readable".to_owned(),
            })
    }

    async fn close(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        state.open.remove(&peripheral.address);
        if state.linked.as_ref() == Some(&peripheral.address) {
            state.linked = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn advertise_on_scan() {
        let transport = FakeTransport::new();
        let peripheral = PeripheralHandle::new(Some("ESP32-Test"), "AA:BB:CC:DD:EE:FF");
        transport.add_peripheral(peripheral.clone());
        let mut events = transport.event_stream().await.unwrap();

        transport.start_scan().await.unwrap();
        assert!(transport.is_scanning());
        assert_eq!(
            events.next().await,
            Some(TransportEvent::Advertisement(peripheral))
        );
        assert!(transport.event_stream().await.is_err());

        transport.end_events();
        transport.start_scan().await.unwrap();
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn connection_resource_held_until_close() {
        let transport = FakeTransport::new();
        let peripheral = PeripheralHandle::new(None, "AA:BB:CC:DD:EE:FF");
        transport.refuse_connect(true);

        assert!(transport.connect(&peripheral).await.is_err());
        assert_eq!(transport.open_connections(), 1);
        transport.close(&peripheral).await.unwrap();
        transport.close(&peripheral).await.unwrap();
        assert_eq!(transport.open_connections(), 0);
        assert_eq!(transport.max_open(), 1);
    }

    #[tokio::test]
    async fn read_requires_link() {
        let transport = FakeTransport::new();
        let peripheral = PeripheralHandle::new(None, "AA:BB:CC:DD:EE:FF");
        let characteristic = Uuid::from_u128(1);
        transport.set_value(characteristic, b"42");

        assert!(matches!(
            transport.read(&peripheral, Uuid::nil(), characteristic).await,
            Err(TransportError::NotConnected { .. })
        ));
        transport.connect(&peripheral).await.unwrap();
        assert_eq!(
            transport
                .read(&peripheral, Uuid::nil(), characteristic)
                .await
                .unwrap(),
            b"42".to_vec()
        );
        assert_eq!(transport.reads().len(), 2);
    }
}
