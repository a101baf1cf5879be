use async_trait::async_trait;
use futures::Stream;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// The name and address of a peripheral which was seen advertising.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PeripheralHandle {
    /// The advertised name of the device, if it has one.
    pub name: Option<String>,
    /// A stable identifier for the device, usually its MAC address.
    pub address: String,
}

impl PeripheralHandle {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name.map(ToOwned::to_owned),
            address: address.to_owned(),
        }
    }
}

impl Display for PeripheralHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => f.write_str(&self.address),
        }
    }
}

/// A privileged operation which the host platform may refuse.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Permission {
    /// Scanning for advertisements.
    Scan,
    /// Connecting to a peripheral and talking GATT to it.
    Connect,
}

/// Something which happened asynchronously on the host's Bluetooth stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    /// An advertisement was received while scanning.
    Advertisement(PeripheralHandle),
    /// Scanning stopped because of an error.
    ScanFailed { reason: String },
    /// The link to the peripheral with the given address was lost.
    Disconnected { address: String },
    /// A subscribed characteristic pushed a new value.
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// A permission which was previously granted has been taken away.
    PermissionRevoked,
}

/// An error carrying out a Bluetooth operation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operation needs a permission which hasn't been granted.
    #[error("Permission {0:?} not granted.")]
    PermissionDenied(Permission),
    /// The Bluetooth radio can't be used.
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),
    /// There is no link to the peripheral.
    #[error("Not connected to {address}.")]
    NotConnected { address: String },
    /// A single characteristic couldn't be read or subscribed to.
    #[error("Characteristic {uuid} failed: {reason}")]
    Characteristic { uuid: Uuid, reason: String },
    /// Some other error from the platform.
    #[error("Platform error: {0}")]
    Platform(#[source] Box<dyn Error + Send + Sync>),
}

pub type TransportEventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// The host platform's BLE central capability.
///
/// A `TelemetryLink` drives a single `Transport`, and never has more than one peripheral connected
/// at a time. Completions of `connect` and `discover_services` are reported by returning from the
/// method; everything the platform reports unprompted arrives on the `event_stream`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Check whether the given privileged operation is currently allowed.
    async fn has_permission(&self, permission: Permission) -> bool;

    /// Get the stream of events from the platform. This is only called once.
    async fn event_stream(&self) -> Result<TransportEventStream, TransportError>;

    /// Start scanning. Advertisements are reported as events.
    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Connect to the given peripheral, returning once the link is established.
    ///
    /// The connection resource is held from the moment this is called until `close` is called for
    /// the same peripheral, even if this fails or is cancelled.
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    /// Discover the GATT services of a connected peripheral, returning their UUIDs.
    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<Uuid>, TransportError>;

    /// Enable notifications for the given characteristic.
    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    /// Read the current value of the given characteristic.
    async fn read(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    /// Disconnect from the peripheral and release the connection resource. Calling this for a
    /// peripheral which isn't connected has no effect.
    async fn close(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_handle() {
        assert_eq!(
            PeripheralHandle::new(Some("ESP32-Test"), "AA:BB:CC:DD:EE:FF").to_string(),
            "ESP32-Test (AA:BB:CC:DD:EE:FF)"
        );
        assert_eq!(
            PeripheralHandle::new(None, "AA:BB:CC:DD:EE:FF").to_string(),
            "AA:BB:CC:DD:EE:FF"
        );
    }
}
