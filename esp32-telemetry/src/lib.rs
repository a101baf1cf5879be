//! A library for discovering an ESP32 engine sensor over Bluetooth Low Energy and streaming its
//! telemetry (RPM, engine temperature, fuel level and voltage).
//!
//! The platform's Bluetooth stack is abstracted behind the [`Transport`] trait. Start by creating
//! a [`TelemetryLink`] with a transport, then call [`TelemetryLink::start_discovery`] and watch
//! its state and samples.

mod acquisition;
pub mod channel;
pub mod decode;
mod discovery;
pub mod fake;
mod link;
mod sample;
pub mod simulator;
mod status;
pub mod transport;

pub use acquisition::{AcquisitionMode, ParseAcquisitionModeError, PollTiming};
pub use channel::{Channel, ChannelDescriptor};
pub use decode::DecodeError;
pub use discovery::DeviceFilter;
pub use link::{LinkConfig, LinkEvent, SpawnError, TelemetryLink};
pub use sample::TelemetrySample;
pub use status::{LinkState, LinkStatus};
pub use transport::{
    PeripheralHandle, Permission, Transport, TransportError, TransportEvent, TransportEventStream,
};
