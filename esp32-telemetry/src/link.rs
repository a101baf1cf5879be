use crate::acquisition::{Acquisition, AcquisitionMode, PollTiming, Target};
use crate::channel::{channel_for, default_channels, Channel, ChannelDescriptor, SERVICE_UUID};
use crate::decode::{decode, DecodeError};
use crate::discovery::{DeviceFilter, Discovery};
use crate::sample::TelemetrySample;
use crate::status::{LinkState, LinkStatus, Trigger};
use crate::transport::{
    PeripheralHandle, Permission, Transport, TransportError, TransportEvent, TransportEventStream,
};
use futures::{FutureExt, Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// How many events a slow subscriber may fall behind by before it starts missing some.
const EVENT_CAPACITY: usize = 256;

/// Error type for the future representing the link's driver task.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Transport event stream ended.")]
    EventStreamEnded,
    #[error("Task failed: {0}")]
    Join(#[from] JoinError),
}

/// Settings for a `TelemetryLink`.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub filter: DeviceFilter,
    /// The GATT service which must be present for the link to become ready.
    pub service: Uuid,
    /// The channels to acquire, in the order they are polled.
    pub channels: Vec<ChannelDescriptor>,
    pub mode: AcquisitionMode,
    pub poll_timing: PollTiming,
    /// Connect to the first matching device as soon as it is found.
    pub auto_connect: bool,
    /// Start acquiring telemetry as soon as the link is ready.
    pub auto_start_acquisition: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::default(),
            service: SERVICE_UUID,
            channels: default_channels(),
            mode: AcquisitionMode::default(),
            poll_timing: PollTiming::default(),
            auto_connect: true,
            auto_start_acquisition: true,
        }
    }
}

/// Something which a `TelemetryLink` reports to its observers.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    /// The link moved to a new status.
    Status(LinkState),
    /// A channel was updated. This carries the whole merged sample.
    Sample(TelemetrySample),
    /// A channel value couldn't be decoded, so the channel was set to zero.
    DecodeError(DecodeError),
}

#[derive(Debug)]
enum Command {
    StartDiscovery,
    StopDiscovery,
    Connect(PeripheralHandle),
    Disconnect,
    StartAcquisition,
    StopAcquisition,
    Reset,
}

/// The outcome of some work which the driver spawned. Each carries the session it was started in,
/// so that results from a session which has since been torn down can be ignored.
#[derive(Debug)]
pub(crate) enum Completion {
    Connected {
        session: u64,
        result: Result<(), TransportError>,
    },
    ServicesDiscovered {
        session: u64,
        result: Result<Vec<Uuid>, TransportError>,
    },
    Value {
        session: u64,
        channel: Channel,
        value: Vec<u8>,
    },
    /// Polling stopped because of a transport error.
    AcquisitionEnded { session: u64 },
    /// A permission check failed during acquisition.
    PermissionLost { session: u64 },
}

/// A link to an ESP32 engine sensor. This can be cheaply cloned and passed around to be used from
/// different places.
///
/// All the methods to control the link return immediately; their effect is reported through the
/// link state and event stream.
#[derive(Clone, Debug)]
pub struct TelemetryLink {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    sample: watch::Receiver<TelemetrySample>,
    events: broadcast::Sender<LinkEvent>,
}

impl TelemetryLink {
    /// Spawn a task to drive a link over the given transport.
    ///
    /// Returns a tuple of (join handle, Self).
    /// If the join handle ever completes then the link is gone, and should be recreated.
    pub async fn new<T: Transport>(
        transport: T,
        config: LinkConfig,
    ) -> Result<(impl Future<Output = Result<(), SpawnError>>, Self), TransportError> {
        let transport_events = transport.event_stream().await?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LinkState::default());
        let (sample_tx, sample) = watch::channel(TelemetrySample::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let driver = Driver {
            transport: Arc::new(transport),
            discovery: Discovery::new(config.filter.clone()),
            config,
            current: LinkState::default(),
            latest: sample.borrow().clone(),
            state: state_tx,
            sample: sample_tx,
            events: events.clone(),
            completions,
            session: 0,
            connection: None,
            pending: None,
            acquisition: None,
        };
        let handle = tokio::spawn(driver.run(commands_rx, transport_events, completions_rx));

        Ok((
            handle.map(|res| Ok(res??)),
            TelemetryLink {
                commands,
                state,
                sample,
                events,
            },
        ))
    }

    /// Start scanning for a device matching the filter. This has no effect if a scan is running
    /// or a device is already connecting or connected.
    pub fn start_discovery(&self) {
        self.send(Command::StartDiscovery);
    }

    pub fn stop_discovery(&self) {
        self.send(Command::StopDiscovery);
    }

    /// Connect to the given peripheral. This has no effect if it is already connecting or
    /// connected.
    pub fn connect(&self, peripheral: PeripheralHandle) {
        self.send(Command::Connect(peripheral));
    }

    /// Stop any scan or acquisition and release the connection. This is always safe to call.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Start acquiring telemetry. This only has an effect once the link is ready.
    pub fn start_acquisition(&self) {
        self.send(Command::StartAcquisition);
    }

    pub fn stop_acquisition(&self) {
        self.send(Command::StopAcquisition);
    }

    /// Go back to `Idle` after the link has failed or been disconnected.
    pub fn reset(&self) {
        self.send(Command::Reset);
    }

    /// Get the current state of the link.
    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Get the latest telemetry.
    pub fn sample(&self) -> TelemetrySample {
        self.sample.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub fn watch_sample(&self) -> watch::Receiver<TelemetrySample> {
        self.sample.clone()
    }

    /// Get a stream of every status change, sample and decode error from now on, in the order they
    /// happened.
    pub fn events(&self) -> impl Stream<Item = LinkEvent> + Unpin {
        Box::pin(
            BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
                match event {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(count)) => {
                        log::warn!("Missed {} link events", count);
                        None
                    }
                }
            }),
        )
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            log::error!("Link driver has stopped, dropping {:?}", e.0);
        }
    }
}

/// Owns all the state of a link. Commands, transport events and completions are all handled one
/// at a time by `run`.
struct Driver<T> {
    transport: Arc<T>,
    config: LinkConfig,
    discovery: Discovery,
    current: LinkState,
    latest: TelemetrySample,
    state: watch::Sender<LinkState>,
    sample: watch::Sender<TelemetrySample>,
    events: broadcast::Sender<LinkEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    /// Incremented whenever in-flight work is cancelled.
    session: u64,
    /// The peripheral whose connection resource is held, if any.
    connection: Option<PeripheralHandle>,
    /// A connection or service discovery attempt in flight.
    pending: Option<JoinHandle<()>>,
    acquisition: Option<Acquisition>,
}

impl<T: Transport> Driver<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: TransportEventStream,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) -> Result<(), SpawnError> {
        let result = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every TelemetryLink has been dropped.
                    None => break Ok(()),
                },
                Some(completion) = completions.recv() => self.handle_completion(completion).await,
                event = transport_events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        log::error!("Transport event stream ended");
                        if !self.current.status.is_terminal() {
                            self.release().await;
                            self.transition(Trigger::Disconnect);
                        }
                        break Err(SpawnError::EventStreamEnded);
                    }
                },
            }
        };
        self.release().await;
        result
    }

    async fn handle_command(&mut self, command: Command) {
        log::trace!("Command: {:?}", command);
        match command {
            Command::StartDiscovery => self.start_discovery().await,
            Command::StopDiscovery => {
                if self.discovery.is_active() {
                    self.discovery.stop(&*self.transport).await;
                    self.transition(Trigger::StopDiscovery);
                }
            }
            Command::Connect(peripheral) => self.connect(peripheral).await,
            Command::Disconnect => {
                if self.current.status.next(Trigger::Disconnect).is_some() {
                    self.release().await;
                    self.transition(Trigger::Disconnect);
                }
            }
            Command::StartAcquisition => self.start_acquisition().await,
            Command::StopAcquisition => {
                if self.acquisition.take().is_some() {
                    // Values still queued from the stopped task will be ignored.
                    self.session += 1;
                    log::info!("Stopped acquisition");
                }
            }
            Command::Reset => {
                if self.current.status.next(Trigger::Reset).is_some() {
                    self.release().await;
                    self.transition(Trigger::Reset);
                }
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        log::trace!("Transport event: {:?}", event);
        match event {
            TransportEvent::Advertisement(peripheral) => {
                if self.current.status == LinkStatus::Scanning && self.discovery.check(&peripheral)
                {
                    log::info!("Found device {}", peripheral);
                    self.discovery.stop(&*self.transport).await;
                    self.transition_with(Trigger::Matched, peripheral.clone());
                    if self.config.auto_connect {
                        self.connect(peripheral).await;
                    }
                }
            }
            TransportEvent::ScanFailed { reason } => {
                if self.discovery.is_active() {
                    log::error!("Scan failed: {}", reason);
                    self.discovery.abandon();
                    self.transition(Trigger::ScanError);
                }
            }
            TransportEvent::Disconnected { address } => {
                let ours = matches!(&self.connection, Some(peripheral) if peripheral.address == address);
                if ours && self.current.status.is_linked() {
                    log::info!("Disconnected from {}", address);
                    self.lose_link().await;
                } else {
                    log::debug!("Ignoring disconnection of {}", address);
                }
            }
            TransportEvent::Notification {
                characteristic,
                value,
            } => {
                let notifying = matches!(
                    &self.acquisition,
                    Some(acquisition) if acquisition.mode() == AcquisitionMode::Notify
                );
                if !notifying {
                    log::trace!("Ignoring notification from {}", characteristic);
                    return;
                }
                match channel_for(&self.config.channels, characteristic) {
                    Some(channel) => self.apply_value(channel, &value),
                    None => log::debug!("Notification from unknown characteristic {}", characteristic),
                }
            }
            TransportEvent::PermissionRevoked => {
                log::warn!("Bluetooth permission revoked");
                self.deny().await;
            }
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected { session, result } if session == self.session => {
                self.pending = None;
                match result {
                    Ok(()) => {
                        if self.transition(Trigger::LinkEstablished) {
                            self.discover_services().await;
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to connect: {}", e);
                        self.lose_link().await;
                    }
                }
            }
            Completion::ServicesDiscovered { session, result } if session == self.session => {
                self.pending = None;
                match result {
                    Ok(services) if services.contains(&self.config.service) => {
                        log::debug!("Services discovered");
                        if self.transition(Trigger::ServicesFound)
                            && self.config.auto_start_acquisition
                        {
                            self.start_acquisition().await;
                        }
                    }
                    Ok(services) => {
                        log::error!(
                            "Service {} not found, only {:?}",
                            self.config.service,
                            services
                        );
                        self.release().await;
                        self.transition(Trigger::ServicesMissing);
                    }
                    Err(e) => {
                        log::error!("Service discovery failed: {}", e);
                        self.release().await;
                        self.transition(Trigger::ServicesMissing);
                    }
                }
            }
            Completion::Value {
                session,
                channel,
                value,
            } if session == self.session && self.acquisition.is_some() => {
                self.apply_value(channel, &value);
            }
            Completion::AcquisitionEnded { session } if session == self.session => {
                log::warn!("Acquisition ended, not restarting");
                self.acquisition = None;
            }
            Completion::PermissionLost { session } if session == self.session => {
                log::warn!("Permission lost during acquisition");
                self.deny().await;
            }
            completion => log::trace!("Ignoring stale {:?}", completion),
        }
    }

    async fn start_discovery(&mut self) {
        if self.current.status.next(Trigger::StartDiscovery).is_none() {
            log::debug!("Not starting discovery in status {}", self.current.status);
            return;
        }
        if !self.transport.has_permission(Permission::Scan).await {
            log::warn!("No permission to scan");
            self.deny().await;
            return;
        }
        self.transition(Trigger::StartDiscovery);
        if let Err(e) = self.discovery.start(&*self.transport).await {
            log::error!("Failed to start scan: {}", e);
            self.discovery.abandon();
            self.transition(Trigger::ScanError);
        }
    }

    async fn connect(&mut self, peripheral: PeripheralHandle) {
        if self.current.status.is_linked() {
            match &self.connection {
                Some(current) if current.address == peripheral.address => {
                    log::debug!("Already linked to {}", peripheral)
                }
                _ => log::warn!(
                    "Ignoring request to connect to {} while {}",
                    peripheral,
                    self.current
                ),
            }
            return;
        }
        if self.current.status.next(Trigger::Connect).is_none() {
            return;
        }
        self.discovery.stop(&*self.transport).await;
        if !self.transport.has_permission(Permission::Connect).await {
            log::warn!("No permission to connect");
            self.deny().await;
            return;
        }
        self.transition_with(Trigger::Connect, peripheral.clone());
        self.connection = Some(peripheral.clone());

        let session = self.session;
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        self.pending = Some(tokio::spawn(async move {
            let result = transport.connect(&peripheral).await;
            let _ = completions.send(Completion::Connected { session, result });
        }));
    }

    async fn discover_services(&mut self) {
        let peripheral = match &self.connection {
            Some(peripheral) => peripheral.clone(),
            None => return,
        };
        if !self.transport.has_permission(Permission::Connect).await {
            log::warn!("No permission to discover services");
            self.deny().await;
            return;
        }
        let session = self.session;
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        self.pending = Some(tokio::spawn(async move {
            let result = transport.discover_services(&peripheral).await;
            let _ = completions.send(Completion::ServicesDiscovered { session, result });
        }));
    }

    async fn start_acquisition(&mut self) {
        if self.current.status != LinkStatus::Ready {
            log::warn!("Can't start acquisition while {}", self.current.status);
            return;
        }
        if self.acquisition.is_some() {
            return;
        }
        let peripheral = match &self.connection {
            Some(peripheral) => peripheral.clone(),
            None => return,
        };
        if !self.transport.has_permission(Permission::Connect).await {
            self.deny().await;
            return;
        }
        log::info!("Starting {} acquisition from {}", self.config.mode, peripheral);
        let target = Target {
            peripheral,
            service: self.config.service,
            channels: self.config.channels.clone(),
        };
        self.acquisition = Some(Acquisition::start(
            self.config.mode,
            self.transport.clone(),
            target,
            self.config.poll_timing,
            self.session,
            self.completions.clone(),
        ));
    }

    fn apply_value(&mut self, channel: Channel, value: &[u8]) {
        let decoded = match decode(channel, value) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Error parsing float from BLE data: {}", e);
                let _ = self.events.send(LinkEvent::DecodeError(e));
                0.0
            }
        };
        self.latest.update(channel, decoded, SystemTime::now());
        self.sample.send_replace(self.latest.clone());
        let _ = self.events.send(LinkEvent::Sample(self.latest.clone()));
    }

    /// The link dropped, or never came up.
    async fn lose_link(&mut self) {
        self.release().await;
        self.transition(Trigger::LinkLost);
    }

    async fn deny(&mut self) {
        self.release().await;
        self.transition(Trigger::PermissionDenied);
    }

    /// Cancel everything in flight and release the connection, if any.
    async fn release(&mut self) {
        self.discovery.stop(&*self.transport).await;
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        if self.acquisition.take().is_some() {
            log::debug!("Stopped acquisition");
        }
        self.session += 1;
        if let Some(peripheral) = self.connection.take() {
            match self.transport.close(&peripheral).await {
                Ok(()) => log::debug!("Closed connection to {}", peripheral),
                Err(e) => log::warn!("Error closing connection to {}: {}", peripheral, e),
            }
        }
    }

    fn transition(&mut self, trigger: Trigger) -> bool {
        self.apply(trigger, None)
    }

    fn transition_with(&mut self, trigger: Trigger, peripheral: PeripheralHandle) -> bool {
        self.apply(trigger, Some(peripheral))
    }

    /// Move to the next status for the given trigger, publishing the new state if it changed.
    /// Returns false if the trigger doesn't apply in the current status.
    fn apply(&mut self, trigger: Trigger, peripheral: Option<PeripheralHandle>) -> bool {
        let status = match self.current.status.next(trigger) {
            Some(status) => status,
            None => {
                log::debug!("Ignoring {:?} while {}", trigger, self.current.status);
                return false;
            }
        };
        let peripheral = match (trigger, peripheral) {
            (_, Some(peripheral)) => Some(peripheral),
            (Trigger::StartDiscovery | Trigger::Reset, None) => None,
            (_, None) => self.current.peripheral.clone(),
        };
        let state = LinkState { status, peripheral };
        if state != self.current {
            log::info!("Link status: {}", state);
            self.current = state.clone();
            self.state.send_replace(state.clone());
            let _ = self.events.send(LinkEvent::Status(state));
        }
        true
    }
}
