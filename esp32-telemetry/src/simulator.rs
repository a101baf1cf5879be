//! A `Transport` which pretends to be an ESP32 engine sensor, for running without hardware.

use crate::channel::{channel_for, Channel, ChannelDescriptor};
use crate::decode::encode;
use crate::transport::{
    PeripheralHandle, Permission, Transport, TransportError, TransportEvent, TransportEventStream,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

pub const SIMULATED_NAME: &str = "ESP32-Mock";
pub const SIMULATED_ADDRESS: &str = "00:00:00:00:00:00";

const NOTIFY_INTERVAL: Duration = Duration::from_millis(100);

/// The value of the given channel after the simulated engine has been running for `t` seconds.
pub fn simulated_value(channel: Channel, t: f32) -> f32 {
    match channel {
        Channel::Rpm => (500.0 + 2500.0 * (t * 0.5).sin()).clamp(800.0, 10000.0),
        Channel::Temperature => (85.0 + 10.0 * (t * 0.2).sin()).clamp(70.0, 110.0),
        Channel::Fuel => (75.0 + 15.0 * (t * 0.1).sin()).clamp(10.0, 100.0),
        Channel::Voltage => (12.6 + 0.8 * (t * 0.3).sin()).clamp(11.0, 14.5),
    }
}

/// A simulated sensor, advertising as `ESP32-Mock`. It always grants permissions, answers reads,
/// and pushes notifications every 100 ms for the characteristics which have been subscribed to.
#[derive(Clone, Debug)]
pub struct SimulatedTransport {
    service: Uuid,
    channels: Vec<ChannelDescriptor>,
    started: Instant,
    state: Arc<Mutex<SimulatorState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    receiver: Arc<Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>>,
}

#[derive(Debug, Default)]
struct SimulatorState {
    connected: bool,
    subscribed: Vec<(Channel, Uuid)>,
    notifier: Option<JoinHandle<()>>,
}

impl SimulatedTransport {
    /// Simulate a sensor offering the given service, with the given channels wired.
    pub fn new(service: Uuid, channels: Vec<ChannelDescriptor>) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            service,
            channels,
            started: Instant::now(),
            state: Default::default(),
            events,
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    fn state(&self) -> MutexGuard<SimulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self, characteristic: Uuid) -> Result<Channel, TransportError> {
        channel_for(&self.channels, characteristic).ok_or_else(|| TransportError::Characteristic {
            uuid: characteristic,
            reason: "No such characteristic".to_owned(),
        })
    }

    fn check_connected(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        if peripheral.address == SIMULATED_ADDRESS && self.state().connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                address: peripheral.address.clone(),
            })
        }
    }

    fn value_now(started: Instant, channel: Channel) -> Vec<u8> {
        let t = started.elapsed().as_secs_f32();
        encode(simulated_value(channel, t)).to_vec()
    }

    fn spawn_notifier(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let events = self.events.clone();
        let started = self.started;
        tokio::spawn(async move {
            let mut ticks = interval(NOTIFY_INTERVAL);
            loop {
                ticks.tick().await;
                let subscribed = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribed
                    .clone();
                for (channel, characteristic) in subscribed {
                    let event = TransportEvent::Notification {
                        characteristic,
                        value: Self::value_now(started, channel),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
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
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        let peripheral = PeripheralHandle::new(Some(SIMULATED_NAME), SIMULATED_ADDRESS);
        let _ = self.events.send(TransportEvent::Advertisement(peripheral));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        if peripheral.address != SIMULATED_ADDRESS {
            return Err(TransportError::NotConnected {
                address: peripheral.address.clone(),
            });
        }
        self.state().connected = true;
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<Uuid>, TransportError> {
        self.check_connected(peripheral)?;
        Ok(vec![self.service])
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.check_connected(peripheral)?;
        let channel = self.channel(characteristic)?;
        let mut state = self.state();
        if !state.subscribed.contains(&(channel, characteristic)) {
            state.subscribed.push((channel, characteristic));
        }
        if state.notifier.is_none() {
            state.notifier = Some(self.spawn_notifier());
        }
        Ok(())
    }

    async fn read(
        &self,
        peripheral: &PeripheralHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_connected(peripheral)?;
        let channel = self.channel(characteristic)?;
        Ok(Self::value_now(self.started, channel))
    }

    async fn close(&self, _peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        state.connected = false;
        state.subscribed.clear();
        if let Some(notifier) = state.notifier.take() {
            notifier.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::default_channels;
    use crate::channel::{RPM_CHARACTERISTIC_UUID, SERVICE_UUID};
    use crate::decode::decode;
    use futures::StreamExt;

    #[test]
    fn values_in_range() {
        for step in 0..1000 {
            let t = step as f32 * 0.1;
            let rpm = simulated_value(Channel::Rpm, t);
            assert!((800.0..=10000.0).contains(&rpm), "rpm {} at {}", rpm, t);
            let temperature = simulated_value(Channel::Temperature, t);
            assert!((70.0..=110.0).contains(&temperature));
            let fuel = simulated_value(Channel::Fuel, t);
            assert!((10.0..=100.0).contains(&fuel));
            let voltage = simulated_value(Channel::Voltage, t);
            assert!((11.0..=14.5).contains(&voltage));
        }
    }

    #[test]
    fn starting_values() {
        assert_eq!(simulated_value(Channel::Rpm, 0.0), 800.0);
        assert_eq!(simulated_value(Channel::Temperature, 0.0), 85.0);
        assert_eq!(simulated_value(Channel::Fuel, 0.0), 75.0);
    }

    #[tokio::test(start_paused = true)]
    async fn notifies_after_subscribe() {
        let transport = SimulatedTransport::new(SERVICE_UUID, default_channels());
        let mut events = transport.event_stream().await.unwrap();
        let peripheral = PeripheralHandle::new(Some(SIMULATED_NAME), SIMULATED_ADDRESS);

        transport.connect(&peripheral).await.unwrap();
        assert_eq!(
            transport.discover_services(&peripheral).await.unwrap(),
            vec![SERVICE_UUID]
        );
        transport
            .subscribe(&peripheral, SERVICE_UUID, RPM_CHARACTERISTIC_UUID)
            .await
            .unwrap();

        match events.next().await {
            Some(TransportEvent::Notification {
                characteristic,
                value,
            }) => {
                assert_eq!(characteristic, RPM_CHARACTERISTIC_UUID);
                let rpm = decode(Channel::Rpm, &value).unwrap();
                assert!((800.0..=10000.0).contains(&rpm));
            }
            other => panic!("Unexpected event {:?}", other),
        }

        transport.close(&peripheral).await.unwrap();
        assert!(transport
            .read(&peripheral, SERVICE_UUID, RPM_CHARACTERISTIC_UUID)
            .await
            .is_err());
    }
}
