use crate::channel::{Channel, ChannelDescriptor};
use crate::link::Completion;
use crate::transport::{PeripheralHandle, Permission, Transport, TransportError};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

const DEFAULT_READ_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_CYCLE_DELAY: Duration = Duration::from_millis(200);

/// How fresh values are pulled from the peripheral once the link is ready.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AcquisitionMode {
    /// Subscribe to every channel and let the peripheral push values when it likes.
    Notify,
    /// Read every channel in turn, forever.
    Poll,
}

impl Default for AcquisitionMode {
    fn default() -> Self {
        Self::Poll
    }
}

impl Display for AcquisitionMode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Notify => "notify",
            Self::Poll => "poll",
        })
    }
}

/// An error parsing an acquisition mode from a string.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("Invalid acquisition mode {0:?}, expected \"notify\" or \"poll\"")]
pub struct ParseAcquisitionModeError(String);

impl FromStr for AcquisitionMode {
    type Err = ParseAcquisitionModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notify" => Ok(Self::Notify),
            "poll" => Ok(Self::Poll),
            _ => Err(ParseAcquisitionModeError(s.to_owned())),
        }
    }
}

/// Delays used in poll mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollTiming {
    /// How long to wait after each read before the next one.
    pub read_delay: Duration,
    /// How long to wait after the last channel of a cycle before starting the next cycle.
    pub cycle_delay: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            read_delay: DEFAULT_READ_DELAY,
            cycle_delay: DEFAULT_CYCLE_DELAY,
        }
    }
}

/// The characteristics to acquire from, on a connected peripheral.
#[derive(Clone, Debug)]
pub(crate) struct Target {
    pub peripheral: PeripheralHandle,
    pub service: Uuid,
    pub channels: Vec<ChannelDescriptor>,
}

impl Target {
    fn wired(&self) -> impl Iterator<Item = (Channel, Uuid)> + '_ {
        self.channels.iter().filter_map(|descriptor| {
            descriptor
                .characteristic
                .map(|characteristic| (descriptor.channel, characteristic))
        })
    }
}

/// A running acquisition task. Dropping it cancels the task at its next await point.
#[derive(Debug)]
pub(crate) struct Acquisition {
    mode: AcquisitionMode,
    task: JoinHandle<()>,
}

impl Acquisition {
    pub fn start<T: Transport>(
        mode: AcquisitionMode,
        transport: Arc<T>,
        target: Target,
        timing: PollTiming,
        session: u64,
        completions: UnboundedSender<Completion>,
    ) -> Self {
        let task = match mode {
            AcquisitionMode::Notify => {
                tokio::spawn(subscribe_all(transport, target, session, completions))
            }
            AcquisitionMode::Poll => {
                tokio::spawn(poll(transport, target, timing, session, completions))
            }
        };
        Self { mode, task }
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn subscribe_all<T: Transport>(
    transport: Arc<T>,
    target: Target,
    session: u64,
    completions: UnboundedSender<Completion>,
) {
    for (channel, characteristic) in target.wired() {
        if !transport.has_permission(Permission::Connect).await {
            let _ = completions.send(Completion::PermissionLost { session });
            return;
        }
        match transport
            .subscribe(&target.peripheral, target.service, characteristic)
            .await
        {
            Ok(()) => log::debug!("Subscribed to {} notifications", channel),
            Err(e) => log::warn!("Failed to subscribe to {}: {}", channel, e),
        }
    }
}

async fn poll<T: Transport>(
    transport: Arc<T>,
    target: Target,
    timing: PollTiming,
    session: u64,
    completions: UnboundedSender<Completion>,
) {
    log::debug!("Starting periodic reading of {}", target.peripheral);
    loop {
        for (channel, characteristic) in target.wired() {
            if !transport.has_permission(Permission::Connect).await {
                let _ = completions.send(Completion::PermissionLost { session });
                return;
            }
            match transport
                .read(&target.peripheral, target.service, characteristic)
                .await
            {
                Ok(value) => {
                    let completion = Completion::Value {
                        session,
                        channel,
                        value,
                    };
                    if completions.send(completion).is_err() {
                        return;
                    }
                }
                Err(e @ TransportError::Characteristic { .. }) => {
                    log::warn!("Read of {} failed: {}", channel, e);
                }
                Err(e) => {
                    log::error!("Error during periodic reading: {}", e);
                    let _ = completions.send(Completion::AcquisitionEnded { session });
                    return;
                }
            }
            sleep(timing.read_delay).await;
        }
        sleep(timing.cycle_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mode() {
        assert_eq!("notify".parse(), Ok(AcquisitionMode::Notify));
        assert_eq!("poll".parse(), Ok(AcquisitionMode::Poll));
        assert_eq!(
            "push".parse::<AcquisitionMode>(),
            Err(ParseAcquisitionModeError("push".to_string()))
        );
    }

    #[test]
    fn default_cycle_is_half_a_second() {
        let timing = PollTiming::default();
        assert_eq!(
            timing.read_delay * 3 + timing.cycle_delay,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn wired_channels_in_order() {
        let target = Target {
            peripheral: PeripheralHandle::new(None, "AA:BB:CC:DD:EE:FF"),
            service: crate::channel::SERVICE_UUID,
            channels: crate::channel::default_channels(),
        };
        let channels: Vec<Channel> = target.wired().map(|(channel, _)| channel).collect();
        assert_eq!(
            channels,
            vec![Channel::Rpm, Channel::Temperature, Channel::Fuel]
        );
    }
}
