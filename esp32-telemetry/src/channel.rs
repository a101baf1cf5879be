use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// The GATT service which the ESP32 firmware exposes its telemetry characteristics on.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);
pub const RPM_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abd);
pub const TEMPERATURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_1234_1234_123456789abe);
pub const FUEL_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abf);

/// A logical telemetry channel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Channel {
    /// Engine speed in revolutions per minute.
    Rpm,
    /// Engine temperature in ºC.
    Temperature,
    /// Fuel level in percent.
    Fuel,
    /// Supply voltage in volts.
    Voltage,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Rpm,
        Channel::Temperature,
        Channel::Fuel,
        Channel::Voltage,
    ];
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Rpm => "RPM",
            Self::Temperature => "Temperature",
            Self::Fuel => "Fuel",
            Self::Voltage => "Voltage",
        })
    }
}

/// Maps a logical channel to the characteristic it is read from.
///
/// Every wired characteristic carries its value either as a 4-byte little-endian `f32` or, for
/// shorter payloads, as a decimal string. See [`decode`](crate::decode::decode).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChannelDescriptor {
    pub channel: Channel,
    /// The characteristic carrying this channel, or `None` if the peripheral doesn't provide it.
    pub characteristic: Option<Uuid>,
}

impl ChannelDescriptor {
    pub fn new(channel: Channel, characteristic: Uuid) -> Self {
        Self {
            channel,
            characteristic: Some(characteristic),
        }
    }

    pub fn unwired(channel: Channel) -> Self {
        Self {
            channel,
            characteristic: None,
        }
    }
}

/// The channels of the stock ESP32 firmware, in the order they are polled.
///
/// There is no voltage characteristic, so voltage always reads as zero.
pub fn default_channels() -> Vec<ChannelDescriptor> {
    vec![
        ChannelDescriptor::new(Channel::Rpm, RPM_CHARACTERISTIC_UUID),
        ChannelDescriptor::new(Channel::Temperature, TEMPERATURE_CHARACTERISTIC_UUID),
        ChannelDescriptor::new(Channel::Fuel, FUEL_CHARACTERISTIC_UUID),
        ChannelDescriptor::unwired(Channel::Voltage),
    ]
}

/// Find the channel carried by the given characteristic, if any.
pub fn channel_for(channels: &[ChannelDescriptor], characteristic: Uuid) -> Option<Channel> {
    channels
        .iter()
        .find(|descriptor| descriptor.characteristic == Some(characteristic))
        .map(|descriptor| descriptor.channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_strings() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "12345678-1234-1234-1234-123456789abc"
        );
        assert_eq!(
            FUEL_CHARACTERISTIC_UUID.to_string(),
            "12345678-1234-1234-1234-123456789abf"
        );
    }

    #[test]
    fn lookup_channel() {
        let channels = default_channels();
        assert_eq!(
            channel_for(&channels, TEMPERATURE_CHARACTERISTIC_UUID),
            Some(Channel::Temperature)
        );
        assert_eq!(channel_for(&channels, SERVICE_UUID), None);
    }

    #[test]
    fn voltage_unwired() {
        let voltage = default_channels()
            .into_iter()
            .find(|descriptor| descriptor.channel == Channel::Voltage)
            .unwrap();
        assert_eq!(voltage.characteristic, None);
    }
}
