use crate::channel::Channel;
use std::fmt::{self, Display, Formatter};
use std::time::SystemTime;

/// The latest known value of every telemetry channel.
///
/// Channels update independently of each other, so a sample is built up by merging in one channel
/// value at a time. A channel which hasn't been updated keeps its last known value.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetrySample {
    /// Engine speed in revolutions per minute.
    pub rpm: f32,
    /// Engine temperature in ºC.
    pub engine_temperature: f32,
    /// Fuel level in percent, 0 to 100.
    pub fuel_level: f32,
    /// Supply voltage in volts.
    pub voltage: f32,
    /// When the most recent channel value was merged in.
    pub timestamp: SystemTime,
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self {
            rpm: 0.0,
            engine_temperature: 0.0,
            fuel_level: 0.0,
            voltage: 0.0,
            timestamp: SystemTime::now(),
        }
    }
}

impl Display for TelemetrySample {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "RPM: {:.0} Temperature: {:.1}ºC Fuel: {:.1}% Voltage: {:.2} V",
            self.rpm, self.engine_temperature, self.fuel_level, self.voltage
        )
    }
}

impl TelemetrySample {
    /// Get the current value of the given channel.
    pub fn get(&self, channel: Channel) -> f32 {
        match channel {
            Channel::Rpm => self.rpm,
            Channel::Temperature => self.engine_temperature,
            Channel::Fuel => self.fuel_level,
            Channel::Voltage => self.voltage,
        }
    }

    /// Set a single channel, leaving the others untouched.
    pub fn update(&mut self, channel: Channel, value: f32, timestamp: SystemTime) {
        match channel {
            Channel::Rpm => self.rpm = value,
            Channel::Temperature => self.engine_temperature = value,
            Channel::Fuel => self.fuel_level = value,
            Channel::Voltage => self.voltage = value,
        }
        self.timestamp = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn update_keeps_other_channels() {
        let start = SystemTime::UNIX_EPOCH;
        let mut sample = TelemetrySample {
            rpm: 900.0,
            engine_temperature: 80.0,
            fuel_level: 50.0,
            voltage: 12.5,
            timestamp: start,
        };
        let later = start + Duration::from_millis(100);
        sample.update(Channel::Temperature, 91.5, later);
        assert_eq!(
            sample,
            TelemetrySample {
                rpm: 900.0,
                engine_temperature: 91.5,
                fuel_level: 50.0,
                voltage: 12.5,
                timestamp: later,
            }
        );
    }

    #[test]
    fn last_write_wins() {
        let mut sample = TelemetrySample::default();
        sample.update(Channel::Rpm, 1000.0, SystemTime::UNIX_EPOCH);
        sample.update(Channel::Rpm, 2000.0, SystemTime::UNIX_EPOCH);
        assert_eq!(sample.get(Channel::Rpm), 2000.0);
    }

    #[test]
    fn display() {
        let sample = TelemetrySample {
            rpm: 2500.4,
            engine_temperature: 85.3,
            fuel_level: 40.0,
            voltage: 12.6,
            timestamp: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(
            sample.to_string(),
            "RPM: 2500 Temperature: 85.3ºC Fuel: 40.0% Voltage: 12.60 V"
        );
    }
}
