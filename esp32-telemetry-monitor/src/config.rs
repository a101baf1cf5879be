use esp32_telemetry::channel::{
    FUEL_CHARACTERISTIC_UUID, RPM_CHARACTERISTIC_UUID, SERVICE_UUID,
    TEMPERATURE_CHARACTERISTIC_UUID,
};
use esp32_telemetry::{
    AcquisitionMode, Channel, ChannelDescriptor, DeviceFilter, LinkConfig, PollTiming,
};
use eyre::Report;
use serde::de::Error as _;
use serde::{Deserialize as _, Deserializer};
use serde_derive::Deserialize;
use stable_eyre::eyre::WrapErr;
use std::fmt::Display;
use std::fs::read_to_string;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_NAME_FILTER: &str = "ESP32";
const DEFAULT_READ_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_CYCLE_DELAY: Duration = Duration::from_millis(200);
const CONFIG_FILENAME: &str = "esp32-telemetry-monitor.toml";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub link: LinkSection,
    pub monitor: MonitorConfig,
}

impl Config {
    pub fn from_file() -> Result<Config, Report> {
        Config::read(CONFIG_FILENAME)
    }

    fn read(filename: &str) -> Result<Config, Report> {
        let config_file =
            read_to_string(filename).wrap_err_with(|| format!("Reading {filename}"))?;
        Ok(toml::from_str(&config_file)?)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSection {
    /// Connect to the first device whose name contains this, ignoring case.
    pub name_filter: String,
    pub service_uuid: Uuid,
    #[serde(deserialize_with = "de_from_str")]
    pub mode: AcquisitionMode,
    /// How long to wait after each read in poll mode.
    #[serde(deserialize_with = "de_duration_millis", rename = "read_delay_millis")]
    pub read_delay: Duration,
    /// How long to wait after each full cycle of reads in poll mode.
    #[serde(deserialize_with = "de_duration_millis", rename = "cycle_delay_millis")]
    pub cycle_delay: Duration,
    pub auto_connect: bool,
    pub auto_start_acquisition: bool,
    pub characteristics: CharacteristicsConfig,
}

impl Default for LinkSection {
    fn default() -> LinkSection {
        LinkSection {
            name_filter: DEFAULT_NAME_FILTER.to_owned(),
            service_uuid: SERVICE_UUID,
            mode: AcquisitionMode::default(),
            read_delay: DEFAULT_READ_DELAY,
            cycle_delay: DEFAULT_CYCLE_DELAY,
            auto_connect: true,
            auto_start_acquisition: true,
            characteristics: CharacteristicsConfig::default(),
        }
    }
}

impl LinkSection {
    pub fn to_link_config(&self) -> LinkConfig {
        LinkConfig {
            filter: DeviceFilter::name_contains(&self.name_filter),
            service: self.service_uuid,
            channels: self.characteristics.channels(),
            mode: self.mode,
            poll_timing: PollTiming {
                read_delay: self.read_delay,
                cycle_delay: self.cycle_delay,
            },
            auto_connect: self.auto_connect,
            auto_start_acquisition: self.auto_start_acquisition,
        }
    }
}

/// The characteristic UUID of each telemetry channel.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CharacteristicsConfig {
    pub rpm: Uuid,
    pub temperature: Uuid,
    pub fuel: Uuid,
    /// The sensor firmware doesn't expose voltage yet, so this is usually left unset.
    pub voltage: Option<Uuid>,
}

impl Default for CharacteristicsConfig {
    fn default() -> CharacteristicsConfig {
        CharacteristicsConfig {
            rpm: RPM_CHARACTERISTIC_UUID,
            temperature: TEMPERATURE_CHARACTERISTIC_UUID,
            fuel: FUEL_CHARACTERISTIC_UUID,
            voltage: None,
        }
    }
}

impl CharacteristicsConfig {
    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new(Channel::Rpm, self.rpm),
            ChannelDescriptor::new(Channel::Temperature, self.temperature),
            ChannelDescriptor::new(Channel::Fuel, self.fuel),
            match self.voltage {
                Some(voltage) => ChannelDescriptor::new(Channel::Voltage, voltage),
                None => ChannelDescriptor::unwired(Channel::Voltage),
            },
        ]
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Use a simulated sensor rather than Bluetooth.
    pub simulate: bool,
}

pub fn de_duration_millis<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let millis = u64::deserialize(d)?;
    Ok(Duration::from_millis(millis))
}

pub fn de_from_str<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let s = String::deserialize(d)?;
    s.parse().map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parsing the example config file should not give any errors.
    #[test]
    fn example_config() {
        Config::read("esp32-telemetry-monitor.example.toml").unwrap();
    }

    /// Parsing an empty config file should not give any errors.
    #[test]
    fn empty_config() {
        let config = toml::from_str::<Config>("").unwrap();
        let link_config = config.link.to_link_config();
        assert_eq!(link_config.service, SERVICE_UUID);
        assert_eq!(link_config.mode, AcquisitionMode::Poll);
        assert_eq!(link_config.poll_timing, PollTiming::default());
        assert_eq!(link_config.channels, esp32_telemetry::channel::default_channels());
        assert!(!config.monitor.simulate);
    }

    #[test]
    fn notify_with_voltage() {
        let config = toml::from_str::<Config>(
            r#"
            [link]
            mode = "notify"
            read_delay_millis = 50

            [link.characteristics]
            voltage = "12345678-1234-1234-1234-123456789ac0"
            "#,
        )
        .unwrap();
        let link_config = config.link.to_link_config();
        assert_eq!(link_config.mode, AcquisitionMode::Notify);
        assert_eq!(link_config.poll_timing.read_delay, Duration::from_millis(50));
        assert_eq!(link_config.poll_timing.cycle_delay, DEFAULT_CYCLE_DELAY);
        assert_eq!(
            link_config.channels[3],
            ChannelDescriptor::new(
                Channel::Voltage,
                Uuid::from_u128(0x12345678_1234_1234_1234_123456789ac0)
            )
        );
    }

    #[test]
    fn invalid_mode() {
        let error = toml::from_str::<Config>("[link]\nmode = \"push\"\n").unwrap_err();
        assert!(error.to_string().contains("push"), "{}", error);
    }
}
