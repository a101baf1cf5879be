use crate::transport::{PeripheralHandle, Transport, TransportError};

const DEFAULT_NAME_FILTER: &str = "ESP32";

/// Which advertising peripherals to connect to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceFilter {
    /// Match devices whose advertised name contains this, ignoring case.
    pub name_contains: String,
}

impl DeviceFilter {
    pub fn name_contains(name: &str) -> Self {
        Self {
            name_contains: name.to_owned(),
        }
    }

    pub fn matches(&self, peripheral: &PeripheralHandle) -> bool {
        match &peripheral.name {
            Some(name) => name
                .to_lowercase()
                .contains(&self.name_contains.to_lowercase()),
            None => false,
        }
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::name_contains(DEFAULT_NAME_FILTER)
    }
}

/// Tracks whether a scan is running, so that starting and stopping are idempotent.
#[derive(Debug)]
pub(crate) struct Discovery {
    filter: DeviceFilter,
    active: bool,
}

impl Discovery {
    pub fn new(filter: DeviceFilter) -> Self {
        Self {
            filter,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Start scanning, unless a scan is already running.
    pub async fn start<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
    ) -> Result<(), TransportError> {
        if self.active {
            return Ok(());
        }
        transport.start_scan().await?;
        log::debug!("Started BLE scan");
        self.active = true;
        Ok(())
    }

    /// Stop scanning, if a scan is running. Errors stopping the scan are logged and otherwise
    /// ignored, as there is nothing useful to do about them.
    pub async fn stop<T: Transport + ?Sized>(&mut self, transport: &T) {
        if !self.active {
            return;
        }
        self.active = false;
        match transport.stop_scan().await {
            Ok(()) => log::debug!("Stopped BLE scan"),
            Err(e) => log::warn!("Error stopping scan: {}", e),
        }
    }

    /// Forget about the running scan after the platform reported that it failed.
    pub fn abandon(&mut self) {
        self.active = false;
    }

    /// Check an advertisement against the filter. Advertisements which arrive when no scan is
    /// running are ignored.
    pub fn check(&self, peripheral: &PeripheralHandle) -> bool {
        if !self.active {
            log::trace!("Ignoring advertisement from {} while not scanning", peripheral);
            return false;
        }
        let matched = self.filter.matches(peripheral);
        log::trace!(
            "BLE device found: {} ({})",
            peripheral,
            if matched { "match" } else { "no match" }
        );
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_case_insensitive() {
        let filter = DeviceFilter::default();
        assert!(filter.matches(&PeripheralHandle::new(Some("esp32-dash"), "11:22:33:44:55:66")));
        assert!(filter.matches(&PeripheralHandle::new(Some("My ESP32"), "11:22:33:44:55:66")));
    }

    #[test]
    fn no_match() {
        let filter = DeviceFilter::default();
        assert!(!filter.matches(&PeripheralHandle::new(Some("LYWSD03MMC"), "11:22:33:44:55:66")));
        assert!(!filter.matches(&PeripheralHandle::new(None, "11:22:33:44:55:66")));
    }

    #[test]
    fn ignore_when_inactive() {
        let mut discovery = Discovery::new(DeviceFilter::default());
        let peripheral = PeripheralHandle::new(Some("ESP32-Test"), "AA:BB:CC:DD:EE:FF");
        assert!(!discovery.check(&peripheral));
        discovery.active = true;
        assert!(discovery.check(&peripheral));
        discovery.abandon();
        assert!(!discovery.is_active());
        assert!(!discovery.check(&peripheral));
    }
}
