use crate::transport::PeripheralHandle;
use std::fmt::{self, Display, Formatter};

/// The state of the link to the sensor.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LinkStatus {
    Idle,
    Scanning,
    DeviceFound,
    Connecting,
    DiscoveringServices,
    Ready,
    ScanFailed,
    ServiceError,
    Disconnected,
    PermissionDenied,
}

/// Something which may move the link from one status to another.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Trigger {
    StartDiscovery,
    StopDiscovery,
    /// An advertisement matched the device filter.
    Matched,
    ScanError,
    Connect,
    LinkEstablished,
    LinkLost,
    ServicesFound,
    ServicesMissing,
    /// A privileged operation was refused, either up front or by revocation.
    PermissionDenied,
    Disconnect,
    /// Manual retry after a failure.
    Reset,
}

impl LinkStatus {
    /// Whether the link is finished, and waiting for a fresh discovery or connection request.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ScanFailed | Self::ServiceError | Self::Disconnected | Self::PermissionDenied
        )
    }

    /// Whether a connection attempt is in progress or established.
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Ready
        )
    }

    /// The status to move to on the given trigger, or `None` if it doesn't apply in this status.
    pub(crate) fn next(self, trigger: Trigger) -> Option<LinkStatus> {
        let next = match (self, trigger) {
            (_, Trigger::PermissionDenied) => Self::PermissionDenied,
            (Self::Idle, Trigger::StartDiscovery) => Self::Scanning,
            (status, Trigger::StartDiscovery) if status.is_terminal() => Self::Scanning,
            (Self::Scanning, Trigger::StopDiscovery) => Self::Idle,
            (Self::Scanning, Trigger::Matched) => Self::DeviceFound,
            (Self::Scanning, Trigger::ScanError) => Self::ScanFailed,
            (Self::Idle | Self::Scanning | Self::DeviceFound, Trigger::Connect) => Self::Connecting,
            (status, Trigger::Connect) if status.is_terminal() => Self::Connecting,
            (Self::Connecting, Trigger::LinkEstablished) => Self::DiscoveringServices,
            (status, Trigger::LinkLost) if status.is_linked() => Self::Disconnected,
            (Self::DiscoveringServices, Trigger::ServicesFound) => Self::Ready,
            (Self::DiscoveringServices, Trigger::ServicesMissing) => Self::ServiceError,
            (Self::Idle, Trigger::Disconnect) => return None,
            (_, Trigger::Disconnect) => Self::Disconnected,
            (status, Trigger::Reset) if status.is_terminal() => Self::Idle,
            _ => return None,
        };
        Some(next)
    }
}

impl Display for LinkStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Scanning => "SCANNING",
            Self::DeviceFound => "FOUND DEVICE",
            Self::Connecting => "CONNECTING",
            Self::DiscoveringServices => "DISCOVERING",
            Self::Ready => "CONNECTED",
            Self::ScanFailed => "SCAN FAILED",
            Self::ServiceError => "SERVICE ERROR",
            Self::Disconnected => "DISCONNECTED",
            Self::PermissionDenied => "NO PERMISSION",
        })
    }
}

/// The current status of the link, along with the peripheral it concerns once one is known.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkState {
    pub status: LinkStatus,
    pub peripheral: Option<PeripheralHandle>,
}

impl LinkState {
    /// Whether telemetry can be acquired.
    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Ready
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            status: LinkStatus::Idle,
            peripheral: None,
        }
    }
}

impl Display for LinkState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.peripheral {
            Some(peripheral) => write!(f, "{} {}", self.status, peripheral),
            None => write!(f, "{}", self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [LinkStatus; 10] = [
        LinkStatus::Idle,
        LinkStatus::Scanning,
        LinkStatus::DeviceFound,
        LinkStatus::Connecting,
        LinkStatus::DiscoveringServices,
        LinkStatus::Ready,
        LinkStatus::ScanFailed,
        LinkStatus::ServiceError,
        LinkStatus::Disconnected,
        LinkStatus::PermissionDenied,
    ];

    #[test]
    fn happy_path() {
        let mut status = LinkStatus::Idle;
        let mut seen = vec![];
        for trigger in [
            Trigger::StartDiscovery,
            Trigger::Matched,
            Trigger::Connect,
            Trigger::LinkEstablished,
            Trigger::ServicesFound,
        ] {
            status = status.next(trigger).unwrap();
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![
                LinkStatus::Scanning,
                LinkStatus::DeviceFound,
                LinkStatus::Connecting,
                LinkStatus::DiscoveringServices,
                LinkStatus::Ready,
            ]
        );
    }

    #[test]
    fn ready_only_from_discovering_services() {
        for status in ALL {
            let next = status.next(Trigger::ServicesFound);
            if status == LinkStatus::DiscoveringServices {
                assert_eq!(next, Some(LinkStatus::Ready));
            } else {
                assert_eq!(next, None, "{:?}", status);
            }
        }
    }

    #[test]
    fn start_discovery_ignored_while_active() {
        for status in [
            LinkStatus::Scanning,
            LinkStatus::DeviceFound,
            LinkStatus::Connecting,
            LinkStatus::DiscoveringServices,
            LinkStatus::Ready,
        ] {
            assert_eq!(status.next(Trigger::StartDiscovery), None, "{:?}", status);
        }
    }

    #[test]
    fn start_discovery_from_terminal() {
        for status in ALL.iter().copied().filter(|status| status.is_terminal()) {
            assert_eq!(
                status.next(Trigger::StartDiscovery),
                Some(LinkStatus::Scanning)
            );
        }
    }

    #[test]
    fn scan_failure_and_retry() {
        let failed = LinkStatus::Scanning.next(Trigger::ScanError).unwrap();
        assert_eq!(failed, LinkStatus::ScanFailed);
        assert_eq!(failed.next(Trigger::Reset), Some(LinkStatus::Idle));
    }

    #[test]
    fn link_lost() {
        for status in ALL {
            let expected = status.is_linked().then(|| LinkStatus::Disconnected);
            assert_eq!(status.next(Trigger::LinkLost), expected, "{:?}", status);
        }
    }

    #[test]
    fn services_missing() {
        assert_eq!(
            LinkStatus::DiscoveringServices.next(Trigger::ServicesMissing),
            Some(LinkStatus::ServiceError)
        );
        assert_eq!(LinkStatus::Ready.next(Trigger::ServicesMissing), None);
    }

    #[test]
    fn permission_denied_from_anywhere() {
        for status in ALL {
            assert_eq!(
                status.next(Trigger::PermissionDenied),
                Some(LinkStatus::PermissionDenied)
            );
        }
    }

    #[test]
    fn disconnect() {
        assert_eq!(LinkStatus::Idle.next(Trigger::Disconnect), None);
        for status in ALL.iter().copied().filter(|&s| s != LinkStatus::Idle) {
            assert_eq!(
                status.next(Trigger::Disconnect),
                Some(LinkStatus::Disconnected)
            );
        }
    }

    #[test]
    fn connect_ignored_while_linked() {
        for status in ALL.iter().copied().filter(|status| status.is_linked()) {
            assert_eq!(status.next(Trigger::Connect), None);
        }
    }

    #[test]
    fn reset_only_from_terminal() {
        assert_eq!(LinkStatus::Ready.next(Trigger::Reset), None);
        assert_eq!(
            LinkStatus::Disconnected.next(Trigger::Reset),
            Some(LinkStatus::Idle)
        );
    }

    #[test]
    fn display_state() {
        let state = LinkState {
            status: LinkStatus::Ready,
            peripheral: Some(PeripheralHandle::new(Some("ESP32-Test"), "AA:BB:CC:DD:EE:FF")),
        };
        assert!(state.is_connected());
        assert_eq!(
            state.to_string(),
            "CONNECTED ESP32-Test (AA:BB:CC:DD:EE:FF)"
        );
        assert_eq!(LinkState::default().to_string(), "IDLE");
    }
}
