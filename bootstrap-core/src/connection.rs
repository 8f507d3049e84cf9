// Station bring-up state machine
//
// Idle --StaStarted--> Scanning --ScanDone(>=1)--> Associating --StaConnected--> Connected
// Scanning with no result, any disconnect and any driver failure are fatal.

use crate::config::StaticIp;
use crate::error::{DriverError, RestartReason};

pub type Bssid = [u8; 6];

pub fn format_bssid(bssid: &Bssid) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        bssid[0], bssid[1], bssid[2], bssid[3], bssid[4], bssid[5]
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Associating,
    Connected,
    Failed,
}

/// Station events as delivered by the platform event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    StaStarted,
    ScanDone,
    StaConnected,
    StaDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub psk: String,
    pub bssid: Option<Bssid>,
    pub ssid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub bssid: Bssid,
    pub rssi: i8,
    pub channel: u8,
}

/// The access point chosen from the scan plus the credential applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTarget {
    pub ssid: String,
    pub bssid: Bssid,
    pub rssi: i8,
    pub channel: u8,
    pub psk: String,
}

/// Weakest security the station will accept when associating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthThreshold {
    Open,
    /// Any pre-shared-key mode, WPA included.
    WpaPersonal,
}

impl NetworkTarget {
    /// The scan already pinned the AP, so the threshold only separates
    /// open networks from PSK ones. WPA and WPA/WPA2 mixed APs must pass.
    pub fn auth_threshold(&self) -> AuthThreshold {
        if self.psk.is_empty() {
            AuthThreshold::Open
        } else {
            AuthThreshold::WpaPersonal
        }
    }
}

/// Station-side operations the state machine issues.
///
/// Scan and connect are asynchronous: completion arrives later as a
/// [`WifiEvent`], never as the return value.
pub trait WifiDriver: Send {
    fn start(&mut self) -> Result<(), DriverError>;
    fn set_static_ip(&mut self, ip: &StaticIp) -> Result<(), DriverError>;
    fn start_scan(&mut self, bssid: Option<Bssid>, ssid: Option<&str>) -> Result<(), DriverError>;
    fn scan_results(&mut self) -> Result<Vec<AccessPoint>, DriverError>;
    fn associate(&mut self, target: &NetworkTarget) -> Result<(), DriverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Ready,
}

pub struct ConnectionManager<D> {
    driver: D,
    credentials: Credentials,
    state: ConnectionState,
    target: Option<NetworkTarget>,
}

impl<D: WifiDriver> ConnectionManager<D> {
    pub fn new(driver: D, credentials: Credentials) -> Self {
        Self {
            driver,
            credentials,
            state: ConnectionState::Idle,
            target: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn target(&self) -> Option<&NetworkTarget> {
        self.target.as_ref()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Advance the state machine by one event.
    ///
    /// Returns [`Progress::Ready`] exactly once, on the transition into
    /// `Connected`. An `Err` means the device must restart; the manager is
    /// left in `Failed` and ignores everything after.
    pub fn on_event(&mut self, event: WifiEvent) -> Result<Progress, RestartReason> {
        use ConnectionState::*;

        let result = match (self.state, event) {
            (Failed, _) => {
                log::debug!("Ignoring {:?} after failure", event);
                return Ok(Progress::Pending);
            }
            (state, WifiEvent::StaDisconnected) => {
                log::error!("Station disconnected while {:?}", state);
                Err(RestartReason::LinkLost { state })
            }
            (Idle, WifiEvent::StaStarted) => self.begin_scan(),
            (Scanning, WifiEvent::ScanDone) => self.select_target(),
            (Associating, WifiEvent::StaConnected) => {
                if let Some(target) = &self.target {
                    log::info!(
                        "Connected to '{}' ({}), signal {} dBm",
                        target.ssid,
                        format_bssid(&target.bssid),
                        target.rssi
                    );
                }
                self.state = Connected;
                Ok(Progress::Ready)
            }
            (state, event) => {
                log::warn!("Ignoring {:?} in state {:?}", event, state);
                Ok(Progress::Pending)
            }
        };

        if result.is_err() {
            self.state = Failed;
        }
        result
    }

    fn begin_scan(&mut self) -> Result<Progress, RestartReason> {
        match self.credentials.bssid {
            Some(bssid) => log::info!("Interface started, scanning for {}", format_bssid(&bssid)),
            None => log::info!("Interface started, scanning"),
        }
        self.driver
            .start_scan(self.credentials.bssid, self.credentials.ssid.as_deref())
            .map_err(|source| self.driver_fault(source))?;
        self.state = ConnectionState::Scanning;
        Ok(Progress::Pending)
    }

    fn select_target(&mut self) -> Result<Progress, RestartReason> {
        let records = self
            .driver
            .scan_results()
            .map_err(|source| self.driver_fault(source))?;

        // Scoped scans should only return matches, but the filter is cheap
        let best = records
            .into_iter()
            .filter(|ap| self.credentials.bssid.map_or(true, |b| b == ap.bssid))
            .filter(|ap| self.credentials.ssid.as_deref().map_or(true, |s| s == ap.ssid))
            .max_by_key(|ap| ap.rssi);

        let Some(ap) = best else {
            log::error!("Scan complete, no access point found");
            return Err(RestartReason::NoAccessPoint);
        };

        let target = NetworkTarget {
            ssid: ap.ssid,
            bssid: ap.bssid,
            rssi: ap.rssi,
            channel: ap.channel,
            psk: self.credentials.psk.clone(),
        };
        log::info!(
            "Associating with '{}' ({}) on channel {}",
            target.ssid,
            format_bssid(&target.bssid),
            target.channel
        );
        self.driver
            .associate(&target)
            .map_err(|source| self.driver_fault(source))?;
        self.target = Some(target);
        self.state = ConnectionState::Associating;
        Ok(Progress::Pending)
    }

    fn driver_fault(&self, source: DriverError) -> RestartReason {
        log::error!("Wifi driver failed while {:?}: {}", self.state, source);
        RestartReason::WifiDriver {
            state: self.state,
            source,
        }
    }
}
