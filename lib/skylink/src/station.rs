//! Station manager: keep the radio associated with the best known network.
//!
//! Applications hand it an ordered list of known access points; it scans,
//! picks the most preferred network that is actually in the air and joins
//! it, optionally arming the radio's own reconnect machinery afterwards.

use flint::logging::{debug, info, o, Logger};

use crate::device::Device;
use crate::support::{DriverError, DriverResult};
use crate::types::{AccessPoint, Mac};

/// One known network, in preference order.
#[derive(Debug, Clone)]
pub struct KnownAp {
    pub ssid: String,
    pub password: Option<String>,
    /// Pin to a specific BSSID; `None` accepts any.
    pub bssid: Option<Mac>,
}

impl KnownAp {
    pub fn new(ssid: &str, password: Option<&str>) -> KnownAp {
        KnownAp {
            ssid: ssid.to_string(),
            password: password.map(str::to_string),
            bssid: None,
        }
    }
}

/// Automatic reconnect policy handed to the radio after a successful join.
#[derive(Debug, Copy, Clone)]
pub struct ReconnectPolicy {
    /// Seconds between attempts.
    pub interval_s: u16,
    /// Maximum attempts; `0` retries forever.
    pub repeat: u16,
}

pub struct StationManager {
    device: Device,
    known: Vec<KnownAp>,
    reconnect: Option<ReconnectPolicy>,
    log: Logger,
}

impl StationManager {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(device: &Device, log: L) -> StationManager {
        let log = match log.into() {
            Some(log) => log.new(o!("unit" => "station-manager")),
            None => flint::logging::discard(),
        };
        StationManager {
            device: device.clone(),
            known: Vec::new(),
            reconnect: None,
            log,
        }
    }

    /// Append a known network. Earlier entries win when several are in
    /// range.
    pub fn add_known(&mut self, ap: KnownAp) {
        self.known.push(ap);
    }

    pub fn set_reconnect_policy(&mut self, policy: Option<ReconnectPolicy>) {
        self.reconnect = policy;
    }

    /// Scan and join the most preferred reachable network. Candidates are
    /// tried in preference order; a failed join falls through to the next.
    pub fn connect_preferred(&self) -> DriverResult<String> {
        if self.known.is_empty() {
            return Err(DriverError::Argument);
        }

        let visible = self.device.sta_scan(None)?;
        debug!(self.log, "scan complete"; "visible" => visible.len());

        for known in &self.known {
            let found = visible.iter().find(|ap| self.matches(known, ap));
            let ap = match found {
                Some(ap) => ap,
                None => continue,
            };

            debug!(self.log, "attempting join";
                   "ssid" => %known.ssid, "rssi" => ap.rssi, "channel" => ap.channel);

            match self
                .device
                .sta_join(&known.ssid, known.password.as_deref(), known.bssid)
            {
                Ok(()) => {
                    if let Some(policy) = self.reconnect {
                        self.device
                            .sta_reconnect_cfg(policy.interval_s, policy.repeat)?;
                    }
                    info!(self.log, "joined"; "ssid" => %known.ssid);
                    return Ok(known.ssid.clone());
                }
                Err(err) => {
                    debug!(self.log, "join failed, trying next candidate";
                           "ssid" => %known.ssid, "err" => %err);
                }
            }
        }

        Err(DriverError::WifiNotConnected)
    }

    /// Join the preferred network unless the station already holds an
    /// address.
    pub fn ensure_connected(&self) -> DriverResult<()> {
        if self.device.has_ip() {
            return Ok(());
        }
        self.connect_preferred().map(|_| ())
    }

    fn matches(&self, known: &KnownAp, ap: &AccessPoint) -> bool {
        if ap.ssid != known.ssid {
            return false;
        }
        match known.bssid {
            Some(bssid) => ap.mac == bssid,
            None => true,
        }
    }
}
