//! Core value types shared across the driver.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

use crate::support::DriverResult;

pub type Port = u16;

/// IP address, v4 or v6. The radio reports both on the same line formats.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Ip {
    V4([u8; 4]),
    V6([u16; 8]),
}

impl Ip {
    #[inline]
    pub fn is_v6(&self) -> bool {
        matches!(self, Ip::V6(_))
    }

    /// The unspecified v4 address, used as a placeholder before DHCP.
    #[inline]
    pub fn zero() -> Ip {
        Ip::V4([0; 4])
    }
}

impl fmt::Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ip::V4(octets) => write!(f, "{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]),
            Ip::V6(groups) => {
                for (i, group) in groups.iter().enumerate() {
                    if i > 0 {
                        write!(f, ":")?;
                    }
                    write!(f, "{:x}", group)?;
                }
                Ok(())
            }
        }
    }
}

/// Hardware (MAC) address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mac(pub [u8; 6]);

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Connection transport as understood by the radio.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnType {
    Tcp,
    Udp,
    Ssl,
    TcpV6,
    UdpV6,
    SslV6,
}

impl ConnType {
    /// The quoted type token used on `CIPSTART` and reported on `+LINK_CONN`.
    pub fn token(&self) -> &'static str {
        match self {
            ConnType::Tcp => "TCP",
            ConnType::Udp => "UDP",
            ConnType::Ssl => "SSL",
            ConnType::TcpV6 => "TCPv6",
            ConnType::UdpV6 => "UDPv6",
            ConnType::SslV6 => "SSLv6",
        }
    }

    pub fn from_token(token: &str) -> Option<ConnType> {
        match token {
            "TCP" => Some(ConnType::Tcp),
            "UDP" => Some(ConnType::Udp),
            "SSL" => Some(ConnType::Ssl),
            "TCPv6" => Some(ConnType::TcpV6),
            "UDPv6" => Some(ConnType::UdpV6),
            "SSLv6" => Some(ConnType::SslV6),
            _ => None,
        }
    }

    #[inline]
    pub fn is_tcp(&self) -> bool {
        matches!(self, ConnType::Tcp | ConnType::TcpV6)
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        matches!(self, ConnType::Udp | ConnType::UdpV6)
    }

    #[inline]
    pub fn is_ssl(&self) -> bool {
        matches!(self, ConnType::Ssl | ConnType::SslV6)
    }
}

/// Access-point encryption schemes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Ecn {
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Wpa3Psk,
    Wpa2Wpa3Psk,
}

impl Ecn {
    pub fn from_code(code: i32) -> Ecn {
        match code {
            0 => Ecn::Open,
            1 => Ecn::Wep,
            2 => Ecn::WpaPsk,
            3 => Ecn::Wpa2Psk,
            4 => Ecn::WpaWpa2Psk,
            5 => Ecn::Wpa2Enterprise,
            6 => Ecn::Wpa3Psk,
            _ => Ecn::Wpa2Wpa3Psk,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Ecn::Open => 0,
            Ecn::Wep => 1,
            Ecn::WpaPsk => 2,
            Ecn::Wpa2Psk => 3,
            Ecn::WpaWpa2Psk => 4,
            Ecn::Wpa2Enterprise => 5,
            Ecn::Wpa3Psk => 6,
            Ecn::Wpa2Wpa3Psk => 7,
        }
    }
}

/// Radio operating mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WifiMode {
    Station = 1,
    AccessPoint = 2,
    StationAccessPoint = 3,
}

/// One scan result from an access-point listing.
#[derive(Debug, Clone)]
pub struct AccessPoint {
    pub ecn: Ecn,
    pub ssid: String,
    pub rssi: i16,
    pub mac: Mac,
    pub channel: u8,
    pub bgn: u8,
    pub wps: bool,
}

/// Information about the access point the station is joined to.
#[derive(Debug, Clone)]
pub struct JoinedAp {
    pub ssid: String,
    pub mac: Mac,
    pub channel: u8,
    pub rssi: i16,
}

/// Soft-AP configuration.
#[derive(Debug, Clone)]
pub struct ApConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub ecn: Ecn,
    pub max_stations: u8,
    pub hidden: bool,
}

/// One station joined to the soft AP.
#[derive(Debug, Copy, Clone)]
pub struct StationEntry {
    pub ip: Ip,
    pub mac: Mac,
}

/// Interface addressing of the local station or soft AP.
#[derive(Debug, Copy, Clone, Default)]
pub struct IpInfo {
    pub ip: Option<Ip>,
    pub gateway: Option<Ip>,
    pub netmask: Option<Ip>,
    pub mac: Option<Mac>,
}

/// AT/SDK firmware version triple, ordered for minimum-version gating.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Default,
)]
pub struct SwVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl SwVersion {
    #[inline]
    pub fn new(major: u8, minor: u8, patch: u8) -> SwVersion {
        SwVersion { major, minor, patch }
    }
}

impl fmt::Display for SwVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Wall-clock time reported by the SNTP query.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

/// Named blob partitions in the radio's manufacturing NVS.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlashPartition {
    ServerCert,
    ClientCa,
    ClientCert,
    ClientKey,
    PhyInit,
    MqttConfig,
}

impl FlashPartition {
    pub fn token(&self) -> &'static str {
        match self {
            FlashPartition::ServerCert => "server_cert",
            FlashPartition::ClientCa => "client_ca",
            FlashPartition::ClientCert => "client_cert",
            FlashPartition::ClientKey => "client_key",
            FlashPartition::PhyInit => "phy_init",
            FlashPartition::MqttConfig => "mqtt_config",
        }
    }

    /// Certificate partitions require 4-byte aligned write lengths.
    #[inline]
    pub fn requires_aligned_write(&self) -> bool {
        matches!(
            self,
            FlashPartition::ClientCa | FlashPartition::ClientCert | FlashPartition::ClientKey
        )
    }
}

/// Extended connection start parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnStartOptions {
    /// TCP/SSL keep-alive period, seconds. Zero disables.
    pub keep_alive: u16,
    /// Local IP to bind the connection to.
    pub local_ip: Option<String>,
    /// UDP local port.
    pub local_port: Port,
    /// UDP peer mode (0 = fixed peer, 1/2 = peer may change).
    pub udp_mode: u8,
}

/// Events fanned out to registered application callbacks.
#[derive(Debug, Clone)]
pub enum Event {
    /// The radio finished booting and printed `ready`.
    Ready,
    /// Device reset sequence completed. `forced` when requested by the API.
    Reset { forced: bool },
    /// AT firmware version detected during initialization.
    AtVersion { version: SwVersion, supported: bool },
    WifiConnected,
    WifiGotIp { ipv6: bool },
    WifiDisconnected,
    /// A station joined the soft AP.
    ApStationConnected { mac: Mac },
    /// A station left the soft AP.
    ApStationDisconnected { mac: Mac },
    /// The soft AP handed out an address.
    ApStationIpAssigned { mac: Mac, ip: Ip },
    /// Web-server status change pushed by the radio.
    WebServer { code: i32 },
    /// Periodic tick for callback-driven application timers.
    KeepAlive,
    /// Physical presence of the radio changed.
    DevicePresent { present: bool },
}

/// Application callback registered with the event fan-out.
pub type EventFn = std::sync::Arc<dyn Fn(&Event) + Send + Sync>;

/// Completion callback for non-blocking API calls.
pub type DoneFn = Box<dyn FnOnce(DriverResult<()>) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_display() {
        assert_eq!(Ip::V4([192, 168, 1, 7]).to_string(), "192.168.1.7");
        assert_eq!(
            Ip::V6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1]).to_string(),
            "2001:db8:0:0:0:0:0:1"
        );
    }

    #[test]
    fn test_mac_display() {
        assert_eq!(
            Mac([0xaa, 0xbb, 0x0c, 0x1d, 0x2e, 0x3f]).to_string(),
            "aa:bb:0c:1d:2e:3f"
        );
    }

    #[test]
    fn test_conn_type_tokens_roundtrip() {
        for ty in &[
            ConnType::Tcp,
            ConnType::Udp,
            ConnType::Ssl,
            ConnType::TcpV6,
            ConnType::UdpV6,
            ConnType::SslV6,
        ] {
            assert_eq!(ConnType::from_token(ty.token()), Some(*ty));
        }
        assert_eq!(ConnType::from_token("SCTP"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(SwVersion::new(1, 2, 0) < SwVersion::new(1, 10, 0));
        assert!(SwVersion::new(2, 0, 0) > SwVersion::new(1, 255, 255));
    }
}
