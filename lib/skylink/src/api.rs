//! Public API surface: Wi-Fi station and access point management,
//! connections, DNS, ping, SNTP, hostname, manufacturing flash, WPS, the
//! radio's web server and SSL configuration.
//!
//! Blocking calls run the command to completion on the caller thread.
//! `_nb` variants queue the command and invoke a completion callback from
//! the producer thread; their result code is the queueing outcome.

use crate::cmd::Command;
use crate::config::{
    CONN_MAX_DATA_LEN, FLASH_ERASE_ALIGN, FLASH_WRITE_ALIGN, MAX_PASSWORD_LEN, MAX_SSID_LEN,
};
use crate::conn::{ConnEvtFn, ConnRef};
use crate::device::Device;
use crate::engine::Response;
use crate::pbuf::Pbuf;
use crate::support::{DriverError, DriverResult};
use crate::types::{
    AccessPoint, ApConfig, ConnStartOptions, ConnType, DateTime, FlashPartition, Ip, IpInfo,
    JoinedAp, Mac, Port, StationEntry, WifiMode,
};

fn validate_ssid(ssid: &str) -> DriverResult<()> {
    if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
        return Err(DriverError::Argument);
    }
    Ok(())
}

fn validate_password(password: Option<&str>) -> DriverResult<()> {
    if password.map_or(false, |p| p.len() > MAX_PASSWORD_LEN) {
        return Err(DriverError::Argument);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Station
// ---------------------------------------------------------------------------

impl Device {
    /// Join an access point. Blocks until the radio confirms the join (or
    /// the join deadline passes).
    pub fn sta_join(
        &self,
        ssid: &str,
        password: Option<&str>,
        bssid: Option<Mac>,
    ) -> DriverResult<()> {
        validate_ssid(ssid)?;
        validate_password(password)?;

        self.run_unit(Command::JoinAp {
            ssid: ssid.to_string(),
            password: password.map(str::to_string),
            mac: bssid,
        })
    }

    pub fn sta_join_nb(
        &self,
        ssid: &str,
        password: Option<&str>,
        bssid: Option<Mac>,
        done: impl FnOnce(DriverResult<()>) + Send + 'static,
    ) -> DriverResult<()> {
        validate_ssid(ssid)?;
        validate_password(password)?;

        self.core().post(
            Command::JoinAp {
                ssid: ssid.to_string(),
                password: password.map(str::to_string),
                mac: bssid,
            },
            Some(Box::new(done)),
        )
    }

    /// Leave the current access point.
    pub fn sta_quit(&self) -> DriverResult<()> {
        self.run_unit(Command::QuitAp)
    }

    pub fn sta_quit_nb(
        &self,
        done: impl FnOnce(DriverResult<()>) + Send + 'static,
    ) -> DriverResult<()> {
        self.core().post(Command::QuitAp, Some(Box::new(done)))
    }

    /// Scan for access points, optionally restricted to one SSID.
    pub fn sta_scan(&self, ssid: Option<&str>) -> DriverResult<Vec<AccessPoint>> {
        if let Some(ssid) = ssid {
            validate_ssid(ssid)?;
        }
        match self.run(Command::ListAp {
            ssid: ssid.map(str::to_string),
        })? {
            Response::ApList(list) => Ok(list),
            _ => Ok(Vec::new()),
        }
    }

    /// Information about the currently joined access point, if any.
    pub fn sta_joined_ap(&self) -> DriverResult<Option<JoinedAp>> {
        match self.run(Command::GetJoinedAp)? {
            Response::JoinedAp(ap) => Ok(ap),
            _ => Ok(None),
        }
    }

    /// Enable or disable automatic rejoin after boot.
    pub fn sta_autojoin(&self, enable: bool) -> DriverResult<()> {
        self.run_unit(Command::SetAutojoin { enable })
    }

    /// Configure automatic reconnect after a drop: retry every `interval_s`
    /// seconds, at most `repeat` times (`0` = forever).
    pub fn sta_reconnect_cfg(&self, interval_s: u16, repeat: u16) -> DriverResult<()> {
        if interval_s == 0 {
            return Device::argument_error();
        }
        self.run_unit(Command::ReconnectCfg { interval_s, repeat })
    }

    /// Combined interface report: (station, soft AP) addressing.
    pub fn ifconfig(&self) -> DriverResult<(IpInfo, IpInfo)> {
        match self.run(Command::Cifsr)? {
            Response::Ifconfig { sta, ap } => Ok((sta, ap)),
            _ => Ok((IpInfo::default(), IpInfo::default())),
        }
    }

    pub fn sta_ip_info(&self) -> DriverResult<IpInfo> {
        match self.run(Command::StaGetIp)? {
            Response::IpInfo(info) => Ok(info),
            _ => Ok(IpInfo::default()),
        }
    }

    pub fn sta_set_ip(
        &self,
        ip: Ip,
        gateway: Option<Ip>,
        netmask: Option<Ip>,
    ) -> DriverResult<()> {
        if gateway.is_some() != netmask.is_some() {
            return Device::argument_error();
        }
        self.run_unit(Command::StaSetIp {
            ip,
            gateway,
            netmask,
        })
    }

    pub fn sta_mac(&self) -> DriverResult<Option<Mac>> {
        match self.run(Command::StaGetMac)? {
            Response::IpInfo(info) => Ok(info.mac),
            _ => Ok(None),
        }
    }

    pub fn sta_set_mac(&self, mac: Mac) -> DriverResult<()> {
        self.run_unit(Command::StaSetMac { mac })
    }
}

// ---------------------------------------------------------------------------
// Access point
// ---------------------------------------------------------------------------

impl Device {
    pub fn set_wifi_mode(&self, mode: WifiMode) -> DriverResult<()> {
        self.run_unit(Command::SetWifiMode { mode })
    }

    /// Configure the soft AP.
    pub fn ap_configure(&self, config: ApConfig) -> DriverResult<()> {
        validate_ssid(&config.ssid)?;
        if config.password.len() > MAX_PASSWORD_LEN {
            return Device::argument_error();
        }
        if config.channel == 0 || config.channel > 14 {
            return Device::argument_error();
        }
        self.run_unit(Command::SetApConfig { config })
    }

    pub fn ap_config(&self) -> DriverResult<Option<ApConfig>> {
        match self.run(Command::GetApConfig)? {
            Response::ApConfig(config) => Ok(config),
            _ => Ok(None),
        }
    }

    /// Stations currently joined to the soft AP.
    pub fn ap_stations(&self) -> DriverResult<Vec<StationEntry>> {
        match self.run(Command::ListStations)? {
            Response::Stations(list) => Ok(list),
            _ => Ok(Vec::new()),
        }
    }

    pub fn ap_ip_info(&self) -> DriverResult<IpInfo> {
        match self.run(Command::ApGetIp)? {
            Response::IpInfo(info) => Ok(info),
            _ => Ok(IpInfo::default()),
        }
    }

    pub fn ap_set_ip(&self, ip: Ip, gateway: Option<Ip>, netmask: Option<Ip>) -> DriverResult<()> {
        if gateway.is_some() != netmask.is_some() {
            return Device::argument_error();
        }
        self.run_unit(Command::ApSetIp {
            ip,
            gateway,
            netmask,
        })
    }

    pub fn ap_mac(&self) -> DriverResult<Option<Mac>> {
        match self.run(Command::ApGetMac)? {
            Response::IpInfo(info) => Ok(info.mac),
            _ => Ok(None),
        }
    }

    pub fn ap_set_mac(&self, mac: Mac) -> DriverResult<()> {
        self.run_unit(Command::ApSetMac { mac })
    }

    pub fn hostname(&self) -> DriverResult<String> {
        match self.run(Command::GetHostname)? {
            Response::Hostname(hostname) => Ok(hostname),
            _ => Ok(String::new()),
        }
    }

    pub fn set_hostname(&self, hostname: &str) -> DriverResult<()> {
        if hostname.is_empty() || hostname.len() > 64 {
            return Device::argument_error();
        }
        self.run_unit(Command::SetHostname {
            hostname: hostname.to_string(),
        })
    }

    /// DHCP state as (station, soft AP).
    pub fn dhcp(&self) -> DriverResult<(bool, bool)> {
        match self.run(Command::GetDhcp)? {
            Response::Dhcp { sta, ap } => Ok((sta, ap)),
            _ => Ok((false, false)),
        }
    }

    pub fn set_dhcp(&self, enable: bool, sta: bool, ap: bool) -> DriverResult<()> {
        self.run_unit(Command::SetDhcp { enable, sta, ap })
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

impl Device {
    /// Open a connection. The event callback is bound to the slot when the
    /// radio confirms activation and receives every later event on it.
    pub fn conn_start(
        &self,
        kind: ConnType,
        host: &str,
        port: Port,
        opts: ConnStartOptions,
        evt_fn: Option<ConnEvtFn>,
    ) -> DriverResult<ConnRef> {
        if host.is_empty() || port == 0 {
            return Device::argument_error();
        }
        match self.run(Command::StartConn {
            kind,
            host: host.to_string(),
            port,
            opts,
            evt_fn,
            assigned: None,
        })? {
            Response::Conn(Some(conn)) => Ok(conn),
            _ => Err(DriverError::Device),
        }
    }

    /// Close a connection and wait for the radio to confirm.
    pub fn conn_close(&self, conn: ConnRef) -> DriverResult<()> {
        self.run_unit(Command::CloseConn { conn })
    }

    pub fn conn_close_nb(
        &self,
        conn: ConnRef,
        done: impl FnOnce(DriverResult<()>) + Send + 'static,
    ) -> DriverResult<()> {
        self.core()
            .post(Command::CloseConn { conn }, Some(Box::new(done)))
    }

    /// Send data on a TCP/SSL connection, splitting into radio-sized chunks.
    /// Returns the number of bytes accepted.
    pub fn conn_send(&self, conn: ConnRef, data: &[u8]) -> DriverResult<usize> {
        if data.is_empty() {
            return Device::argument_error();
        }

        let mut sent = 0;
        for chunk in data.chunks(CONN_MAX_DATA_LEN) {
            self.run_unit(Command::Send {
                conn,
                data: chunk.to_vec(),
                remote: None,
            })?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Send one UDP datagram to the connection's bound peer. Datagrams are
    /// not split; the radio's per-send cap applies unchanged.
    pub fn conn_send_dgram(&self, conn: ConnRef, data: &[u8]) -> DriverResult<usize> {
        if data.is_empty() || data.len() > CONN_MAX_DATA_LEN {
            return Device::argument_error();
        }
        self.run_unit(Command::Send {
            conn,
            data: data.to_vec(),
            remote: None,
        })?;
        Ok(data.len())
    }

    /// Send one UDP datagram to an explicit remote endpoint.
    pub fn conn_sendto(
        &self,
        conn: ConnRef,
        ip: Ip,
        port: Port,
        data: &[u8],
    ) -> DriverResult<usize> {
        if data.is_empty() || data.len() > CONN_MAX_DATA_LEN || port == 0 {
            return Device::argument_error();
        }
        self.run_unit(Command::Send {
            conn,
            data: data.to_vec(),
            remote: Some((ip, port)),
        })?;
        Ok(data.len())
    }

    /// Acknowledge consumed receive data (manual receive mode).
    pub fn conn_recved(&self, conn: ConnRef, pbuf: &Pbuf) {
        self.core().conn_recved(conn, pbuf);
    }

    pub fn conn_is_active(&self, conn: ConnRef) -> bool {
        self.core().conn_is_active(conn)
    }

    /// Bytes received and sent on the connection so far.
    pub fn conn_totals(&self, conn: ConnRef) -> Option<(u64, u64)> {
        let state = self.core().lock();
        state
            .conns
            .get(conn)
            .map(|slot| (slot.total_recved, slot.total_sent))
    }

    /// Query the radio's connection status and reconcile the local table
    /// against it.
    pub fn conn_refresh_status(&self) -> DriverResult<()> {
        self.run_unit(Command::Status)
    }

    /// Pending byte counts per slot (manual receive mode).
    pub fn conn_recv_lens(&self) -> DriverResult<Vec<Option<usize>>> {
        match self.run(Command::RecvLen)? {
            Response::RecvLens(lens) => Ok(lens),
            _ => Ok(Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

impl Device {
    /// Enable or disable the radio-side TCP server. While enabled, inbound
    /// connections are bound to `server_evt`. `timeout_s` closes idle
    /// clients radio-side; zero disables that.
    pub fn set_server(
        &self,
        enable: bool,
        port: Port,
        max_connections: u16,
        timeout_s: u16,
        server_evt: Option<ConnEvtFn>,
    ) -> DriverResult<()> {
        if enable && port == 0 {
            return Device::argument_error();
        }

        if enable {
            {
                let mut state = self.core().lock();
                state.server_evt = server_evt;
            }
            let max = max_connections.min(crate::config::MAX_CONNS as u16).max(1);
            self.run_unit(Command::ServerMaxConn { max })?;
            self.run_unit(Command::Server { enable: true, port })?;
            self.run_unit(Command::ServerTimeout { seconds: timeout_s })
        } else {
            let result = self.run_unit(Command::Server {
                enable: false,
                port,
            });
            let mut state = self.core().lock();
            state.server_evt = None;
            result
        }
    }
}

// ---------------------------------------------------------------------------
// DNS, ping, SNTP
// ---------------------------------------------------------------------------

impl Device {
    /// Resolve a hostname through the radio's DNS client.
    pub fn dns_lookup(&self, host: &str) -> DriverResult<Ip> {
        if host.is_empty() {
            return Device::argument_error();
        }
        match self.run(Command::DnsQuery {
            host: host.to_string(),
        })? {
            Response::DnsIp(Some(ip)) => Ok(ip),
            _ => Err(DriverError::Device),
        }
    }

    /// Ping a host; returns the round trip in milliseconds.
    pub fn ping(&self, host: &str) -> DriverResult<u32> {
        if host.is_empty() {
            return Device::argument_error();
        }
        match self.run(Command::Ping {
            host: host.to_string(),
        })? {
            Response::PingTime(Some(time)) => Ok(time),
            _ => Err(DriverError::Device),
        }
    }

    pub fn ping_nb(
        &self,
        host: &str,
        done: impl FnOnce(DriverResult<()>) + Send + 'static,
    ) -> DriverResult<()> {
        if host.is_empty() {
            return Device::argument_error();
        }
        self.core().post(
            Command::Ping {
                host: host.to_string(),
            },
            Some(Box::new(done)),
        )
    }

    /// Configure SNTP: enable flag, timezone offset and up to three servers.
    pub fn sntp_configure(
        &self,
        enable: bool,
        timezone: i16,
        servers: &[&str],
    ) -> DriverResult<()> {
        if !(-11..=13).contains(&timezone) || servers.len() > 3 {
            return Device::argument_error();
        }
        self.run_unit(Command::SntpCfg {
            enable,
            timezone,
            servers: servers.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn sntp_config(&self) -> DriverResult<(bool, i16)> {
        match self.run(Command::SntpGetCfg)? {
            Response::SntpCfg { enabled, timezone } => Ok((enabled, timezone)),
            _ => Err(DriverError::Device),
        }
    }

    /// Current wall-clock time from SNTP.
    pub fn sntp_time(&self) -> DriverResult<DateTime> {
        match self.run(Command::SntpTime)? {
            Response::SntpTime(Some(datetime)) => Ok(datetime),
            _ => Err(DriverError::Device),
        }
    }

    pub fn sntp_interval(&self) -> DriverResult<u32> {
        match self.run(Command::SntpGetInterval)? {
            Response::SntpInterval(interval) => Ok(interval),
            _ => Err(DriverError::Device),
        }
    }

    pub fn sntp_set_interval(&self, seconds: u32) -> DriverResult<()> {
        self.run_unit(Command::SntpSetInterval { seconds })
    }
}

// ---------------------------------------------------------------------------
// Flash, WPS, web server, SSL, UART
// ---------------------------------------------------------------------------

impl Device {
    /// Erase a region of a manufacturing NVS partition. Offset and length
    /// must be 4-KiB aligned; zero for both erases the whole partition.
    pub fn flash_erase(
        &self,
        partition: FlashPartition,
        offset: u32,
        length: u32,
    ) -> DriverResult<()> {
        if offset % FLASH_ERASE_ALIGN != 0 || length % FLASH_ERASE_ALIGN != 0 {
            return Device::argument_error();
        }
        self.run_unit(Command::FlashErase {
            partition,
            offset,
            length,
        })
    }

    pub fn flash_erase_nb(
        &self,
        partition: FlashPartition,
        offset: u32,
        length: u32,
        done: impl FnOnce(DriverResult<()>) + Send + 'static,
    ) -> DriverResult<()> {
        if offset % FLASH_ERASE_ALIGN != 0 || length % FLASH_ERASE_ALIGN != 0 {
            return Device::argument_error();
        }
        self.core().post(
            Command::FlashErase {
                partition,
                offset,
                length,
            },
            Some(Box::new(done)),
        )
    }

    /// Write a blob into a manufacturing NVS partition. Certificate
    /// partitions require 4-byte aligned offsets and lengths.
    pub fn flash_write(
        &self,
        partition: FlashPartition,
        offset: u32,
        data: &[u8],
    ) -> DriverResult<()> {
        if data.is_empty() {
            return Device::argument_error();
        }
        if partition.requires_aligned_write()
            && (offset % FLASH_WRITE_ALIGN != 0 || data.len() as u32 % FLASH_WRITE_ALIGN != 0)
        {
            return Device::argument_error();
        }
        self.run_unit(Command::FlashWrite {
            partition,
            offset,
            data: data.to_vec(),
        })
    }

    /// Enable or disable WPS pairing.
    pub fn wps_enable(&self, enable: bool) -> DriverResult<()> {
        self.run_unit(Command::Wps { enable })
    }

    /// Enable the radio's built-in configuration web server.
    pub fn webserver_enable(&self, enable: bool, port: Port, timeout_s: u16) -> DriverResult<()> {
        if enable && port == 0 {
            return Device::argument_error();
        }
        self.run_unit(Command::WebServer {
            enable,
            port,
            timeout_s,
        })
    }

    /// Per-connection SSL verification configuration.
    pub fn ssl_configure(
        &self,
        conn: Option<u8>,
        auth_mode: u8,
        pki_number: u8,
        ca_number: u8,
    ) -> DriverResult<()> {
        if auth_mode > 3 {
            return Device::argument_error();
        }
        if let Some(conn) = conn {
            if conn as usize >= crate::config::MAX_CONNS {
                return Device::argument_error();
            }
        }
        self.run_unit(Command::SslConf {
            conn,
            auth_mode,
            pki_number,
            ca_number,
        })
    }

    /// SSL handshake buffer size on the radio, 2048..=4096 bytes.
    pub fn ssl_buffer_size(&self, size: u32) -> DriverResult<()> {
        if !(2048..=4096).contains(&size) {
            return Device::argument_error();
        }
        self.run_unit(Command::SslSize { size })
    }

    /// Raise (or change) the serial link rate. The transport's
    /// `set_baudrate` hook runs after the radio acknowledges.
    pub fn uart_reconfigure(&self, baud: u32) -> DriverResult<()> {
        if baud < 9600 {
            return Device::argument_error();
        }
        self.run_unit(Command::UartCur { baud })
    }
}
