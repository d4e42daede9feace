//! The command set: one variant per radio operation, with AT text emission
//! and per-kind deadlines.

use std::fmt::Write as _;
use std::time::Duration;

use crate::config::Timeouts;
use crate::conn::{ConnEvtFn, ConnRef};
use crate::types::{
    ApConfig, ConnStartOptions, ConnType, FlashPartition, Ip, Mac, Port, WifiMode,
};

/// Escape `"`, `,` and `\` the way the radio expects inside quoted fields.
pub(crate) fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == ',' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

pub(crate) enum Command {
    Reset,
    Restore,
    CheckAt,
    EchoOff,
    Gmr,
    UartCur {
        baud: u32,
    },
    SetWifiMode {
        mode: WifiMode,
    },
    JoinAp {
        ssid: String,
        password: Option<String>,
        mac: Option<Mac>,
    },
    QuitAp,
    ListAp {
        ssid: Option<String>,
    },
    GetJoinedAp,
    SetAutojoin {
        enable: bool,
    },
    ReconnectCfg {
        interval_s: u16,
        repeat: u16,
    },
    Cifsr,
    StaGetIp,
    StaSetIp {
        ip: Ip,
        gateway: Option<Ip>,
        netmask: Option<Ip>,
    },
    StaGetMac,
    StaSetMac {
        mac: Mac,
    },
    ApGetIp,
    ApSetIp {
        ip: Ip,
        gateway: Option<Ip>,
        netmask: Option<Ip>,
    },
    ApGetMac,
    ApSetMac {
        mac: Mac,
    },
    SetApConfig {
        config: ApConfig,
    },
    GetApConfig,
    ListStations,
    SetHostname {
        hostname: String,
    },
    GetHostname,
    SetDhcp {
        enable: bool,
        sta: bool,
        ap: bool,
    },
    GetDhcp,
    Mux {
        enable: bool,
    },
    Dinfo {
        enable: bool,
    },
    RecvMode {
        manual: bool,
    },
    RecvData {
        conn: ConnRef,
        len: usize,
    },
    RecvLen,
    Status,
    StartConn {
        kind: ConnType,
        host: String,
        port: Port,
        opts: ConnStartOptions,
        evt_fn: Option<ConnEvtFn>,
        /// Slot picked at emission time.
        assigned: Option<u8>,
    },
    CloseConn {
        conn: ConnRef,
    },
    Send {
        conn: ConnRef,
        data: Vec<u8>,
        remote: Option<(Ip, Port)>,
    },
    ServerMaxConn {
        max: u16,
    },
    Server {
        enable: bool,
        port: Port,
    },
    ServerTimeout {
        seconds: u16,
    },
    DnsQuery {
        host: String,
    },
    Ping {
        host: String,
    },
    SntpCfg {
        enable: bool,
        timezone: i16,
        servers: Vec<String>,
    },
    SntpGetCfg,
    SntpTime,
    SntpSetInterval {
        seconds: u32,
    },
    SntpGetInterval,
    Wps {
        enable: bool,
    },
    WebServer {
        enable: bool,
        port: Port,
        timeout_s: u16,
    },
    SslConf {
        conn: Option<u8>,
        auth_mode: u8,
        pki_number: u8,
        ca_number: u8,
    },
    SslSize {
        size: u32,
    },
    FlashErase {
        partition: FlashPartition,
        offset: u32,
        length: u32,
    },
    FlashWrite {
        partition: FlashPartition,
        offset: u32,
        data: Vec<u8>,
    },
}

impl Command {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset => "RST",
            Command::Restore => "RESTORE",
            Command::CheckAt => "AT",
            Command::EchoOff => "ATE0",
            Command::Gmr => "GMR",
            Command::UartCur { .. } => "UART_CUR",
            Command::SetWifiMode { .. } => "CWMODE",
            Command::JoinAp { .. } => "CWJAP",
            Command::QuitAp => "CWQAP",
            Command::ListAp { .. } => "CWLAP",
            Command::GetJoinedAp => "CWJAP?",
            Command::SetAutojoin { .. } => "CWAUTOCONN",
            Command::ReconnectCfg { .. } => "CWRECONNCFG",
            Command::Cifsr => "CIFSR",
            Command::StaGetIp => "CIPSTA?",
            Command::StaSetIp { .. } => "CIPSTA",
            Command::StaGetMac => "CIPSTAMAC?",
            Command::StaSetMac { .. } => "CIPSTAMAC",
            Command::ApGetIp => "CIPAP?",
            Command::ApSetIp { .. } => "CIPAP",
            Command::ApGetMac => "CIPAPMAC?",
            Command::ApSetMac { .. } => "CIPAPMAC",
            Command::SetApConfig { .. } => "CWSAP",
            Command::GetApConfig => "CWSAP?",
            Command::ListStations => "CWLIF",
            Command::SetHostname { .. } => "CWHOSTNAME",
            Command::GetHostname => "CWHOSTNAME?",
            Command::SetDhcp { .. } => "CWDHCP",
            Command::GetDhcp => "CWDHCP?",
            Command::Mux { .. } => "CIPMUX",
            Command::Dinfo { .. } => "CIPDINFO",
            Command::RecvMode { .. } => "CIPRECVMODE",
            Command::RecvData { .. } => "CIPRECVDATA",
            Command::RecvLen => "CIPRECVLEN?",
            Command::Status => "CIPSTATUS",
            Command::StartConn { .. } => "CIPSTART",
            Command::CloseConn { .. } => "CIPCLOSE",
            Command::Send { .. } => "CIPSEND",
            Command::ServerMaxConn { .. } => "CIPSERVERMAXCONN",
            Command::Server { .. } => "CIPSERVER",
            Command::ServerTimeout { .. } => "CIPSTO",
            Command::DnsQuery { .. } => "CIPDOMAIN",
            Command::Ping { .. } => "PING",
            Command::SntpCfg { .. } => "CIPSNTPCFG",
            Command::SntpGetCfg => "CIPSNTPCFG?",
            Command::SntpTime => "CIPSNTPTIME?",
            Command::SntpSetInterval { .. } => "CIPSNTPINTV",
            Command::SntpGetInterval => "CIPSNTPINTV?",
            Command::Wps { .. } => "WPS",
            Command::WebServer { .. } => "WEBSERVER",
            Command::SslConf { .. } => "CIPSSLCCONF",
            Command::SslSize { .. } => "CIPSSLSIZE",
            Command::FlashErase { .. } => "SYSFLASH-ERASE",
            Command::FlashWrite { .. } => "SYSFLASH-WRITE",
        }
    }

    /// Deadline for the whole command, prompt and payload stages included.
    pub fn timeout(&self, t: &Timeouts) -> Duration {
        let ms = match self {
            Command::Reset => t.reset_ms,
            Command::Restore => t.restore_ms,
            Command::JoinAp { .. } | Command::QuitAp => t.join_ms,
            Command::ListAp { .. } => t.scan_ms,
            Command::StartConn { .. } => t.connect_ms,
            Command::Send { .. } => t.send_ms,
            Command::FlashErase { .. } | Command::FlashWrite { .. } => t.flash_ms,
            Command::Ping { .. } => t.ping_ms,
            Command::DnsQuery { .. } => t.dns_ms,
            _ => t.generic_ms,
        };
        Duration::from_millis(ms)
    }

    /// True for the two-stage commands that wait for the `>` prompt and then
    /// stream a payload.
    pub fn wants_prompt(&self) -> bool {
        matches!(self, Command::Send { .. } | Command::FlashWrite { .. })
    }

    /// Payload streamed after the `>` prompt.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Command::Send { data, .. } => Some(data),
            Command::FlashWrite { data, .. } => Some(data),
            _ => None,
        }
    }

    /// True when the command completes on the radio's `ready` banner instead
    /// of a normal terminator.
    pub fn completes_on_ready(&self) -> bool {
        matches!(self, Command::Reset | Command::Restore)
    }

    /// Render the first-stage AT text.
    pub fn at_text(&self) -> String {
        let mut out = String::with_capacity(48);
        match self {
            Command::Reset => out.push_str("AT+RST"),
            Command::Restore => out.push_str("AT+RESTORE"),
            Command::CheckAt => out.push_str("AT"),
            Command::EchoOff => out.push_str("ATE0"),
            Command::Gmr => out.push_str("AT+GMR"),
            Command::UartCur { baud } => {
                let _ = write!(out, "AT+UART_CUR={},8,1,0,0", baud);
            }
            Command::SetWifiMode { mode } => {
                let _ = write!(out, "AT+CWMODE={}", *mode as u8);
            }
            Command::JoinAp { ssid, password, mac } => {
                out.push_str("AT+CWJAP=");
                push_quoted(&mut out, ssid);
                out.push(',');
                push_quoted(&mut out, password.as_deref().unwrap_or(""));
                if let Some(mac) = mac {
                    out.push(',');
                    let _ = write!(out, "\"{}\"", mac);
                }
            }
            Command::QuitAp => out.push_str("AT+CWQAP"),
            Command::ListAp { ssid } => {
                out.push_str("AT+CWLAP");
                if let Some(ssid) = ssid {
                    out.push('=');
                    push_quoted(&mut out, ssid);
                }
            }
            Command::GetJoinedAp => out.push_str("AT+CWJAP?"),
            Command::SetAutojoin { enable } => {
                let _ = write!(out, "AT+CWAUTOCONN={}", *enable as u8);
            }
            Command::ReconnectCfg { interval_s, repeat } => {
                let _ = write!(out, "AT+CWRECONNCFG={},{}", interval_s, repeat);
            }
            Command::Cifsr => out.push_str("AT+CIFSR"),
            Command::StaGetIp => out.push_str("AT+CIPSTA?"),
            Command::StaSetIp { ip, gateway, netmask } => {
                let _ = write!(out, "AT+CIPSTA=\"{}\"", ip);
                if let (Some(gw), Some(mask)) = (gateway, netmask) {
                    let _ = write!(out, ",\"{}\",\"{}\"", gw, mask);
                }
            }
            Command::StaGetMac => out.push_str("AT+CIPSTAMAC?"),
            Command::StaSetMac { mac } => {
                let _ = write!(out, "AT+CIPSTAMAC=\"{}\"", mac);
            }
            Command::ApGetIp => out.push_str("AT+CIPAP?"),
            Command::ApSetIp { ip, gateway, netmask } => {
                let _ = write!(out, "AT+CIPAP=\"{}\"", ip);
                if let (Some(gw), Some(mask)) = (gateway, netmask) {
                    let _ = write!(out, ",\"{}\",\"{}\"", gw, mask);
                }
            }
            Command::ApGetMac => out.push_str("AT+CIPAPMAC?"),
            Command::ApSetMac { mac } => {
                let _ = write!(out, "AT+CIPAPMAC=\"{}\"", mac);
            }
            Command::SetApConfig { config } => {
                out.push_str("AT+CWSAP=");
                push_quoted(&mut out, &config.ssid);
                out.push(',');
                push_quoted(&mut out, &config.password);
                let _ = write!(
                    out,
                    ",{},{},{},{}",
                    config.channel,
                    config.ecn.code(),
                    config.max_stations,
                    config.hidden as u8
                );
            }
            Command::GetApConfig => out.push_str("AT+CWSAP?"),
            Command::ListStations => out.push_str("AT+CWLIF"),
            Command::SetHostname { hostname } => {
                out.push_str("AT+CWHOSTNAME=");
                push_quoted(&mut out, hostname);
            }
            Command::GetHostname => out.push_str("AT+CWHOSTNAME?"),
            Command::SetDhcp { enable, sta, ap } => {
                let mask = (*sta as u8) << 1 | (*ap as u8);
                let _ = write!(out, "AT+CWDHCP={},{}", *enable as u8, mask);
            }
            Command::GetDhcp => out.push_str("AT+CWDHCP?"),
            Command::Mux { enable } => {
                let _ = write!(out, "AT+CIPMUX={}", *enable as u8);
            }
            Command::Dinfo { enable } => {
                let _ = write!(out, "AT+CIPDINFO={}", *enable as u8);
            }
            Command::RecvMode { manual } => {
                let _ = write!(out, "AT+CIPRECVMODE={}", *manual as u8);
            }
            Command::RecvData { conn, len } => {
                let _ = write!(out, "AT+CIPRECVDATA={},{}", conn.index(), len);
            }
            Command::RecvLen => out.push_str("AT+CIPRECVLEN?"),
            Command::Status => out.push_str("AT+CIPSTATUS"),
            Command::StartConn {
                kind,
                host,
                port,
                opts,
                assigned,
                ..
            } => {
                let num = assigned.expect("StartConn emitted without a slot");
                let _ = write!(out, "AT+CIPSTART={},\"{}\",", num, kind.token());
                push_quoted(&mut out, host);
                let _ = write!(out, ",{}", port);
                if kind.is_udp() {
                    if opts.local_port > 0 {
                        let _ = write!(out, ",{},{}", opts.local_port, opts.udp_mode);
                    }
                } else if opts.keep_alive > 0 {
                    let _ = write!(out, ",{}", opts.keep_alive);
                    if let Some(local_ip) = &opts.local_ip {
                        out.push(',');
                        push_quoted(&mut out, local_ip);
                    }
                }
            }
            Command::CloseConn { conn } => {
                let _ = write!(out, "AT+CIPCLOSE={}", conn.index());
            }
            Command::Send { conn, data, remote } => {
                let _ = write!(out, "AT+CIPSEND={},{}", conn.index(), data.len());
                if let Some((ip, port)) = remote {
                    let _ = write!(out, ",\"{}\",{}", ip, port);
                }
            }
            Command::ServerMaxConn { max } => {
                let _ = write!(out, "AT+CIPSERVERMAXCONN={}", max);
            }
            Command::Server { enable, port } => {
                let _ = write!(out, "AT+CIPSERVER={},{}", *enable as u8, port);
            }
            Command::ServerTimeout { seconds } => {
                let _ = write!(out, "AT+CIPSTO={}", seconds);
            }
            Command::DnsQuery { host } => {
                out.push_str("AT+CIPDOMAIN=");
                push_quoted(&mut out, host);
            }
            Command::Ping { host } => {
                out.push_str("AT+PING=");
                push_quoted(&mut out, host);
            }
            Command::SntpCfg {
                enable,
                timezone,
                servers,
            } => {
                let _ = write!(out, "AT+CIPSNTPCFG={},{}", *enable as u8, timezone);
                for server in servers.iter().take(3) {
                    out.push(',');
                    push_quoted(&mut out, server);
                }
            }
            Command::SntpGetCfg => out.push_str("AT+CIPSNTPCFG?"),
            Command::SntpTime => out.push_str("AT+CIPSNTPTIME?"),
            Command::SntpSetInterval { seconds } => {
                let _ = write!(out, "AT+CIPSNTPINTV={}", seconds);
            }
            Command::SntpGetInterval => out.push_str("AT+CIPSNTPINTV?"),
            Command::Wps { enable } => {
                let _ = write!(out, "AT+WPS={}", *enable as u8);
            }
            Command::WebServer {
                enable,
                port,
                timeout_s,
            } => {
                let _ = write!(out, "AT+WEBSERVER={},{},{}", *enable as u8, port, timeout_s);
            }
            Command::SslConf {
                conn,
                auth_mode,
                pki_number,
                ca_number,
            } => {
                out.push_str("AT+CIPSSLCCONF=");
                if let Some(conn) = conn {
                    let _ = write!(out, "{},", conn);
                }
                let _ = write!(out, "{},{},{}", auth_mode, pki_number, ca_number);
            }
            Command::SslSize { size } => {
                let _ = write!(out, "AT+CIPSSLSIZE={}", size);
            }
            Command::FlashErase {
                partition,
                offset,
                length,
            } => {
                let _ = write!(
                    out,
                    "AT+SYSFLASH=0,\"{}\",{},{}",
                    partition.token(),
                    offset,
                    length
                );
            }
            Command::FlashWrite {
                partition,
                offset,
                data,
            } => {
                let _ = write!(
                    out,
                    "AT+SYSFLASH=1,\"{}\",{},{}",
                    partition.token(),
                    offset,
                    data.len()
                );
            }
        }
        out.push_str("\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ecn;

    #[test]
    fn test_quoted_escaping() {
        let mut out = String::new();
        push_quoted(&mut out, "a,b\"c\\d");
        assert_eq!(out, "\"a\\,b\\\"c\\\\d\"");
    }

    #[test]
    fn test_join_text() {
        let cmd = Command::JoinAp {
            ssid: "foo".into(),
            password: Some("bar".into()),
            mac: None,
        };
        assert_eq!(cmd.at_text(), "AT+CWJAP=\"foo\",\"bar\"\r\n");
    }

    #[test]
    fn test_join_with_bssid() {
        let cmd = Command::JoinAp {
            ssid: "net".into(),
            password: None,
            mac: Some(Mac([0xa4, 0xcf, 0x12, 0x0f, 0x9d, 0x1b])),
        };
        assert_eq!(
            cmd.at_text(),
            "AT+CWJAP=\"net\",\"\",\"a4:cf:12:0f:9d:1b\"\r\n"
        );
    }

    #[test]
    fn test_start_conn_tcp() {
        let cmd = Command::StartConn {
            kind: ConnType::Tcp,
            host: "example.com".into(),
            port: 80,
            opts: ConnStartOptions::default(),
            evt_fn: None,
            assigned: Some(0),
        };
        assert_eq!(cmd.at_text(), "AT+CIPSTART=0,\"TCP\",\"example.com\",80\r\n");
    }

    #[test]
    fn test_start_conn_udp_with_local_port() {
        let cmd = Command::StartConn {
            kind: ConnType::Udp,
            host: "10.0.0.2".into(),
            port: 1234,
            opts: ConnStartOptions {
                local_port: 5678,
                udp_mode: 2,
                ..Default::default()
            },
            evt_fn: None,
            assigned: Some(3),
        };
        assert_eq!(
            cmd.at_text(),
            "AT+CIPSTART=3,\"UDP\",\"10.0.0.2\",1234,5678,2\r\n"
        );
    }

    #[test]
    fn test_send_stages() {
        let cmd = Command::Send {
            conn: ConnRef { idx: 2, val_id: 1 },
            data: b"hello".to_vec(),
            remote: None,
        };
        assert_eq!(cmd.at_text(), "AT+CIPSEND=2,5\r\n");
        assert!(cmd.wants_prompt());
        assert_eq!(cmd.payload(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_sendto_includes_remote() {
        let cmd = Command::Send {
            conn: ConnRef { idx: 0, val_id: 1 },
            data: vec![1, 2, 3],
            remote: Some((Ip::V4([10, 0, 0, 1]), 9000)),
        };
        assert_eq!(cmd.at_text(), "AT+CIPSEND=0,3,\"10.0.0.1\",9000\r\n");
    }

    #[test]
    fn test_ap_config_text() {
        let cmd = Command::SetApConfig {
            config: ApConfig {
                ssid: "unit".into(),
                password: "secret".into(),
                channel: 5,
                ecn: Ecn::Wpa2Psk,
                max_stations: 4,
                hidden: false,
            },
        };
        assert_eq!(cmd.at_text(), "AT+CWSAP=\"unit\",\"secret\",5,3,4,0\r\n");
    }

    #[test]
    fn test_sntp_cfg_caps_servers() {
        let cmd = Command::SntpCfg {
            enable: true,
            timezone: 1,
            servers: vec![
                "a.pool.org".into(),
                "b.pool.org".into(),
                "c.pool.org".into(),
                "d.pool.org".into(),
            ],
        };
        assert_eq!(
            cmd.at_text(),
            "AT+CIPSNTPCFG=1,1,\"a.pool.org\",\"b.pool.org\",\"c.pool.org\"\r\n"
        );
    }

    #[test]
    fn test_flash_write_stages() {
        let cmd = Command::FlashWrite {
            partition: FlashPartition::ClientCert,
            offset: 0,
            data: vec![0; 8],
        };
        assert_eq!(cmd.at_text(), "AT+SYSFLASH=1,\"client_cert\",0,8\r\n");
        assert!(cmd.wants_prompt());
    }

    #[test]
    fn test_timeout_classes() {
        let t = Timeouts::default();
        assert_eq!(
            Command::JoinAp {
                ssid: "x".into(),
                password: None,
                mac: None
            }
            .timeout(&t),
            Duration::from_millis(30_000)
        );
        assert_eq!(Command::Gmr.timeout(&t), Duration::from_millis(1_000));
        assert!(Command::Reset.completes_on_ready());
    }
}
