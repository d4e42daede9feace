//! Line-oriented AT response parsing.
//!
//! [`Scanner`] walks a single response line with the radio's loose field
//! conventions (optional quotes, comma separators, bare tokens). On top of it
//! sit the line classifier, which splits terminators / synchronous replies /
//! unsolicited notifications, and the typed extractors for the well-known
//! reply shapes.

use crate::types::{
    AccessPoint, ApConfig, ConnType, DateTime, Ecn, Ip, JoinedAp, Mac, Port, StationEntry,
    SwVersion,
};

/// Cursor over one response line.
pub(crate) struct Scanner<'a> {
    rem: &'a str,
}

impl<'a> Scanner<'a> {
    pub fn new(line: &'a str) -> Scanner<'a> {
        Scanner { rem: line }
    }

    #[inline]
    pub fn rest(&self) -> &'a str {
        self.rem
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.rem.is_empty()
    }

    /// Advance past `c` if it is the next character.
    #[inline]
    pub fn skip_if(&mut self, c: char) -> bool {
        if self.rem.starts_with(c) {
            self.rem = &self.rem[c.len_utf8()..];
            true
        } else {
            false
        }
    }

    /// Advance past `prefix` if present.
    #[inline]
    pub fn skip_prefix(&mut self, prefix: &str) -> bool {
        if self.rem.starts_with(prefix) {
            self.rem = &self.rem[prefix.len()..];
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<char> {
        self.rem.chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.rem = &self.rem[c.len_utf8()..];
        Some(c)
    }

    /// Parse a signed decimal number, skipping optional leading quote/comma
    /// decoration and one trailing comma.
    pub fn number(&mut self) -> i32 {
        self.skip_if('"');
        self.skip_if(',');
        self.skip_if('"');

        let minus = self.skip_if('-');

        let mut val: i32 = 0;
        while let Some(c) = self.peek() {
            match c.to_digit(10) {
                Some(d) => {
                    val = val.wrapping_mul(10).wrapping_add(d as i32);
                    self.bump();
                }
                None => break,
            }
        }
        self.skip_if(',');

        if minus {
            -val
        } else {
            val
        }
    }

    #[inline]
    pub fn port(&mut self) -> Port {
        self.number() as Port
    }

    /// Parse an unsigned hex number with the same decoration rules as
    /// [`Scanner::number`].
    pub fn hex(&mut self) -> u32 {
        self.skip_if('"');
        self.skip_if(',');
        self.skip_if('"');

        let mut val: u32 = 0;
        while let Some(c) = self.peek() {
            match c.to_digit(16) {
                Some(d) => {
                    val = val.wrapping_mul(16).wrapping_add(d);
                    self.bump();
                }
                None => break,
            }
        }
        self.skip_if(',');
        val
    }

    /// Parse a number with radix auto-detection: `0x`/`0X` hex, `0b` binary,
    /// a remaining leading `0` octal, plain decimal otherwise.
    pub fn radix_number(&mut self) -> u32 {
        self.skip_if('"');
        self.skip_if(',');
        self.skip_if('"');

        let radix = if self.skip_prefix("0x") || self.skip_prefix("0X") {
            16
        } else if self.skip_prefix("0b") || self.skip_prefix("0B") {
            2
        } else if self.rem.starts_with('0') && self.rem.len() > 1 {
            self.bump();
            8
        } else {
            10
        };

        let mut val: u32 = 0;
        while let Some(c) = self.peek() {
            match c.to_digit(radix) {
                Some(d) => {
                    val = val.wrapping_mul(radix).wrapping_add(d);
                    self.bump();
                }
                None => break,
            }
        }
        self.skip_if(',');
        val
    }

    /// Parse a quoted or bare string field. Reads until a closing quote that
    /// ends the field, or end of line. At most `max` characters are kept; the
    /// remainder of an overlong field is consumed and discarded.
    pub fn string(&mut self, max: usize) -> String {
        self.skip_if(',');
        let quoted = self.skip_if('"');

        let mut out = String::new();
        while let Some(c) = self.peek() {
            let field_end = if quoted {
                c == '"'
                    && matches!(self.rem[1..].chars().next(), None | Some(',') | Some('\r') | Some('\n'))
            } else {
                c == ',' || c == '\r' || c == '\n'
            };
            if field_end {
                if quoted {
                    self.bump();
                }
                break;
            }
            self.bump();
            if out.len() < max {
                out.push(c);
            }
        }
        out
    }

    /// Consume a string field without keeping it.
    #[inline]
    pub fn skip_string(&mut self) {
        let _ = self.string(0);
    }

    /// Parse an IP address, v4 or v6, with optional surrounding quotes. The
    /// address family is decided by the presence of `:` in the token.
    pub fn ip(&mut self) -> Option<Ip> {
        self.skip_if(',');
        self.skip_if('"');

        let token_len = self
            .rem
            .find(|c: char| !(c.is_ascii_hexdigit() || c == ':' || c == '.'))
            .unwrap_or_else(|| self.rem.len());
        let token = &self.rem[..token_len];
        self.rem = &self.rem[token_len..];

        self.skip_if('"');
        self.skip_if(',');

        if token.is_empty() {
            return None;
        }
        if token.contains(':') {
            parse_ipv6_groups(token).map(Ip::V6)
        } else {
            parse_ipv4_octets(token).map(Ip::V4)
        }
    }

    /// Parse a `aa:bb:cc:dd:ee:ff` MAC address with optional quotes.
    pub fn mac(&mut self) -> Option<Mac> {
        self.skip_if(',');
        self.skip_if('"');

        let mut out = [0u8; 6];
        for (i, item) in out.iter_mut().enumerate() {
            let mut val: u32 = 0;
            let mut digits = 0;
            while let Some(d) = self.peek().and_then(|c| c.to_digit(16)) {
                val = val * 16 + d;
                digits += 1;
                self.bump();
            }
            if digits == 0 || val > 0xFF {
                return None;
            }
            *item = val as u8;
            if i < 5 && !self.skip_if(':') {
                return None;
            }
        }

        self.skip_if('"');
        self.skip_if(',');
        Some(Mac(out))
    }
}

fn parse_ipv4_octets(token: &str) -> Option<[u8; 4]> {
    let mut out = [0u8; 4];
    let mut parts = token.split('.');
    for item in out.iter_mut() {
        *item = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Expand an IPv6 token into its 8 groups. A single `::` run of zeros is
/// expanded in place; more than one is malformed.
fn parse_ipv6_groups(token: &str) -> Option<[u16; 8]> {
    let mut out = [0u16; 8];

    let parse_side = |side: &str, groups: &mut Vec<u16>| -> Option<()> {
        if side.is_empty() {
            return Some(());
        }
        for part in side.split(':') {
            groups.push(u16::from_str_radix(part, 16).ok()?);
        }
        Some(())
    };

    match token.find("::") {
        Some(pos) => {
            // A second `::` cannot appear.
            if token[pos + 2..].contains("::") {
                return None;
            }
            let mut head = Vec::new();
            let mut tail = Vec::new();
            parse_side(&token[..pos], &mut head)?;
            parse_side(&token[pos + 2..], &mut tail)?;
            if head.len() + tail.len() > 8 {
                return None;
            }
            out[..head.len()].copy_from_slice(&head);
            out[8 - tail.len()..].copy_from_slice(&tail);
        }
        None => {
            let mut groups = Vec::new();
            parse_side(token, &mut groups)?;
            if groups.len() != 8 {
                return None;
            }
            out.copy_from_slice(&groups);
        }
    }
    Some(out)
}

/// New-connection notification carried on `+LINK_CONN`.
#[derive(Debug, Clone)]
pub(crate) struct LinkConn {
    pub failed: bool,
    pub num: u8,
    pub kind: ConnType,
    pub is_server: bool,
    pub remote_ip: Option<Ip>,
    pub remote_port: Port,
    pub local_port: Port,
}

/// Header of an `+IPD` notification, everything between `+IPD,` and the data
/// colon (or line end for the short, notification-only form).
#[derive(Debug, Clone)]
pub(crate) struct IpdHeader {
    pub conn: u8,
    pub len: usize,
    pub remote: Option<(Ip, Port)>,
}

pub(crate) fn parse_ipd_header(fields: &str) -> Option<IpdHeader> {
    let mut sc = Scanner::new(fields);
    let conn = sc.number();
    if !(0..=255).contains(&conn) {
        return None;
    }
    let len = sc.number();
    if len < 0 {
        return None;
    }

    let remote = if !sc.is_done() {
        let ip = sc.ip()?;
        let port = sc.port();
        Some((ip, port))
    } else {
        None
    };

    Some(IpdHeader {
        conn: conn as u8,
        len: len as usize,
        remote,
    })
}

/// One classified response line.
#[derive(Debug)]
pub(crate) enum RadioLine<'a> {
    /// `OK` terminator.
    Ok,
    /// `ERROR` terminator.
    Error,
    /// `FAIL` terminator.
    Fail,
    SendOk,
    SendFail,
    Busy,
    AlreadyConnected,
    Ready,
    WifiConnected,
    WifiGotIp,
    WifiDisconnected,
    ConnActive(u8),
    ConnClosed(u8),
    LinkConn(LinkConn),
    StaConnected(Mac),
    StaDisconnected(Mac),
    DistStaIp { mac: Mac, ip: Ip },
    WebServer(i32),
    /// `+VERB:` reply belonging to the in-flight command.
    Sync(&'a str),
    Empty,
    Other(&'a str),
}

/// Classify a CRLF-stripped response line.
pub(crate) fn classify(line: &str) -> RadioLine {
    match line {
        "" => return RadioLine::Empty,
        "OK" => return RadioLine::Ok,
        "ERROR" => return RadioLine::Error,
        "FAIL" => return RadioLine::Fail,
        "SEND OK" => return RadioLine::SendOk,
        "SEND FAIL" => return RadioLine::SendFail,
        "ALREADY CONNECTED" | "ALREADY CONNECT" => return RadioLine::AlreadyConnected,
        "ready" => return RadioLine::Ready,
        "WIFI CONNECTED" => return RadioLine::WifiConnected,
        "WIFI GOT IP" => return RadioLine::WifiGotIp,
        "WIFI DISCONNECT" | "WIFI DISCONNECTED" => return RadioLine::WifiDisconnected,
        _ => {}
    }

    if line.starts_with("busy") {
        return RadioLine::Busy;
    }

    // `n,CONNECT` / `n,CLOSED`, plus the unnumbered single-connection forms.
    if let Some(rest) = line.strip_suffix(",CONNECT") {
        if let Ok(num) = rest.parse::<u8>() {
            return RadioLine::ConnActive(num);
        }
    }
    if let Some(rest) = line.strip_suffix(",CLOSED") {
        if let Ok(num) = rest.parse::<u8>() {
            return RadioLine::ConnClosed(num);
        }
    }
    if line == "CONNECT" {
        return RadioLine::ConnActive(0);
    }
    if line == "CLOSED" {
        return RadioLine::ConnClosed(0);
    }

    if let Some(rest) = line.strip_prefix("+LINK_CONN:") {
        if let Some(link) = parse_link_conn(rest) {
            return RadioLine::LinkConn(link);
        }
        return RadioLine::Other(line);
    }
    if let Some(rest) = line.strip_prefix("+STA_CONNECTED:") {
        if let Some(mac) = Scanner::new(rest).mac() {
            return RadioLine::StaConnected(mac);
        }
    }
    if let Some(rest) = line.strip_prefix("+STA_DISCONNECTED:") {
        if let Some(mac) = Scanner::new(rest).mac() {
            return RadioLine::StaDisconnected(mac);
        }
    }
    if let Some(rest) = line.strip_prefix("+DIST_STA_IP:") {
        let mut sc = Scanner::new(rest);
        if let (Some(mac), Some(ip)) = (sc.mac(), sc.ip()) {
            return RadioLine::DistStaIp { mac, ip };
        }
    }
    if let Some(rest) = line.strip_prefix("+WEBSERVER:") {
        return RadioLine::WebServer(Scanner::new(rest).number());
    }

    if line.starts_with('+') {
        return RadioLine::Sync(line);
    }

    RadioLine::Other(line)
}

fn parse_link_conn(fields: &str) -> Option<LinkConn> {
    let mut sc = Scanner::new(fields);
    let failed = sc.number() != 0;
    let num = sc.number();
    if !(0..=255).contains(&num) {
        return None;
    }
    let kind = ConnType::from_token(&sc.string(8))?;
    sc.skip_if(',');
    let is_server = sc.number() != 0;
    let remote_ip = sc.ip();
    let remote_port = sc.port();
    let local_port = sc.port();

    Some(LinkConn {
        failed,
        num: num as u8,
        kind,
        is_server,
        remote_ip,
        remote_port,
        local_port,
    })
}

/// `+CWLAP:(ecn,"ssid",rssi,"mac",channel,...)`
pub(crate) fn parse_cwlap(line: &str) -> Option<AccessPoint> {
    let rest = line.strip_prefix("+CWLAP:").unwrap_or(line);
    let mut sc = Scanner::new(rest);
    if !sc.skip_if('(') {
        return None;
    }

    let ecn = Ecn::from_code(sc.number());
    let ssid = sc.string(crate::config::MAX_SSID_LEN);
    let rssi = sc.number() as i16;
    let mac = sc.mac()?;
    let channel = sc.number() as u8;

    // Scan type, scan times, frequency offset/calibration, ciphers.
    for _ in 0..7 {
        sc.number();
    }
    let bgn = sc.number() as u8;
    let wps = sc.number() != 0;

    Some(AccessPoint {
        ecn,
        ssid,
        rssi,
        mac,
        channel,
        bgn,
        wps,
    })
}

/// `+CWJAP:"ssid","mac",channel,rssi`
pub(crate) fn parse_cwjap_info(line: &str) -> Option<JoinedAp> {
    let rest = line.strip_prefix("+CWJAP:").unwrap_or(line);
    if !rest.starts_with('"') {
        return None;
    }
    let mut sc = Scanner::new(rest);
    let ssid = sc.string(crate::config::MAX_SSID_LEN);
    sc.skip_if(',');
    let mac = sc.mac()?;
    let channel = sc.number() as u8;
    let rssi = sc.number() as i16;

    Some(JoinedAp {
        ssid,
        mac,
        channel,
        rssi,
    })
}

/// `+CWSAP:"ssid","password",channel,ecn,max_stations,hidden`
pub(crate) fn parse_cwsap(line: &str) -> Option<ApConfig> {
    let rest = line.strip_prefix("+CWSAP:").unwrap_or(line);
    if !rest.starts_with('"') {
        return None;
    }
    let mut sc = Scanner::new(rest);
    let ssid = sc.string(crate::config::MAX_SSID_LEN);
    sc.skip_if(',');
    let password = sc.string(crate::config::MAX_PASSWORD_LEN);
    sc.skip_if(',');
    let channel = sc.number() as u8;
    let ecn = Ecn::from_code(sc.number());
    let max_stations = sc.number() as u8;
    let hidden = sc.number() != 0;

    Some(ApConfig {
        ssid,
        password,
        channel,
        ecn,
        max_stations,
        hidden,
    })
}

/// `+CWLIF:ip,mac`
pub(crate) fn parse_cwlif(line: &str) -> Option<StationEntry> {
    let rest = line.strip_prefix("+CWLIF:").unwrap_or(line);
    let mut sc = Scanner::new(rest);
    let ip = sc.ip()?;
    let mac = sc.mac()?;
    Some(StationEntry { ip, mac })
}

/// One row of a `+CIPSTATUS`/`+CIPSTATE` listing.
#[derive(Debug, Clone)]
pub(crate) struct ConnStatusRow {
    pub num: u8,
    pub remote_ip: Option<Ip>,
    pub remote_port: Port,
    pub local_port: Port,
    pub is_client: bool,
}

pub(crate) fn parse_cipstatus(line: &str) -> Option<ConnStatusRow> {
    let rest = line
        .strip_prefix("+CIPSTATUS:")
        .or_else(|| line.strip_prefix("+CIPSTATE:"))
        .unwrap_or(line);
    let mut sc = Scanner::new(rest);

    let num = sc.number();
    if !(0..crate::config::MAX_CONNS as i32).contains(&num) {
        return None;
    }
    sc.skip_string();
    let remote_ip = sc.ip();
    let remote_port = sc.port();
    let local_port = sc.port();
    // The tetype field is `0` when we initiated the connection.
    let is_client = sc.number() == 0;

    Some(ConnStatusRow {
        num: num as u8,
        remote_ip,
        remote_port,
        local_port,
        is_client,
    })
}

/// `+CIPDOMAIN:ip`
pub(crate) fn parse_cipdomain(line: &str) -> Option<Ip> {
    let rest = line.strip_prefix("+CIPDOMAIN:").unwrap_or(line);
    Scanner::new(rest).ip()
}

/// `+time:ms` ping round-trip report.
pub(crate) fn parse_ping_time(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("+time:").or_else(|| line.strip_prefix("+"))?;
    let mut sc = Scanner::new(rest);
    let val = sc.number();
    if val < 0 {
        None
    } else {
        Some(val as u32)
    }
}

/// `+CWHOSTNAME:name`
pub(crate) fn parse_hostname(line: &str) -> Option<String> {
    let rest = line.strip_prefix("+CWHOSTNAME:")?;
    Some(Scanner::new(rest).string(64))
}

/// `+CWDHCP:mask` with bit 0 = soft AP, bit 1 = station.
pub(crate) fn parse_cwdhcp(line: &str) -> Option<(bool, bool)> {
    let rest = line.strip_prefix("+CWDHCP:")?;
    let val = Scanner::new(rest).number();
    Some(((val & 0x02) == 0x02, (val & 0x01) == 0x01))
}

/// `+CIPSNTPCFG:enabled,timezone,...`
pub(crate) fn parse_sntp_cfg(line: &str) -> Option<(bool, i16)> {
    let rest = line.strip_prefix("+CIPSNTPCFG:")?;
    let mut sc = Scanner::new(rest);
    let enabled = sc.number() != 0;
    let timezone = sc.number() as i16;
    Some((enabled, timezone))
}

/// `+CIPSNTPINTV:seconds`
pub(crate) fn parse_sntp_interval(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("+CIPSNTPINTV:")?;
    let val = Scanner::new(rest).number();
    if val < 0 {
        None
    } else {
        Some(val as u32)
    }
}

const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// `+CIPSNTPTIME:Thu Aug 04 14:48:05 2022`
pub(crate) fn parse_sntp_time(line: &str) -> Option<DateTime> {
    let rest = line.strip_prefix("+CIPSNTPTIME:")?;
    if rest.len() < 8 {
        return None;
    }

    let weekday = WEEKDAYS.iter().position(|d| rest.starts_with(d))? as u8 + 1;
    let rest = &rest[4..];
    let month = MONTHS.iter().position(|m| rest.starts_with(m))? as u8 + 1;
    let rest = &rest[4..];

    let mut sc = Scanner::new(rest.trim_start());
    let day = sc.number() as u8;
    sc.skip_if(' ');
    let hours = sc.number() as u8;
    sc.skip_if(':');
    let minutes = sc.number() as u8;
    sc.skip_if(':');
    let seconds = sc.number() as u8;
    sc.skip_if(' ');
    let year = sc.number() as u16;

    Some(DateTime {
        year,
        month,
        day,
        weekday,
        hours,
        minutes,
        seconds,
    })
}

/// `+CIPRECVLEN:len0,len1,...` with one entry per connection slot, `-1` for
/// slots without pending data.
pub(crate) fn parse_ciprecvlen(line: &str) -> Vec<Option<usize>> {
    let rest = line.strip_prefix("+CIPRECVLEN:").unwrap_or(line);
    let mut sc = Scanner::new(rest);
    let mut out = Vec::with_capacity(crate::config::MAX_CONNS);
    for _ in 0..crate::config::MAX_CONNS {
        if sc.is_done() {
            break;
        }
        let val = sc.number();
        out.push(if val < 0 { None } else { Some(val as usize) });
    }
    out
}

/// One `+CIFSR:` interface report row.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum CifsrRow {
    StaIp(Ip),
    StaMac(Mac),
    ApIp(Ip),
    ApMac(Mac),
}

pub(crate) fn parse_cifsr(line: &str) -> Option<CifsrRow> {
    let rest = line.strip_prefix("+CIFSR:")?;
    if let Some(value) = rest.strip_prefix("STAIP,") {
        return Scanner::new(value).ip().map(CifsrRow::StaIp);
    }
    if let Some(value) = rest.strip_prefix("STAMAC,") {
        return Scanner::new(value).mac().map(CifsrRow::StaMac);
    }
    if let Some(value) = rest.strip_prefix("APIP,") {
        return Scanner::new(value).ip().map(CifsrRow::ApIp);
    }
    if let Some(value) = rest.strip_prefix("APMAC,") {
        return Scanner::new(value).mac().map(CifsrRow::ApMac);
    }
    None
}

/// First version triple on an `AT version:` or `SDK version:` line.
pub(crate) fn parse_version(line: &str) -> Option<SwVersion> {
    let rest = line
        .strip_prefix("AT version:")
        .or_else(|| line.strip_prefix("SDK version:"))?;
    // SDK builds report as `vX.Y.Z`.
    let rest = rest.strip_prefix('v').unwrap_or(rest);
    let mut sc = Scanner::new(rest);
    let major = sc.number();
    sc.skip_if('.');
    let minor = sc.number();
    sc.skip_if('.');
    let patch = sc.number();

    Some(SwVersion::new(major as u8, minor as u8, patch as u8))
}
