//! Sequential MQTT client surface.
//!
//! This is the transport contract an MQTT implementation plugs into: the
//! connection options, quality-of-service levels, and a thin framing layer
//! that moves MQTT control packets over a netconn. Broker protocol logic
//! (session state, retransmission, topic matching) belongs to the
//! application module using this surface.

use crate::device::Device;
use crate::netconn::Netconn;
use crate::pbuf::Pbuf;
use crate::support::{DriverError, DriverResult};
use crate::types::{ConnType, Port};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MqttQos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Connection options presented to the broker.
#[derive(Debug, Clone, Default)]
pub struct MqttClientInfo {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_s: u16,
    pub will_topic: Option<String>,
    pub will_message: Option<Vec<u8>>,
    pub use_ssl: bool,
}

/// One application-visible message.
#[derive(Debug)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: MqttQos,
}

/// Transport half of a sequential MQTT client: a netconn plus MQTT
/// fixed-header framing. One consumer thread drives it.
pub struct MqttTransport {
    nc: Netconn,
    /// Reassembly buffer for packets split across TCP segments.
    pending: Vec<u8>,
}

impl MqttTransport {
    /// Open the TCP (or SSL) connection to the broker.
    pub fn connect(device: &Device, info: &MqttClientInfo, host: &str, port: Port) -> DriverResult<MqttTransport> {
        if info.client_id.is_empty() {
            return Err(DriverError::Argument);
        }
        let kind = if info.use_ssl {
            ConnType::Ssl
        } else {
            ConnType::Tcp
        };
        let nc = Netconn::new(device, kind);
        nc.connect(host, port)?;
        Ok(MqttTransport {
            nc,
            pending: Vec::new(),
        })
    }

    /// Write one complete control packet and flush it to the radio.
    pub fn write_packet(&self, packet: &[u8]) -> DriverResult<()> {
        self.nc.write(packet)?;
        self.nc.flush()
    }

    /// Read the next complete control packet, honoring the netconn receive
    /// timeout. Packets split across TCP segments are reassembled.
    pub fn read_packet(&mut self) -> DriverResult<Vec<u8>> {
        loop {
            if let Some(len) = complete_packet_len(&self.pending) {
                let rest = self.pending.split_off(len);
                let packet = std::mem::replace(&mut self.pending, rest);
                return Ok(packet);
            }
            let pbuf = self.nc.receive()?;
            self.pending.extend_from_slice(&pbuf.to_vec());
        }
    }

    /// Tear the connection down.
    pub fn close(self) -> DriverResult<()> {
        self.nc.close()
    }

    pub fn netconn(&self) -> &Netconn {
        &self.nc
    }
}

/// Length of the first complete MQTT control packet in `buf`, if one is
/// fully buffered: fixed header byte, variable-length remaining-length
/// field, then that many bytes.
fn complete_packet_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    let mut remaining: usize = 0;
    let mut multiplier: usize = 1;
    for (i, &b) in buf[1..].iter().enumerate() {
        if i >= 4 {
            // Malformed length field; force the consumer to resync.
            return Some(buf.len());
        }
        remaining += (b & 0x7F) as usize * multiplier;
        multiplier *= 128;
        if b & 0x80 == 0 {
            let total = 1 + i + 1 + remaining;
            return if buf.len() >= total { Some(total) } else { None };
        }
    }
    None
}

/// Keep-alive pbuf passthrough for implementations that want zero-copy
/// payload access.
pub fn payload_of(pbuf: &Pbuf) -> Vec<u8> {
    pbuf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_packet_single_byte_length() {
        // PINGRESP: 0xD0 0x00
        assert_eq!(complete_packet_len(&[0xD0, 0x00]), Some(2));
        // Partial header
        assert_eq!(complete_packet_len(&[0xD0]), None);
    }

    #[test]
    fn test_complete_packet_waits_for_body() {
        // PUBLISH with 4-byte body, only 2 arrived
        assert_eq!(complete_packet_len(&[0x30, 0x04, 1, 2]), None);
        assert_eq!(complete_packet_len(&[0x30, 0x04, 1, 2, 3, 4]), Some(6));
    }

    #[test]
    fn test_complete_packet_multibyte_length() {
        // Remaining length 200 encoded as 0xC8 0x01
        let mut buf = vec![0x30, 0xC8, 0x01];
        buf.extend(vec![0u8; 200]);
        assert_eq!(complete_packet_len(&buf), Some(203));
    }
}
