//! A minimal in-process radio simulator so the demos run without hardware.
//!
//! It speaks just enough of the AT dialogue: join, multiplexed connections,
//! send with prompt, and an echo service that reflects transmitted payloads
//! back as `+IPD` packets.

use std::io;
use std::sync::{Arc, Mutex};

use skylink::port::{InputFeeder, SerialIo};

struct SimState {
    feeder: Option<InputFeeder>,
    /// Set while a send prompt is outstanding: (conn, expected payload len).
    pending_send: Option<(u8, usize)>,
    server_port: Option<u16>,
}

#[derive(Clone)]
pub struct SimRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimRadio {
    pub fn new() -> SimRadio {
        SimRadio {
            state: Arc::new(Mutex::new(SimState {
                feeder: None,
                pending_send: None,
                server_port: None,
            })),
        }
    }

    pub fn attach(&self, feeder: InputFeeder) {
        self.state.lock().unwrap().feeder = Some(feeder);
    }

    fn reply(&self, bytes: &[u8]) {
        let feeder = self.state.lock().unwrap().feeder.clone();
        if let Some(feeder) = feeder {
            feeder.feed(bytes);
        }
    }

    /// Simulate an inbound client hitting the simulated server.
    pub fn inject_inbound(&self, conn: u8, remote: &str, remote_port: u16) {
        let port = self.state.lock().unwrap().server_port.unwrap_or(80);
        self.reply(
            format!(
                "+LINK_CONN:0,{},\"TCP\",1,\"{}\",{},{}\r\n",
                conn, remote, remote_port, port
            )
            .as_bytes(),
        );
    }

    /// Simulate payload arriving on a connection.
    pub fn inject_data(&self, conn: u8, data: &[u8]) {
        let mut frame = format!("+IPD,{},{}:", conn, data.len()).into_bytes();
        frame.extend_from_slice(data);
        self.reply(&frame);
    }

    fn handle_command(&self, line: &str) {
        if line == "AT" || line == "ATE0" {
            self.reply(b"OK\r\n");
        } else if line == "AT+RST" || line == "AT+RESTORE" {
            self.reply(b"OK\r\n\r\nready\r\n");
        } else if line == "AT+GMR" {
            self.reply(b"AT version:2.4.0.0(sim)\r\nSDK version:v5.0-sim\r\nOK\r\n");
        } else if line.starts_with("AT+CWJAP=") {
            self.reply(b"WIFI CONNECTED\r\nWIFI GOT IP\r\n\r\nOK\r\n");
        } else if line.starts_with("AT+CWLAP") {
            self.reply(
                b"+CWLAP:(3,\"simnet\",-42,\"a4:cf:12:0f:9d:1b\",6,0,0,0,0,0,0,0,4,1)\r\n\
                  +CWLAP:(0,\"open-cafe\",-77,\"62:01:94:c1:30:55\",11,0,0,0,0,0,0,0,4,0)\r\nOK\r\n",
            );
        } else if line.starts_with("AT+CWLIF") {
            self.reply(b"+CWLIF:192.168.4.2,\"d8:3a:dd:01:02:03\"\r\nOK\r\n");
        } else if let Some(rest) = line.strip_prefix("AT+CIPSTART=") {
            let conn: u8 = rest
                .split(',')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            self.reply(format!("{},CONNECT\r\n\r\nOK\r\n", conn).as_bytes());
        } else if let Some(rest) = line.strip_prefix("AT+CIPSEND=") {
            let mut fields = rest.split(',');
            let conn: u8 = fields.next().and_then(|n| n.parse().ok()).unwrap_or(0);
            let len: usize = fields.next().and_then(|n| n.parse().ok()).unwrap_or(0);
            self.state.lock().unwrap().pending_send = Some((conn, len));
            self.reply(b"OK\r\n> ");
        } else if let Some(rest) = line.strip_prefix("AT+CIPCLOSE=") {
            let conn: u8 = rest.parse().unwrap_or(0);
            self.reply(format!("{},CLOSED\r\n\r\nOK\r\n", conn).as_bytes());
        } else if let Some(rest) = line.strip_prefix("AT+CIPSERVER=1,") {
            let port: u16 = rest.parse().unwrap_or(80);
            self.state.lock().unwrap().server_port = Some(port);
            self.reply(b"OK\r\n");
        } else if line.starts_with("AT+PING=") {
            self.reply(b"+time:12\r\nOK\r\n");
        } else if line.starts_with("AT+CIPDOMAIN=") {
            self.reply(b"+CIPDOMAIN:\"93.184.216.34\"\r\nOK\r\n");
        } else if line.starts_with("AT+") || line.starts_with("ATE") {
            // Everything else is accepted silently.
            self.reply(b"OK\r\n");
        }
    }
}

impl SerialIo for SimRadio {
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        // A pending prompt means these bytes are payload, not a command.
        let pending = self.state.lock().unwrap().pending_send.take();
        if let Some((conn, len)) = pending {
            let payload = bytes[..len.min(bytes.len())].to_vec();
            self.reply(format!("Recv {} bytes\r\n\r\nSEND OK\r\n", payload.len()).as_bytes());
            // Echo service: reflect the payload back.
            self.inject_data(conn, &payload);
            return Ok(bytes.len());
        }

        for line in String::from_utf8_lossy(bytes).split("\r\n") {
            if !line.is_empty() {
                self.handle_command(line);
            }
        }
        Ok(bytes.len())
    }
}
