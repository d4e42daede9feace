//! Test doubles for driving the engine without hardware: a scripted serial
//! port that replies to recognized writes by feeding bytes back through the
//! device's input path.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use skylink::port::{InputFeeder, SerialIo};
use skylink::prelude::*;

pub enum Expect {
    /// Reply when the written bytes start with this prefix.
    Prefix(&'static [u8]),
    /// Reply to whatever comes next (payload stages).
    Any,
}

struct Exchange {
    expect: Expect,
    reply: Vec<u8>,
}

struct PortInner {
    script: Vec<Exchange>,
    writes: Vec<Vec<u8>>,
    feeder: Option<InputFeeder>,
}

/// Serial port double. Writes are recorded; when the front of the script
/// matches, its canned reply is fed back into the device.
#[derive(Clone)]
pub struct ScriptedPort {
    inner: Arc<Mutex<PortInner>>,
}

impl ScriptedPort {
    pub fn new() -> ScriptedPort {
        ScriptedPort {
            inner: Arc::new(Mutex::new(PortInner {
                script: Vec::new(),
                writes: Vec::new(),
                feeder: None,
            })),
        }
    }

    /// Install the feed-back path. Must run before the first command.
    pub fn attach(&self, feeder: InputFeeder) {
        self.inner.lock().unwrap().feeder = Some(feeder);
    }

    /// Queue a scripted exchange.
    pub fn expect(&self, expect: Expect, reply: &[u8]) {
        self.inner.lock().unwrap().script.push(Exchange {
            expect,
            reply: reply.to_vec(),
        });
    }

    /// All bytes written so far, flattened.
    pub fn written(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        inner.writes.iter().flatten().copied().collect()
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes.len()
    }

    pub fn written_contains(&self, needle: &[u8]) -> bool {
        let haystack = self.written();
        haystack
            .windows(needle.len().max(1))
            .any(|window| window == needle)
    }
}

impl SerialIo for ScriptedPort {
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let (reply, feeder) = {
            let mut inner = self.inner.lock().unwrap();
            inner.writes.push(bytes.to_vec());

            let matches = match inner.script.first() {
                Some(exchange) => match &exchange.expect {
                    Expect::Prefix(prefix) => bytes.starts_with(prefix),
                    Expect::Any => true,
                },
                None => false,
            };
            if matches {
                let exchange = inner.script.remove(0);
                (Some(exchange.reply), inner.feeder.clone())
            } else {
                (None, None)
            }
        };

        if let (Some(reply), Some(feeder)) = (reply, feeder) {
            feeder.feed(&reply);
        }
        Ok(bytes.len())
    }
}

/// Build a device with fast test timeouts over a scripted port.
pub fn test_device(port: &ScriptedPort) -> Device {
    let mut opts = Options::default();
    opts.timeouts.generic_ms = 500;
    opts.timeouts.join_ms = 500;
    opts.timeouts.connect_ms = 500;
    opts.timeouts.send_ms = 500;
    opts.timeouts.reset_ms = 500;

    let device = Device::new(Box::new(port.clone()), opts, None);
    port.attach(device.input_feeder());
    device
}

/// Poll until `cond` holds or the deadline passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Mark the station as associated with an address, as the radio would after
/// a join.
pub fn feed_wifi_up(device: &Device) {
    device.input_process(b"WIFI CONNECTED\r\nWIFI GOT IP\r\n");
    assert!(wait_until(Duration::from_secs(1), || device.has_ip()));
}
