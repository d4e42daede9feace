//! HTTP server integration contract.
//!
//! The driver side provides listening, accept and per-client byte streams;
//! an application server module supplies the request handling through
//! [`HttpHandler`]. `serve_once` is the canonical accept-and-dispatch loop
//! body a single-threaded server runs.

use crate::netconn::Netconn;
use crate::support::{DriverError, DriverResult};

/// Request handling contract an HTTP server module implements.
pub trait HttpHandler {
    /// Called with the full request head (start line + headers) and
    /// whatever body bytes arrived with it. Returns the raw response bytes
    /// to write back.
    fn handle(&mut self, request: &[u8]) -> Vec<u8>;
}

/// Options for the driver-side listening socket.
#[derive(Debug, Clone)]
pub struct HttpServerOptions {
    pub port: u16,
    pub max_clients: u16,
    /// Radio-side idle close for accepted clients, seconds.
    pub idle_timeout_s: u16,
}

impl Default for HttpServerOptions {
    fn default() -> HttpServerOptions {
        HttpServerOptions {
            port: 80,
            max_clients: 4,
            idle_timeout_s: 10,
        }
    }
}

/// Accept one client from the listening netconn, feed its request to the
/// handler and write the response back. Returns when the client is done.
pub fn serve_once(listener: &Netconn, handler: &mut dyn HttpHandler) -> DriverResult<()> {
    let client = listener.accept()?;

    let mut request = Vec::new();
    loop {
        match client.receive() {
            Ok(pbuf) => {
                request.extend_from_slice(&pbuf.to_vec());
                // Head complete once the blank line arrives.
                if find_header_end(&request).is_some() {
                    break;
                }
            }
            Err(DriverError::Closed) => break,
            Err(err) => {
                let _ = client.close();
                return Err(err);
            }
        }
    }

    if !request.is_empty() {
        let response = handler.handle(&request);
        client.write(&response)?;
        client.flush()?;
    }
    client.close()
}

/// Offset just past the `\r\n\r\n` separator, if present. The engine never
/// interprets this sequence itself; it is payload, significant only here.
pub fn find_header_end(request: &[u8]) -> Option<usize> {
    request
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
