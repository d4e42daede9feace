//! Sequential (thread-blocking) network API over the event-driven engine.
//!
//! A netconn owns a bounded receive mailbox fed by the connection callback
//! and, in server mode, an accept mailbox of freshly wrapped inbound
//! connections. Exactly one application thread is expected to drain each
//! mailbox. Stale-generation events are discarded by checking the captured
//! connection reference on every hook invocation.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, Weak};

use flint::logging::{debug, trace, warn, Logger};

use crate::config::{ACCEPT_QUEUE_LEN, CONN_MAX_DATA_LEN, MAX_CONNS, RECEIVE_QUEUE_LEN};
use crate::conn::{ConnEvent, ConnEvtFn, ConnRef};
use crate::device::Device;
use crate::pbuf::Pbuf;
use crate::support::{DriverError, DriverResult, EvtReply};
use crate::types::{ConnStartOptions, ConnType, Ip, Port};

/// Entries of the receive mailbox. The non-data variants are the sentinels
/// the consumer decodes into `Closed` / `NoDevice` results.
enum RecvItem {
    Data(Pbuf),
    Closed,
    NoDevice,
}

enum AcceptItem {
    Client(Netconn),
    WifiLost,
    NoDevice,
}

struct NcState {
    conn: Option<ConnRef>,
    listen_port: Port,
    listening: bool,
    /// Server-side idle timeout handed to the radio on listen.
    conn_timeout_s: u16,
    /// `None` blocks forever; `Some(0)` polls.
    rcv_timeout_ms: Option<u64>,
    rx_entries: usize,
    /// Linear TX staging buffer, allocated on first buffered write.
    buff: Option<Vec<u8>>,
}

pub(crate) struct NetconnInner {
    kind: ConnType,
    device: Device,
    rx_tx: Sender<RecvItem>,
    rx_rx: Receiver<RecvItem>,
    accept_tx: Sender<AcceptItem>,
    accept_rx: Receiver<AcceptItem>,
    state: Mutex<NcState>,
    log: Logger,
}

impl NetconnInner {
    fn lock(&self) -> std::sync::MutexGuard<NcState> {
        self.state.lock().expect("Netconn state lock poisoned")
    }

    /// Post into the receive mailbox, honoring the reserved close slot for
    /// data entries.
    fn push_recv(&self, item: RecvItem) -> bool {
        let mut state = self.lock();
        let is_data = matches!(item, RecvItem::Data(_));
        if is_data && state.rx_entries >= RECEIVE_QUEUE_LEN - 1 {
            return false;
        }
        match self.rx_tx.try_send(item) {
            Ok(()) => {
                state.rx_entries += 1;
                true
            }
            Err(_) => false,
        }
    }

    /// Connection event hook, invoked from the processor thread.
    fn handle_conn_event(&self, event: &ConnEvent) -> EvtReply {
        match event {
            ConnEvent::Active { conn, client } => {
                if *client {
                    // Bind the slot the engine picked for our start request.
                    let mut state = self.lock();
                    state.conn = Some(*conn);
                }
                EvtReply::Ok
            }
            ConnEvent::Recv { conn, pbuf } => {
                let valid = { self.lock().conn == Some(*conn) };
                if !valid {
                    trace!(self.log, "payload for stale generation dropped";
                           "conn" => conn.index(), "generation" => conn.generation());
                    return EvtReply::IgnoreMore;
                }
                if self.push_recv(RecvItem::Data(pbuf.clone())) {
                    EvtReply::Ok
                } else {
                    // Mailbox saturated: drop the packet and tell the engine
                    // to stop pulling for this connection.
                    debug!(self.log, "receive mailbox full, packet dropped";
                           "conn" => conn.index(), "len" => pbuf.total_len());
                    EvtReply::IgnoreMore
                }
            }
            ConnEvent::Closed { conn, .. } => {
                let valid = { self.lock().conn == Some(*conn) };
                if valid {
                    self.push_recv(RecvItem::Closed);
                }
                EvtReply::Ok
            }
        }
    }

    /// Device-loss broadcast: wake both mailboxes with the no-device
    /// sentinel.
    pub(crate) fn notify_no_device(&self) {
        self.push_recv(RecvItem::NoDevice);
        let _ = self.accept_tx.try_send(AcceptItem::NoDevice);
    }

    /// Station lost the access point: a listening netconn cannot accept
    /// anything further.
    pub(crate) fn notify_wifi_disconnected(&self) {
        if self.lock().listening {
            let _ = self.accept_tx.try_send(AcceptItem::WifiLost);
        }
    }

    fn hook(inner: &Arc<NetconnInner>) -> ConnEvtFn {
        let weak: Weak<NetconnInner> = Arc::downgrade(inner);
        Arc::new(move |event| match weak.upgrade() {
            Some(inner) => inner.handle_conn_event(event),
            None => EvtReply::IgnoreMore,
        })
    }
}

/// Sequential connection handle. Clonable only through accept (each handle
/// is meant for a single consumer thread).
pub struct Netconn {
    inner: Arc<NetconnInner>,
}

impl Netconn {
    /// Create a new netconn of the given transport kind.
    pub fn new(device: &Device, kind: ConnType) -> Netconn {
        let (rx_tx, rx_rx) = bounded(RECEIVE_QUEUE_LEN);
        let (accept_tx, accept_rx) = bounded(ACCEPT_QUEUE_LEN);

        let inner = Arc::new(NetconnInner {
            kind,
            device: device.clone(),
            rx_tx,
            rx_rx,
            accept_tx,
            accept_rx,
            state: Mutex::new(NcState {
                conn: None,
                listen_port: 0,
                listening: false,
                conn_timeout_s: 0,
                rcv_timeout_ms: None,
                rx_entries: 0,
                buff: None,
            }),
            log: device.core().log.clone(),
        });

        device.core().register_netconn(Arc::downgrade(&inner));
        Netconn { inner }
    }

    /// Transport kind of this handle.
    pub fn kind(&self) -> ConnType {
        self.inner.kind
    }

    /// The underlying connection reference, while one is bound.
    pub fn conn(&self) -> Option<ConnRef> {
        self.inner.lock().conn
    }

    /// Slot number on the radio, if connected.
    pub fn conn_number(&self) -> Option<u8> {
        self.conn().map(|conn| conn.index())
    }

    // -- client ------------------------------------------------------------

    /// Connect to a remote host. Blocks until the radio confirms.
    pub fn connect(&self, host: &str, port: Port) -> DriverResult<()> {
        self.connect_ex(host, port, ConnStartOptions::default())
    }

    /// Connect with keep-alive / local addressing options.
    pub fn connect_ex(&self, host: &str, port: Port, opts: ConnStartOptions) -> DriverResult<()> {
        if self.conn().is_some() {
            return Err(DriverError::AlreadyConnected);
        }
        let hook = NetconnInner::hook(&self.inner);
        let conn = self
            .inner
            .device
            .conn_start(self.inner.kind, host, port, opts, Some(hook))?;

        // The hook already captured it on the activation event; this also
        // covers radios that only report activation through the terminator.
        self.inner.lock().conn = Some(conn);
        Ok(())
    }

    // -- server ------------------------------------------------------------

    /// Record the port a later [`Netconn::listen`] uses.
    pub fn bind(&self, port: Port) -> DriverResult<()> {
        if port == 0 {
            return Err(DriverError::Argument);
        }
        self.inner.lock().listen_port = port;
        Ok(())
    }

    /// Server-side idle timeout for accepted clients. Call before `listen`.
    pub fn set_listen_conn_timeout(&self, seconds: u16) {
        self.inner.lock().conn_timeout_s = seconds;
    }

    /// Start the radio-side server on the bound port.
    pub fn listen(&self) -> DriverResult<()> {
        self.listen_with_max_conn(MAX_CONNS as u16)
    }

    /// Start listening, limiting concurrently served clients.
    pub fn listen_with_max_conn(&self, max_connections: u16) -> DriverResult<()> {
        if !self.inner.kind.is_tcp() {
            return Err(DriverError::Argument);
        }
        let (port, timeout_s) = {
            let state = self.inner.lock();
            (state.listen_port, state.conn_timeout_s)
        };
        if port == 0 {
            return Err(DriverError::Argument);
        }

        let accept_hook = self.server_hook();
        self.inner
            .device
            .set_server(true, port, max_connections, timeout_s, Some(accept_hook))?;

        self.inner.lock().listening = true;
        Ok(())
    }

    /// Hook bound to radio-initiated connections while this netconn listens:
    /// wraps each one in a child handle and queues it for `accept`.
    fn server_hook(&self) -> ConnEvtFn {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            let parent = match weak.upgrade() {
                Some(parent) => parent,
                None => return EvtReply::IgnoreMore,
            };
            match event {
                ConnEvent::Active { conn, client } if !client => {
                    let child = Netconn::child(&parent, *conn);
                    // Route all further slot events to the child.
                    parent
                        .device
                        .core()
                        .bind_conn_callback(*conn, NetconnInner::hook(&child.inner));

                    match parent.accept_tx.try_send(AcceptItem::Client(child)) {
                        Ok(()) => EvtReply::Ok,
                        Err(err) => {
                            // Accept queue exhausted: refuse the connection.
                            warn!(parent.log, "accept queue full, closing inbound connection";
                                  "conn" => conn.index());
                            let child = match err.into_inner() {
                                AcceptItem::Client(child) => Some(child),
                                _ => None,
                            };
                            if let Some(child) = child {
                                child.inner.lock().conn = None;
                            }
                            parent.device.core().close_conn_async(*conn);
                            EvtReply::Ok
                        }
                    }
                }
                _ => EvtReply::Ok,
            }
        })
    }

    fn child(parent: &Arc<NetconnInner>, conn: ConnRef) -> Netconn {
        let child = Netconn::new(&parent.device, ConnType::Tcp);
        child.inner.lock().conn = Some(conn);
        child
    }

    /// Wait for an inbound connection. Blocks until a client arrives, the
    /// station drops off the network or the device is lost.
    pub fn accept(&self) -> DriverResult<Netconn> {
        if !self.inner.lock().listening {
            return Err(DriverError::Argument);
        }
        match self.inner.accept_rx.recv() {
            Ok(AcceptItem::Client(client)) => Ok(client),
            Ok(AcceptItem::WifiLost) => {
                self.inner.lock().listening = false;
                Err(DriverError::WifiNotConnected)
            }
            Ok(AcceptItem::NoDevice) => {
                self.inner.lock().listening = false;
                Err(DriverError::NoDevice)
            }
            Err(_) => Err(DriverError::NoDevice),
        }
    }

    // -- transmit ----------------------------------------------------------

    /// Buffered write for TCP/SSL. Data is staged up to one radio packet and
    /// flushed as full packets; oversized input bypasses staging.
    pub fn write(&self, data: &[u8]) -> DriverResult<usize> {
        if !(self.inner.kind.is_tcp() || self.inner.kind.is_ssl()) {
            return Err(DriverError::Argument);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let conn = self.conn().ok_or(DriverError::Closed)?;

        let total = data.len();
        let mut rest = data;

        // Top up a previously staged buffer first.
        let staged = { self.inner.lock().buff.take() };
        if let Some(mut buff) = staged {
            let room = CONN_MAX_DATA_LEN - buff.len();
            let take = room.min(rest.len());
            buff.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if buff.len() == CONN_MAX_DATA_LEN {
                self.inner.device.conn_send(conn, &buff)?;
            } else {
                self.inner.lock().buff = Some(buff);
                return Ok(total);
            }
        }

        // Whole packets go out directly, skipping the copy.
        if rest.len() >= CONN_MAX_DATA_LEN {
            let direct = rest.len() - rest.len() % CONN_MAX_DATA_LEN;
            self.inner.device.conn_send(conn, &rest[..direct])?;
            rest = &rest[direct..];
        }

        if !rest.is_empty() {
            let mut buff = Vec::with_capacity(CONN_MAX_DATA_LEN);
            buff.extend_from_slice(rest);
            self.inner.lock().buff = Some(buff);
        }
        Ok(total)
    }

    /// Push any staged bytes out to the radio.
    pub fn flush(&self) -> DriverResult<()> {
        let staged = { self.inner.lock().buff.take() };
        if let Some(buff) = staged {
            if !buff.is_empty() {
                let conn = self.conn().ok_or(DriverError::Closed)?;
                self.inner.device.conn_send(conn, &buff)?;
            }
        }
        Ok(())
    }

    /// Send one datagram to the connection's bound peer (UDP only).
    pub fn send(&self, data: &[u8]) -> DriverResult<usize> {
        if !self.inner.kind.is_udp() {
            return Err(DriverError::Argument);
        }
        let conn = self.conn().ok_or(DriverError::Closed)?;
        self.inner.device.conn_send_dgram(conn, data)
    }

    /// Send one datagram to an explicit endpoint (UDP only).
    pub fn sendto(&self, ip: Ip, port: Port, data: &[u8]) -> DriverResult<usize> {
        if !self.inner.kind.is_udp() {
            return Err(DriverError::Argument);
        }
        let conn = self.conn().ok_or(DriverError::Closed)?;
        self.inner.device.conn_sendto(conn, ip, port, data)
    }

    // -- receive -----------------------------------------------------------

    /// Receive timeout in milliseconds. `None` waits forever, `Some(0)`
    /// polls.
    pub fn set_receive_timeout(&self, timeout_ms: Option<u64>) {
        self.inner.lock().rcv_timeout_ms = timeout_ms;
    }

    pub fn receive_timeout(&self) -> Option<u64> {
        self.inner.lock().rcv_timeout_ms
    }

    /// Block for the next payload. Returns [`DriverError::Closed`] once the
    /// peer (or the engine) closed the connection, [`DriverError::NoDevice`]
    /// when the radio vanished, [`DriverError::Timeout`] on expiry.
    pub fn receive(&self) -> DriverResult<Pbuf> {
        let timeout_ms = { self.inner.lock().rcv_timeout_ms };

        let item = match timeout_ms {
            None => self.inner.rx_rx.recv().map_err(|_| DriverError::NoDevice)?,
            Some(0) => match self.inner.rx_rx.try_recv() {
                Ok(item) => item,
                Err(TryRecvError::Empty) => return Err(DriverError::Timeout),
                Err(TryRecvError::Disconnected) => return Err(DriverError::NoDevice),
            },
            Some(ms) => {
                match self
                    .inner
                    .rx_rx
                    .recv_timeout(std::time::Duration::from_millis(ms))
                {
                    Ok(item) => item,
                    Err(RecvTimeoutError::Timeout) => return Err(DriverError::Timeout),
                    Err(RecvTimeoutError::Disconnected) => return Err(DriverError::NoDevice),
                }
            }
        };

        {
            let mut state = self.inner.lock();
            state.rx_entries = state.rx_entries.saturating_sub(1);
        }

        match item {
            RecvItem::Data(pbuf) => {
                if let Some(conn) = self.conn() {
                    // Let more data flow and, in manual mode, advance the
                    // radio-side window.
                    self.inner.device.core().set_receive_blocked(conn, false);
                    self.inner.device.conn_recved(conn, &pbuf);
                }
                Ok(pbuf)
            }
            RecvItem::Closed => Err(DriverError::Closed),
            RecvItem::NoDevice => Err(DriverError::NoDevice),
        }
    }

    // -- teardown ----------------------------------------------------------

    /// Flush, close the underlying connection, stop listening and drain both
    /// mailboxes. Closing an already-closed netconn is a no-op.
    pub fn close(&self) -> DriverResult<()> {
        // Best effort: the connection may already be half dead.
        let _ = self.flush();

        let (conn, was_listening, listen_port) = {
            let mut state = self.inner.lock();
            let conn = state.conn.take();
            let was_listening = state.listening;
            state.listening = false;
            (conn, was_listening, state.listen_port)
        };

        if let Some(conn) = conn {
            if self.inner.device.conn_is_active(conn) {
                let _ = self.inner.device.conn_close(conn);
            }
        }

        if was_listening {
            let _ = self
                .inner
                .device
                .set_server(false, listen_port, 0, 0, None);
        }

        self.drain_mailboxes();
        Ok(())
    }

    fn drain_mailboxes(&self) {
        while let Ok(item) = self.inner.rx_rx.try_recv() {
            // Dropping a Data entry releases its pbuf reference.
            drop(item);
        }
        {
            let mut state = self.inner.lock();
            state.rx_entries = 0;
        }
        while let Ok(item) = self.inner.accept_rx.try_recv() {
            if let AcceptItem::Client(child) = item {
                let _ = child.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_item_reserved_close_slot() {
        // The mailbox admits RECEIVE_QUEUE_LEN - 1 data entries; the last
        // slot stays free for the close sentinel.
        assert!(RECEIVE_QUEUE_LEN >= 2);
    }
}
