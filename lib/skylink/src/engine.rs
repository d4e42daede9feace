//! The AT protocol engine.
//!
//! Two library-owned threads share the serial line: the producer pops command
//! messages off a bounded queue, writes their AT text and waits for the
//! processor to release it; the processor drains the UART byte ring, scans
//! lines and binary payloads out of it and advances the in-flight command's
//! state machine. At most one command is ever outstanding, and unsolicited
//! notifications are handled regardless of what is in flight.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use flint::logging::{debug, trace, warn, Logger};

use crate::buffer::RxRing;
use crate::cmd::Command;
use crate::config::{Options, CONN_MAX_DATA_LEN, MAX_CONNS, MAX_LINE_LEN, RX_RING_SIZE};
use crate::conn::{ConnEvent, ConnEvtFn, ConnRef, ConnTable};
use crate::events::EventBus;
use crate::parser::{self, RadioLine};
use crate::pbuf::Pbuf;
use crate::port::SerialIo;
use crate::support::{DriverError, DriverResult, EvtReply};
use crate::types::{
    AccessPoint, ApConfig, DateTime, Event, Ip, IpInfo, JoinedAp, Port, StationEntry, SwVersion,
};

/// Signals from the processor to the producer about the in-flight command.
pub(crate) enum Step {
    /// The `>` prompt arrived; stream the payload stage.
    Prompt,
    /// A terminator arrived; the command is complete.
    Done(DriverResult<()>),
}

/// Typed output of a completed command.
#[derive(Debug)]
pub(crate) enum Response {
    None,
    Versions {
        at: Option<SwVersion>,
        sdk: Option<SwVersion>,
    },
    ApList(Vec<AccessPoint>),
    JoinedAp(Option<JoinedAp>),
    IpInfo(IpInfo),
    ApConfig(Option<ApConfig>),
    Stations(Vec<StationEntry>),
    Hostname(String),
    Dhcp {
        sta: bool,
        ap: bool,
    },
    DnsIp(Option<Ip>),
    PingTime(Option<u32>),
    SntpCfg {
        enabled: bool,
        timezone: i16,
    },
    SntpTime(Option<DateTime>),
    SntpInterval(u32),
    RecvLens(Vec<Option<usize>>),
    Conn(Option<ConnRef>),
    Ifconfig {
        sta: IpInfo,
        ap: IpInfo,
    },
}

/// How a completed command message finds its way back to the caller.
pub(crate) enum ReplyTo {
    /// Blocking caller parked on the other end of this channel.
    Blocking(Sender<Box<CmdMsg>>),
    /// Non-blocking caller; invoked from the producer thread.
    Callback(Box<dyn FnOnce(DriverResult<()>) + Send>),
    /// Fire and forget (engine-internal commands).
    Discard,
}

/// One outstanding request, owned by exactly one of caller, producer or
/// processor at any time.
pub(crate) struct CmdMsg {
    pub cmd: Command,
    pub resp: Response,
    pub result: DriverResult<()>,
    pub reply: ReplyTo,
}

impl CmdMsg {
    pub fn new(cmd: Command, reply: ReplyTo) -> Box<CmdMsg> {
        Box::new(CmdMsg {
            cmd,
            resp: Response::None,
            result: Ok(()),
            reply,
        })
    }
}

struct InFlight {
    msg: Box<CmdMsg>,
    step_tx: Sender<Step>,
    prompt_sent: bool,
}

/// Binary read in progress: payload bytes of an `+IPD` packet (or a manual
/// `+CIPRECVDATA` reply) being pulled out of the byte stream.
struct IpdState {
    conn_idx: u8,
    remaining: usize,
    buf: Vec<u8>,
    source: Option<(Ip, Port)>,
}

pub(crate) struct State {
    pub conns: ConnTable,
    inflight: Option<InFlight>,
    ipd: Option<IpdState>,
    pub wifi_connected: bool,
    pub has_ip: bool,
    pub present: bool,
    pub manual_receive: bool,
    pub at_version: Option<SwVersion>,
    pub at_version_ok: bool,
    /// Callback bound to radio-initiated (server mode) connections.
    pub server_evt: Option<ConnEvtFn>,
}

impl State {
    fn new() -> State {
        State {
            conns: ConnTable::new(),
            inflight: None,
            ipd: None,
            wifi_connected: false,
            has_ip: false,
            present: true,
            manual_receive: false,
            at_version: None,
            at_version_ok: false,
            server_evt: None,
        }
    }
}

pub(crate) struct Core {
    pub state: Mutex<State>,
    pub cmd_tx: Sender<Box<CmdMsg>>,
    pub input_tx: Sender<Box<[u8]>>,
    pub serial: Mutex<Box<dyn SerialIo>>,
    pub events: EventBus,
    pub opts: Options,
    pub log: Logger,
    /// Live netconn handles, for the device-loss and wifi-loss broadcasts.
    netconns: Mutex<Vec<Weak<crate::netconn::NetconnInner>>>,
}

impl Core {
    pub fn new(
        serial: Box<dyn SerialIo>,
        opts: Options,
        log: Logger,
        cmd_tx: Sender<Box<CmdMsg>>,
        input_tx: Sender<Box<[u8]>>,
    ) -> Core {
        let events = EventBus::new(log.clone());
        Core {
            state: Mutex::new(State::new()),
            cmd_tx,
            input_tx,
            serial: Mutex::new(serial),
            events,
            opts,
            log,
            netconns: Mutex::new(Vec::new()),
        }
    }

    pub fn register_netconn(&self, handle: Weak<crate::netconn::NetconnInner>) {
        let mut netconns = self.netconns.lock().expect("Netconn registry lock poisoned");
        netconns.retain(|entry| entry.strong_count() > 0);
        netconns.push(handle);
    }

    fn live_netconns(&self) -> Vec<Arc<crate::netconn::NetconnInner>> {
        self.netconns
            .lock()
            .expect("Netconn registry lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Rebind the event callback of an active slot (server accept hands the
    /// slot from the listener to the child netconn).
    pub fn bind_conn_callback(&self, conn: ConnRef, evt_fn: ConnEvtFn) {
        if let Some(slot) = self.lock().conns.get_mut(conn) {
            slot.evt_fn = Some(evt_fn);
        }
    }

    #[inline]
    pub fn lock(&self) -> std::sync::MutexGuard<State> {
        self.state.lock().expect("Core state lock poisoned")
    }

    /// Run a command to completion on the caller thread.
    pub fn run(&self, cmd: Command) -> DriverResult<Response> {
        if !self.lock().present {
            return Err(DriverError::NoDevice);
        }

        let (reply_tx, reply_rx) = bounded(1);
        let msg = CmdMsg::new(cmd, ReplyTo::Blocking(reply_tx));

        self.cmd_tx
            .send(msg)
            .map_err(|_| DriverError::NoDevice)?;

        let msg = reply_rx.recv().map_err(|_| DriverError::NoDevice)?;
        msg.result?;
        Ok(msg.resp)
    }

    /// Queue a command without waiting. The callback runs on the producer
    /// thread after completion.
    pub fn post(
        &self,
        cmd: Command,
        done: Option<Box<dyn FnOnce(DriverResult<()>) + Send>>,
    ) -> DriverResult<()> {
        if !self.lock().present {
            return Err(DriverError::NoDevice);
        }
        let reply = match done {
            Some(callback) => ReplyTo::Callback(callback),
            None => ReplyTo::Discard,
        };
        self.cmd_tx
            .send(CmdMsg::new(cmd, reply))
            .map_err(|_| DriverError::NoDevice)
    }

    /// Queue a command from inside the engine. Never blocks; dropping the
    /// command under overload is preferable to stalling the processor.
    fn post_from_engine(&self, cmd: Command) {
        let name = cmd.name();
        match self.cmd_tx.try_send(CmdMsg::new(cmd, ReplyTo::Discard)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(self.log, "command queue full, engine command dropped"; "cmd" => name);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn send_serial(&self, bytes: &[u8]) -> DriverResult<()> {
        let mut serial = self.serial.lock().expect("Serial lock poisoned");
        serial.send(bytes).map(|_| ()).map_err(Into::into)
    }

    /// Release the in-flight command from the processor side.
    fn signal_done(&self, result: DriverResult<()>) {
        let state = self.lock();
        if let Some(inflight) = &state.inflight {
            let _ = inflight.step_tx.try_send(Step::Done(result));
        }
    }

    /// Mark the device present or lost. Loss completes the in-flight command,
    /// clears the connection table and broadcasts to every event subscriber.
    pub fn set_present(&self, present: bool) {
        {
            let mut state = self.lock();
            if state.present == present {
                return;
            }
            state.present = present;

            if !present {
                if let Some(inflight) = &state.inflight {
                    let _ = inflight.step_tx.try_send(Step::Done(Err(DriverError::NoDevice)));
                }
                let active: Vec<u8> = state.conns.active_slots().collect();
                for idx in active {
                    state.conns.mark_closed(idx);
                }
                state.wifi_connected = false;
                state.has_ip = false;
            }
        }
        if !present {
            for netconn in self.live_netconns() {
                netconn.notify_no_device();
            }
        }
        self.events.dispatch(&Event::DevicePresent { present });
    }

    pub fn is_present(&self) -> bool {
        self.lock().present
    }

    /// Validity check for connection references held outside the engine.
    pub fn conn_is_active(&self, conn: ConnRef) -> bool {
        self.lock().conns.is_valid(conn)
    }

    pub fn set_receive_blocked(&self, conn: ConnRef, blocked: bool) {
        if let Some(slot) = self.lock().conns.get_mut(conn) {
            slot.receive_blocked = blocked;
        }
    }

    /// Close a connection without waiting for the radio's answer. Safe to
    /// call from event callbacks running on the processor thread.
    pub fn close_conn_async(&self, conn: ConnRef) {
        self.post_from_engine(Command::CloseConn { conn });
    }

    /// Acknowledge consumed data in manual receive mode: advances the
    /// radio-side window by fetching the next pending chunk, if any.
    pub fn conn_recved(&self, conn: ConnRef, _pbuf: &Pbuf) {
        let fetch = {
            let state = self.lock();
            if !state.manual_receive {
                return;
            }
            match state.conns.get(conn) {
                Some(slot) if slot.tcp_available > 0 && !slot.receive_blocked => {
                    Some(slot.tcp_available.min(CONN_MAX_DATA_LEN))
                }
                _ => None,
            }
        };
        if let Some(len) = fetch {
            self.post_from_engine(Command::RecvData { conn, len });
        }
    }
}

// ---------------------------------------------------------------------------
// Producer thread
// ---------------------------------------------------------------------------

/// Validate a command against current state and render its first-stage text.
/// Runs under the core lock, immediately before the message goes in flight.
fn prepare(msg: &mut CmdMsg, state: &mut State) -> DriverResult<String> {
    match &mut msg.cmd {
        Command::StartConn { assigned, .. } => {
            if !state.has_ip {
                return Err(DriverError::WifiNotConnected);
            }
            match state.conns.free_slot() {
                Some(idx) => *assigned = Some(idx),
                None => return Err(DriverError::NoFreeConnection),
            }
        }
        Command::DnsQuery { .. } | Command::Ping { .. } => {
            if !state.has_ip {
                return Err(DriverError::WifiNotConnected);
            }
        }
        Command::Send { conn, data, .. } => {
            if data.is_empty() {
                return Err(DriverError::Argument);
            }
            match state.conns.get(*conn) {
                Some(slot) if !slot.in_closing => {}
                _ => return Err(DriverError::Closed),
            }
        }
        Command::RecvData { conn, .. } => {
            if state.conns.get(*conn).is_none() {
                return Err(DriverError::Closed);
            }
        }
        Command::CloseConn { conn } => {
            // A stale reference still emits the close: the radio may believe
            // the slot is alive even when our side already gave up on it.
            if let Some(slot) = state.conns.get_mut(*conn) {
                slot.in_closing = true;
                slot.closed_by_us = true;
            }
        }
        _ => {}
    }
    Ok(msg.cmd.at_text())
}

pub(crate) fn producer_loop(core: Arc<Core>, cmd_rx: Receiver<Box<CmdMsg>>) {
    loop {
        let mut msg = match cmd_rx.recv() {
            Ok(msg) => msg,
            Err(_) => break,
        };

        if !core.is_present() {
            msg.result = Err(DriverError::NoDevice);
            deliver(&core, msg);
            continue;
        }

        let name = msg.cmd.name();
        let timeout = msg.cmd.timeout(&core.opts.timeouts);
        let is_reset = msg.cmd.completes_on_ready();

        let (step_tx, step_rx) = bounded(4);
        let text = {
            let mut state = core.lock();
            match prepare(&mut msg, &mut state) {
                Ok(text) => {
                    state.inflight = Some(InFlight {
                        msg,
                        step_tx,
                        prompt_sent: false,
                    });
                    text
                }
                Err(err) => {
                    drop(state);
                    msg.result = Err(err);
                    deliver(&core, msg);
                    continue;
                }
            }
        };

        trace!(core.log, "command in flight"; "cmd" => name, "timeout_ms" => timeout.as_millis() as u64);

        // Reset prefers the hardware line when the board wires it; the
        // in-flight slot is primed first so the `ready` banner cannot race
        // past the waiter.
        let via_reset_pin = is_reset && {
            let mut serial = core.serial.lock().expect("Serial lock poisoned");
            serial.reset_line(true) && {
                std::thread::sleep(Duration::from_millis(10));
                serial.reset_line(false)
            }
        };

        if !via_reset_pin {
            if let Err(err) = core.send_serial(text.as_bytes()) {
                finish(&core, Err(err), &cmd_rx);
                continue;
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match step_rx.recv_timeout(remaining) {
                Ok(Step::Prompt) => {
                    let payload: Option<Vec<u8>> = {
                        let state = core.lock();
                        state
                            .inflight
                            .as_ref()
                            .and_then(|inflight| inflight.msg.cmd.payload().map(|p| p.to_vec()))
                    };
                    if let Some(payload) = payload {
                        if let Err(err) = core.send_serial(&payload) {
                            finish(&core, Err(err), &cmd_rx);
                            break;
                        }
                    }
                }
                Ok(Step::Done(result)) => {
                    finish(&core, result, &cmd_rx);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    debug!(core.log, "command timed out"; "cmd" => name);
                    finish(&core, Err(DriverError::Timeout), &cmd_rx);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    finish(&core, Err(DriverError::NoDevice), &cmd_rx);
                    break;
                }
            }
        }
    }

    trace!(core.log, "producer thread exiting");
}

/// Take the in-flight message out, apply completion side effects and hand the
/// message back to its caller.
fn finish(core: &Arc<Core>, result: DriverResult<()>, cmd_rx: &Receiver<Box<CmdMsg>>) {
    let mut post_events: Vec<Event> = Vec::new();
    let mut set_baud: Option<u32> = None;

    let msg = {
        let mut state = core.lock();
        let inflight = match state.inflight.take() {
            Some(inflight) => inflight,
            None => return,
        };
        let mut msg = inflight.msg;
        msg.result = result;

        // A manual read abandoned mid-transfer must not leave the parser in
        // binary mode waiting for bytes that will never come.
        if msg.result.is_err() && matches!(msg.cmd, Command::RecvData { .. }) {
            state.ipd = None;
        }

        apply_completion(&mut state, &msg, &core.opts, &mut post_events, &mut set_baud);
        msg
    };

    if msg.cmd.completes_on_ready() {
        // Everything queued behind a reset was aimed at the pre-reset radio.
        // Drained before the resetting caller is released, so its follow-up
        // commands cannot be swept up by mistake.
        while let Ok(mut stale) = cmd_rx.try_recv() {
            stale.result = Err(DriverError::ResetAborted);
            deliver(core, stale);
        }
        post_events.push(Event::Reset {
            forced: msg.result.is_ok(),
        });
    }

    if let Some(baud) = set_baud {
        let mut serial = core.serial.lock().expect("Serial lock poisoned");
        if let Err(err) = serial.set_baudrate(baud) {
            warn!(core.log, "baudrate change rejected by transport"; "baud" => baud, "err" => ?err);
        }
    }

    for event in &post_events {
        core.events.dispatch(event);
    }

    deliver(core, msg);
}

/// Completion side effects that belong to the engine state.
fn apply_completion(
    state: &mut State,
    msg: &CmdMsg,
    opts: &Options,
    events: &mut Vec<Event>,
    set_baud: &mut Option<u32>,
) {
    match &msg.cmd {
        Command::RecvMode { manual } if msg.result.is_ok() => {
            state.manual_receive = *manual;
        }
        Command::Send { conn, data, .. } => {
            // Chunks count towards the total regardless of outcome.
            if let Some(slot) = state.conns.get_mut(*conn) {
                slot.total_sent += data.len() as u64;
            }
        }
        Command::Gmr if msg.result.is_ok() => {
            if let Response::Versions { at: Some(at), .. } = &msg.resp {
                let supported = *at >= opts.min_at_version;
                state.at_version = Some(*at);
                state.at_version_ok = supported;
                events.push(Event::AtVersion {
                    version: *at,
                    supported,
                });
            }
        }
        Command::UartCur { baud } if msg.result.is_ok() => {
            *set_baud = Some(*baud);
        }
        Command::Server { enable, .. } if msg.result.is_ok() && !*enable => {
            state.server_evt = None;
        }
        _ => {}
    }
}

fn deliver(core: &Arc<Core>, mut msg: Box<CmdMsg>) {
    let reply = std::mem::replace(&mut msg.reply, ReplyTo::Discard);
    match reply {
        ReplyTo::Blocking(tx) => {
            // The caller gave up only if it died; nothing to do then.
            let _ = tx.send(msg);
        }
        ReplyTo::Callback(callback) => callback(msg.result),
        ReplyTo::Discard => {
            if let Err(err) = msg.result {
                trace!(core.log, "engine command failed"; "cmd" => msg.cmd.name(), "err" => %err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Processor thread
// ---------------------------------------------------------------------------

pub(crate) fn processor_loop(core: Arc<Core>, input_rx: Receiver<Box<[u8]>>) {
    let mut ring = RxRing::new(RX_RING_SIZE, core.log.clone());
    let keepalive = core
        .opts
        .keepalive_interval_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_secs(3600));
    let keepalive_enabled = core.opts.keepalive_interval_ms.is_some();

    loop {
        match input_rx.recv_timeout(keepalive) {
            Ok(chunk) => {
                ring.ingress(&chunk);
                process_ring(&core, &mut ring);
            }
            Err(RecvTimeoutError::Timeout) => {
                if keepalive_enabled {
                    core.events.dispatch(&Event::KeepAlive);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    trace!(core.log, "processor thread exiting");
}

enum ScanAction {
    /// Complete line available; `usize` is the delimiter index.
    Line(usize),
    /// `+IPD`-style header terminated by `:`; switch to binary mode.
    Binary(usize),
    /// Data prompt at the head of the stream.
    Prompt,
    /// Need more bytes.
    Incomplete,
    /// Oversized garbage; discard what we have.
    Discard,
}

pub(crate) fn process_ring(core: &Arc<Core>, ring: &mut RxRing) {
    loop {
        // Binary payload mode runs until the announced byte count is in.
        let in_binary = { core.lock().ipd.is_some() };
        if in_binary {
            if ring.is_empty() {
                return;
            }
            feed_binary(core, ring);
            continue;
        }

        let awaiting_prompt = {
            let state = core.lock();
            state
                .inflight
                .as_ref()
                .map(|inflight| inflight.msg.cmd.wants_prompt() && !inflight.prompt_sent)
                .unwrap_or(false)
        };

        let action = scan(ring.peek(), awaiting_prompt);
        match action {
            ScanAction::Line(at) => {
                let line = String::from_utf8_lossy(&ring.peek()[..at])
                    .trim_end_matches('\r')
                    .to_string();
                ring.consume(at + 1);
                handle_line(core, &line);
            }
            ScanAction::Binary(at) => {
                let header = String::from_utf8_lossy(&ring.peek()[..at]).into_owned();
                ring.consume(at + 1);
                start_binary(core, &header);
            }
            ScanAction::Prompt => {
                let skip = if ring.peek().len() > 1 && ring.peek()[1] == b' ' {
                    2
                } else {
                    1
                };
                ring.consume(skip);
                let mut state = core.lock();
                if let Some(inflight) = &mut state.inflight {
                    if !inflight.prompt_sent {
                        inflight.prompt_sent = true;
                        let _ = inflight.step_tx.try_send(Step::Prompt);
                    }
                }
            }
            ScanAction::Incomplete => return,
            ScanAction::Discard => {
                warn!(core.log, "discarding oversized unterminated input"; "len" => ring.len());
                ring.clear();
                return;
            }
        }
    }
}

fn scan(buf: &[u8], awaiting_prompt: bool) -> ScanAction {
    if buf.is_empty() {
        return ScanAction::Incomplete;
    }
    if awaiting_prompt && buf[0] == b'>' {
        return ScanAction::Prompt;
    }

    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            return ScanAction::Line(i);
        }
        if b == b':'
            && (buf[..i].starts_with(b"+IPD,") || buf[..i].starts_with(b"+CIPRECVDATA"))
        {
            return ScanAction::Binary(i);
        }
    }

    if buf.len() > MAX_LINE_LEN {
        ScanAction::Discard
    } else {
        ScanAction::Incomplete
    }
}

/// Enter binary payload mode for a data-carrying `+IPD` or `+CIPRECVDATA`.
fn start_binary(core: &Arc<Core>, header: &str) {
    let (fields, is_recvdata) = if let Some(rest) = header.strip_prefix("+IPD,") {
        (rest, false)
    } else if let Some(rest) = header.strip_prefix("+CIPRECVDATA,") {
        (rest, true)
    } else if let Some(rest) = header.strip_prefix("+CIPRECVDATA:") {
        (rest, true)
    } else {
        warn!(core.log, "unrecognized binary header"; "header" => header);
        return;
    };

    let mut state = core.lock();

    let (conn_idx, len, remote) = if is_recvdata {
        // Length first; the target connection is the one the in-flight
        // receive command addresses.
        let mut sc = parser::Scanner::new(fields);
        let len = sc.number().max(0) as usize;
        let remote = sc.ip().map(|ip| (ip, sc.port()));
        let conn_idx = match &state.inflight {
            Some(inflight) => match &inflight.msg.cmd {
                Command::RecvData { conn, .. } => conn.index(),
                _ => {
                    warn!(core.log, "receive data header without receive command");
                    return;
                }
            },
            None => return,
        };
        (conn_idx, len, remote)
    } else {
        match parser::parse_ipd_header(fields) {
            Some(hdr) => (hdr.conn, hdr.len, hdr.remote),
            None => {
                warn!(core.log, "malformed IPD header"; "header" => header);
                return;
            }
        }
    };

    if conn_idx as usize >= MAX_CONNS {
        warn!(core.log, "IPD for out-of-range connection"; "conn" => conn_idx);
        return;
    }

    if let Some((ip, port)) = remote {
        if let Some(slot) = state.conns.slot_mut(conn_idx) {
            slot.remote_ip = Some(ip);
            slot.remote_port = port;
        }
    }

    if len == 0 {
        return;
    }

    state.ipd = Some(IpdState {
        conn_idx,
        remaining: len,
        buf: Vec::with_capacity(len),
        source: remote,
    });
}

fn feed_binary(core: &Arc<Core>, ring: &mut RxRing) {
    let finished = {
        let mut state = core.lock();
        let ipd = match &mut state.ipd {
            Some(ipd) => ipd,
            None => return,
        };

        let take = ipd.remaining.min(ring.len());
        ipd.buf.extend_from_slice(&ring.peek()[..take]);
        ipd.remaining -= take;
        ring.consume(take);

        if ipd.remaining == 0 {
            state.ipd.take()
        } else {
            None
        }
    };

    if let Some(ipd) = finished {
        let mut pbuf = Pbuf::from_vec(ipd.buf);
        if let Some((ip, port)) = ipd.source {
            pbuf.set_source(ip, port);
        }
        deliver_recv(core, ipd.conn_idx, pbuf);
    }
}

/// Hand a completed payload to the owning connection's callback.
fn deliver_recv(core: &Arc<Core>, conn_idx: u8, pbuf: Pbuf) {
    let len = pbuf.total_len();
    let (conn, evt_fn) = {
        let mut state = core.lock();
        let manual = state.manual_receive;
        match state.conns.slot_mut(conn_idx) {
            Some(slot) if slot.active => {
                slot.total_recved += len as u64;
                if manual {
                    slot.tcp_available = slot.tcp_available.saturating_sub(len);
                }
                (
                    ConnRef {
                        idx: conn_idx,
                        val_id: slot.val_id,
                    },
                    slot.evt_fn.clone(),
                )
            }
            _ => {
                trace!(core.log, "payload for inactive slot dropped"; "conn" => conn_idx, "len" => len);
                return;
            }
        }
    };

    trace!(core.log, "payload received"; "conn" => conn_idx, "len" => len);

    match evt_fn {
        Some(evt_fn) => {
            let reply = evt_fn(&ConnEvent::Recv { conn, pbuf });
            if reply == EvtReply::IgnoreMore {
                // Consumer refused the packet; stop pulling until it drains.
                core.set_receive_blocked(conn, true);
            }
        }
        None => {
            // No consumer bound; the payload is freed on drop.
        }
    }
}

fn handle_line(core: &Arc<Core>, line: &str) {
    // Version report lines predate the echo check: they also begin with "AT".
    if line.starts_with("AT version:") || line.starts_with("SDK version:") {
        handle_sync(core, line);
        return;
    }
    // Command echo (enabled until ATE0 lands) is noise.
    if line.starts_with("AT") {
        return;
    }

    match parser::classify(line) {
        RadioLine::Empty => {}
        RadioLine::Ok => {
            let ignore = {
                let state = core.lock();
                state
                    .inflight
                    .as_ref()
                    .map(|inflight| {
                        // Reset prints OK before rebooting: completion is the
                        // `ready` banner. Two-stage commands print OK before
                        // the `>` prompt: completion is their send verdict.
                        inflight.msg.cmd.completes_on_ready()
                            || (inflight.msg.cmd.wants_prompt() && !inflight.prompt_sent)
                    })
                    .unwrap_or(false)
            };
            if !ignore {
                core.signal_done(Ok(()));
            }
        }
        RadioLine::Error | RadioLine::Fail => core.signal_done(Err(DriverError::Device)),
        RadioLine::Busy => core.signal_done(Err(DriverError::Busy)),
        RadioLine::AlreadyConnected => core.signal_done(Err(DriverError::AlreadyConnected)),
        RadioLine::SendOk => core.signal_done(Ok(())),
        RadioLine::SendFail => core.signal_done(Err(DriverError::SendFail)),
        RadioLine::Ready => handle_ready(core),
        RadioLine::WifiConnected => {
            core.lock().wifi_connected = true;
            core.events.dispatch(&Event::WifiConnected);
        }
        RadioLine::WifiGotIp => {
            core.lock().has_ip = true;
            core.events.dispatch(&Event::WifiGotIp { ipv6: false });
        }
        RadioLine::WifiDisconnected => {
            {
                let mut state = core.lock();
                state.wifi_connected = false;
                state.has_ip = false;
            }
            for netconn in core.live_netconns() {
                netconn.notify_wifi_disconnected();
            }
            core.events.dispatch(&Event::WifiDisconnected);
        }
        RadioLine::ConnActive(idx) => conn_active(core, idx, None),
        RadioLine::LinkConn(link) => {
            if link.failed {
                trace!(core.log, "link establishment failed"; "conn" => link.num);
            } else {
                let num = link.num;
                conn_active(core, num, Some(link));
            }
        }
        RadioLine::ConnClosed(idx) => conn_closed(core, idx),
        RadioLine::StaConnected(mac) => {
            core.events.dispatch(&Event::ApStationConnected { mac });
        }
        RadioLine::StaDisconnected(mac) => {
            core.events.dispatch(&Event::ApStationDisconnected { mac });
        }
        RadioLine::DistStaIp { mac, ip } => {
            core.events.dispatch(&Event::ApStationIpAssigned { mac, ip });
        }
        RadioLine::WebServer(code) => {
            core.events.dispatch(&Event::WebServer { code });
        }
        RadioLine::Sync(sync) => handle_sync(core, sync),
        RadioLine::Other(other) => {
            trace!(core.log, "unhandled line"; "line" => other);
        }
    }
}

/// The radio rebooted (requested or spontaneous). All connections are gone;
/// a non-reset in-flight command is aborted.
fn handle_ready(core: &Arc<Core>) {
    let (closed, reset_inflight) = {
        let mut state = core.lock();
        let active: Vec<u8> = state.conns.active_slots().collect();
        let mut closed = Vec::new();
        for idx in active {
            if let Some(info) = state.conns.mark_closed(idx) {
                closed.push(info);
            }
        }
        state.wifi_connected = false;
        state.has_ip = false;
        state.manual_receive = false;

        let reset_inflight = state
            .inflight
            .as_ref()
            .map(|inflight| inflight.msg.cmd.completes_on_ready())
            .unwrap_or(false);
        (closed, reset_inflight)
    };

    for (conn, evt_fn, forced) in closed {
        if let Some(evt_fn) = evt_fn {
            evt_fn(&ConnEvent::Closed { conn, forced });
        }
    }

    if reset_inflight {
        core.signal_done(Ok(()));
    } else {
        core.signal_done(Err(DriverError::ResetAborted));
    }
    core.events.dispatch(&Event::Ready);
}

/// A connection slot went active, announced by `n,CONNECT` or `+LINK_CONN`.
fn conn_active(core: &Arc<Core>, idx: u8, link: Option<parser::LinkConn>) {
    if idx as usize >= MAX_CONNS {
        warn!(core.log, "activation for out-of-range slot"; "conn" => idx);
        return;
    }

    let (conn, evt_fn, client) = {
        let mut state = core.lock();

        // Did our own start request trigger this?
        let started_by_us = match &state.inflight {
            Some(inflight) => match &inflight.msg.cmd {
                Command::StartConn { assigned, .. } => *assigned == Some(idx),
                _ => false,
            },
            None => false,
        };

        let from_radio_server = link.as_ref().map(|l| l.is_server).unwrap_or(!started_by_us);

        let (kind, evt_fn, client) = if started_by_us && !from_radio_server {
            match &state.inflight.as_ref().expect("checked above").msg.cmd {
                Command::StartConn { kind, evt_fn, .. } => (*kind, evt_fn.clone(), true),
                _ => unreachable!(),
            }
        } else {
            let kind = link
                .as_ref()
                .map(|l| l.kind)
                .unwrap_or(crate::types::ConnType::Tcp);
            (kind, state.server_evt.clone(), false)
        };

        let remote = link
            .as_ref()
            .and_then(|l| l.remote_ip.map(|ip| (ip, l.remote_port)));
        let local_port = link.as_ref().map(|l| l.local_port).unwrap_or(0);

        let conn = match state.conns.mark_active(idx, kind, client, remote, local_port, evt_fn) {
            Some(conn) => conn,
            None => return,
        };

        // Stash the handle for the start command's caller.
        if started_by_us {
            if let Some(inflight) = &mut state.inflight {
                inflight.msg.resp = Response::Conn(Some(conn));
            }
        }

        let evt_fn = state.conns.slot(idx).and_then(|slot| slot.evt_fn.clone());
        (conn, evt_fn, client)
    };

    debug!(core.log, "connection active"; "conn" => idx, "client" => client, "generation" => conn.generation());

    match evt_fn {
        Some(evt_fn) => {
            evt_fn(&ConnEvent::Active { conn, client });
        }
        None if !client => {
            // Inbound connection with nobody listening: refuse it.
            core.post_from_engine(Command::CloseConn { conn });
        }
        None => {}
    }
}

fn conn_closed(core: &Arc<Core>, idx: u8) {
    let (closed, abort_inflight) = {
        let mut state = core.lock();

        // A send or manual read against this slot can never complete now.
        let abort_inflight = match &state.inflight {
            Some(inflight) => match &inflight.msg.cmd {
                Command::Send { conn, .. } | Command::RecvData { conn, .. } => {
                    conn.index() == idx
                }
                _ => false,
            },
            None => false,
        };

        (state.conns.mark_closed(idx), abort_inflight)
    };

    if abort_inflight {
        core.signal_done(Err(DriverError::Closed));
    }

    if let Some((conn, evt_fn, forced)) = closed {
        debug!(core.log, "connection closed"; "conn" => idx, "forced" => forced);
        if let Some(evt_fn) = evt_fn {
            evt_fn(&ConnEvent::Closed { conn, forced });
        }
    }
}

/// Synchronous `+VERB:` replies, routed by the in-flight command, plus the
/// unsolicited short-form `+IPD` notification.
fn handle_sync(core: &Arc<Core>, line: &str) {
    // `+IPD,conn,avail` without payload: manual receive notification.
    if let Some(fields) = line.strip_prefix("+IPD,") {
        if let Some(hdr) = parser::parse_ipd_header(fields) {
            let fetch = {
                let mut state = core.lock();
                let manual = state.manual_receive;
                match state.conns.slot_mut(hdr.conn) {
                    Some(slot) if slot.active => {
                        slot.tcp_available = hdr.len;
                        if manual && !slot.receive_blocked && hdr.len > 0 {
                            Some((
                                ConnRef {
                                    idx: hdr.conn,
                                    val_id: slot.val_id,
                                },
                                hdr.len.min(CONN_MAX_DATA_LEN),
                            ))
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            };
            if let Some((conn, len)) = fetch {
                core.post_from_engine(Command::RecvData { conn, len });
            }
        }
        return;
    }

    let mut force_close: Vec<ConnRef> = Vec::new();
    {
        let mut state = core.lock();

        // +CIPRECVLEN can arrive as a solicited reply; it always updates the
        // per-slot counters.
        if line.starts_with("+CIPRECVLEN:") {
            let lens = parser::parse_ciprecvlen(line);
            for (idx, len) in lens.iter().enumerate() {
                if let (Some(len), Some(slot)) = (len, state.conns.slot_mut(idx as u8)) {
                    if slot.active {
                        slot.tcp_available = *len;
                    }
                }
            }
        }

        // Status rows touch the connection table, so they are handled before
        // the in-flight message is borrowed.
        let status_in_flight = matches!(
            state.inflight.as_ref().map(|inflight| &inflight.msg.cmd),
            Some(Command::Status)
        );
        if status_in_flight {
            if let Some(row) = parser::parse_cipstatus(line) {
                match state.conns.slot(row.num).map(|slot| slot.active) {
                    Some(true) => {
                        let slot = state.conns.slot_mut(row.num).expect("slot resolved");
                        slot.remote_ip = row.remote_ip;
                        slot.remote_port = row.remote_port;
                        slot.local_port = row.local_port;
                    }
                    Some(false) => {
                        // Radio believes this one is alive, we do not: force
                        // it closed to reconverge.
                        let val_id =
                            state.conns.slot(row.num).map(|slot| slot.val_id).unwrap_or(0);
                        force_close.push(ConnRef {
                            idx: row.num,
                            val_id,
                        });
                    }
                    None => {}
                }
            }
            drop(state);
            for conn in force_close {
                core.post_from_engine(Command::CloseConn { conn });
            }
            return;
        }

        let inflight = match &mut state.inflight {
            Some(inflight) => inflight,
            None => return,
        };
        let msg = &mut inflight.msg;

        match &msg.cmd {
            Command::Gmr => {
                if let Some(version) = parser::parse_version(line) {
                    let is_at = line.starts_with("AT version:");
                    match &mut msg.resp {
                        Response::Versions { at, sdk } => {
                            if is_at {
                                *at = Some(version);
                            } else {
                                *sdk = Some(version);
                            }
                        }
                        resp => {
                            *resp = Response::Versions {
                                at: if is_at { Some(version) } else { None },
                                sdk: if is_at { None } else { Some(version) },
                            };
                        }
                    }
                }
            }
            Command::ListAp { .. } => {
                if let Some(ap) = parser::parse_cwlap(line) {
                    match &mut msg.resp {
                        Response::ApList(list) => list.push(ap),
                        resp => *resp = Response::ApList(vec![ap]),
                    }
                }
            }
            Command::GetJoinedAp => {
                if let Some(ap) = parser::parse_cwjap_info(line) {
                    msg.resp = Response::JoinedAp(Some(ap));
                }
            }
            Command::JoinAp { .. } => {
                // `+CWJAP:<reason>` error detail ahead of the FAIL terminator.
                if let Some(rest) = line.strip_prefix("+CWJAP:") {
                    trace!(core.log, "join refused"; "reason" => rest);
                }
            }
            Command::StaGetIp | Command::ApGetIp => {
                let rest = line
                    .strip_prefix("+CIPSTA:")
                    .or_else(|| line.strip_prefix("+CIPAP:"));
                if let Some(rest) = rest {
                    if !matches!(msg.resp, Response::IpInfo(_)) {
                        msg.resp = Response::IpInfo(IpInfo::default());
                    }
                    if let Response::IpInfo(info) = &mut msg.resp {
                        if let Some(value) = rest.strip_prefix("ip:") {
                            info.ip = parser::Scanner::new(value).ip();
                        } else if let Some(value) = rest.strip_prefix("gateway:") {
                            info.gateway = parser::Scanner::new(value).ip();
                        } else if let Some(value) = rest.strip_prefix("netmask:") {
                            info.netmask = parser::Scanner::new(value).ip();
                        }
                    }
                }
            }
            Command::StaGetMac | Command::ApGetMac => {
                let rest = line
                    .strip_prefix("+CIPSTAMAC:")
                    .or_else(|| line.strip_prefix("+CIPAPMAC:"));
                if let Some(rest) = rest {
                    let mut info = IpInfo::default();
                    info.mac = parser::Scanner::new(rest).mac();
                    msg.resp = Response::IpInfo(info);
                }
            }
            Command::GetApConfig => {
                if let Some(config) = parser::parse_cwsap(line) {
                    msg.resp = Response::ApConfig(Some(config));
                }
            }
            Command::ListStations => {
                if let Some(entry) = parser::parse_cwlif(line) {
                    match &mut msg.resp {
                        Response::Stations(list) => list.push(entry),
                        resp => *resp = Response::Stations(vec![entry]),
                    }
                }
            }
            Command::GetHostname => {
                if let Some(hostname) = parser::parse_hostname(line) {
                    msg.resp = Response::Hostname(hostname);
                }
            }
            Command::GetDhcp => {
                if let Some((sta, ap)) = parser::parse_cwdhcp(line) {
                    msg.resp = Response::Dhcp { sta, ap };
                }
            }
            Command::DnsQuery { .. } => {
                if let Some(ip) = parser::parse_cipdomain(line) {
                    msg.resp = Response::DnsIp(Some(ip));
                }
            }
            Command::Ping { .. } => {
                if let Some(time) = parser::parse_ping_time(line) {
                    msg.resp = Response::PingTime(Some(time));
                }
            }
            Command::SntpGetCfg => {
                if let Some((enabled, timezone)) = parser::parse_sntp_cfg(line) {
                    msg.resp = Response::SntpCfg { enabled, timezone };
                }
            }
            Command::SntpTime => {
                if let Some(datetime) = parser::parse_sntp_time(line) {
                    msg.resp = Response::SntpTime(Some(datetime));
                }
            }
            Command::SntpGetInterval => {
                if let Some(interval) = parser::parse_sntp_interval(line) {
                    msg.resp = Response::SntpInterval(interval);
                }
            }
            Command::RecvLen => {
                msg.resp = Response::RecvLens(parser::parse_ciprecvlen(line));
            }
            Command::Cifsr => {
                if let Some(row) = parser::parse_cifsr(line) {
                    if !matches!(msg.resp, Response::Ifconfig { .. }) {
                        msg.resp = Response::Ifconfig {
                            sta: IpInfo::default(),
                            ap: IpInfo::default(),
                        };
                    }
                    if let Response::Ifconfig { sta, ap } = &mut msg.resp {
                        match row {
                            parser::CifsrRow::StaIp(ip) => sta.ip = Some(ip),
                            parser::CifsrRow::StaMac(mac) => sta.mac = Some(mac),
                            parser::CifsrRow::ApIp(ip) => ap.ip = Some(ip),
                            parser::CifsrRow::ApMac(mac) => ap.mac = Some(mac),
                        }
                    }
                }
            }
            _ => {
                trace!(core.log, "sync line with no consumer"; "line" => line);
            }
        }
    }
}
