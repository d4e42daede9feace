//! The public device handle.
//!
//! Owns the engine singleton: one radio, one serial line, two library
//! threads. Constructing a [`Device`] spawns the producer and processor;
//! dropping every handle (and feeder) lets them wind down.

use crossbeam_channel::{bounded, unbounded};
use std::sync::Arc;
use std::thread;

use flint::logging::{info, o, Logger};

use crate::cmd::Command;
use crate::config::{Options, CMD_QUEUE_LEN};
use crate::engine::{processor_loop, producer_loop, Core, Response};
use crate::port::{InputFeeder, SerialIo};
use crate::support::{DriverError, DriverResult};
use crate::types::{Event, EventFn, SwVersion, WifiMode};

/// Handle to one attached radio. Cheap to clone; all clones drive the same
/// engine.
#[derive(Clone)]
pub struct Device {
    core: Arc<Core>,
}

impl Device {
    /// Bring up the engine on the supplied serial transport. Threads are
    /// running when this returns; the radio itself is untouched until
    /// [`Device::initialize`].
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        serial: Box<dyn SerialIo>,
        opts: Options,
        log: L,
    ) -> Device {
        let log = match log.into() {
            Some(log) => log.new(o!("unit" => "skylink")),
            None => flint::logging::discard(),
        };

        let (cmd_tx, cmd_rx) = bounded(CMD_QUEUE_LEN);
        let (input_tx, input_rx) = unbounded();

        let core = Arc::new(Core::new(serial, opts, log, cmd_tx, input_tx));

        let producer_core = core.clone();
        thread::Builder::new()
            .name("skylink-producer".into())
            .spawn(move || producer_loop(producer_core, cmd_rx))
            .expect("Failed to spawn producer thread");

        let processor_core = core.clone();
        thread::Builder::new()
            .name("skylink-processor".into())
            .spawn(move || processor_loop(processor_core, input_rx))
            .expect("Failed to spawn processor thread");

        Device { core }
    }

    /// Cloneable ingestion handle for the platform's UART receive path.
    pub fn input_feeder(&self) -> InputFeeder {
        InputFeeder::new(self.core.input_tx.clone())
    }

    /// Push received bytes into the processor. Shorthand for going through
    /// [`Device::input_feeder`].
    pub fn input_process(&self, bytes: &[u8]) {
        let _ = self.core.input_tx.send(bytes.to_vec().into_boxed_slice());
    }

    /// Reset the radio and replay the baseline configuration: echo off,
    /// station mode, connection multiplexing, remote-endpoint reporting,
    /// manual receive when configured, firmware version gate and the
    /// optional link rate raise.
    pub fn initialize(&self) -> DriverResult<()> {
        self.run_unit(Command::Reset)?;
        self.apply_baseline()?;

        info!(self.core.log, "device initialized";
              "at_version" => self.at_version().map(|v| v.to_string()).unwrap_or_default(),
              "supported" => self.at_version_supported());
        Ok(())
    }

    /// Blocking device reset. Aborts the in-flight command, drops every
    /// connection and re-applies the baseline configuration.
    pub fn reset(&self) -> DriverResult<()> {
        self.run_unit(Command::Reset)?;
        self.apply_baseline()
    }

    /// Vendor factory restore followed by re-initialization.
    pub fn restore(&self) -> DriverResult<()> {
        self.run_unit(Command::Restore)?;
        self.apply_baseline()
    }

    fn apply_baseline(&self) -> DriverResult<()> {
        self.run_unit(Command::EchoOff)?;
        self.run_unit(Command::SetWifiMode {
            mode: WifiMode::Station,
        })?;
        self.run_unit(Command::Mux { enable: true })?;
        self.run_unit(Command::Dinfo { enable: true })?;
        if self.core.opts.manual_tcp_receive {
            self.run_unit(Command::RecvMode { manual: true })?;
        }
        self.run_unit(Command::Gmr)?;
        if let Some(baud) = self.core.opts.target_baudrate {
            self.run_unit(Command::UartCur { baud })?;
        }
        Ok(())
    }

    /// Probe the radio with a bare `AT`.
    pub fn probe(&self) -> DriverResult<()> {
        self.run_unit(Command::CheckAt)
    }

    /// Platform notification about the radio's presence line. Loss completes
    /// everything pending with [`DriverError::NoDevice`] and is broadcast to
    /// all subscribers.
    pub fn set_present(&self, present: bool) {
        self.core.set_present(present);
    }

    pub fn is_present(&self) -> bool {
        self.core.is_present()
    }

    /// AT firmware version detected during initialization.
    pub fn at_version(&self) -> Option<SwVersion> {
        self.core.lock().at_version
    }

    /// Whether the detected firmware satisfies the configured minimum.
    pub fn at_version_supported(&self) -> bool {
        self.core.lock().at_version_ok
    }

    pub fn is_wifi_connected(&self) -> bool {
        self.core.lock().wifi_connected
    }

    pub fn has_ip(&self) -> bool {
        self.core.lock().has_ip
    }

    /// Subscribe to device events. The returned token unregisters.
    pub fn register_event(&self, callback: EventFn) -> usize {
        self.core.events.register(callback)
    }

    pub fn unregister_event(&self, id: usize) {
        self.core.events.unregister(id);
    }

    /// Emit an event to all subscribers (used by tests and demos).
    #[doc(hidden)]
    pub fn dispatch_event(&self, event: &Event) {
        self.core.events.dispatch(event);
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Run a command expecting no payload in the response.
    pub(crate) fn run_unit(&self, cmd: Command) -> DriverResult<()> {
        self.core.run(cmd).map(|_| ())
    }

    pub(crate) fn run(&self, cmd: Command) -> DriverResult<Response> {
        self.core.run(cmd)
    }

    pub(crate) fn argument_error<T>() -> DriverResult<T> {
        Err(DriverError::Argument)
    }
}
