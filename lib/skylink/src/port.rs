//! The platform boundary: the driver never opens devices itself, it talks to
//! whatever serial transport the embedder hands it and is fed received bytes
//! through [`InputFeeder`].

use crossbeam_channel::Sender;
use std::io;

/// Serial transport supplied by the platform.
///
/// Only the producer thread calls `send`; the receive direction is pushed in
/// through [`InputFeeder`] from whatever context the platform reads the UART.
pub trait SerialIo: Send {
    /// Write bytes to the radio. Must return only after all bytes are queued
    /// into the transmit path.
    fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Drive the radio's hardware reset pin. Returns `false` when the board
    /// has no reset wiring, in which case the driver falls back to `AT+RST`.
    fn reset_line(&mut self, _assert: bool) -> bool {
        false
    }

    /// Reconfigure the link baudrate after the radio accepted `AT+UART_CUR`.
    fn set_baudrate(&mut self, _baud: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Cloneable handle for pushing received UART bytes into the processor
/// thread. Safe to call from any thread, including interrupt bottom halves;
/// it never blocks on the parser.
#[derive(Clone)]
pub struct InputFeeder {
    tx: Sender<Box<[u8]>>,
}

impl InputFeeder {
    pub(crate) fn new(tx: Sender<Box<[u8]>>) -> InputFeeder {
        InputFeeder { tx }
    }

    /// Feed a chunk of received bytes. Chunk boundaries are arbitrary; the
    /// parser reassembles lines and binary payloads across them.
    pub fn feed(&self, bytes: &[u8]) {
        // Send fails only when the processor thread is gone, which means the
        // device handle was dropped; late UART bytes are then irrelevant.
        let _ = self.tx.send(bytes.to_vec().into_boxed_slice());
    }
}
