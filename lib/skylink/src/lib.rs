//! Host-side driver for tethered AT-command Wi-Fi radios.
//!
//! The radio is an external MCU running a vendor AT firmware on the far end
//! of a UART. This crate turns that serial dialogue into a usable network
//! stack: join access points, open TCP/UDP/SSL connections, exchange
//! payloads, resolve names and keep time, through either the event-driven
//! connection callbacks or the sequential [`netconn::Netconn`] API.
//!
//! The embedder supplies the serial transport (a [`port::SerialIo`]
//! implementation) and feeds received bytes through [`port::InputFeeder`].
//! Everything else lives here: the producer/processor thread pair, command
//! sequencing, response parsing and connection bookkeeping.

#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod apps;
pub mod config;
pub mod netconn;
pub mod pbuf;
pub mod port;
pub mod station;
pub mod support;
pub mod types;

mod api;
mod buffer;
mod cmd;
mod conn;
mod device;
mod engine;
mod events;
mod parser;

pub use conn::{ConnEvent, ConnEvtFn, ConnRef};
pub use device::Device;
pub use support::{DriverError, DriverResult, EvtReply};

pub mod prelude {
    pub use crate::config::Options;
    pub use crate::conn::{ConnEvent, ConnRef};
    pub use crate::netconn::Netconn;
    pub use crate::pbuf::Pbuf;
    pub use crate::port::{InputFeeder, SerialIo};
    pub use crate::support::{DriverError, DriverResult, EvtReply};
    pub use crate::types::{ConnStartOptions, ConnType, Event, Ip, Mac, WifiMode};
    pub use crate::Device;
}
