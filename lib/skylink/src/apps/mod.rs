//! Integration contracts for application modules layered on the netconn API.

pub mod http;
pub mod mqtt;
