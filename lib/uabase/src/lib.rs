#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Base library for the OPC UA communication stack: status codes, the
//! 100-nanosecond time domain, wire-level primitive types, endpoint urls,
//! the security-policy abstraction and logging setup.

pub mod logging;
pub mod security;
pub mod status;
pub mod time;
pub mod types;
pub mod url;

/// The OPC UA TCP protocol version implemented by this stack.
pub const PROTOCOL_VERSION: u32 = 0;

/// Default port for opc.tcp endpoints.
pub const DEFAULT_PORT: u16 = 4840;
