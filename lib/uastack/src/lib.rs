#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! The wire between an application and its OPC UA peers: a cooperative
//! event loop (timers, delayed callbacks, fd polling), a TCP connection
//! manager on top of it, and the SecureChannel implementing the binary
//! protocol's framing, chunking, crypto pipelines and message assembly.

pub mod buffer;
pub mod channel;
pub mod delayed;
pub mod eventloop;
pub mod frame;
pub mod support;
pub mod tcp;
pub mod testing;
pub mod timer;
