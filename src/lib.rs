//! Busgate: a field gateway arbitrating one shared Modbus RTU bus
//!
//! The crate serializes every bus access through a single priority command
//! queue. A polling orchestrator reads all registered devices on a fixed
//! cycle, operators send direct commands through a gateway that refuses to
//! interleave with polling, and a watchdog restarts polling when it stops
//! without the operator asking for it.
//!
//! Services are built once through [`api::GatewayBuilder`]. The transport is
//! either a real serial port or a simulated bus, fixed by configuration.

pub mod api;
#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod protocol;

pub use api::*;
