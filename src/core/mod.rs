//! Configuration, logging, persistence and task helpers
//!
//! Nothing in here touches the bus. The api services depend on these
//! modules; these modules only depend on `protocol` types.
pub mod config;
pub mod logs;
pub mod persistence;
pub mod task_manager;

pub use config::GatewayConfig;
pub use logs::{EventSink, GatewayEvent, LogEventSink, MemoryEventSink};
