pub mod error;
pub mod modbus;
pub mod transaction;
pub mod transport;
