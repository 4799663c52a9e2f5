//! Modbus-RTU sensor buses.

pub mod bus;
pub mod config;
pub mod decode;
pub mod manager;
