//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `hal` - hardware abstraction traits (pins, echo pulses, register bus)
//! - `sim` - simulated hardware backends for running without a board
//! - `rc522` - register-level contactless reader protocol driver
//! - `bus` - resilient message-bus client with cooperative pump
//! - `mqtt` - rumqttc-backed bus transport

pub mod bus;
pub mod hal;
pub mod mqtt;
pub mod rc522;
pub mod sim;

// Re-export commonly used types
pub use bus::{BusClient, BusError, BusMessage, BusTransport};
pub use hal::{OutputPin, PulseInput, RegisterBus};
pub use mqtt::MqttTransport;
pub use rc522::{CardReader, ProtocolError};
