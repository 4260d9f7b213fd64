//! Hardware abstraction traits
//!
//! The node core never touches pins or bus registers directly; it goes
//! through these seams so the same logic runs against real GPIO backends,
//! the simulated backends in [`crate::io::sim`], and the scripted fakes in
//! unit tests.
//!
//! Register and pin I/O is modeled as infallible: the reader chip sits on a
//! local SPI-style bus whose transfers either happen or the whole node is
//! dead, and protocol-level faults are reported by the chip's own status
//! registers, not by the wires.

use std::time::Duration;

/// A single digital output line (LED, buzzer gate, lock MOSFET, trigger pin).
pub trait OutputPin {
    fn set(&mut self, high: bool);
}

/// An input line that can time a pulse (ultrasonic echo).
pub trait PulseInput {
    /// Wait for a pulse at `level` and return its duration, or `None` if no
    /// complete pulse is seen within `timeout`.
    fn measure_pulse(&mut self, level: bool, timeout: Duration) -> Option<Duration>;
}

/// Byte-oriented register bus to the reader chip.
///
/// One transfer is one register access: the implementation owns chip-select
/// and the address framing (`(reg << 1) & 0x7E`, bit7 set for reads).
pub trait RegisterBus {
    fn write_reg(&mut self, reg: u8, value: u8);
    fn read_reg(&mut self, reg: u8) -> u8;
}

/// Read flag in the register address byte.
pub const REG_READ_BIT: u8 = 0x80;

/// Build the address byte of a register transfer.
///
/// The chip expects the register address left-shifted by one, bit0 clear;
/// bit7 set marks a read. SPI-backed `RegisterBus` implementations send this
/// byte followed by the value byte (write) or one clocked-out byte (read).
pub fn register_frame(reg: u8, read: bool) -> u8 {
    let addr = (reg << 1) & 0x7E;
    if read {
        addr | REG_READ_BIT
    } else {
        addr
    }
}
