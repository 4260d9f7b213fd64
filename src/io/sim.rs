//! Simulated hardware backends
//!
//! Lets the node binary run on a development machine with no board attached:
//! pins log their transitions, the echo line never answers (the ranger falls
//! back to its last good value), and the register bus behaves like an absent
//! chip (all-zero reads), which the protocol driver reports as repeated
//! timeouts / no-card cycles.

use crate::io::hal::{OutputPin, PulseInput, RegisterBus};
use std::time::Duration;
use tracing::debug;

/// Output pin that logs level changes.
pub struct SimPin {
    label: &'static str,
    level: bool,
}

impl SimPin {
    pub fn new(label: &'static str) -> Self {
        Self { label, level: false }
    }

    pub fn level(&self) -> bool {
        self.level
    }
}

impl OutputPin for SimPin {
    fn set(&mut self, high: bool) {
        if self.level != high {
            debug!(pin = self.label, high, "sim_pin_set");
        }
        self.level = high;
    }
}

/// Echo line with no reflector in front of it.
pub struct SimEcho;

impl PulseInput for SimEcho {
    fn measure_pulse(&mut self, _level: bool, _timeout: Duration) -> Option<Duration> {
        None
    }
}

/// Register bus with no chip on the other end.
pub struct SimRegisterBus;

impl RegisterBus for SimRegisterBus {
    fn write_reg(&mut self, _reg: u8, _value: u8) {}

    fn read_reg(&mut self, _reg: u8) -> u8 {
        0x00
    }
}
