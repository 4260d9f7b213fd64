//! Shared types for the access node

use serde::{Deserialize, Serialize};

/// Length of a card UID in bytes.
///
/// Single-size cascade level 1 UIDs only; the anticollision response carries
/// these four bytes plus an XOR check byte.
pub const UID_LEN: usize = 4;

/// Newtype wrapper for card UIDs to provide type safety
///
/// Two UIDs are equal iff their byte sequences are equal. The canonical
/// rendering is uppercase hex, zero-padded, no separators (8 chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CardUid(pub [u8; UID_LEN]);

impl CardUid {
    /// Parse from the canonical 8-char hex rendering (case-insensitive).
    pub fn parse_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; UID_LEN];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for CardUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// One accepted card presentation
///
/// Produced at most once per physical presentation (debounced), consumed
/// within the same loop iteration, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionEvent {
    pub uid: CardUid,
    /// Monotonic milliseconds since node start.
    pub ts: u64,
    pub allowed: bool,
}

impl DetectionEvent {
    pub fn payload(&self) -> DetectionPayload {
        DetectionPayload { uid: self.uid.to_string(), allowed: self.allowed, ts: self.ts }
    }
}

/// Wire payload for `<prefix>/rfid`
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub uid: String,
    pub allowed: bool,
    pub ts: u64,
}

/// Discretized proximity state derived from the filtered distance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Near,
    Mid,
    Far,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Near => "near",
            Zone::Mid => "mid",
            Zone::Far => "far",
        }
    }
}

/// Lock actuator status as published on `<prefix>/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Open,
    Closed,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Open => "OPEN",
            LockState::Closed => "CLOSED",
        }
    }
}

/// Inbound remote command, parsed from subscribed topic payloads
///
/// Payload matching mirrors the deployed controllers: `OPEN`/`1` and
/// `CLOSE`/`0` for the lock, `ON`/`1` and `OFF`/`0` for the ranger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCommand {
    Open,
    Close,
    SensorOn,
    SensorOff,
}

impl BusCommand {
    /// Parse a command from a `cmd` topic payload. Unknown payloads are ignored.
    pub fn parse_cmd(payload: &str) -> Option<Self> {
        match payload.trim().to_ascii_uppercase().as_str() {
            "OPEN" | "1" => Some(Self::Open),
            "CLOSE" | "0" => Some(Self::Close),
            _ => None,
        }
    }

    /// Parse a command from a `sensor` topic payload.
    pub fn parse_sensor(payload: &str) -> Option<Self> {
        match payload.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" => Some(Self::SensorOn),
            "OFF" | "0" => Some(Self::SensorOff),
            _ => None,
        }
    }
}
