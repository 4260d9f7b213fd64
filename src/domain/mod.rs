//! Domain models - core access-control types
//!
//! This module contains the canonical data types used throughout the node:
//! - `CardUid` - contactless card identifier with canonical hex rendering
//! - `DetectionEvent` - one accepted card presentation
//! - `Zone` - discretized proximity state (NEAR/MID/FAR)
//! - `LockState` - lock actuator status as published on the bus
//! - `BusCommand` - inbound remote commands

pub mod types;

// Re-export commonly used types at module level
pub use types::{BusCommand, CardUid, DetectionEvent, DetectionPayload, LockState, Zone};
