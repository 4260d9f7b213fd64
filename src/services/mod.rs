//! Business logic: proximity classification, access decisions, control loop

pub mod access;
pub mod node;
pub mod proximity;

pub use access::{AccessEngine, AccessPolicy};
pub use node::Node;
pub use proximity::{Indicators, ProximityMonitor, RangeSensor, ZoneClassifier};
