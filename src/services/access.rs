//! Access decision and actuation engine
//!
//! Turns a resolved card UID into an authorization decision and a
//! physical/network effect, exactly once per physical presentation:
//! - debounce: the same UID re-read within the window is suppressed
//! - authorization: static allow-list; the empty-list allow-all branch
//!   is gated by an explicit config flag and logged loudly at startup
//! - ordering: detect, publish the detection event (best-effort),
//!   actuate if allowed, publish the resulting status (best-effort);
//!   a publish failure never prevents or delays the pulse
//!
//! The actuation pulse holds the loop for seconds, so its timing runs
//! through the bus client's `pump` to keep the session serviced.

use crate::domain::{CardUid, DetectionEvent, LockState};
use crate::infra::config::Topics;
use crate::infra::Metrics;
use crate::io::bus::{BusClient, BusTransport};
use crate::io::hal::OutputPin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Static UID allow-list, immutable at runtime.
pub struct AccessPolicy {
    allow_list: Vec<CardUid>,
    allow_all_when_empty: bool,
}

impl AccessPolicy {
    pub fn new(allow_list: Vec<CardUid>, allow_all_when_empty: bool) -> Self {
        if allow_list.is_empty() {
            if allow_all_when_empty {
                warn!("allow_list_empty_all_cards_accepted");
            } else {
                warn!("allow_list_empty_all_cards_denied");
            }
        } else {
            info!(entries = allow_list.len(), "allow_list_loaded");
        }
        Self { allow_list, allow_all_when_empty }
    }

    pub fn is_allowed(&self, uid: &CardUid) -> bool {
        if self.allow_list.is_empty() {
            self.allow_all_when_empty
        } else {
            self.allow_list.contains(uid)
        }
    }
}

pub struct AccessEngine<P: OutputPin> {
    lock: P,
    policy: AccessPolicy,
    topics: Topics,
    pulse: Duration,
    debounce_ms: u64,
    metrics: Arc<Metrics>,
    last_uid: Option<CardUid>,
    last_trigger_ms: Option<u64>,
}

impl<P: OutputPin> AccessEngine<P> {
    pub fn new(
        lock: P,
        policy: AccessPolicy,
        topics: Topics,
        pulse: Duration,
        debounce_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            lock,
            policy,
            topics,
            pulse,
            debounce_ms,
            metrics,
            last_uid: None,
            last_trigger_ms: None,
        }
    }

    /// Handle one resolved card presence. `now_ms` is a monotonic tick
    /// supplied by the control loop.
    pub async fn on_card<T: BusTransport>(
        &mut self,
        bus: &mut BusClient<T>,
        uid: CardUid,
        now_ms: u64,
    ) {
        if self.is_debounced(&uid, now_ms) {
            debug!(uid = %uid, "card_debounced");
            self.metrics.record_debounced();
            return;
        }
        self.last_uid = Some(uid);
        self.last_trigger_ms = Some(now_ms);

        let allowed = self.policy.is_allowed(&uid);
        self.metrics.record_detection(allowed);
        info!(uid = %uid, allowed, "card_detected");

        let event = DetectionEvent { uid, ts: now_ms, allowed };
        match serde_json::to_string(&event.payload()) {
            Ok(json) => self.best_effort(bus, &self.topics.rfid, json.as_bytes()).await,
            Err(e) => warn!(error = %e, "detection_encode_failed"),
        }
        let audit = if allowed {
            format!("access granted uid={uid}")
        } else {
            format!("access denied uid={uid}")
        };
        self.best_effort(bus, &self.topics.event, audit.as_bytes()).await;

        if allowed {
            self.pulse_lock(bus).await;
            self.publish_status(bus, LockState::Open).await;
        } else {
            self.publish_status(bus, LockState::Closed).await;
        }
    }

    /// Remote request to trigger the lock; no debounce or allow-list.
    pub async fn on_remote_open<T: BusTransport>(&mut self, bus: &mut BusClient<T>) {
        info!("remote_open");
        self.best_effort(bus, &self.topics.event, b"remote open request").await;
        self.pulse_lock(bus).await;
        self.publish_status(bus, LockState::Open).await;
    }

    /// The solenoid is pulse-only; CLOSE is acknowledged without
    /// energizing anything.
    pub async fn on_remote_close<T: BusTransport>(&mut self, bus: &mut BusClient<T>) {
        info!("remote_close");
        self.publish_status(bus, LockState::Closed).await;
    }

    fn is_debounced(&self, uid: &CardUid, now_ms: u64) -> bool {
        match (&self.last_uid, self.last_trigger_ms) {
            (Some(last), Some(trigger_ms)) => {
                *last == *uid && now_ms.saturating_sub(trigger_ms) < self.debounce_ms
            }
            _ => false,
        }
    }

    /// Energize the actuator for the configured pulse, servicing the bus
    /// for the whole duration instead of sleeping.
    async fn pulse_lock<T: BusTransport>(&mut self, bus: &mut BusClient<T>) {
        info!(pulse_ms = self.pulse.as_millis() as u64, "lock_pulse");
        self.lock.set(true);
        bus.pump(self.pulse).await;
        self.lock.set(false);
        self.metrics.record_pulse();
    }

    async fn publish_status<T: BusTransport>(&self, bus: &mut BusClient<T>, state: LockState) {
        self.best_effort(bus, &self.topics.status, state.as_str().as_bytes()).await;
    }

    async fn best_effort<T: BusTransport>(
        &self,
        bus: &mut BusClient<T>,
        topic: &str,
        payload: &[u8],
    ) {
        if let Err(e) = bus.publish(topic, payload).await {
            self.metrics.record_publish_failure();
            warn!(topic, error = %e, "publish_dropped");
        }
    }
}
