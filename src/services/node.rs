//! Single-threaded control loop
//!
//! One iteration: service the bus, drain queued remote commands, poll
//! the proximity classifier, poll the card reader, hand any new card to
//! the access engine. Iteration pacing runs through `pump` so the bus
//! session stays serviced between passes. No error in any stage ever
//! escalates to termination; the node keeps looping and sensing.

use crate::domain::BusCommand;
use crate::infra::config::Topics;
use crate::infra::Metrics;
use crate::io::bus::{BusClient, BusMessage, BusTransport};
use crate::io::hal::{OutputPin, PulseInput, RegisterBus};
use crate::io::rc522::CardReader;
use crate::services::access::AccessEngine;
use crate::services::proximity::ProximityMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause between loop iterations, serviced rather than slept.
const LOOP_PACE: Duration = Duration::from_millis(100);
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub struct Node<T, B, TP, E, L, LK>
where
    T: BusTransport,
    B: RegisterBus,
    TP: OutputPin,
    E: PulseInput,
    L: OutputPin,
    LK: OutputPin,
{
    bus: BusClient<T>,
    reader: CardReader<B>,
    proximity: ProximityMonitor<TP, E, L>,
    engine: AccessEngine<LK>,
    topics: Topics,
    metrics: Arc<Metrics>,
    started: Instant,
    last_report: Instant,
}

impl<T, B, TP, E, L, LK> Node<T, B, TP, E, L, LK>
where
    T: BusTransport,
    B: RegisterBus,
    TP: OutputPin,
    E: PulseInput,
    L: OutputPin,
    LK: OutputPin,
{
    pub fn new(
        bus: BusClient<T>,
        reader: CardReader<B>,
        proximity: ProximityMonitor<TP, E, L>,
        engine: AccessEngine<LK>,
        topics: Topics,
        metrics: Arc<Metrics>,
    ) -> Self {
        let now = Instant::now();
        Self { bus, reader, proximity, engine, topics, metrics, started: now, last_report: now }
    }

    /// Bring the session up and loop forever.
    pub async fn run(&mut self) {
        self.bus.connect().await;
        let online_topic = self.topics.event.clone();
        if let Err(e) = self.bus.publish(&online_topic, b"node online").await {
            warn!(error = %e, "online_announcement_dropped");
        }
        info!("node_running");
        loop {
            self.tick().await;
            self.bus.pump(LOOP_PACE).await;
        }
    }

    /// One loop iteration. Bus servicing always comes first so later
    /// stages can never starve the heartbeat.
    pub async fn tick(&mut self) {
        self.bus.service().await;

        while let Some(msg) = self.bus.pop_inbound() {
            self.handle_message(msg).await;
        }

        let zone_before = self.proximity.zone();
        self.proximity.poll().await;
        if self.proximity.zone() != zone_before {
            self.metrics.record_zone_change();
        }

        if let Some(uid) = self.reader.poll_card() {
            let now_ms = self.started.elapsed().as_millis() as u64;
            self.engine.on_card(&mut self.bus, uid, now_ms).await;
        }

        if self.last_report.elapsed() >= REPORT_INTERVAL {
            self.metrics.report().log();
            self.last_report = Instant::now();
        }
    }

    async fn handle_message(&mut self, msg: BusMessage) {
        if msg.topic == self.topics.cmd {
            match BusCommand::parse_cmd(&msg.payload) {
                Some(BusCommand::Open) => {
                    self.metrics.record_remote_command();
                    self.engine.on_remote_open(&mut self.bus).await;
                }
                Some(BusCommand::Close) => {
                    self.metrics.record_remote_command();
                    self.engine.on_remote_close(&mut self.bus).await;
                }
                _ => warn!(payload = %msg.payload, "command_unparsed"),
            }
        } else if msg.topic == self.topics.sensor {
            match BusCommand::parse_sensor(&msg.payload) {
                Some(BusCommand::SensorOn) => {
                    self.metrics.record_remote_command();
                    self.proximity.set_enabled(true);
                }
                Some(BusCommand::SensorOff) => {
                    self.metrics.record_remote_command();
                    self.proximity.set_enabled(false);
                }
                _ => warn!(payload = %msg.payload, "sensor_command_unparsed"),
            }
        } else {
            debug!(topic = %msg.topic, "message_ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bus::BusError;
    use crate::io::sim::{SimEcho, SimPin, SimRegisterBus};
    use crate::services::access::AccessPolicy;
    use crate::services::proximity::{Indicators, RangeSensor, ZoneClassifier};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        inbound: VecDeque<BusMessage>,
        published: Vec<(String, String)>,
    }

    #[async_trait]
    impl BusTransport for ScriptedTransport {
        async fn connect(&mut self) -> Result<(), BusError> {
            Ok(())
        }

        async fn subscribe(&mut self, _topic: &str) -> Result<(), BusError> {
            Ok(())
        }

        async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
            self.published.push((topic.to_string(), String::from_utf8_lossy(payload).into()));
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), BusError> {
            Ok(())
        }

        async fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
            if let Some(msg) = self.inbound.pop_front() {
                return Ok(Some(msg));
            }
            tokio::time::sleep(timeout).await;
            Ok(None)
        }
    }

    type SimNode = Node<ScriptedTransport, SimRegisterBus, SimPin, SimEcho, SimPin, SimPin>;

    fn node(inbound: Vec<BusMessage>) -> SimNode {
        let topics = Topics::new("casa/tranca");
        let metrics = Arc::new(Metrics::new());
        let transport =
            ScriptedTransport { inbound: inbound.into(), published: Vec::new() };
        let bus = BusClient::new(
            transport,
            topics.subscriptions(),
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        let reader = CardReader::new(SimRegisterBus);
        let proximity = ProximityMonitor::new(
            RangeSensor::new(SimPin::new("trig"), SimEcho),
            ZoneClassifier::new(5.0, 12.0, 1.0),
            Indicators::new(
                SimPin::new("led_near"),
                SimPin::new("led_mid"),
                SimPin::new("led_far"),
                SimPin::new("buzzer"),
            ),
        );
        let engine = AccessEngine::new(
            SimPin::new("lock"),
            AccessPolicy::new(vec![], true),
            topics.clone(),
            Duration::from_millis(100),
            1500,
            metrics.clone(),
        );
        Node::new(bus, reader, proximity, engine, topics, metrics)
    }

    fn cmd(payload: &str) -> BusMessage {
        BusMessage { topic: "casa/tranca/cmd".into(), payload: payload.into() }
    }

    fn statuses(node: &SimNode) -> Vec<String> {
        node.bus
            .transport_ref()
            .published
            .iter()
            .filter(|(t, _)| t == "casa/tranca/status")
            .map(|(_, p)| p.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_open_command_reports_open() {
        let mut node = node(vec![cmd("OPEN")]);
        node.bus.connect().await;
        node.tick().await;
        assert_eq!(statuses(&node), vec!["OPEN"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_command_reports_closed() {
        let mut node = node(vec![cmd("0")]);
        node.bus.connect().await;
        node.tick().await;
        assert_eq!(statuses(&node), vec!["CLOSED"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_command_is_ignored() {
        let mut node = node(vec![cmd("FROB")]);
        node.bus.connect().await;
        node.tick().await;
        assert!(statuses(&node).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_command_toggles_proximity() {
        let off = BusMessage { topic: "casa/tranca/sensor".into(), payload: "OFF".into() };
        let mut node = node(vec![off]);
        node.bus.connect().await;
        assert!(node.proximity.enabled());
        node.tick().await;
        assert!(!node.proximity.enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_field_produces_no_detection() {
        let mut node = node(vec![]);
        node.bus.connect().await;
        node.tick().await;
        assert_eq!(node.metrics.detections_total(), 0);
        assert!(statuses(&node).is_empty());
    }
}
