//! locknode - physical-access node control core
//!
//! Decides, from a contactless-card tap and an ultrasonic proximity
//! reading, whether to energize a lock actuator, and mirrors that
//! decision on local indicators and an MQTT bus.
//!
//! Module structure:
//! - `domain/` - Core types (CardUid, DetectionEvent, Zone, commands)
//! - `io/` - External interfaces (register bus, card reader, bus client, MQTT)
//! - `services/` - Business logic (Proximity, Access engine, control loop)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use locknode::infra::{Config, Metrics};
use locknode::io::mqtt::MqttTransport;
use locknode::io::sim::{SimEcho, SimPin, SimRegisterBus};
use locknode::io::{BusClient, CardReader};
use locknode::services::{
    AccessEngine, AccessPolicy, Indicators, Node, ProximityMonitor, RangeSensor, ZoneClassifier,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// locknode - card and proximity driven lock controller
#[derive(Parser, Debug)]
#[command(name = "locknode", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Log level via RUST_LOG env var; default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("locknode starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        topic_prefix = %config.topic_prefix(),
        allow_list_entries = %config.allow_list().len(),
        pulse_ms = %config.pulse().as_millis(),
        debounce_ms = %config.debounce_ms(),
        "config_loaded"
    );

    let topics = config.topics();
    let metrics = Arc::new(Metrics::new());

    let transport = MqttTransport::new(
        config.mqtt_host(),
        config.mqtt_port(),
        config.mqtt_client_id(),
        config.mqtt_credentials(),
        config.keepalive(),
    );
    let bus = BusClient::new(
        transport,
        topics.subscriptions(),
        config.keepalive(),
        config.reconnect_backoff(),
    );

    // Simulated hardware backends; a deployment swaps these for real
    // pin and register-bus drivers behind the same traits.
    let mut reader = CardReader::new(SimRegisterBus);
    reader.init();

    let mut proximity = ProximityMonitor::new(
        RangeSensor::new(SimPin::new("trigger"), SimEcho),
        ZoneClassifier::new(config.t_near_cm(), config.t_far_cm(), config.hysteresis_cm()),
        Indicators::new(
            SimPin::new("led_near"),
            SimPin::new("led_mid"),
            SimPin::new("led_far"),
            SimPin::new("buzzer"),
        ),
    );
    if !config.proximity_enabled() {
        proximity.set_enabled(false);
    }

    let policy = AccessPolicy::new(config.allow_list(), config.allow_all_when_empty());
    let engine = AccessEngine::new(
        SimPin::new("lock"),
        policy,
        topics.clone(),
        config.pulse(),
        config.debounce_ms(),
        metrics.clone(),
    );

    let mut node = Node::new(bus, reader, proximity, engine, topics, metrics);
    node.run().await;
}
