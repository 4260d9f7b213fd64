//! MQTT transport over rumqttc
//!
//! Implements [`BusTransport`] on top of an `AsyncClient` + `EventLoop`
//! pair. rumqttc only makes protocol progress while its event loop is
//! polled, so every operation here drives the loop: `connect` until the
//! ConnAck, `subscribe` until the SubAck, `poll` until a publish arrives
//! or the timeout elapses. Publishes that arrive while we are waiting for
//! an ack are buffered and handed out by the next `poll` call.

use crate::io::bus::{BusError, BusMessage, BusTransport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded number of event-loop polls while waiting for a ConnAck/SubAck.
const ACK_POLL_BUDGET: usize = 32;
/// rumqttc request channel capacity.
const REQUEST_CAP: usize = 64;

pub struct MqttTransport {
    options: MqttOptions,
    conn: Option<(AsyncClient, EventLoop)>,
    pending: VecDeque<BusMessage>,
}

impl MqttTransport {
    pub fn new(
        host: &str,
        port: u16,
        client_id: &str,
        credentials: Option<(String, String)>,
        keep_alive: Duration,
    ) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(keep_alive);
        options.set_clean_session(true);
        if let Some((user, pass)) = credentials {
            options.set_credentials(user, pass);
        }
        Self { options, conn: None, pending: VecDeque::new() }
    }

    fn conn_mut(&mut self) -> Result<(&AsyncClient, &mut EventLoop), BusError> {
        match &mut self.conn {
            Some((client, eventloop)) => Ok((client, eventloop)),
            None => Err(BusError::NotConnected),
        }
    }

    fn buffer_publish(pending: &mut VecDeque<BusMessage>, publish: rumqttc::Publish) {
        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
        pending.push_back(BusMessage { topic: publish.topic, payload });
    }

    /// Drive the event loop until `is_ack` matches an incoming packet.
    /// Publishes seen along the way are buffered, never dropped.
    async fn drive_until(
        &mut self,
        what: &str,
        is_ack: impl Fn(&Packet) -> bool,
    ) -> Result<(), BusError> {
        for _ in 0..ACK_POLL_BUDGET {
            let (_, eventloop) = self.conn_mut()?;
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    Self::buffer_publish(&mut self.pending, publish);
                }
                Ok(Event::Incoming(packet)) if is_ack(&packet) => return Ok(()),
                Ok(event) => debug!(?event, "mqtt_event"),
                Err(e) => {
                    self.conn = None;
                    return Err(BusError::Transport(e.to_string()));
                }
            }
        }
        self.conn = None;
        Err(BusError::Transport(format!("no {what} within poll budget")))
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), BusError> {
        self.conn = Some(AsyncClient::new(self.options.clone(), REQUEST_CAP));
        self.drive_until("connack", |p| matches!(p, Packet::ConnAck(_))).await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        let (client, _) = self.conn_mut()?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        self.drive_until("suback", |p| matches!(p, Packet::SubAck(_))).await
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let (client, eventloop) = self.conn_mut()?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        // One poll to flush the write; QoS 0 has no ack to wait for.
        match tokio::time::timeout(Duration::from_millis(50), eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                Self::buffer_publish(&mut self.pending, publish);
                Ok(())
            }
            Ok(Ok(_)) | Err(_) => Ok(()),
            Ok(Err(e)) => {
                self.conn = None;
                Err(BusError::Transport(e.to_string()))
            }
        }
    }

    async fn ping(&mut self) -> Result<(), BusError> {
        // The event loop emits PingReq itself once the keepalive interval
        // passes; probing liveness means giving it a chance to run.
        let (_, eventloop) = self.conn_mut()?;
        match tokio::time::timeout(Duration::from_millis(50), eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                Self::buffer_publish(&mut self.pending, publish);
                Ok(())
            }
            Ok(Ok(_)) | Err(_) => Ok(()),
            Ok(Err(e)) => {
                warn!(error = %e, "mqtt_ping_poll_failed");
                self.conn = None;
                Err(BusError::Transport(e.to_string()))
            }
        }
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        let (_, eventloop) = self.conn_mut()?;
        match tokio::time::timeout(timeout, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                Ok(Some(BusMessage { topic: publish.topic, payload }))
            }
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) => {
                self.conn = None;
                Err(BusError::Transport(e.to_string()))
            }
            Err(_) => Ok(None),
        }
    }
}
