//! MQTT implementation of [`MessageBus`].
//!
//! The event loop is owned by the bus rather than spawned: `flush` drives it
//! until every produced message is written (QoS 0) or acknowledged (QoS 1),
//! then disconnects. One bus serves one run.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::{DeliveryReport, MessageBus};
use crate::config::MqttConfig;
use crate::error::{PipelineError, Result};

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

pub struct MqttBus {
    client: AsyncClient,
    eventloop: EventLoop,
    qos: QoS,
    /// Produced but not yet written to the socket, in produce order.
    queued: VecDeque<String>,
    /// Written and waiting for PubAck, keyed by packet id.
    inflight: HashMap<u16, String>,
}

/// Maps the configured QoS number onto the levels this relay supports.
pub(crate) fn qos_level(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        other => Err(PipelineError::Config(format!("unsupported MQTT QoS {other}"))),
    }
}

/// Connection options shared by the publisher and the consumer. `role` keeps
/// their client ids apart when both run against the same broker.
pub(crate) fn mqtt_options(config: &MqttConfig, role: &str) -> MqttOptions {
    let client_id = format!("{}-{role}-{}", config.client_id, std::process::id());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    options
}

impl MqttBus {
    /// Prepares a client. Nothing touches the network until the first flush.
    pub fn new(config: &MqttConfig) -> Result<Self> {
        let qos = qos_level(config.qos)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options(config, "publisher"), 16);

        Ok(Self {
            client,
            eventloop,
            qos,
            queued: VecDeque::new(),
            inflight: HashMap::new(),
        })
    }

    fn settle(&mut self, reason: &str, reports: &mut Vec<DeliveryReport>) {
        for topic in self.queued.drain(..).chain(self.inflight.drain().map(|(_, t)| t)) {
            reports.push(DeliveryReport::Failed {
                topic,
                reason: reason.to_string(),
            });
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "mqtt_disconnect_request_failed");
            return;
        }
        let deadline = Instant::now() + DISCONNECT_GRACE;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(_)) => {}
            }
        }
        debug!("mqtt_disconnected");
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn produce(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish_bytes(topic, self.qos, false, payload)
            .await
            .map_err(|e| PipelineError::DeliveryFailure(format!("enqueue to `{topic}`: {e}")))?;
        self.queued.push_back(topic.to_string());
        Ok(())
    }

    async fn flush(&mut self, timeout: Duration) -> Result<Vec<DeliveryReport>> {
        let deadline = Instant::now() + timeout;
        let mut reports = Vec::with_capacity(self.queued.len());

        while !self.queued.is_empty() || !self.inflight.is_empty() {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    info!("mqtt_connected");
                }
                Ok(Ok(Event::Outgoing(Outgoing::Publish(pkid)))) => {
                    let Some(topic) = self.queued.pop_front() else {
                        continue;
                    };
                    if self.qos == QoS::AtMostOnce {
                        reports.push(DeliveryReport::Delivered {
                            topic,
                            packet_id: None,
                        });
                    } else {
                        self.inflight.insert(pkid, topic);
                    }
                }
                Ok(Ok(Event::Incoming(Packet::PubAck(ack)))) => {
                    if let Some(topic) = self.inflight.remove(&ack.pkid) {
                        reports.push(DeliveryReport::Delivered {
                            topic,
                            packet_id: Some(ack.pkid),
                        });
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "mqtt_connection_error");
                    self.settle(&e.to_string(), &mut reports);
                    return Ok(reports);
                }
                Err(_) => {
                    warn!(
                        queued = self.queued.len(),
                        inflight = self.inflight.len(),
                        "mqtt_flush_timeout"
                    );
                    self.settle("not acknowledged before flush timeout", &mut reports);
                }
            }
        }

        self.disconnect().await;
        Ok(reports)
    }
}


#[cfg(test)]
mod tests {
    use super::fake_broker::{self, PUBLISH};
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn broker_at(port: u16) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..MqttConfig::default()
        }
    }

    #[test]
    fn test_rejects_qos_two() {
        let config = MqttConfig {
            qos: 2,
            ..MqttConfig::default()
        };
        assert!(matches!(MqttBus::new(&config), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_client_ids_differ_by_role() {
        let config = MqttConfig::default();
        let publisher = mqtt_options(&config, "publisher");
        let consumer = mqtt_options(&config, "consumer");
        assert_ne!(publisher.client_id(), consumer.client_id());
        assert!(publisher.client_id().starts_with("subway-relay-publisher-"));
    }

    #[tokio::test]
    async fn test_qos1_delivered_on_puback() {
        let (listener, port) = fake_broker::listen().await;
        let broker = tokio::spawn(async move {
            let mut stream = fake_broker::accept(&listener).await;
            let (header, body) = fake_broker::read_packet(&mut stream).await;
            assert_eq!(header >> 4, PUBLISH);
            assert_eq!((header >> 1) & 0b11, 1);

            let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
            let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
            let pkid = [body[2 + topic_len], body[3 + topic_len]];
            stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();
            (stream, topic, body[4 + topic_len..].to_vec())
        });

        let payload = r#"[{"statnNm":"교대","updnLine":"상행/내선"}]"#;
        let mut bus = MqttBus::new(&broker_at(port)).unwrap();
        bus.produce("subway", Bytes::from(payload)).await.unwrap();

        let reports = bus.flush(Duration::from_secs(5)).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert!(matches!(
            &reports[0],
            DeliveryReport::Delivered { topic, packet_id: Some(_) } if topic == "subway"
        ));
        let (_stream, topic, received) = broker.await.unwrap();
        assert_eq!(topic, "subway");
        assert_eq!(received, payload.as_bytes());
    }

    #[tokio::test]
    async fn test_unacknowledged_message_fails_at_timeout() {
        let (listener, port) = fake_broker::listen().await;
        let broker = tokio::spawn(async move {
            let mut stream = fake_broker::accept(&listener).await;
            let (header, _) = fake_broker::read_packet(&mut stream).await;
            assert_eq!(header >> 4, PUBLISH);
            // Never acknowledge; hold the connection open.
            stream
        });

        let mut bus = MqttBus::new(&broker_at(port)).unwrap();
        bus.produce("subway", Bytes::from_static(b"[]")).await.unwrap();

        let started = std::time::Instant::now();
        let reports = bus.flush(Duration::from_millis(1500)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            &reports[0],
            DeliveryReport::Failed { topic, reason } if topic == "subway" && reason.contains("flush timeout")
        ));
        let _stream = broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_failure() {
        let mut bus = MqttBus::new(&broker_at(1)).unwrap();
        bus.produce("subway", Bytes::from_static(b"[]")).await.unwrap();

        let reports = bus.flush(Duration::from_secs(5)).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert!(matches!(&reports[0], DeliveryReport::Failed { topic, .. } if topic == "subway"));
    }

    #[tokio::test]
    async fn test_flush_with_nothing_produced() {
        let mut bus = MqttBus::new(&broker_at(1)).unwrap();
        let reports = bus.flush(Duration::from_millis(100)).await.unwrap();
        assert!(reports.is_empty());
    }
}
