//! Reads published batches back off the topic.
//!
//! This is the downstream view of the relay: each message is one run's batch,
//! decoded into the same nine-field records the publisher sent.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, Packet};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::MqttConfig;
use crate::error::{PipelineError, Result};
use crate::normalize::NormalizedRecord;
use crate::publish::mqtt::{mqtt_options, qos_level};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Decodes one message payload: a JSON array of flat records.
pub fn decode_message(payload: &[u8]) -> Result<Vec<NormalizedRecord>> {
    serde_json::from_slice(payload)
        .map_err(|e| PipelineError::Serialization(format!("decoding message: {e}")))
}

/// Default batch handler: one log line per record carrying all nine fields.
pub fn log_records(topic: &str, records: &[NormalizedRecord]) {
    info!(topic, records = records.len(), "Batch received");
    for record in records {
        info!(
            subway_nm = %record.subway_name,
            train_no = %record.train_no,
            statn_nm = %record.station_name,
            statn_tnm = %record.terminal_station_name,
            train_sttus = %record.train_status,
            updn_line = %record.direction,
            status = %record.status,
            code = %record.code,
            message = %record.message,
            "Position"
        );
    }
}

/// Subscribes to `topic` and hands every decoded batch to `on_batch`.
///
/// Stops after `max_messages` messages (0 = no limit) or once `shutdown`
/// turns true. A payload that does not decode is logged and skipped but
/// still counts as received. Connection errors are logged and the client
/// reconnects after a short pause, subscribing again on every ConnAck.
/// Returns the number of messages received.
pub async fn consume<F>(
    config: &MqttConfig,
    topic: &str,
    max_messages: usize,
    mut shutdown: watch::Receiver<bool>,
    mut on_batch: F,
) -> Result<usize>
where
    F: FnMut(&str, Vec<NormalizedRecord>),
{
    let qos = qos_level(config.qos)?;
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, "consumer"), 16);

    let mut received = 0;
    // A dropped shutdown sender can never fire; stop selecting on it.
    let mut listening = true;

    loop {
        if max_messages > 0 && received >= max_messages {
            break;
        }

        tokio::select! {
            biased;

            closed = async { shutdown.wait_for(|stop| *stop).await.is_err() }, if listening => {
                if closed {
                    listening = false;
                } else {
                    info!("mqtt_consumer_shutdown");
                    break;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic, host = %config.host, port = config.port, "mqtt_consumer_connected");
                    client.subscribe(topic, qos).await.map_err(|e| {
                        PipelineError::DeliveryFailure(format!("subscribe to `{topic}`: {e}"))
                    })?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    received += 1;
                    match decode_message(&publish.payload) {
                        Ok(records) => on_batch(&publish.topic, records),
                        Err(e) => {
                            warn!(topic = %publish.topic, error = %e, "mqtt_message_undecodable");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "mqtt_consumer_error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    info!(received, "Consumer stopped");
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::mqtt::fake_broker::{self, SUBSCRIBE};
    use tokio::io::AsyncWriteExt;

    fn record(train_no: &str) -> NormalizedRecord {
        NormalizedRecord {
            subway_name: "3호선".to_string(),
            train_no: train_no.to_string(),
            station_name: "교대".to_string(),
            terminal_station_name: "오금".to_string(),
            train_status: "도착".to_string(),
            direction: "상행/내선".to_string(),
            status: "SUCCESS".to_string(),
            code: "0".to_string(),
            message: "OK".to_string(),
        }
    }

    fn broker_at(port: u16) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..MqttConfig::default()
        }
    }

    #[test]
    fn test_decode_published_payload() {
        let batch = vec![record("3101"), record("3102")];
        let payload = serde_json::to_vec(&batch).unwrap();

        assert_eq!(decode_message(&payload).unwrap(), batch);
    }

    #[test]
    fn test_decode_rejects_non_batch() {
        let err = decode_message(br#"{"trainNo":"3101"}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_receives_published_batch() {
        let (listener, port) = fake_broker::listen().await;
        let batch = vec![record("3101"), record("3102")];
        let garbage = fake_broker::publish_packet("subway", b"not json");
        let message = fake_broker::publish_packet("subway", &serde_json::to_vec(&batch).unwrap());

        let broker = tokio::spawn(async move {
            let mut stream = fake_broker::accept(&listener).await;
            let (header, body) = fake_broker::read_packet(&mut stream).await;
            assert_eq!(header >> 4, SUBSCRIBE);
            // SUBACK echoing the packet id, granting QoS 1.
            stream.write_all(&[0x90, 0x03, body[0], body[1], 0x01]).await.unwrap();
            stream.write_all(&garbage).await.unwrap();
            stream.write_all(&message).await.unwrap();
            stream
        });

        let (_tx, shutdown) = watch::channel(false);
        let mut seen = Vec::new();
        let received = tokio::time::timeout(
            Duration::from_secs(5),
            consume(&broker_at(port), "subway", 2, shutdown, |topic, records| {
                seen.push((topic.to_string(), records))
            }),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(received, 2);
        assert_eq!(seen, vec![("subway".to_string(), batch)]);
        let _stream = broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumer() {
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();

        let received = tokio::time::timeout(
            Duration::from_secs(5),
            consume(&broker_at(1), "subway", 0, shutdown, |_, _| {}),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(received, 0);
    }

    #[tokio::test]
    async fn test_rejects_qos_two() {
        let config = MqttConfig {
            qos: 2,
            ..broker_at(1)
        };
        let (_tx, shutdown) = watch::channel(false);

        let err = consume(&config, "subway", 1, shutdown, |_, _| {}).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
