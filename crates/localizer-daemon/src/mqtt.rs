//! MQTT transport: connection options, subscription loop and publishing sink

use anyhow::Result;
use async_trait::async_trait;
use localizer_core::{Dispatcher, MessageSink, SinkError};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;

/// Capacity of the request channel between clients and the event loop
const REQUEST_CAPACITY: usize = 64;

/// Delay before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Messages handled concurrently before new ones are dropped
const MAX_IN_FLIGHT: usize = 256;

/// Upper bound on waiting for the DISCONNECT packet to go out
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    options
}

/// Create the process-wide client and its event loop
pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY)
}

/// Publishes republished documents through the shared client
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
}

impl MqttSink {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageSink for MqttSink {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), SinkError> {
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .await
            .map_err(|e| SinkError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Bounds the number of messages being handled at once
///
/// Messages arriving while every permit is taken are dropped, so a stalled
/// sink cannot make handler tasks pile up.
#[derive(Clone)]
pub struct InFlight {
    permits: Arc<Semaphore>,
}

impl InFlight {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Handle `publish` on its own task; returns false if it was dropped
    pub fn try_spawn(&self, dispatcher: &Arc<Dispatcher>, publish: Publish) -> bool {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            warn!(topic = %publish.topic, "Too many messages in flight, dropping");
            return false;
        };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.handle(&publish.payload).await;
            debug!(topic = %publish.topic, outcome = ?outcome, "Handled message");
            drop(permit);
        });
        true
    }
}

/// Drive the event loop until `shutdown` resolves
///
/// The subscription is (re)issued on every CONNACK so it survives broker
/// reconnects. Requests that go through the client's channel are sent from
/// separate tasks: only this loop drains that channel, so it must never wait
/// on it.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscribe_topic: &str,
    dispatcher: Arc<Dispatcher>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    let in_flight = InFlight::new(MAX_IN_FLIGHT);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, disconnecting from broker");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %subscribe_topic, "Connected to broker, subscribing");
                    let client = client.clone();
                    let topic = subscribe_topic.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = client.subscribe(&topic, QoS::AtMostOnce).await {
                            error!(topic = %topic, error = %e, "Subscribe request failed");
                        }
                    });
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(pkid = ack.pkid, codes = ?ack.return_codes, "Subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    in_flight.try_spawn(&dispatcher, publish);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, retrying in {}s", RECONNECT_DELAY.as_secs());
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("Shutdown requested while disconnected");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    let disconnect = {
        let client = client.clone();
        tokio::spawn(async move { client.disconnect().await })
    };

    let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("Timed out waiting for broker disconnect");
    }
    disconnect.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use localizer_core::{DispatcherConfig, FamilyClassifier, SensorRegistry};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn empty_dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(SensorRegistry::default()),
            FamilyClassifier::default(),
            DispatcherConfig::default(),
        ))
    }

    /// Accepts one connection, answers CONNECT with CONNACK and reports the
    /// size of the first read that follows
    async fn fake_broker() -> (u16, oneshot::Receiver<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            stream.read(&mut buf).await.unwrap();
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let _ = tx.send(n);
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        });
        (port, rx)
    }

    fn local_config(port: u16) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..MqttConfig::default()
        }
    }

    #[test]
    fn test_mqtt_options() {
        let config = MqttConfig {
            host: "broker.lan".to_string(),
            port: 1884,
            username: Some("bridge".to_string()),
            password: Some("hunter2".to_string()),
            keep_alive_secs: 15,
            ..MqttConfig::default()
        };
        let options = mqtt_options(&config);

        assert_eq!(options.broker_address(), ("broker.lan".to_string(), 1884));
        assert_eq!(options.client_id(), "DFS-low_energy_sensor_localizer");
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert_eq!(
            options.credentials(),
            Some(("bridge".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    fn test_mqtt_options_anonymous() {
        let options = mqtt_options(&MqttConfig::default());
        assert!(options.credentials().is_none());
    }

    #[tokio::test]
    async fn test_sink_queues_publish() {
        // Requests wait in the channel until the event loop is polled
        let (client, _eventloop) = connect(&MqttConfig::default());
        let sink = MqttSink::new(client);

        sink.publish("home/2/office/temperature", b"{}".to_vec(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sink_reports_closed_event_loop() {
        let (client, eventloop) = connect(&MqttConfig::default());
        drop(eventloop);
        let sink = MqttSink::new(client);

        let err = sink
            .publish("home/2/office/humidity", b"{}".to_vec(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Publish { ref topic, .. } if topic == "home/2/office/humidity"));
    }

    #[tokio::test]
    async fn test_run_drains_full_request_channel() {
        let (port, received) = fake_broker().await;
        let (client, eventloop) = connect(&local_config(port));
        for i in 0..REQUEST_CAPACITY {
            client
                .try_publish(format!("home/0/hall/{}", i), QoS::AtMostOnce, true, b"{}".to_vec())
                .unwrap();
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.await;
            };
            run(client, eventloop, "rtl_433/events", empty_dispatcher(), shutdown).await
        });

        let n = tokio::time::timeout(Duration::from_secs(5), received)
            .await
            .expect("event loop stalled after CONNACK")
            .unwrap();
        assert!(n > 0);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not stop after shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_reconnect_delay() {
        // Nothing listens on a port that was just released
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (client, eventloop) = connect(&local_config(port));

        let shutdown = tokio::time::sleep(Duration::from_millis(300));
        let result = tokio::time::timeout(
            RECONNECT_DELAY - Duration::from_secs(1),
            run(client, eventloop, "rtl_433/events", empty_dispatcher(), shutdown),
        )
        .await
        .expect("shutdown waited for the reconnect delay");
        result.unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_limit() {
        let in_flight = InFlight::new(1);
        let dispatcher = empty_dispatcher();
        let publish = Publish::new("rtl_433/events", QoS::AtMostOnce, b"{}".to_vec());

        let held = in_flight.permits.clone().try_acquire_owned().unwrap();
        assert!(!in_flight.try_spawn(&dispatcher, publish.clone()));

        drop(held);
        assert!(in_flight.try_spawn(&dispatcher, publish));
    }
}
