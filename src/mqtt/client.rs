use std::collections::HashMap;
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::StateUpdate;
use crate::config::Config;

pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// Requests rumqttc buffers while the event loop is not connected.
const REQUEST_CAPACITY: usize = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: Config,
    reconnect_delay: Duration,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        mqttopts.set_last_will(LastWill::new(
            config.bridge_status_topic(),
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(mqttopts, REQUEST_CAPACITY);

        Self {
            client,
            eventloop,
            config: config.clone(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Run the MQTT event loop. Announces the bridge and subscribes to device
    /// command topics on connect, forwards incoming publishes through
    /// `command_tx`, and publishes state updates received from `update_rx`.
    ///
    /// Requests never wait on the client's queue: only this loop drains it,
    /// so while the broker is away updates beyond its capacity are dropped.
    pub async fn run(
        mut self,
        command_tx: mpsc::Sender<MqttMessage>,
        mut update_rx: mpsc::Receiver<StateUpdate>,
    ) {
        let status_topic = self.config.bridge_status_topic();
        let command_topic = self.config.command_subscription();
        // Retained topics only get republished when their payload changes.
        let mut last_retained: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        if let Err(e) = self
                            .client
                            .try_publish(&status_topic, QoS::AtLeastOnce, true, "online")
                        {
                            error!("Failed to publish online status: {}", e);
                        }
                        if let Err(e) = self.client.try_subscribe(&command_topic, QoS::AtLeastOnce) {
                            error!("Failed to subscribe to {}: {}", command_topic, e);
                        }
                        // Broker may have lost retained state; republish on next update.
                        last_retained.clear();
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.clone(),
                            payload: String::from_utf8_lossy(&publish.payload).to_string(),
                        };
                        if command_tx.send(msg).await.is_err() {
                            warn!("Command channel closed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}. Reconnecting...", e);
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                },
                Some(update) = update_rx.recv() => {
                    let topic = self.config.device_topic(&update.device, &update.suffix);
                    if update.retain && last_retained.get(&topic) == Some(&update.payload) {
                        debug!("Unchanged {}, skipping", topic);
                        continue;
                    }
                    debug!("Publishing {}: {}", topic, update.payload);
                    match self.client.try_publish(
                        &topic,
                        QoS::AtMostOnce,
                        update.retain,
                        update.payload.clone().into_bytes(),
                    ) {
                        Ok(()) => {
                            if update.retain {
                                last_retained.insert(topic, update.payload);
                            }
                        }
                        Err(ClientError::TryRequest(_)) => {
                            warn!("MQTT request queue is full, dropping update for {}", topic);
                        }
                        Err(e) => warn!("Failed to publish {}: {}", topic, e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::net::TcpListener;

    /// Broker stand-in that accepts connections and hangs up immediately.
    async fn hang_up_broker() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        (port, accepts)
    }

    fn config_for(port: u16) -> Config {
        let port = port.to_string();
        Config::from_lookup(|key| match key {
            "MQTT_BROKER_HOST" => Some("127.0.0.1".to_string()),
            "MQTT_BROKER_PORT" => Some(port.clone()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_keeps_reconnecting_while_updates_pile_up() {
        let (port, accepts) = hang_up_broker().await;
        let client = MqttClient::new(&config_for(port)).with_reconnect_delay(Duration::from_millis(20));

        let (command_tx, _command_rx) = mpsc::channel(8);
        let (update_tx, update_rx) = mpsc::channel(200);
        let handle = tokio::spawn(client.run(command_tx, update_rx));

        for i in 0..150 {
            update_tx
                .send(StateUpdate {
                    device: "98f33011".into(),
                    suffix: "sensor/fe".into(),
                    payload: format!("{{\"n\":{i}}}"),
                    retain: false,
                })
                .await
                .unwrap();
        }

        // Every update is consumed even though none can reach the broker.
        tokio::time::timeout(Duration::from_secs(5), async {
            while update_tx.capacity() < update_tx.max_capacity() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("updates stuck in channel");

        // Reconnect attempts continue after the request queue has filled up.
        let before = accepts.load(Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(5), async {
            while accepts.load(Ordering::SeqCst) < before + 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("MQTT loop stopped reconnecting");

        handle.abort();
    }
}
