use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn};

use lookin_to_mqtt::bridge::{self, DeviceCommand, Registration, StateUpdate};
use lookin_to_mqtt::config::Config;
use lookin_to_mqtt::lookin::discovery::{Discovery, DiscoveryConfig};
use lookin_to_mqtt::lookin::{Endpoint, EndpointConfig, LookinClient};
use lookin_to_mqtt::mqtt::client::{MqttClient, MqttMessage};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting lookin-to-mqtt bridge (mqtt={}:{}, udp_port={}, hosts={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.lookin.udp_port,
        config.lookin.hosts.len(),
    );

    // Channels
    let (mqtt_cmd_tx, mut mqtt_cmd_rx) = mpsc::channel::<MqttMessage>(100);
    let (update_tx, update_rx) = mpsc::channel::<StateUpdate>(200);
    let (register_tx, mut register_rx) = mpsc::channel::<Registration>(16);

    let mqtt_client = MqttClient::new(&config);
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(mqtt_cmd_tx, update_rx).await;
    });

    // UDP: listen for pushes on the well-known port, broadcast discovery from an ephemeral one
    let port = config.lookin.udp_port;
    let listener_config = EndpointConfig::new(
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
    )
    .with_queue_size(config.lookin.queue_size)
    .with_span(info_span!("lookin_udp", port));
    // Plain bind without SO_REUSEADDR/SO_REUSEPORT: the port is held exclusively.
    let listener = match Endpoint::open(listener_config).await {
        Ok(endpoint) => Arc::new(endpoint),
        Err(e) => {
            error!(
                "Failed to open UDP endpoint on port {} (is another LOOKin listener running?): {}",
                port, e
            );
            std::process::exit(1);
        }
    };

    let discovery = match Discovery::start(DiscoveryConfig {
        port,
        interval: config.lookin.discovery_interval(),
        queue_size: config.lookin.queue_size,
        span: info_span!("lookin_discovery"),
    })
    .await
    {
        Ok(discovery) => Some(discovery),
        Err(e) => {
            warn!("Discovery disabled: {}", e);
            None
        }
    };

    let mut handles = vec![tokio::spawn(bridge::forward_events(
        listener.clone(),
        update_tx.clone(),
    ))];
    if let Some(discovery) = &discovery {
        handles.push(tokio::spawn(bridge::forward_events(
            discovery.endpoint().clone(),
            update_tx.clone(),
        )));
    }

    // Spawn an HTTP bridge task for each configured device
    for host in &config.lookin.hosts {
        let client = match LookinClient::new(host.clone(), config.lookin.http_timeouts()) {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to create HTTP client for {}: {}", host, e);
                std::process::exit(1);
            }
        };
        handles.push(tokio::spawn(bridge::run_device(
            client,
            update_tx.clone(),
            register_tx.clone(),
            config.lookin.poll_interval(),
        )));
    }

    drop(update_tx);
    drop(register_tx);

    // Keyed by device topic segment, filled as devices come online
    let mut device_cmd_txs: HashMap<String, mpsc::Sender<DeviceCommand>> = HashMap::new();
    let topic_prefix = config.mqtt.topic_prefix.clone();

    // Main loop: route MQTT commands to devices + handle shutdown
    loop {
        tokio::select! {
            Some(registration) = register_rx.recv() => {
                info!("Device {} ready for commands", registration.device);
                device_cmd_txs.insert(registration.device, registration.commands);
            }
            Some(msg) = mqtt_cmd_rx.recv() => {
                // Parse topic: {prefix}/{device}/command/{path}
                let Some((device, path)) = parse_command_topic(&msg.topic, &topic_prefix) else {
                    continue;
                };
                let Some(cmd_tx) = device_cmd_txs.get(device) else {
                    warn!("Unknown device in command topic: {}", device);
                    continue;
                };
                match bridge::build_command(path, &msg.payload) {
                    Some(cmd) => {
                        if cmd_tx.send(cmd).await.is_err() {
                            warn!("Command channel closed for device {}", device);
                        }
                    }
                    None => warn!("Could not build command: path={}, payload={}", path, msg.payload),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            } => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    listener.close();
    if let Some(discovery) = discovery {
        discovery.stop().await;
    }
    for handle in handles {
        handle.abort();
    }
    mqtt_handle.abort();
    info!("lookin-to-mqtt bridge stopped");
}

/// Parse a command topic into (device, path).
/// Expected format: {prefix}/{device}/command/{path}
fn parse_command_topic<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (device, rest) = rest.split_once('/')?;
    let path = rest.strip_prefix("command/")?;
    if device.is_empty() || path.is_empty() {
        return None;
    }
    Some((device, path))
}
