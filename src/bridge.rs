use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::sanitize_topic_name;
use crate::lookin::message::{FanMode, HvacMode, SwingMode};
use crate::lookin::models::{Climate, Command, Device, IrFormat};
use crate::lookin::{self, Endpoint, LookinClient, UdpEvent};

/// Signal byte(s) appended to local remote commands when none is given.
const DEFAULT_SIGNAL: &str = "FF";

/// A state change ready to publish to MQTT under `{prefix}/{device}/{suffix}`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub device: String,
    pub suffix: String,
    pub payload: String,
    pub retain: bool,
}

impl StateUpdate {
    fn json(device: &str, suffix: impl Into<String>, value: &impl Serialize, retain: bool) -> Self {
        Self {
            device: sanitize_topic_name(device),
            suffix: suffix.into(),
            payload: serde_json::to_string(value).unwrap_or_default(),
            retain,
        }
    }

    pub fn from_event(event: &UdpEvent) -> Self {
        match event {
            UdpEvent::Alive(alive) => Self::json(&alive.id, "alive", event, true),
            UdpEvent::Updated(update) => Self::json(
                &update.id,
                format!("sensor/{}", update.sensor.to_ascii_lowercase()),
                event,
                false,
            ),
        }
    }
}

/// Announces a connected device so commands can be routed to it.
pub struct Registration {
    pub device: String,
    pub commands: mpsc::Sender<DeviceCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClimateChange {
    HvacMode(HvacMode),
    FanMode(FanMode),
    SwingMode(SwingMode),
    Temperature(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Rename(String),
    SendIr {
        format: IrFormat,
        codes: String,
    },
    Remote {
        uuid: String,
        command: Command,
        signal: String,
    },
    Climate {
        uuid: String,
        change: ClimateChange,
    },
}

/// Build a command from the topic tail after `command/` and the payload.
///
/// ```text
/// name                        <new name>
/// ir                          prontohex:0000,006D,...
/// remote/{uuid}/{command}     [signal]
/// climate/{uuid}/{field}      cool | high | both | 22
/// ```
pub fn build_command(path: &str, payload: &str) -> Option<DeviceCommand> {
    let payload = payload.trim();
    let mut parts = path.split('/');
    let command = match (parts.next()?, parts.next(), parts.next()) {
        ("name", None, None) if !payload.is_empty() => DeviceCommand::Rename(payload.to_string()),
        ("ir", None, None) => {
            let (format, codes) = IrFormat::split_prefixed(payload)?;
            DeviceCommand::SendIr { format, codes }
        }
        ("remote", Some(uuid), Some(name)) if !uuid.is_empty() => DeviceCommand::Remote {
            uuid: uuid.to_string(),
            command: Command::from_name(name)?,
            signal: if payload.is_empty() {
                DEFAULT_SIGNAL.to_string()
            } else {
                payload.to_string()
            },
        },
        ("climate", Some(uuid), Some(field)) if !uuid.is_empty() => {
            let change = match field {
                "hvac_mode" => ClimateChange::HvacMode(HvacMode::from_name(payload)?),
                "fan_mode" => ClimateChange::FanMode(FanMode::from_name(payload)?),
                "swing_mode" => ClimateChange::SwingMode(SwingMode::from_name(payload)?),
                "temperature" => {
                    let celsius: f64 = payload.parse().ok()?;
                    ClimateChange::Temperature(celsius.round().clamp(0.0, 255.0) as u8)
                }
                _ => return None,
            };
            DeviceCommand::Climate {
                uuid: uuid.to_string(),
                change,
            }
        }
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(command)
}

/// Drain an endpoint into MQTT state updates until it closes.
pub async fn forward_events(endpoint: Arc<Endpoint>, updates: mpsc::Sender<StateUpdate>) {
    loop {
        match endpoint.receive().await {
            Ok((event, addr)) => {
                debug!(%addr, device = event.device_id(), "UDP event");
                if updates.send(StateUpdate::from_event(&event)).await.is_err() {
                    warn!("State update channel closed");
                    return;
                }
            }
            Err(lookin::Error::EndpointClosed) => {
                info!(local_addr = %endpoint.local_addr(), "Endpoint closed, stopping forwarder");
                return;
            }
            Err(e) => {
                error!(error = %e, "Unexpected endpoint error");
                return;
            }
        }
    }
}

/// One LOOKin device reached over HTTP. Only constructed once its device
/// info has been fetched.
pub struct DeviceBridge {
    client: LookinClient,
    device: Device,
    topic: String,
    /// Local climate state per remote uuid, fetched on first use.
    climates: HashMap<String, Climate>,
    online: bool,
}

impl DeviceBridge {
    pub async fn connect(client: LookinClient) -> lookin::Result<Self> {
        let device = client.get_device_info().await?;
        let topic = sanitize_topic_name(&device.id);
        Ok(Self {
            client,
            device,
            topic,
            climates: HashMap::new(),
            online: true,
        })
    }

    /// Retry [`connect`](Self::connect) with exponential backoff until it succeeds.
    pub async fn connect_with_backoff(client: LookinClient) -> Self {
        let mut backoff = Duration::from_secs(5);
        let max_backoff = Duration::from_secs(60);

        loop {
            info!("Connecting to LOOKin device at {}", client.host());
            match Self::connect(client.clone()).await {
                Ok(bridge) => {
                    info!(
                        "Connected to {} ({}) firmware {}",
                        bridge.device.name, bridge.device.id, bridge.device.firmware
                    );
                    return bridge;
                }
                Err(e) if e.is_transient() => {
                    warn!("Device at {} unreachable: {}. Retrying in {:?}", client.host(), e, backoff);
                }
                Err(e) => {
                    error!("Device at {} unusable: {}. Retrying in {:?}", client.host(), e, backoff);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn update(&self, suffix: impl Into<String>, value: &impl Serialize, retain: bool) -> StateUpdate {
        StateUpdate::json(&self.topic, suffix, value, retain)
    }

    fn availability(&self) -> StateUpdate {
        StateUpdate {
            device: self.topic.clone(),
            suffix: "availability".into(),
            payload: if self.online { "online" } else { "offline" }.into(),
            retain: true,
        }
    }

    fn mark(&mut self, online: bool) -> Option<StateUpdate> {
        if self.online == online {
            return None;
        }
        self.online = online;
        Some(self.availability())
    }

    /// Fetch sensor readings; transient failures flip availability.
    pub async fn poll(&mut self) -> Vec<StateUpdate> {
        let mut updates = Vec::new();
        match self.client.get_meteo_sensor().await {
            Ok(meteo) => {
                updates.extend(self.mark(true));
                updates.push(self.update("meteo", &meteo, true));
            }
            Err(e) if e.is_transient() => {
                warn!("Device {} unreachable: {}", self.device.name, e);
                updates.extend(self.mark(false));
            }
            Err(e) => error!("Device {} meteo poll failed: {}", self.device.name, e),
        }
        updates
    }

    pub async fn execute(&mut self, command: DeviceCommand) -> lookin::Result<Vec<StateUpdate>> {
        info!("Sending command to {}: {:?}", self.device.name, command);
        match command {
            DeviceCommand::Rename(name) => {
                self.client.update_device_name(&name).await?;
                self.device = self.client.get_device_info().await?;
                Ok(vec![self.update("info", &self.device, true)])
            }
            DeviceCommand::SendIr { format, codes } => {
                self.client.send_ir(format, &codes).await?;
                Ok(Vec::new())
            }
            DeviceCommand::Remote {
                uuid,
                command,
                signal,
            } => {
                self.client.send_command(&uuid, command, &signal).await?;
                Ok(Vec::new())
            }
            DeviceCommand::Climate { uuid, change } => {
                let climate = self.apply_climate(&uuid, change).await?;
                Ok(vec![self.update(format!("climate/{}", uuid.to_ascii_lowercase()), &climate, true)])
            }
        }
    }

    async fn apply_climate(&mut self, uuid: &str, change: ClimateChange) -> lookin::Result<Climate> {
        let mut climate = match self.climates.remove(uuid) {
            Some(climate) => climate,
            None => self.client.get_conditioner(uuid).await?,
        };
        match change {
            ClimateChange::HvacMode(mode) => climate.set_hvac_mode(mode),
            ClimateChange::FanMode(mode) => climate.set_fan_mode(mode),
            ClimateChange::SwingMode(mode) => climate.set_swing_mode(mode),
            ClimateChange::Temperature(celsius) => climate.set_temperature(celsius),
        }
        // On failure the cached copy is dropped so the next change starts
        // from the device's state.
        self.client.update_climate(&climate).await?;
        self.climates.insert(uuid.to_string(), climate.clone());
        Ok(climate)
    }

    /// Poll on an interval and execute routed commands until the command
    /// channel closes.
    pub async fn serve(
        mut self,
        updates: mpsc::Sender<StateUpdate>,
        mut commands: mpsc::Receiver<DeviceCommand>,
        poll_interval: Duration,
    ) {
        let initial = [self.availability(), self.update("info", &self.device, true)];
        for update in initial {
            if updates.send(update).await.is_err() {
                return;
            }
        }

        let mut poll_timer = tokio::time::interval(poll_interval);
        loop {
            let produced = tokio::select! {
                _ = poll_timer.tick() => self.poll().await,
                command = commands.recv() => match command {
                    Some(command) => match self.execute(command).await {
                        Ok(produced) => produced,
                        Err(e) => {
                            warn!("Command for {} failed: {}", self.device.name, e);
                            Vec::new()
                        }
                    },
                    None => {
                        info!("Command channel for {} closed", self.device.name);
                        return;
                    }
                },
            };
            for update in produced {
                if updates.send(update).await.is_err() {
                    warn!("State update channel closed");
                    return;
                }
            }
        }
    }
}

/// Connect to `client`'s device, register it for command routing, then serve it.
pub async fn run_device(
    client: LookinClient,
    updates: mpsc::Sender<StateUpdate>,
    registrations: mpsc::Sender<Registration>,
    poll_interval: Duration,
) {
    let bridge = DeviceBridge::connect_with_backoff(client).await;
    let (commands_tx, commands_rx) = mpsc::channel(50);
    let registration = Registration {
        device: bridge.topic().to_string(),
        commands: commands_tx,
    };
    if registrations.send(registration).await.is_err() {
        warn!("Registration channel closed");
        return;
    }
    bridge.serve(updates, commands_rx, poll_interval).await;
}
