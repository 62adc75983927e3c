//! JSON documents served by the device's HTTP API.
//!
//! Firmware reports most numbers as strings, so payloads are first read into
//! `Raw*` mirrors of the wire format and then converted field by field.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::Result;
use super::message::{ClimateStatus, FanMode, HvacMode, SwingMode};

/// A JSON scalar that may arrive as text or as a number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl Scalar {
    fn text(&self) -> String {
        match self {
            Scalar::Text(s) => s.clone(),
            Scalar::Number(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }

    fn parse<T: FromStr>(&self, key: &str) -> std::result::Result<T, String> {
        let text = self.text();
        text.trim()
            .parse()
            .map_err(|_| format!("field {key} has unexpected value {text:?}"))
    }
}

/// Device class of a stored remote, keyed by the two-character `Type` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    MediaTv,
    MediaGeneric,
    Light,
    Humidifier,
    Purifier,
    Fan,
    Vacuum,
    Climate,
    Remote,
    Unknown,
}

impl DeviceKind {
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "00" => DeviceKind::Remote,
            "01" => DeviceKind::MediaTv,
            "02" => DeviceKind::MediaGeneric,
            "03" => DeviceKind::Light,
            "04" => DeviceKind::Humidifier,
            "05" => DeviceKind::Purifier,
            "06" => DeviceKind::Vacuum,
            "07" => DeviceKind::Fan,
            "EF" => DeviceKind::Climate,
            _ => DeviceKind::Unknown,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDevice {
    #[serde(rename = "Type")]
    kind: Scalar,
    #[serde(rename = "MRDC")]
    mrdc: Scalar,
    status: Scalar,
    #[serde(rename = "ID")]
    id: Scalar,
    name: Scalar,
    time: Scalar,
    timezone: Scalar,
    power_mode: Scalar,
    current_voltage: Scalar,
    firmware: Scalar,
    temperature: Scalar,
    #[serde(rename = "HomeKit")]
    homekit: Scalar,
    eco_mode: Scalar,
    sensor_mode: Scalar,
}

/// `GET /device`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub kind: String,
    pub mrdc: String,
    pub status: String,
    pub id: String,
    pub name: String,
    /// Device clock, epoch seconds.
    pub time: i64,
    pub timezone: i32,
    pub power_mode: String,
    pub current_voltage: i64,
    pub firmware: f64,
    pub temperature: i64,
    pub homekit: i64,
    pub eco_mode: bool,
    pub sensor_mode: i64,
}

impl TryFrom<RawDevice> for Device {
    type Error = String;

    fn try_from(raw: RawDevice) -> std::result::Result<Self, String> {
        Ok(Self {
            kind: raw.kind.text(),
            mrdc: raw.mrdc.text(),
            status: raw.status.text(),
            id: raw.id.text().to_uppercase(),
            name: raw.name.text(),
            time: raw.time.parse("Time")?,
            timezone: raw.timezone.parse("Timezone")?,
            power_mode: raw.power_mode.text(),
            current_voltage: raw.current_voltage.parse("CurrentVoltage")?,
            firmware: raw.firmware.parse("Firmware")?,
            temperature: raw.temperature.parse("Temperature")?,
            homekit: raw.homekit.parse("HomeKit")?,
            eco_mode: raw.eco_mode.text() == "on",
            sensor_mode: raw.sensor_mode.parse("SensorMode")?,
        })
    }
}

impl Device {
    pub fn from_json(body: &[u8]) -> std::result::Result<Self, String> {
        let raw: RawDevice = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        raw.try_into()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMeteoSensor {
    humidity: Scalar,
    pressure: Scalar,
    temperature: Scalar,
    updated: Scalar,
}

/// `GET /sensors/meteo`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeteoSensor {
    pub humidity: f64,
    pub pressure: i64,
    pub temperature: f64,
    /// Epoch seconds of the last reading.
    pub updated: i64,
}

impl MeteoSensor {
    pub fn from_json(body: &[u8]) -> std::result::Result<Self, String> {
        let raw: RawMeteoSensor = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        Ok(Self {
            humidity: raw.humidity.parse("Humidity")?,
            pressure: raw.pressure.parse("Pressure")?,
            temperature: raw.temperature.parse("Temperature")?,
            updated: raw.updated.parse("Updated")?,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDeviceSummary {
    #[serde(rename = "Type")]
    kind: Scalar,
    #[serde(rename = "UUID")]
    uuid: Scalar,
    updated: Scalar,
}

/// One entry of `GET /data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub kind: DeviceKind,
    pub uuid: String,
    pub updated: i64,
}

impl DeviceSummary {
    pub fn list_from_json(body: &[u8]) -> std::result::Result<Vec<Self>, String> {
        let raw: Vec<RawDeviceSummary> = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        raw.into_iter()
            .map(|raw| {
                Ok(Self {
                    kind: DeviceKind::from_code(&raw.kind.text()),
                    uuid: raw.uuid.text(),
                    updated: raw.updated.parse("Updated")?,
                })
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRemoteFunction {
    name: String,
    #[serde(rename = "Type")]
    kind: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRemote {
    #[serde(rename = "Type")]
    kind: Scalar,
    name: Scalar,
    updated: Scalar,
    #[serde(default)]
    status: Option<Scalar>,
    #[serde(default)]
    extra: Option<Scalar>,
    #[serde(default)]
    functions: Vec<RawRemoteFunction>,
}

impl RawRemote {
    fn from_json(body: &[u8]) -> std::result::Result<Self, String> {
        serde_json::from_slice(body).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFunction {
    pub name: String,
    pub kind: String,
}

/// `GET /data/{uuid}` for an IR remote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Remote {
    pub kind: DeviceKind,
    pub name: String,
    pub updated: i64,
    pub status: String,
    pub functions: Vec<RemoteFunction>,
}

impl Remote {
    pub fn from_json(body: &[u8]) -> std::result::Result<Self, String> {
        let raw = RawRemote::from_json(body)?;
        Ok(Self {
            kind: DeviceKind::from_code(&raw.kind.text()),
            name: raw.name.text(),
            updated: raw.updated.parse("Updated")?,
            status: raw.status.map(|s| s.text()).unwrap_or_default(),
            functions: raw
                .functions
                .into_iter()
                .map(|f| RemoteFunction {
                    name: f.name,
                    kind: f.kind,
                })
                .collect(),
        })
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.name == name)
    }
}

/// `GET /data/{uuid}` for an air conditioner.
///
/// Setters only change this in-memory copy; nothing reaches the device until
/// it is pushed with `LookinClient::update_climate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Climate {
    pub kind: DeviceKind,
    pub name: String,
    pub updated: i64,
    /// Codeset identifier, prefixed to the status in AC commands.
    pub extra: String,
    pub state: ClimateStatus,
}

impl Climate {
    pub fn from_json(body: &[u8]) -> std::result::Result<Self, String> {
        let raw = RawRemote::from_json(body)?;
        let extra = raw.extra.ok_or("missing field Extra")?.text();
        let status = raw.status.ok_or("missing field Status")?.text();
        let state = ClimateStatus::decode(&status)
            .ok_or_else(|| format!("field Status has unexpected value {status:?}"))?;
        Ok(Self {
            kind: DeviceKind::from_code(&raw.kind.text()),
            name: raw.name.text(),
            updated: raw.updated.parse("Updated")?,
            extra,
            state,
        })
    }

    pub fn set_hvac_mode(&mut self, mode: HvacMode) {
        self.state.hvac_mode = mode;
    }

    pub fn set_fan_mode(&mut self, mode: FanMode) {
        self.state.fan_mode = mode;
    }

    pub fn set_swing_mode(&mut self, mode: SwingMode) {
        self.state.swing_mode = mode;
    }

    /// Target temperature in °C; validated when the status is encoded.
    pub fn set_temperature(&mut self, celsius: u8) {
        self.state.temperature = celsius;
    }

    pub fn status(&self) -> Result<String> {
        self.state.encode()
    }
}

/// Remote control command, sent as a two-character code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Power,
    PowerOn,
    PowerOff,
    Mode,
    Mute,
    VolumeUp,
    VolumeDown,
    ChannelUp,
    ChannelDown,
    Swing,
    Speed,
    Cursor,
    Menu,
}

impl Command {
    pub fn code(self) -> &'static str {
        match self {
            Command::Power => "01",
            Command::PowerOn => "02",
            Command::PowerOff => "03",
            Command::Mode => "04",
            Command::Mute => "05",
            Command::VolumeUp => "06",
            Command::VolumeDown => "07",
            Command::ChannelUp => "08",
            Command::ChannelDown => "09",
            Command::Swing => "0A",
            Command::Speed => "0B",
            Command::Cursor => "0C",
            Command::Menu => "0D",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "power" => Some(Command::Power),
            "poweron" => Some(Command::PowerOn),
            "poweroff" => Some(Command::PowerOff),
            "mode" => Some(Command::Mode),
            "mute" => Some(Command::Mute),
            "volup" => Some(Command::VolumeUp),
            "voldown" => Some(Command::VolumeDown),
            "chup" => Some(Command::ChannelUp),
            "chdown" => Some(Command::ChannelDown),
            "swing" => Some(Command::Swing),
            "speed" => Some(Command::Speed),
            "cursor" => Some(Command::Cursor),
            "menu" => Some(Command::Menu),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrFormat {
    Raw,
    ProntoHex,
}

impl IrFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            IrFormat::Raw => "raw",
            IrFormat::ProntoHex => "prontohex",
        }
    }

    /// Split `"prontohex:0000,006D,..."` into the format and space-separated codes.
    pub fn split_prefixed(command: &str) -> Option<(Self, String)> {
        [IrFormat::Raw, IrFormat::ProntoHex]
            .into_iter()
            .find_map(|format| {
                let codes = command
                    .strip_prefix(format.as_str())?
                    .strip_prefix(':')?;
                Some((format, codes.replace(',', " ")))
            })
    }
}
