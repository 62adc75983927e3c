//! Text frames exchanged with LOOKin devices over UDP, plus the compact
//! four-character climate status carried in IR commands.
//!
//! ```text
//! LOOK.in:Alive!{id}:{type}:{batteries}:{ip}:{version}:{storage}
//! LOOK.in:Updated!{id}:{sensor}:{event}:{value}
//! LOOK.in:Discover!
//! ```

use std::fmt;

use serde::Serialize;

use super::error::{Error, Result};

pub const ALIVE_TAG: &str = "LOOK.in:Alive";
pub const UPDATED_TAG: &str = "LOOK.in:Updated";
/// Beacon broadcast by the discovery loop; devices answer with `Alive`.
pub const DISCOVER_FRAME: &str = "LOOK.in:Discover!";

const ALIVE_FIELDS: usize = 6;
const UPDATED_FIELDS: usize = 4;

pub const MIN_TEMP: u8 = 16;
pub const MAX_TEMP: u8 = 30;
const TEMP_OFFSET: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Remote,
    Unknown,
}

impl DeviceType {
    pub fn from_hex(code: &str) -> Self {
        match code {
            "81" => DeviceType::Remote,
            _ => DeviceType::Unknown,
        }
    }
}

/// Announcement sent by a device, usually in reply to a discovery beacon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UdpAlive {
    pub id: String,
    #[serde(skip)]
    pub device_type_hex: String,
    pub device_type: DeviceType,
    pub has_batteries: bool,
    pub ip: String,
    pub firmware_version: String,
    pub storage: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    Ir,
    Meteo,
}

impl SensorId {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "87" => Some(SensorId::Ir),
            "FE" => Some(SensorId::Meteo),
            _ => None,
        }
    }
}

/// Pushed sensor change. `temperature`/`humidity` are only derived from
/// eight-character values (two big-endian 16 bit words, tenths).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UdpUpdate {
    pub id: String,
    pub sensor: String,
    pub event: String,
    #[serde(rename = "value")]
    pub raw_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

impl UdpUpdate {
    pub fn new(id: &str, sensor: &str, event: &str, raw_value: &str) -> Self {
        let (temperature, humidity) = match decode_tenths_pair(raw_value) {
            Some((t, h)) => (Some(t), Some(h)),
            None => (None, None),
        };
        Self {
            id: id.to_string(),
            sensor: sensor.to_string(),
            event: event.to_string(),
            raw_value: raw_value.to_string(),
            temperature,
            humidity,
        }
    }

    pub fn sensor_id(&self) -> Option<SensorId> {
        SensorId::from_code(&self.sensor)
    }

    /// For IR sensor updates: `(remote uuid, signal)`.
    pub fn ir_signal(&self) -> Option<(&str, &str)> {
        if self.sensor_id() != Some(SensorId::Ir) {
            return None;
        }
        let uuid = self.raw_value.get(..4)?;
        let signal = self.raw_value.get(4..)?;
        Some((uuid, signal))
    }
}

fn decode_tenths_pair(value: &str) -> Option<(f64, f64)> {
    if value.len() != 8 {
        return None;
    }
    let high = u16::from_str_radix(value.get(..4)?, 16).ok()?;
    let low = u16::from_str_radix(value.get(4..)?, 16).ok()?;
    Some((f64::from(high) / 10.0, f64::from(low) / 10.0))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UdpEvent {
    Alive(UdpAlive),
    Updated(UdpUpdate),
}

impl UdpEvent {
    pub fn device_id(&self) -> &str {
        match self {
            UdpEvent::Alive(alive) => &alive.id,
            UdpEvent::Updated(update) => &update.id,
        }
    }
}

/// Parse one frame. Unknown tags and wrong field counts yield `None`.
pub fn parse(raw: &str) -> Option<UdpEvent> {
    let (tag, data) = raw.split_once('!')?;
    let fields: Vec<&str> = data.split(':').collect();

    match (tag, fields.len()) {
        (ALIVE_TAG, ALIVE_FIELDS) => Some(UdpEvent::Alive(UdpAlive {
            id: fields[0].to_string(),
            device_type_hex: fields[1].to_string(),
            device_type: DeviceType::from_hex(fields[1]),
            has_batteries: !fields[2].is_empty(),
            ip: fields[3].to_string(),
            firmware_version: fields[4].to_string(),
            storage: fields[5].to_string(),
        })),
        (UPDATED_TAG, UPDATED_FIELDS) => Some(UdpEvent::Updated(UdpUpdate::new(
            fields[0], fields[1], fields[2], fields[3],
        ))),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Off,
    Auto,
    Cool,
    Heat,
    Dry,
    FanOnly,
}

impl HvacMode {
    pub const ALL: [HvacMode; 6] = [
        HvacMode::Off,
        HvacMode::Auto,
        HvacMode::Cool,
        HvacMode::Heat,
        HvacMode::Dry,
        HvacMode::FanOnly,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off" => Some(HvacMode::Off),
            "auto" => Some(HvacMode::Auto),
            "cool" => Some(HvacMode::Cool),
            "heat" => Some(HvacMode::Heat),
            "dry" => Some(HvacMode::Dry),
            "fan_only" => Some(HvacMode::FanOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    Auto,
    Low,
    Middle,
    High,
}

impl FanMode {
    pub const ALL: [FanMode; 4] = [FanMode::Auto, FanMode::Low, FanMode::Middle, FanMode::High];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "auto" => Some(FanMode::Auto),
            "low" => Some(FanMode::Low),
            "middle" | "medium" => Some(FanMode::Middle),
            "high" => Some(FanMode::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwingMode {
    Off,
    Both,
}

impl SwingMode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SwingMode::Off),
            1 => Some(SwingMode::Both),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off" => Some(SwingMode::Off),
            "both" | "on" => Some(SwingMode::Both),
            _ => None,
        }
    }
}

/// Air conditioner state as carried in `/commands/ir/ac/{extra}{status}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClimateStatus {
    pub hvac_mode: HvacMode,
    /// Target temperature in °C.
    pub temperature: u8,
    pub fan_mode: FanMode,
    pub swing_mode: SwingMode,
}

impl ClimateStatus {
    /// `{hvac}{last hex nibble of temperature + 16}{fan}{swing}`.
    pub fn encode(&self) -> Result<String> {
        if !(MIN_TEMP..=MAX_TEMP).contains(&self.temperature) {
            return Err(Error::TemperatureOutOfRange(self.temperature));
        }
        let offset = format!("{:X}", self.temperature + TEMP_OFFSET);
        let nibble = offset.chars().last().unwrap_or('0');
        Ok(format!(
            "{}{}{}{}",
            self.hvac_mode.code(),
            nibble,
            self.fan_mode.code(),
            self.swing_mode.code()
        ))
    }

    pub fn decode(status: &str) -> Option<Self> {
        let mut chars = status.chars();
        let hvac = chars.next()?.to_digit(10)?;
        let nibble = chars.next()?.to_digit(16)?;
        let fan = chars.next()?.to_digit(10)?;
        let swing = chars.next()?.to_digit(10)?;
        if chars.next().is_some() {
            return None;
        }
        Some(Self {
            hvac_mode: HvacMode::from_code(hvac as u8)?,
            temperature: nibble as u8 + MIN_TEMP,
            fan_mode: FanMode::from_code(fan as u8)?,
            swing_mode: SwingMode::from_code(swing as u8)?,
        })
    }
}

impl fmt::Display for ClimateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(status) => f.write_str(&status),
            Err(_) => write!(f, "<invalid {}°C>", self.temperature),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alive() {
        let event = parse("LOOK.in:Alive!98F33011:81:1:192.168.1.20:2.38:0").unwrap();
        let UdpEvent::Alive(alive) = event else {
            panic!("expected alive event");
        };
        assert_eq!(alive.id, "98F33011");
        assert_eq!(alive.device_type_hex, "81");
        assert_eq!(alive.device_type, DeviceType::Remote);
        assert!(alive.has_batteries);
        assert_eq!(alive.ip, "192.168.1.20");
        assert_eq!(alive.firmware_version, "2.38");
        assert_eq!(alive.storage, "0");
    }

    #[test]
    fn test_alive_unknown_type_and_text_truthiness() {
        let UdpEvent::Alive(alive) = parse("LOOK.in:Alive!AB:02:0:10.0.0.2:1.0:1").unwrap() else {
            panic!("expected alive event");
        };
        assert_eq!(alive.device_type, DeviceType::Unknown);
        // "0" is non-empty text and therefore true
        assert!(alive.has_batteries);

        let UdpEvent::Alive(alive) = parse("LOOK.in:Alive!AB:81::10.0.0.2:1.0:1").unwrap() else {
            panic!("expected alive event");
        };
        assert!(!alive.has_batteries);
    }

    #[test]
    fn test_parse_update_with_temperature_and_humidity() {
        let UdpEvent::Updated(update) = parse("LOOK.in:Updated!98F33011:FE:00:00EB01C2").unwrap()
        else {
            panic!("expected update event");
        };
        assert_eq!(update.sensor, "FE");
        assert_eq!(update.event, "00");
        assert_eq!(update.raw_value, "00EB01C2");
        assert_eq!(update.temperature, Some(23.5));
        assert_eq!(update.humidity, Some(45.0));
        assert_eq!(update.sensor_id(), Some(SensorId::Meteo));
    }

    #[test]
    fn test_update_without_eight_chars_has_no_derived_fields() {
        for value in ["", "00EB", "00EB01C2FF", "1"] {
            let frame = format!("LOOK.in:Updated!98F33011:FE:00:{value}");
            let UdpEvent::Updated(update) = parse(&frame).unwrap() else {
                panic!("expected update event");
            };
            assert_eq!(update.temperature, None);
            assert_eq!(update.humidity, None);
        }
    }

    #[test]
    fn test_ir_update_splits_uuid_and_signal() {
        let UdpEvent::Updated(update) = parse("LOOK.in:Updated!98F33011:87:01:A1B2FF").unwrap()
        else {
            panic!("expected update event");
        };
        assert_eq!(update.ir_signal(), Some(("A1B2", "FF")));
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        assert_eq!(parse("garbage"), None);
        assert_eq!(parse("LOOK.in:Alive!a:b:c"), None);
        assert_eq!(parse("LOOK.in:Updated!a:b:c"), None);
        assert_eq!(parse("LOOK.in:Other!a:b:c:d"), None);
        assert_eq!(parse(DISCOVER_FRAME), None);
    }

    #[test]
    fn test_status_composition() {
        let status = ClimateStatus {
            hvac_mode: HvacMode::Cool,
            temperature: 20,
            fan_mode: FanMode::Low,
            swing_mode: SwingMode::Off,
        };
        assert_eq!(status.encode().unwrap(), "2410");

        let hot = ClimateStatus {
            temperature: 30,
            ..status
        };
        // 30 + 16 = 0x2E
        assert_eq!(hot.encode().unwrap(), "2E10");
    }

    #[test]
    fn test_status_rejects_out_of_range_temperature() {
        let status = ClimateStatus {
            hvac_mode: HvacMode::Heat,
            temperature: 31,
            fan_mode: FanMode::Auto,
            swing_mode: SwingMode::Both,
        };
        assert!(matches!(status.encode(), Err(Error::TemperatureOutOfRange(31))));
        let cold = ClimateStatus {
            temperature: 15,
            ..status
        };
        assert!(matches!(cold.encode(), Err(Error::TemperatureOutOfRange(15))));
    }

    #[test]
    fn test_status_decode() {
        let status = ClimateStatus::decode("3A21").unwrap();
        assert_eq!(status.hvac_mode, HvacMode::Heat);
        assert_eq!(status.temperature, 26);
        assert_eq!(status.fan_mode, FanMode::Middle);
        assert_eq!(status.swing_mode, SwingMode::Both);
        assert_eq!(status.encode().unwrap(), "3A21");

        assert_eq!(ClimateStatus::decode("9000"), None);
        assert_eq!(ClimateStatus::decode("000"), None);
        assert_eq!(ClimateStatus::decode("00000"), None);
    }
}
