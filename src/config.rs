use std::env;
use std::time::Duration;

use crate::lookin::LOOKIN_PORT;
use crate::lookin::http::HttpTimeouts;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub lookin: LookinConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct LookinConfig {
    /// Devices polled over HTTP; UDP events are bridged regardless.
    pub hosts: Vec<String>,
    pub udp_port: u16,
    /// Inbound UDP queue capacity, 0 for unbounded.
    pub queue_size: usize,
    pub discovery_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,
}

impl LookinConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeouts(&self) -> HttpTimeouts {
        let total = Duration::from_secs(self.http_timeout_secs);
        HttpTimeouts {
            total,
            connect: total.saturating_sub(Duration::from_secs(1)).max(Duration::from_secs(1)),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn required(&self, key: &str) -> Result<String, String> {
        (self.lookup)(key).ok_or_else(|| format!("{key} environment variable is required"))
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn or_default<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, String> {
        match self.optional(key) {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| format!("{key} has an invalid value: {v}")),
            None => Ok(default),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let env = Env { lookup };

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env.required("MQTT_BROKER_HOST")?,
                broker_port: env.or_default("MQTT_BROKER_PORT", 1883)?,
                username: env.optional("MQTT_USERNAME"),
                password: env.optional("MQTT_PASSWORD"),
                topic_prefix: env.or_default("MQTT_TOPIC_PREFIX", "lookin".to_string())?,
                client_id: env.or_default("MQTT_CLIENT_ID", "lookin-to-mqtt".to_string())?,
            },
            lookin: LookinConfig {
                hosts: parse_hosts(&env.optional("LOOKIN_HOSTS").unwrap_or_default()),
                udp_port: env.or_default("LOOKIN_UDP_PORT", LOOKIN_PORT)?,
                queue_size: env.or_default("LOOKIN_QUEUE_SIZE", 64)?,
                discovery_interval_secs: env.or_default("LOOKIN_DISCOVERY_INTERVAL_SECS", 60)?,
                poll_interval_secs: env.or_default("LOOKIN_POLL_INTERVAL_SECS", 60)?,
                http_timeout_secs: env.or_default("LOOKIN_HTTP_TIMEOUT_SECS", 9)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.lookin.discovery_interval_secs == 0 {
            return Err("LOOKIN_DISCOVERY_INTERVAL_SECS must be > 0".into());
        }
        if self.lookin.poll_interval_secs == 0 {
            return Err("LOOKIN_POLL_INTERVAL_SECS must be > 0".into());
        }
        if self.lookin.http_timeout_secs == 0 {
            return Err("LOOKIN_HTTP_TIMEOUT_SECS must be > 0".into());
        }
        Ok(())
    }

    pub fn bridge_status_topic(&self) -> String {
        format!("{}/bridge_status", self.mqtt.topic_prefix)
    }

    /// `{prefix}/{device}/{suffix}`
    pub fn device_topic(&self, device_id: &str, suffix: &str) -> String {
        format!(
            "{}/{}/{}",
            self.mqtt.topic_prefix,
            sanitize_topic_name(device_id),
            suffix
        )
    }

    pub fn command_subscription(&self) -> String {
        format!("{}/+/command/#", self.mqtt.topic_prefix)
    }
}

fn parse_hosts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect()
}

/// Convert a device id into a safe MQTT topic segment.
/// "98F3:3011" → "98f3_3011"
pub fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("MQTT_BROKER_HOST", "broker.local")]).unwrap();
        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "lookin");
        assert!(config.lookin.hosts.is_empty());
        assert_eq!(config.lookin.udp_port, 61201);
        assert_eq!(config.lookin.queue_size, 64);
        assert_eq!(config.lookin.http_timeouts().total, Duration::from_secs(9));
        assert_eq!(config.lookin.http_timeouts().connect, Duration::from_secs(8));
    }

    #[test]
    fn test_hosts_and_overrides() {
        let config = load(&[
            ("MQTT_BROKER_HOST", "broker.local"),
            ("LOOKIN_HOSTS", " 192.168.1.20, ,192.168.1.21:80 "),
            ("LOOKIN_QUEUE_SIZE", "0"),
            ("MQTT_TOPIC_PREFIX", "home/ir"),
        ])
        .unwrap();
        assert_eq!(config.lookin.hosts, vec!["192.168.1.20", "192.168.1.21:80"]);
        assert_eq!(config.lookin.queue_size, 0);
        assert_eq!(
            config.device_topic("98F33011", "meteo"),
            "home/ir/98f33011/meteo"
        );
        assert_eq!(config.command_subscription(), "home/ir/+/command/#");
    }

    #[test]
    fn test_validation_errors() {
        assert!(load(&[]).unwrap_err().contains("MQTT_BROKER_HOST"));
        assert!(
            load(&[("MQTT_BROKER_HOST", "b"), ("LOOKIN_POLL_INTERVAL_SECS", "0")])
                .unwrap_err()
                .contains("LOOKIN_POLL_INTERVAL_SECS")
        );
        assert!(
            load(&[("MQTT_BROKER_HOST", "b"), ("LOOKIN_UDP_PORT", "seventy")])
                .unwrap_err()
                .contains("LOOKIN_UDP_PORT")
        );
    }

    #[test]
    fn test_sanitize_topic_name() {
        assert_eq!(sanitize_topic_name("98F3:3011"), "98f3_3011");
        assert_eq!(sanitize_topic_name("__AB__"), "ab");
    }
}
