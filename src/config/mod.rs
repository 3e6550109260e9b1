use log::info;
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs::File;
use std::io::prelude::*;

fn mqtt_client_name_default() -> String { return "abb2mqtt".to_string() }
fn mqtt_topic_default() -> String { return "abb2mqtt/meter".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_topic_default")]
    pub topic: String,
}

/// The two counter layouts seen in the field. They are not distinguishable
/// from the byte content, so the active one is a configuration choice.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum EnergyEncoding {
    /// Little-endian 48 bit counters scaled by 1/1000.
    Integer,
    /// Packed BCD counters scaled by 1/100, sign in the top nibble.
    Bcd,
}

fn meter_baudrate_default() -> u32 { return 2400 }
fn meter_address_default() -> u8 { return 1 }
fn meter_polling_interval_default() -> u64 { return 30 }
fn meter_max_staleness_default() -> u64 { return 300 }
fn meter_encoding_default() -> EnergyEncoding { return EnergyEncoding::Integer }

#[derive(Deserialize, Serialize, Clone)]
pub struct MeterConfig {
    pub device: String,
    #[serde(default="meter_baudrate_default")]
    pub baudrate: u32,
    pub address: u8,
    /// Seconds between two polling cycles.
    #[serde(default="meter_polling_interval_default")]
    pub polling_interval: u64,
    /// Seconds without a successful read before the watchdog gives up.
    #[serde(default="meter_max_staleness_default")]
    pub max_staleness: u64,
    #[serde(default="meter_encoding_default")]
    pub encoding: EnergyEncoding,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub meter: MeterConfig,
}

impl Config {
    pub fn load() -> Self {
        /* Check for the two paths of the config file */
        let mut file = File::open("config/a2m.yaml");
        if file.is_err() {
            file = Ok(File::open("a2m.yaml").expect("Unable to read the config on config/a2m.yaml or a2m.yaml"));
        }

        let mut file = file.unwrap();

        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("Unable to read config file");
        let c: Config = serde_yml::from_str(&contents).expect("Unable to parse config file");
        info!("Configuration loaded, meter {} on {}", c.meter.address, c.meter.device);
        return c;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_with_defaults() {
        let yaml = r"
mqtt:
  host: broker.local
  port: 1883
  user: meter
  pass: secret
meter:
  device: /dev/ttyUSB0
  address: 5
";
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.mqtt.client_name, "abb2mqtt");
        assert_eq!(config.mqtt.topic, "abb2mqtt/meter");
        assert_eq!(config.meter.baudrate, 2400);
        assert_eq!(config.meter.address, 5);
        assert_eq!(config.meter.polling_interval, 30);
        assert_eq!(config.meter.max_staleness, 300);
        assert_eq!(config.meter.encoding, EnergyEncoding::Integer);
    }

    #[test]
    fn test_parse_bcd_encoding() {
        let yaml = r"
mqtt:
  host: broker.local
  port: 1883
  user: meter
  pass: secret
meter:
  device: /dev/ttyAMA0
  address: 1
  encoding: bcd
";
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.meter.encoding, EnergyEncoding::Bcd);
    }
}
