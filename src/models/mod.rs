use serde::Serialize;
use serde_json::{json, Value};

/// Represents one decoded meter value. The key is the stable identifier
/// used in the published payload, name and unit are presentation metadata
/// and never used in logic.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Measurement {
    #[serde(skip)]
    pub key: String,
    pub name: String,
    pub value: f64,
    #[serde(rename = "unit_of_measurement", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Measurement {
    pub fn new(key: &str, name: &str, value: f64) -> Self {
        return Measurement {
            key: key.to_string(),
            name: name.to_string(),
            value,
            unit: None,
        };
    }

    pub fn with_unit(key: &str, name: &str, value: f64, unit: &str) -> Self {
        return Measurement {
            key: key.to_string(),
            name: name.to_string(),
            value,
            unit: Some(unit.to_string()),
        };
    }
}

/// Device information extracted from telegram 2, published alongside the
/// measurements but never merged as one.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Metadata {
    pub serial_number: String,
    pub version: u8,
    pub access_number: u8,
    pub status: u8,
}

/// The merged result of one polling cycle. Keeps insertion order, inserting
/// an already known key replaces the value in place, so whatever is merged
/// last wins.
#[derive(Debug, Clone, Default)]
pub struct MeasurementSet {
    measurements: Vec<Measurement>,
    pub metadata: Option<Metadata>,
}

impl MeasurementSet {
    pub fn new() -> Self {
        return MeasurementSet {
            measurements: Vec::new(),
            metadata: None,
        };
    }

    pub fn insert(&mut self, measurement: Measurement) {
        match self.measurements.iter_mut().find(|m| m.key == measurement.key) {
            Some(slot) => { *slot = measurement; }
            None => { self.measurements.push(measurement); }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Measurement> {
        return self.measurements.iter().find(|m| m.key == key);
    }

    pub fn len(&self) -> usize {
        return self.measurements.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.measurements.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        return self.measurements.iter();
    }

    /// Folds another set into this one, its values win on key collisions.
    pub fn merge(&mut self, other: MeasurementSet) {
        for measurement in other.measurements {
            self.insert(measurement);
        }
        if other.metadata.is_some() {
            self.metadata = other.metadata;
        }
    }

    /// The wire shape the consumers expect:
    /// `{"data": {<key>: {"name": ..., "value": ...}, "metadata": {...}}}`
    pub fn to_payload(&self) -> Value {
        let mut data = serde_json::Map::new();
        for measurement in &self.measurements {
            data.insert(measurement.key.clone(), serde_json::to_value(measurement).unwrap());
        }
        if let Some(metadata) = &self.metadata {
            data.insert("metadata".to_string(), serde_json::to_value(metadata).unwrap());
        }
        return json!({ "data": data });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_disjoint_is_union() {
        let mut a = MeasurementSet::new();
        a.insert(Measurement::new("energy_total", "Energy, total", 12.345));
        let mut b = MeasurementSet::new();
        b.insert(Measurement::new("voltage_l1", "Voltage, L1", 230.1));

        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get("energy_total").unwrap().value, 12.345);
        assert_eq!(a.get("voltage_l1").unwrap().value, 230.1);
    }

    #[test]
    fn test_merge_overlap_last_wins() {
        let mut a = MeasurementSet::new();
        a.insert(Measurement::new("energy_total", "Energy, total", 1.0));
        let mut b = MeasurementSet::new();
        b.insert(Measurement::new("energy_total", "Energy, total", 2.0));

        a.merge(b);
        assert_eq!(a.len(), 1);
        assert_eq!(a.get("energy_total").unwrap().value, 2.0);
    }

    #[test]
    fn test_merge_keeps_metadata() {
        let mut a = MeasurementSet::new();
        let mut b = MeasurementSet::new();
        b.metadata = Some(Metadata {
            serial_number: "0caf3202".to_string(),
            version: 32,
            access_number: 7,
            status: 0,
        });

        a.merge(b);
        assert_eq!(a.metadata.unwrap().serial_number, "0caf3202");
    }

    #[test]
    fn test_payload_shape() {
        let mut set = MeasurementSet::new();
        set.insert(Measurement::new("energy_total", "Energy, total", 12.345));
        set.insert(Measurement::with_unit("frequency", "Frequency", 50.02, "Hz"));
        set.metadata = Some(Metadata {
            serial_number: "0caf3202".to_string(),
            version: 32,
            access_number: 7,
            status: 0,
        });

        let payload = set.to_payload();
        assert_eq!(payload["data"]["energy_total"]["name"], "Energy, total");
        assert_eq!(payload["data"]["energy_total"]["value"], 12.345);
        assert!(payload["data"]["energy_total"].get("unit_of_measurement").is_none());
        assert_eq!(payload["data"]["frequency"]["unit_of_measurement"], "Hz");
        assert_eq!(payload["data"]["metadata"]["serial_number"], "0caf3202");
        assert_eq!(payload["data"]["metadata"]["version"], 32);
    }
}
