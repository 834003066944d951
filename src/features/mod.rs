//! Per-capture traffic features: fixed schema, streaming extraction, splitting.

mod extractor;
mod split;
mod stats;

pub use extractor::{processed_dir, DeepExtractOptions, FeatureExtractor};
pub use split::{SplitBackend, Splitter};

use crate::error::ConfigurationError;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;

/// Integer counters, in schema order.
pub const COUNTER_NAMES: [&str; 35] = [
    "packet_count",
    // TCP flags, bit 0 (FIN) .. bit 8 (NS)
    "FIN",
    "SYN",
    "RST",
    "PSH",
    "ACK",
    "URG",
    "ECE",
    "CWR",
    "NS",
    // protocols
    "TCP",
    "UDP",
    "ICMP",
    "DNS",
    "HTTP",
    // well-known ports
    "port_21",
    "port_22",
    "port_23",
    "port_25",
    "port_53",
    "port_80",
    "port_110",
    "port_111",
    "port_135",
    "port_139",
    "port_143",
    "port_443",
    "port_445",
    "port_993",
    "port_995",
    "port_1723",
    "port_3306",
    "port_3389",
    "port_5900",
    "port_8080",
];

/// Running averages, in schema order after the counters.
pub const AVERAGE_NAMES: [&str; 3] = ["Avg_delta_time", "Avg_packet_length", "Avg_TCP_payload_length"];

pub const FEATURE_COUNT: usize = COUNTER_NAMES.len() + AVERAGE_NAMES.len();

/// Tracked ports and the counter each one feeds.
pub const PORT_TABLE: [(u16, &str); 20] = [
    (21, "port_21"),     // FTP
    (22, "port_22"),     // SSH
    (23, "port_23"),     // Telnet
    (25, "port_25"),     // SMTP
    (53, "port_53"),     // DNS
    (80, "port_80"),     // HTTP
    (110, "port_110"),   // POP3
    (111, "port_111"),   // ONC RPC
    (135, "port_135"),   // EPMAP
    (139, "port_139"),   // NetBIOS session
    (143, "port_143"),   // IMAP
    (443, "port_443"),   // HTTPS
    (445, "port_445"),   // Microsoft-DS
    (993, "port_993"),   // IMAPS
    (995, "port_995"),   // POP3S
    (1723, "port_1723"), // PPTP
    (3306, "port_3306"), // MySQL
    (3389, "port_3389"), // RDP
    (5900, "port_5900"), // VNC
    (8080, "port_8080"), // HTTP proxy
];

pub(crate) const PACKET_COUNT: usize = 0;
pub(crate) const FLAG_BASE: usize = 1;
pub(crate) const TCP: usize = 10;
pub(crate) const UDP: usize = 11;
pub(crate) const ICMP: usize = 12;
pub(crate) const DNS: usize = 13;
pub(crate) const HTTP: usize = 14;

pub(crate) const AVG_DELTA_TIME: usize = 0;
pub(crate) const AVG_PACKET_LENGTH: usize = 1;
pub(crate) const AVG_TCP_PAYLOAD: usize = 2;

/// Port → counter index, built from a port table after checking it against the schema.
pub fn port_index(table: &[(u16, &str)]) -> Result<HashMap<u16, usize>, ConfigurationError> {
    let mut index = HashMap::with_capacity(table.len());
    for &(port, name) in table {
        let slot = COUNTER_NAMES.iter().position(|n| *n == name);
        match slot {
            Some(slot) if name == format!("port_{}", port) => {
                index.insert(port, slot);
            }
            _ => {
                return Err(ConfigurationError::PortTable {
                    port,
                    name: name.to_string(),
                })
            }
        }
    }
    Ok(index)
}

/// Fixed-schema feature vector of one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub(crate) counters: [u64; COUNTER_NAMES.len()],
    pub(crate) averages: [f64; AVERAGE_NAMES.len()],
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self {
            counters: [0; COUNTER_NAMES.len()],
            averages: [0.0; AVERAGE_NAMES.len()],
        }
    }
}

impl FeatureVector {
    pub fn packet_count(&self) -> u64 {
        self.counters[PACKET_COUNT]
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        COUNTER_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.counters[i])
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        AVERAGE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.averages[i])
    }

    /// Any field by name, counters widened to f64
    pub fn get(&self, name: &str) -> Option<f64> {
        self.counter(name)
            .map(|c| c as f64)
            .or_else(|| self.average(name))
    }

    /// (name, value) pairs in schema order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        COUNTER_NAMES
            .iter()
            .zip(self.counters.iter().map(|c| *c as f64))
            .chain(AVERAGE_NAMES.iter().zip(self.averages.iter().copied()))
            .map(|(n, v)| (*n, v))
    }

    /// Matrix row for clustering
    pub fn to_row(&self) -> Vec<f64> {
        self.iter().map(|(_, v)| v).collect()
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FEATURE_COUNT))?;
        for (name, count) in COUNTER_NAMES.iter().zip(self.counters.iter()) {
            map.serialize_entry(name, count)?;
        }
        for (name, avg) in AVERAGE_NAMES.iter().zip(self.averages.iter()) {
            map.serialize_entry(name, avg)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_port_table_is_consistent() {
        let index = port_index(&PORT_TABLE).unwrap();
        assert_eq!(index.len(), 20);
        assert_eq!(COUNTER_NAMES[index[&80]], "port_80");
        assert_eq!(COUNTER_NAMES[index[&8080]], "port_8080");
    }

    #[test]
    fn mismatched_port_name_is_rejected() {
        let err = port_index(&[(22, "port_22"), (80, "port_8080")]).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::PortTable {
                port: 80,
                name: "port_8080".into()
            }
        );
    }

    #[test]
    fn unknown_port_field_is_rejected() {
        assert!(port_index(&[(8443, "port_8443")]).is_err());
    }

    #[test]
    fn schema_indices_line_up() {
        assert_eq!(COUNTER_NAMES[FLAG_BASE], "FIN");
        assert_eq!(COUNTER_NAMES[FLAG_BASE + 8], "NS");
        assert_eq!(COUNTER_NAMES[TCP], "TCP");
        assert_eq!(COUNTER_NAMES[HTTP], "HTTP");
        assert_eq!(AVERAGE_NAMES[AVG_TCP_PAYLOAD], "Avg_TCP_payload_length");
        assert_eq!(FEATURE_COUNT, 38);
    }

    #[test]
    fn serializes_as_named_map() {
        let mut fv = FeatureVector::default();
        fv.counters[PACKET_COUNT] = 3;
        fv.averages[AVG_PACKET_LENGTH] = 60.0;
        let json = serde_json::to_value(&fv).unwrap();
        assert_eq!(json["packet_count"], 3);
        assert_eq!(json["Avg_packet_length"], 60.0);
        assert_eq!(json.as_object().unwrap().len(), FEATURE_COUNT);
    }
}
