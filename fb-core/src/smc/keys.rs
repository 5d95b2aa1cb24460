//! Sensor classification by key prefix
//!
//! Lookup tables are built once, keyed by the first one or two characters.
//! Two-character entries take precedence over one-character entries.

use std::collections::{HashMap, HashSet};

use fb_protocol::SensorKey;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::constants::keys as well_known;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorCategory {
    Temperature,
    Voltage,
    Current,
    Power,
    Fan,
    Other,
}

impl SensorCategory {
    pub fn unit(&self) -> &'static str {
        match self {
            SensorCategory::Temperature => "°C",
            SensorCategory::Voltage => "V",
            SensorCategory::Current => "A",
            SensorCategory::Power => "W",
            SensorCategory::Fan => "rpm",
            SensorCategory::Other => "",
        }
    }
}

/// Per-fan register suffixes that make an `F<n>..` key fan-related
const FAN_SUFFIXES: [&str; 6] = [
    well_known::FAN_ACTUAL,
    well_known::FAN_MIN,
    well_known::FAN_MAX,
    well_known::FAN_TARGET,
    well_known::FAN_MODE,
    well_known::FAN_ID,
];

lazy_static! {
    static ref CATEGORY_TABLE: HashMap<&'static str, SensorCategory> = {
        let mut m = HashMap::new();
        m.insert("T", SensorCategory::Temperature);
        m.insert("V", SensorCategory::Voltage);
        m.insert("I", SensorCategory::Current);
        m.insert("P", SensorCategory::Power);
        for prefix in ["F0", "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9"] {
            m.insert(prefix, SensorCategory::Fan);
        }
        m
    };

    static ref CPU_TEMPERATURE_PREFIXES: HashSet<&'static str> =
        ["Tp", "Te", "TC"].into_iter().collect();
}

/// Category of a key; fan prefixes only count with a known fan suffix
pub fn classify(key: SensorKey) -> SensorCategory {
    let s = key.as_str();
    if let Some(&cat) = CATEGORY_TABLE.get(&s[..2]) {
        if cat == SensorCategory::Fan && !FAN_SUFFIXES.contains(&&s[2..]) {
            return SensorCategory::Other;
        }
        return cat;
    }
    CATEGORY_TABLE
        .get(&s[..1])
        .copied()
        .unwrap_or(SensorCategory::Other)
}

/// Temperature keys that measure CPU cores or clusters
pub fn is_cpu_temperature(key: SensorKey) -> bool {
    CPU_TEMPERATURE_PREFIXES.contains(&key.as_str()[..2])
}
