//! Temperature input for curve evaluation

use std::sync::Arc;

use fb_protocol::SensorKey;
use parking_lot::RwLock;

use crate::smc::{classify, is_cpu_temperature, SensorCategory, SmcAccess};

/// Readings outside this band are sensor glitches
const PLAUSIBLE_CELSIUS: std::ops::RangeInclusive<f64> = 1.0..=125.0;

/// Supplies the temperature the active curve is evaluated against
#[cfg_attr(test, mockall::automock)]
pub trait TemperatureSource: Send + Sync {
    fn current_temperature(&self) -> Option<f64>;
}

/// Latest value published by the poll loop
#[derive(Debug, Clone, Default)]
pub struct LatestTemperature {
    cell: Arc<RwLock<Option<f64>>>,
}

impl LatestTemperature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: Option<f64>) {
        *self.cell.write() = value;
    }
}

impl TemperatureSource for LatestTemperature {
    fn current_temperature(&self) -> Option<f64> {
        *self.cell.read()
    }
}

/// CPU temperature keys among an enumerated key list
pub fn cpu_temperature_keys(all: &[SensorKey]) -> Vec<SensorKey> {
    all.iter()
        .copied()
        .filter(|k| classify(*k) == SensorCategory::Temperature && is_cpu_temperature(*k))
        .collect()
}

/// Mean of the plausible readings among `keys`
pub fn average_temperature<A: SmcAccess + ?Sized>(smc: &mut A, keys: &[SensorKey]) -> Option<f64> {
    let readings: Vec<f64> = keys
        .iter()
        .filter_map(|k| smc.read_value(*k))
        .filter(|t| PLAUSIBLE_CELSIUS.contains(t))
        .collect();
    if readings.is_empty() {
        return None;
    }
    Some(readings.iter().sum::<f64>() / readings.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smc::MemorySmc;
    use fb_protocol::TypeTag;

    #[test]
    fn averages_cpu_sensors_only() {
        let mut smc = MemorySmc::simulated_machine(1);
        let keys = cpu_temperature_keys(&smc.keys());
        assert_eq!(keys.len(), 3);
        let avg = average_temperature(&mut smc, &keys).unwrap();
        assert!((avg - 48.5).abs() < 1e-9);
    }

    #[test]
    fn ignores_implausible_readings() {
        let mut smc = MemorySmc::new();
        let a = SensorKey::new("Tp01").unwrap();
        let b = SensorKey::new("Tp02").unwrap();
        smc.insert_value(a, TypeTag::FLT, 60.0);
        smc.insert_value(b, TypeTag::FLT, -127.0);
        assert_eq!(average_temperature(&mut smc, &[a, b]), Some(60.0));
        assert_eq!(average_temperature(&mut smc, &[b]), None);
    }

    #[test]
    fn latest_cell_is_shared() {
        let cell = LatestTemperature::new();
        let reader = cell.clone();
        assert_eq!(reader.current_temperature(), None);
        cell.set(Some(71.0));
        assert_eq!(reader.current_temperature(), Some(71.0));
    }
}
