//! In-memory controller
//!
//! Backs `--simulate` runs and the test suites of every crate. Writes are
//! padded or truncated to the stored size exactly like the driver does.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use fb_protocol::{SensorKey, TypeTag};
use parking_lot::Mutex;

use super::{codec, RawValue, SmcAccess};
use crate::constants::keys;

#[derive(Debug, Default)]
struct MemoryState {
    regs: BTreeMap<SensorKey, (TypeTag, Vec<u8>)>,
    writes: Vec<(SensorKey, Vec<u8>)>,
    rejected: HashSet<SensorKey>,
    ignored: HashSet<SensorKey>,
}

/// Shared in-memory register file. Clones see the same registers.
#[derive(Debug, Clone, Default)]
pub struct MemorySmc {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySmc {
    pub fn new() -> Self {
        Self::default()
    }

    /// A machine with `fans` fans (1200..6000 rpm, float keys), a forced
    /// bitmask, the unlock flag and a handful of CPU temperature sensors.
    pub fn simulated_machine(fans: u32) -> Self {
        let smc = Self::new();
        smc.insert_value(keys::FAN_COUNT, TypeTag::UI8, fans as f64);
        for i in 0..fans {
            let key = |suffix| SensorKey::fan(i as usize, suffix);
            let entries = [
                (keys::FAN_ACTUAL, 1800.0),
                (keys::FAN_MIN, 1200.0),
                (keys::FAN_MAX, 6000.0),
                (keys::FAN_TARGET, 1200.0),
            ];
            for (suffix, value) in entries {
                if let Ok(k) = key(suffix) {
                    smc.insert_value(k, TypeTag::FLT, value);
                }
            }
            if let Ok(k) = key(keys::FAN_MODE) {
                smc.insert_value(k, TypeTag::UI8, keys::MODE_AUTOMATIC as f64);
            }
        }
        smc.insert_value(keys::FORCE_BITMASK, TypeTag::UI16, 0.0);
        smc.insert_value(keys::UNLOCK_FLAG, TypeTag::UI8, 0.0);
        for (name, temp) in [("Tp01", 48.0), ("Tp05", 52.5), ("Te05", 45.0), ("TG0P", 40.0)] {
            if let Ok(k) = SensorKey::new(name) {
                smc.insert_value(k, TypeTag::FLT, temp);
            }
        }
        smc
    }

    pub fn insert(&self, key: SensorKey, type_tag: TypeTag, bytes: &[u8]) {
        self.state.lock().regs.insert(key, (type_tag, bytes.to_vec()));
    }

    pub fn insert_value(&self, key: SensorKey, type_tag: TypeTag, value: f64) {
        if let Some(bytes) = codec::encode(type_tag, value) {
            self.insert(key, type_tag, &bytes);
        }
    }

    pub fn value(&self, key: SensorKey) -> Option<f64> {
        let state = self.state.lock();
        let (tag, bytes) = state.regs.get(&key)?;
        codec::decode(*tag, bytes)
    }

    pub fn bytes(&self, key: SensorKey) -> Option<Vec<u8>> {
        self.state.lock().regs.get(&key).map(|(_, b)| b.clone())
    }

    pub fn keys(&self) -> Vec<SensorKey> {
        self.state.lock().regs.keys().copied().collect()
    }

    /// Every write attempted so far, in order
    pub fn writes(&self) -> Vec<(SensorKey, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Writes to `key` report failure
    pub fn reject_writes(&self, key: SensorKey) {
        self.state.lock().rejected.insert(key);
    }

    /// Writes to `key` report success but leave the value untouched,
    /// the way the OS thermal daemon silently reclaims a fan
    pub fn ignore_writes(&self, key: SensorKey) {
        self.state.lock().ignored.insert(key);
    }

    pub fn accept_writes(&self, key: SensorKey) {
        let mut state = self.state.lock();
        state.ignored.remove(&key);
        state.rejected.remove(&key);
    }
}

impl SmcAccess for MemorySmc {
    fn read_raw(&mut self, key: SensorKey) -> Option<RawValue> {
        let state = self.state.lock();
        let (type_tag, bytes) = state.regs.get(&key)?;
        Some(RawValue {
            key,
            size: bytes.len() as u8,
            type_tag: *type_tag,
            bytes: bytes.clone(),
        })
    }

    fn key_type(&mut self, key: SensorKey) -> Option<TypeTag> {
        self.state.lock().regs.get(&key).map(|(t, _)| *t)
    }

    fn write(&mut self, key: SensorKey, bytes: &[u8]) -> bool {
        let mut state = self.state.lock();
        state.writes.push((key, bytes.to_vec()));
        if state.rejected.contains(&key) {
            return false;
        }
        let ignored = state.ignored.contains(&key);
        match state.regs.get_mut(&key) {
            Some((_, stored)) => {
                if !ignored {
                    let size = stored.len();
                    let mut next = bytes.to_vec();
                    next.resize(size, 0);
                    *stored = next;
                }
                true
            }
            None => false,
        }
    }
}
