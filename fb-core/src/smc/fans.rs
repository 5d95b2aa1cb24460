//! Fan discovery and actuator helpers
//!
//! Speed keys are written in whatever format the controller reports for
//! them (float on newer machines, 14.2 fixed-point on older ones). Forced
//! mode goes through the per-fan mode key when present, otherwise through
//! the forced bitmask that covers all fans.

use fb_protocol::{SensorKey, TypeTag};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{codec, SmcAccess};
use crate::constants::keys;

/// Display label for a fan's control state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanLabel {
    Auto,
    Pct(u8),
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanDescriptor {
    pub index: u32,
    /// Measured speed, rpm
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub target: f64,
    pub forced: bool,
    pub label: FanLabel,
}

impl FanDescriptor {
    /// Position of the current speed within `[min, max]`, 0..=100
    pub fn speed_percentage(&self) -> f64 {
        percentage_of(self.current, self.min, self.max)
    }

    /// Target rpm for a percentage of the fan's range
    pub fn rpm_for_percentage(&self, pct: f64) -> f64 {
        let pct = pct.clamp(0.0, 100.0);
        self.min + (self.max - self.min).max(0.0) * pct / 100.0
    }

    fn relabel(&mut self) {
        self.label = if !self.forced {
            FanLabel::Auto
        } else {
            let pct = percentage_of(self.target, self.min, self.max);
            if pct >= 100.0 {
                FanLabel::Max
            } else {
                FanLabel::Pct(pct.round() as u8)
            }
        };
    }
}

fn percentage_of(rpm: f64, min: f64, max: f64) -> f64 {
    if max <= min {
        return 0.0;
    }
    ((rpm - min) / (max - min)).clamp(0.0, 1.0) * 100.0
}

pub fn fan_key(index: u32, suffix: &str) -> Option<SensorKey> {
    SensorKey::fan(index as usize, suffix)
        .map_err(|e| warn!("cannot build fan key: {}", e))
        .ok()
}

fn read_fan_value<A: SmcAccess + ?Sized>(smc: &mut A, index: u32, suffix: &str) -> Option<f64> {
    smc.read_value(fan_key(index, suffix)?)
}

/// Encode for a key in its reported format, or `fallback` when the type is
/// unknown. With no fallback an untyped key is not written: RPM keys come
/// as `flt ` or `fpe2` and a guess would be resized by the broker.
fn encode_for<A: SmcAccess + ?Sized>(
    smc: &mut A,
    key: SensorKey,
    value: f64,
    fallback: Option<TypeTag>,
) -> Option<Vec<u8>> {
    let Some(tag) = smc.key_type(key).or(fallback) else {
        warn!(key = %key, "key type unknown, refusing write");
        return None;
    };
    let bytes = codec::encode(tag, value);
    if bytes.is_none() {
        debug!(key = %key, type_tag = %tag, "no encoder for key type");
    }
    bytes
}

fn write_value<A: SmcAccess + ?Sized>(
    smc: &mut A,
    key: SensorKey,
    value: f64,
    fallback: Option<TypeTag>,
) -> bool {
    match encode_for(smc, key, value, fallback) {
        Some(bytes) => smc.write(key, &bytes),
        None => false,
    }
}

fn key_exists<A: SmcAccess + ?Sized>(smc: &mut A, key: SensorKey) -> bool {
    smc.key_type(key).is_some() || smc.read_value(key).is_some()
}

pub fn fan_count<A: SmcAccess + ?Sized>(smc: &mut A) -> usize {
    smc.read_value(keys::FAN_COUNT)
        .map(|n| n.max(0.0) as usize)
        .unwrap_or(0)
}

/// Enumerate fans and read their static range once.
/// Fans without a readable maximum are skipped.
pub fn discover_fans<A: SmcAccess + ?Sized>(smc: &mut A) -> Vec<FanDescriptor> {
    let count = fan_count(smc);
    let mut fans = Vec::with_capacity(count);

    for index in 0..count as u32 {
        let Some(max) = read_fan_value(smc, index, keys::FAN_MAX) else {
            warn!(fan = index, "fan has no readable maximum, skipping");
            continue;
        };
        let min = read_fan_value(smc, index, keys::FAN_MIN).unwrap_or(0.0);
        let seed = FanDescriptor {
            index,
            current: min,
            min,
            max,
            target: min,
            forced: false,
            label: FanLabel::Auto,
        };
        fans.push(read_fan(smc, &seed));
    }

    debug!(count = fans.len(), "discovered fans");
    fans
}

/// Refresh the dynamic fields of a fan; unreadable fields keep their old value
pub fn read_fan<A: SmcAccess + ?Sized>(smc: &mut A, fan: &FanDescriptor) -> FanDescriptor {
    let mut next = fan.clone();
    if let Some(rpm) = read_fan_value(smc, fan.index, keys::FAN_ACTUAL) {
        next.current = rpm;
    }
    if let Some(rpm) = read_fan_value(smc, fan.index, keys::FAN_TARGET) {
        next.target = rpm;
    }
    if let Some(forced) = is_forced(smc, fan.index) {
        next.forced = forced;
    }
    next.relabel();
    next
}

pub fn set_target_rpm<A: SmcAccess + ?Sized>(smc: &mut A, index: u32, rpm: f64) -> bool {
    match fan_key(index, keys::FAN_TARGET) {
        Some(key) => write_value(smc, key, rpm, None),
        None => false,
    }
}

pub fn set_min_rpm<A: SmcAccess + ?Sized>(smc: &mut A, index: u32, rpm: f64) -> bool {
    match fan_key(index, keys::FAN_MIN) {
        Some(key) => write_value(smc, key, rpm, None),
        None => false,
    }
}

/// Raw value of the per-fan mode key
pub fn read_mode<A: SmcAccess + ?Sized>(smc: &mut A, index: u32) -> Option<u8> {
    read_fan_value(smc, index, keys::FAN_MODE).map(|m| m as u8)
}

fn fan_bit(index: u32) -> u16 {
    1u16.checked_shl(index).unwrap_or(0)
}

fn read_bitmask<A: SmcAccess + ?Sized>(smc: &mut A) -> Option<u16> {
    smc.read_value(keys::FORCE_BITMASK).map(|v| v as u16)
}

/// Forced-vs-automatic, from the mode key or else the bitmask
pub fn is_forced<A: SmcAccess + ?Sized>(smc: &mut A, index: u32) -> Option<bool> {
    if let Some(mode) = read_mode(smc, index) {
        return Some(mode == keys::MODE_FORCED);
    }
    read_bitmask(smc).map(|mask| mask & fan_bit(index) != 0)
}

pub fn set_forced<A: SmcAccess + ?Sized>(smc: &mut A, index: u32, forced: bool) -> bool {
    if let Some(mode_key) = fan_key(index, keys::FAN_MODE) {
        if key_exists(smc, mode_key) {
            let mode = if forced { keys::MODE_FORCED } else { keys::MODE_AUTOMATIC };
            return write_value(smc, mode_key, mode as f64, Some(TypeTag::UI8));
        }
    }

    let mask = read_bitmask(smc).unwrap_or(0);
    let mask = if forced { mask | fan_bit(index) } else { mask & !fan_bit(index) };
    write_value(smc, keys::FORCE_BITMASK, mask as f64, Some(TypeTag::UI16))
}

/// Set or clear the unlock flag that holds off the OS thermal daemon
pub fn set_unlock<A: SmcAccess + ?Sized>(smc: &mut A, on: bool) -> bool {
    write_value(smc, keys::UNLOCK_FLAG, if on { 1.0 } else { 0.0 }, Some(TypeTag::UI8))
}

/// Hand every fan back to automatic control.
///
/// Writes mode 0 per fan, restores the discovered minimum, zeroes the forced
/// bitmask and clears the unlock flag. Both the per-fan and bitmask paths are
/// attempted because either may be inert on a given machine. Returns whether
/// every write to a key that exists succeeded.
pub fn reset_all_to_automatic<A: SmcAccess + ?Sized>(smc: &mut A, fans: &[FanDescriptor]) -> bool {
    let mut ok = true;

    for fan in fans {
        if let Some(mode_key) = fan_key(fan.index, keys::FAN_MODE) {
            if key_exists(smc, mode_key) {
                ok &= write_value(smc, mode_key, keys::MODE_AUTOMATIC as f64, Some(TypeTag::UI8));
            }
        }
        ok &= set_min_rpm(smc, fan.index, fan.min);
    }

    let bitmask_known = key_exists(smc, keys::FORCE_BITMASK);
    if !write_value(smc, keys::FORCE_BITMASK, 0.0, Some(TypeTag::UI16)) && bitmask_known {
        ok = false;
    }

    let unlock_known = key_exists(smc, keys::UNLOCK_FLAG);
    if !set_unlock(smc, false) && unlock_known {
        ok = false;
    }

    if ok {
        debug!(fans = fans.len(), "fans returned to automatic");
    } else {
        warn!(fans = fans.len(), "some writes failed while returning fans to automatic");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smc::{FakeTransport, Smc};

    fn machine() -> FakeTransport {
        let fake = FakeTransport::new(2);
        fake.insert("FNum", "ui8 ", &[1]);
        fake.insert("F0Ac", "flt ", &1800f32.to_ne_bytes());
        fake.insert("F0Mn", "flt ", &1200f32.to_ne_bytes());
        fake.insert("F0Mx", "flt ", &6000f32.to_ne_bytes());
        fake.insert("F0Tg", "flt ", &1200f32.to_ne_bytes());
        fake.insert("F0Md", "ui8 ", &[0]);
        fake.insert("FS! ", "ui16", &[0, 0]);
        fake.insert("Ftst", "ui8 ", &[0]);
        fake
    }

    #[test]
    fn percentage_mapping_clamps() {
        let mut fan = FanDescriptor {
            index: 0,
            current: 3600.0,
            min: 1200.0,
            max: 6000.0,
            target: 0.0,
            forced: false,
            label: FanLabel::Auto,
        };
        assert_eq!(fan.speed_percentage(), 50.0);
        fan.current = 9000.0;
        assert_eq!(fan.speed_percentage(), 100.0);
        fan.current = 100.0;
        assert_eq!(fan.speed_percentage(), 0.0);
        fan.max = fan.min;
        assert_eq!(fan.speed_percentage(), 0.0);
        assert_eq!(fan.rpm_for_percentage(50.0), 1200.0);
    }

    #[test]
    fn discovers_fan_range_and_state() {
        let mut smc = Smc::with_transport(machine()).unwrap();
        let fans = discover_fans(&mut smc);
        assert_eq!(fans.len(), 1);
        assert_eq!(fans[0].min, 1200.0);
        assert_eq!(fans[0].max, 6000.0);
        assert_eq!(fans[0].current, 1800.0);
        assert_eq!(fans[0].label, FanLabel::Auto);
    }

    #[test]
    fn target_uses_fixed_point_when_reported() {
        let fake = machine();
        fake.insert("F0Tg", "fpe2", &[0, 0]);
        let mut smc = Smc::with_transport(fake.clone()).unwrap();
        assert!(set_target_rpm(&mut smc, 0, 1200.0));
        assert_eq!(fake.bytes("F0Tg"), vec![0x12, 0xc0]);
    }

    #[test]
    fn forced_mode_prefers_mode_key() {
        let fake = machine();
        let mut smc = Smc::with_transport(fake.clone()).unwrap();
        assert!(set_forced(&mut smc, 0, true));
        assert_eq!(fake.bytes("F0Md"), vec![1]);
        assert_eq!(fake.bytes("FS! "), vec![0, 0]);
        assert_eq!(is_forced(&mut smc, 0), Some(true));
    }

    #[test]
    fn forced_mode_falls_back_to_bitmask() {
        let fake = FakeTransport::new(2);
        fake.insert("FNum", "ui8 ", &[2]);
        fake.insert("FS! ", "ui16", &[0, 0]);
        let mut smc = Smc::with_transport(fake.clone()).unwrap();
        assert!(set_forced(&mut smc, 1, true));
        assert_eq!(fake.bytes("FS! "), vec![0, 2]);
        assert_eq!(is_forced(&mut smc, 1), Some(true));
        assert_eq!(is_forced(&mut smc, 0), Some(false));
        assert!(set_forced(&mut smc, 1, false));
        assert_eq!(fake.bytes("FS! "), vec![0, 0]);
    }

    #[test]
    fn reset_clears_everything() {
        let fake = machine();
        let mut smc = Smc::with_transport(fake.clone()).unwrap();
        let fans = discover_fans(&mut smc);
        set_forced(&mut smc, 0, true);
        set_min_rpm(&mut smc, 0, 4000.0);
        set_unlock(&mut smc, true);
        fake.insert("FS! ", "ui16", &[0, 1]);

        assert!(reset_all_to_automatic(&mut smc, &fans));
        assert_eq!(fake.bytes("F0Md"), vec![0]);
        assert_eq!(fake.bytes("F0Mn"), 1200f32.to_ne_bytes().to_vec());
        assert_eq!(fake.bytes("FS! "), vec![0, 0]);
        assert_eq!(fake.bytes("Ftst"), vec![0]);
    }

    #[test]
    fn forced_label_reflects_target() {
        let fake = machine();
        fake.insert("F0Md", "ui8 ", &[1]);
        fake.insert("F0Tg", "flt ", &6000f32.to_ne_bytes());
        let mut smc = Smc::with_transport(fake).unwrap();
        let fans = discover_fans(&mut smc);
        assert_eq!(fans[0].label, FanLabel::Max);
    }

    /// Values readable but no type information, like the broker-only view
    struct Untyped(crate::smc::MemorySmc);

    impl SmcAccess for Untyped {
        fn read_raw(&mut self, _key: SensorKey) -> Option<crate::smc::RawValue> {
            None
        }

        fn read_value(&mut self, key: SensorKey) -> Option<f64> {
            self.0.read_value(key)
        }

        fn write(&mut self, key: SensorKey, bytes: &[u8]) -> bool {
            self.0.write(key, bytes)
        }
    }

    #[test]
    fn rpm_write_needs_a_known_type() {
        let memory = crate::smc::MemorySmc::simulated_machine(1);
        let mut smc = Untyped(memory.clone());
        let tg = SensorKey::new("F0Tg").unwrap();

        assert!(!set_target_rpm(&mut smc, 0, 3000.0));
        assert!(!set_min_rpm(&mut smc, 0, 3000.0));
        assert_eq!(memory.value(tg), Some(1200.0));
        // integer keys still have a safe default
        assert!(set_forced(&mut smc, 0, true));
        assert_eq!(memory.value(SensorKey::new("F0Md").unwrap()), Some(1.0));
    }
}
