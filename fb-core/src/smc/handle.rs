//! Controller handle: key metadata, reads, writes and enumeration
//!
//! Every call goes through an `SmcTransport`, which performs one driver
//! round-trip with a fixed-layout parameter block. The handle picks a
//! working driver selector once and pins it.

use std::collections::HashMap;

use fb_error::{FanbridgeError, Result};
use fb_protocol::{SensorKey, TypeTag};
use tracing::{debug, trace, warn};

use super::{codec, RawValue, SmcAccess};
use crate::constants::{driver, keys};

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SmcVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub reserved: u8,
    pub release: u16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SmcPowerLimit {
    pub version: u16,
    pub length: u16,
    pub cpu_limit: u32,
    pub gpu_limit: u32,
    pub mem_limit: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SmcKeyInfo {
    pub data_size: u32,
    pub data_type: u32,
    pub data_attributes: u8,
}

/// Parameter block exchanged with the driver on every call
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SmcParamBlock {
    pub key: u32,
    pub vers: SmcVersion,
    pub power_limit: SmcPowerLimit,
    pub key_info: SmcKeyInfo,
    pub result: u8,
    pub status: u8,
    pub command: u8,
    pub data32: u32,
    pub bytes: [u8; driver::MAX_DATA_BYTES],
}

/// One driver round-trip. The block is both input and output.
pub trait SmcTransport: Send {
    fn call(&mut self, selector: u32, block: &mut SmcParamBlock) -> Result<()>;
}

/// Cached per-key metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub size: u8,
    pub type_tag: TypeTag,
    pub attributes: u8,
}

pub struct Smc<T: SmcTransport> {
    transport: T,
    selector: u32,
    key_info: HashMap<SensorKey, KeyInfo>,
}

impl<T: SmcTransport> std::fmt::Debug for Smc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Smc")
            .field("selector", &self.selector)
            .field("cached_keys", &self.key_info.len())
            .finish()
    }
}

fn plausible_size(size: u32) -> bool {
    (1..=driver::MAX_DATA_BYTES as u32).contains(&size)
}

impl<T: SmcTransport> Smc<T> {
    /// Wrap a transport, probing for a driver selector that answers
    /// key-info calls for well-known keys with a plausible size.
    pub fn with_transport(mut transport: T) -> Result<Self> {
        for selector in driver::KNOWN_SELECTORS {
            for probe in keys::PROBE_KEYS {
                let mut block = SmcParamBlock {
                    key: probe.as_u32(),
                    command: driver::CMD_READ_KEYINFO,
                    ..Default::default()
                };
                match transport.call(selector, &mut block) {
                    Ok(()) if block.result == 0 && plausible_size(block.key_info.data_size) => {
                        debug!(selector, probe = %probe, "pinned controller selector");
                        let mut smc = Self {
                            transport,
                            selector,
                            key_info: HashMap::new(),
                        };
                        smc.key_info.insert(probe, info_from_block(&block));
                        return Ok(smc);
                    }
                    Ok(()) => trace!(selector, probe = %probe, result = block.result, "selector rejected"),
                    Err(e) => trace!(selector, probe = %probe, "selector call failed: {}", e),
                }
            }
        }
        warn!("no controller selector returned a plausible key size");
        Err(FanbridgeError::NoSelector)
    }

    pub fn selector(&self) -> u32 {
        self.selector
    }

    fn call(&mut self, block: &mut SmcParamBlock) -> Result<()> {
        self.transport.call(self.selector, block)
    }

    /// Fetch size and type for a key, cached for the life of the handle
    pub fn key_info(&mut self, key: SensorKey) -> Result<KeyInfo> {
        if let Some(info) = self.key_info.get(&key) {
            return Ok(*info);
        }

        let mut block = SmcParamBlock {
            key: key.as_u32(),
            command: driver::CMD_READ_KEYINFO,
            ..Default::default()
        };
        self.call(&mut block)?;
        if block.result != 0 || !plausible_size(block.key_info.data_size) {
            return Err(FanbridgeError::NotFound(key.to_string()));
        }

        let info = info_from_block(&block);
        self.key_info.insert(key, info);
        Ok(info)
    }

    pub fn read_key(&mut self, key: SensorKey) -> Result<RawValue> {
        let info = self.key_info(key)?;
        let mut block = SmcParamBlock {
            key: key.as_u32(),
            command: driver::CMD_READ_BYTES,
            key_info: SmcKeyInfo {
                data_size: info.size as u32,
                ..Default::default()
            },
            ..Default::default()
        };
        self.call(&mut block)?;
        if block.result != 0 {
            return Err(FanbridgeError::NotFound(key.to_string()));
        }

        Ok(RawValue {
            key,
            size: info.size,
            type_tag: info.type_tag,
            bytes: block.bytes[..info.size as usize].to_vec(),
        })
    }

    /// Write exactly the key's size, zero-padding or truncating `bytes`
    pub fn write_key(&mut self, key: SensorKey, bytes: &[u8]) -> Result<()> {
        let info = self.key_info(key)?;
        let size = info.size as usize;

        let mut block = SmcParamBlock {
            key: key.as_u32(),
            command: driver::CMD_WRITE_BYTES,
            key_info: SmcKeyInfo {
                data_size: info.size as u32,
                ..Default::default()
            },
            ..Default::default()
        };
        let n = bytes.len().min(size);
        block.bytes[..n].copy_from_slice(&bytes[..n]);

        self.call(&mut block)?;
        if block.result != 0 {
            return Err(FanbridgeError::write_failed(
                key.to_string(),
                format!("controller result {}", block.result),
            ));
        }
        Ok(())
    }

    fn key_at_index(&mut self, index: u32) -> Result<SensorKey> {
        let mut block = SmcParamBlock {
            command: driver::CMD_READ_INDEX,
            data32: index,
            ..Default::default()
        };
        self.call(&mut block)?;
        if block.result != 0 {
            return Err(FanbridgeError::NotFound(format!("key index {}", index)));
        }
        SensorKey::from_u32(block.key).map_err(FanbridgeError::InvalidKey)
    }

    /// All keys the controller reports, in index order.
    /// Positions that fail or hold non-printable keys are skipped.
    pub fn enumerate_keys(&mut self) -> Vec<SensorKey> {
        let count = match self.read_key(keys::KEY_COUNT) {
            Ok(raw) => raw.decode().unwrap_or(0.0) as u32,
            Err(e) => {
                warn!("cannot read key count: {}", e);
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.key_at_index(index) {
                Ok(key) => out.push(key),
                Err(e) => trace!(index, "skipping key: {}", e),
            }
        }
        debug!(count, found = out.len(), "enumerated controller keys");
        out
    }
}

fn info_from_block(block: &SmcParamBlock) -> KeyInfo {
    KeyInfo {
        size: block.key_info.data_size as u8,
        type_tag: TypeTag::from_u32(block.key_info.data_type),
        attributes: block.key_info.data_attributes,
    }
}

impl<T: SmcTransport> SmcAccess for Smc<T> {
    fn read_raw(&mut self, key: SensorKey) -> Option<RawValue> {
        self.read_key(key)
            .map_err(|e| trace!(key = %key, "read failed: {}", e))
            .ok()
    }

    fn key_type(&mut self, key: SensorKey) -> Option<TypeTag> {
        self.key_info(key).ok().map(|i| i.type_tag)
    }

    fn write(&mut self, key: SensorKey, bytes: &[u8]) -> bool {
        match self.write_key(key, bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!(key = %key, "write failed: {}", e);
                false
            }
        }
    }
}

impl RawValue {
    pub fn decode(&self) -> Option<f64> {
        codec::decode(self.type_tag, &self.bytes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory controller keyed by name, with an optional working selector
    #[derive(Clone, Default)]
    pub(crate) struct FakeTransport {
        pub selector: u32,
        pub regs: Arc<Mutex<Vec<(SensorKey, TypeTag, Vec<u8>)>>>,
        pub calls: Arc<Mutex<Vec<(u32, u8)>>>,
    }

    impl FakeTransport {
        pub(crate) fn new(selector: u32) -> Self {
            let t = Self { selector, ..Default::default() };
            t.insert("#KEY", "ui32", &[0, 0, 0, 0]);
            t.insert("FNum", "ui8 ", &[1]);
            t
        }

        pub(crate) fn insert(&self, key: &str, tag: &str, bytes: &[u8]) {
            let mut regs = self.regs.lock();
            let key = SensorKey::new(key).unwrap();
            regs.retain(|(k, _, _)| *k != key);
            regs.push((key, TypeTag::new(tag).unwrap(), bytes.to_vec()));
            let n = regs.len() as u32;
            if let Some(entry) = regs.iter_mut().find(|(k, _, _)| k.as_str() == "#KEY") {
                entry.2 = n.to_be_bytes().to_vec();
            }
        }

        pub(crate) fn bytes(&self, key: &str) -> Vec<u8> {
            let regs = self.regs.lock();
            regs.iter()
                .find(|(k, _, _)| k.as_str() == key)
                .map(|(_, _, b)| b.clone())
                .unwrap_or_default()
        }
    }

    impl SmcTransport for FakeTransport {
        fn call(&mut self, selector: u32, block: &mut SmcParamBlock) -> Result<()> {
            self.calls.lock().push((selector, block.command));
            if selector != self.selector {
                block.result = 0x84;
                return Ok(());
            }
            let mut regs = self.regs.lock();
            match block.command {
                driver::CMD_READ_INDEX => match regs.get(block.data32 as usize) {
                    Some((k, _, _)) => block.key = k.as_u32(),
                    None => block.result = 0x84,
                },
                _ => {
                    let Some(entry) = regs.iter_mut().find(|(k, _, _)| k.as_u32() == block.key) else {
                        block.result = 0x84;
                        return Ok(());
                    };
                    match block.command {
                        driver::CMD_READ_KEYINFO => {
                            block.key_info.data_size = entry.2.len() as u32;
                            block.key_info.data_type = entry.1.as_u32();
                        }
                        driver::CMD_READ_BYTES => {
                            block.bytes[..entry.2.len()].copy_from_slice(&entry.2);
                        }
                        driver::CMD_WRITE_BYTES => {
                            let n = block.key_info.data_size as usize;
                            entry.2 = block.bytes[..n].to_vec();
                        }
                        _ => block.result = 0x01,
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn probes_until_a_selector_answers() {
        let fake = FakeTransport::new(5);
        let smc = Smc::with_transport(fake.clone()).unwrap();
        assert_eq!(smc.selector(), 5);
        let tried: Vec<u32> = fake.calls.lock().iter().map(|c| c.0).collect();
        assert_eq!(tried, vec![2, 2, 5]);
    }

    #[test]
    fn no_selector_is_an_error() {
        let fake = FakeTransport::new(99);
        assert!(matches!(
            Smc::with_transport(fake),
            Err(FanbridgeError::NoSelector)
        ));
    }

    #[test]
    fn read_uses_cached_metadata() {
        let fake = FakeTransport::new(2);
        fake.insert("TC0P", "sp78", &[0x28, 0x80]);
        let mut smc = Smc::with_transport(fake.clone()).unwrap();

        let raw = smc.read_key(SensorKey::new("TC0P").unwrap()).unwrap();
        assert_eq!(raw.size, 2);
        assert_eq!(raw.decode(), Some(40.5));

        smc.read_key(SensorKey::new("TC0P").unwrap()).unwrap();
        let info_calls = fake
            .calls
            .lock()
            .iter()
            .filter(|c| c.1 == driver::CMD_READ_KEYINFO)
            .count();
        // one for the probe, one for TC0P
        assert_eq!(info_calls, 2);
    }

    #[test]
    fn write_pads_and_truncates_to_key_size() {
        let fake = FakeTransport::new(2);
        fake.insert("F0Tg", "fpe2", &[0, 0]);
        fake.insert("F0Md", "ui8 ", &[0]);
        let mut smc = Smc::with_transport(fake.clone()).unwrap();

        smc.write_key(SensorKey::new("F0Tg").unwrap(), &[0x12]).unwrap();
        assert_eq!(fake.bytes("F0Tg"), vec![0x12, 0x00]);

        smc.write_key(SensorKey::new("F0Md").unwrap(), &[1, 2, 3]).unwrap();
        assert_eq!(fake.bytes("F0Md"), vec![1]);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let mut smc = Smc::with_transport(FakeTransport::new(2)).unwrap();
        assert!(smc.read_value(SensorKey::new("TZZZ").unwrap()).is_none());
        assert!(!smc.write(SensorKey::new("TZZZ").unwrap(), &[0]));
    }

    #[test]
    fn enumerates_every_key() {
        let fake = FakeTransport::new(2);
        fake.insert("TC0P", "sp78", &[0, 0]);
        fake.insert("F0Ac", "fpe2", &[0, 0]);
        let mut smc = Smc::with_transport(fake).unwrap();
        let names: Vec<String> = smc.enumerate_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(names, vec!["#KEY", "FNum", "TC0P", "F0Ac"]);
    }
}
