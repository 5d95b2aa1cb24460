//! Control-interface layer for the system management controller
//!
//! - `handle` - driver handle, key metadata cache, read/write/enumerate
//! - `codec` - fixed-point, float and integer value formats
//! - `keys` - sensor category table
//! - `fans` - fan discovery and actuator helpers
//! - `ffi` - IOKit transport (macOS only)
//! - `memory` - in-memory register file for simulation and tests

pub mod codec;
pub mod fans;
pub mod ffi;
mod handle;
pub mod keys;
mod memory;

pub use fans::{FanDescriptor, FanLabel};
pub use handle::{KeyInfo, Smc, SmcKeyInfo, SmcParamBlock, SmcPowerLimit, SmcTransport, SmcVersion};
pub use keys::{classify, is_cpu_temperature, SensorCategory};
pub use memory::MemorySmc;

use fb_error::Result;
use fb_protocol::{SensorKey, TypeTag};

#[cfg(test)]
pub(crate) use handle::tests::FakeTransport;

/// Raw bytes of one key as the controller returned them
#[derive(Debug, Clone, PartialEq)]
pub struct RawValue {
    pub key: SensorKey,
    pub size: u8,
    pub type_tag: TypeTag,
    pub bytes: Vec<u8>,
}

/// Typed access to controller keys.
///
/// Reads never fail loudly: a missing key or undecodable value is `None`.
/// Writes report success as a boolean so callers can retry.
pub trait SmcAccess: Send {
    fn read_raw(&mut self, key: SensorKey) -> Option<RawValue>;

    fn write(&mut self, key: SensorKey, bytes: &[u8]) -> bool;

    fn read_value(&mut self, key: SensorKey) -> Option<f64> {
        self.read_raw(key).and_then(|raw| raw.decode())
    }

    fn key_type(&mut self, key: SensorKey) -> Option<TypeTag> {
        self.read_raw(key).map(|raw| raw.type_tag)
    }
}

impl<A: SmcAccess + ?Sized> SmcAccess for Box<A> {
    fn read_raw(&mut self, key: SensorKey) -> Option<RawValue> {
        (**self).read_raw(key)
    }

    fn write(&mut self, key: SensorKey, bytes: &[u8]) -> bool {
        (**self).write(key, bytes)
    }

    fn read_value(&mut self, key: SensorKey) -> Option<f64> {
        (**self).read_value(key)
    }

    fn key_type(&mut self, key: SensorKey) -> Option<TypeTag> {
        (**self).key_type(key)
    }
}

/// The controller handle for this machine
pub type LocalSmc = Smc<ffi::IoKitTransport>;

/// Open the local controller. Fails with `NotSupported` off macOS.
pub fn open() -> Result<LocalSmc> {
    let transport = ffi::IoKitTransport::open()?;
    Smc::with_transport(transport)
}
