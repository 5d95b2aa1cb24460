//! Controller access split between the local handle and the broker
//!
//! Reads stay local: unprivileged processes may read any key, and the local
//! handle knows each key's type. Writes go to the broker while it grants
//! write access, and fall back to the local handle otherwise (degraded mode,
//! writes to fan keys usually fail there).

use std::sync::Arc;

use fb_protocol::{SensorKey, TypeTag};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::daemon_client::DaemonClient;
use crate::smc::{RawValue, SmcAccess};

pub struct RoutedAccess {
    local: Option<Box<dyn SmcAccess>>,
    broker: Option<Arc<Mutex<DaemonClient>>>,
    degraded_logged: bool,
}

impl RoutedAccess {
    pub fn new(local: Option<Box<dyn SmcAccess>>, broker: Option<Arc<Mutex<DaemonClient>>>) -> Self {
        Self {
            local,
            broker,
            degraded_logged: false,
        }
    }

    /// Whether writes currently reach the broker
    pub fn has_write_access(&self) -> bool {
        self.broker
            .as_ref()
            .map_or(false, |b| b.lock().has_write_access())
    }
}

impl SmcAccess for RoutedAccess {
    fn read_raw(&mut self, key: SensorKey) -> Option<RawValue> {
        self.local.as_mut()?.read_raw(key)
    }

    fn read_value(&mut self, key: SensorKey) -> Option<f64> {
        if let Some(local) = self.local.as_mut() {
            return local.read_value(key);
        }
        let broker = self.broker.as_ref()?;
        let mut client = broker.lock();
        if !client.has_write_access() {
            return None;
        }
        client.read_value(key)
    }

    fn key_type(&mut self, key: SensorKey) -> Option<TypeTag> {
        self.local.as_mut()?.key_type(key)
    }

    fn write(&mut self, key: SensorKey, bytes: &[u8]) -> bool {
        if let Some(broker) = self.broker.as_ref() {
            let mut client = broker.lock();
            if client.has_write_access() {
                self.degraded_logged = false;
                return client.write_key(key, bytes);
            }
        }

        if !self.degraded_logged {
            warn!("no broker write access, writing through the local handle");
            self.degraded_logged = true;
        }
        match self.local.as_mut() {
            Some(local) => local.write(key, bytes),
            None => {
                debug!(key = %key, "no controller available for write");
                false
            }
        }
    }
}
