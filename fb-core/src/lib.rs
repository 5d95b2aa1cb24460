//! Fanbridge Core Library
//!
//! Controller telemetry and fan control for Macs.
//!
//! # Module Structure
//!
//! - `smc/` - Control-interface layer: driver handle, value codec, fan helpers
//! - `engine/` - Fan curves, hysteresis, the orchestrator and its worker thread
//! - `daemon_client` - Connection to the privileged broker
//! - `service` - launchd install and broker channel paths
//! - `routed` - Local reads, broker writes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fb_core::{ControlTiming, FanOrchestrator, LatestTemperature, MemorySmc, SystemClock};
//!
//! let smc = MemorySmc::simulated_machine(2);
//! let mut orchestrator = FanOrchestrator::new(
//!     smc,
//!     SystemClock::new(),
//!     Arc::new(LatestTemperature::new()),
//!     ControlTiming::default(),
//! );
//! orchestrator.discover();
//! orchestrator.set_manual_speed(60.0).unwrap();
//! ```

// Grouped modules
pub mod engine;
pub mod smc;

// Standalone modules
pub mod clock;
pub mod constants;
pub mod daemon_client;
pub mod routed;
pub mod service;
pub mod settings;
pub mod temperature;

pub use fb_error::{FanbridgeError, Result};
pub use fb_protocol::{SensorKey, TypeTag};

pub use clock::{Clock, ManualClock, SystemClock};
pub use daemon_client::{ConnectionState, ConnectWindows, DaemonClient, DaemonLink, Elevator};
pub use engine::{
    ControlCommand, ControlMode, ControlTiming, ControlWorker, CurvePhase, CurvePoint, CurvePreset,
    FanBoard, FanCurve, FanOrchestrator, FanSpeed,
};
pub use routed::RoutedAccess;
pub use service::{ChannelPaths, ServiceManager};
pub use settings::{load_settings, save_settings, Profile, ProfileMode, Settings};
pub use smc::{FanDescriptor, FanLabel, LocalSmc, MemorySmc, RawValue, SensorCategory, SmcAccess};
pub use temperature::{LatestTemperature, TemperatureSource};
