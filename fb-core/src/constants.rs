//! Constants and configuration values for Fanbridge
//!
//! Centralizes all magic numbers, paths, and timing defaults.
//! This is the single source of truth; other modules import from here.

use std::time::Duration;

/// Filesystem locations
pub mod paths {
    /// Directory holding the broker's channels in persistent mode
    pub const CHANNEL_DIR: &str = "/tmp/fanbridge";

    /// Request channel (client writes, broker reads)
    pub const REQUEST_CHANNEL: &str = "fanbridge.req";

    /// Response channel (broker writes, client reads)
    pub const RESPONSE_CHANNEL: &str = "fanbridge.resp";

    /// Zero-byte marker present while the broker is waiting for a client
    pub const READY_MARKER: &str = "fanbridge.ready";

    /// Broker log file, stdout/stderr of the installed service
    pub const DAEMON_LOG: &str = "/var/log/fanbridge-daemon.log";

    /// Settings file name inside the user config directory
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Config directory name under the platform config root
    pub const APP_DIR: &str = "fanbridge";
}

/// Installed service descriptor
pub mod service {
    pub const LABEL: &str = "io.fanbridge.daemon";

    pub const DESCRIPTOR_DIR: &str = "/Library/LaunchDaemons";

    pub const DESCRIPTOR_PATH: &str = "/Library/LaunchDaemons/io.fanbridge.daemon.plist";

    /// Flag passed to the binary by the service descriptor
    pub const DAEMON_FLAG: &str = "--daemon";

    pub const HELPER_FLAG: &str = "--helper";
}

/// Well-known controller keys and values
pub mod keys {
    use fb_protocol::SensorKey;

    /// Total number of keys (ui32)
    pub const KEY_COUNT: SensorKey = SensorKey::from_static(b"#KEY");

    /// Number of fans
    pub const FAN_COUNT: SensorKey = SensorKey::from_static(b"FNum");

    /// Forced-mode bitmask covering all fans, one bit per fan
    pub const FORCE_BITMASK: SensorKey = SensorKey::from_static(b"FS! ");

    /// Unlock flag: asks the OS thermal daemon to let go of the fans
    pub const UNLOCK_FLAG: SensorKey = SensorKey::from_static(b"Ftst");

    /// Per-fan key suffixes, `F<n><suffix>`
    pub const FAN_ACTUAL: &str = "Ac";
    pub const FAN_MIN: &str = "Mn";
    pub const FAN_MAX: &str = "Mx";
    pub const FAN_TARGET: &str = "Tg";
    pub const FAN_MODE: &str = "Md";
    pub const FAN_ID: &str = "ID";

    /// Fan mode values
    pub const MODE_AUTOMATIC: u8 = 0;
    pub const MODE_FORCED: u8 = 1;
    /// Fan held by the OS thermal daemon
    pub const MODE_SYSTEM: u8 = 3;

    /// Keys probed when choosing a driver selector
    pub const PROBE_KEYS: [SensorKey; 2] = [KEY_COUNT, FAN_COUNT];
}

/// Controller driver parameters
pub mod driver {
    /// IOKit service class of the controller
    pub const SERVICE_CLASS: &str = "AppleSMC";

    /// Preferred registry entry on newer machines
    pub const KEYS_ENDPOINT: &str = "AppleSMCKeysEndpoint";

    /// Known driver entry points, tried in order
    pub const KNOWN_SELECTORS: [u32; 3] = [2, 5, 3];

    pub const CMD_READ_BYTES: u8 = 5;
    pub const CMD_WRITE_BYTES: u8 = 6;
    pub const CMD_READ_INDEX: u8 = 8;
    pub const CMD_READ_KEYINFO: u8 = 9;

    /// Fixed data buffer of the parameter block
    pub const MAX_DATA_BYTES: usize = fb_protocol::MAX_VALUE_BYTES;
}

/// Timing for the connection manager
pub mod connect {
    use super::Duration;

    /// Wait for an installed-but-starting broker
    pub const INSTALLED_WAIT: Duration = Duration::from_secs(10);

    /// Wait after a fresh install
    pub const INSTALL_WAIT: Duration = Duration::from_secs(15);

    /// Wait after launching the single-shot helper
    pub const HELPER_WAIT: Duration = Duration::from_secs(30);

    /// Readiness poll interval
    pub const READY_POLL: Duration = Duration::from_millis(250);

    /// Per-command reply timeout
    pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

    /// Initial response buffer size
    pub const INITIAL_BUFFER_SIZE: usize = 256;
}

/// Timing and bounds for the fan orchestrator
pub mod control {
    use super::Duration;

    /// How long to watch for the OS thermal daemon to yield
    pub const UNLOCK_POLL_WINDOW: Duration = Duration::from_secs(6);

    pub const UNLOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Extra settle time after a yield before re-asserting the unlock flag
    pub const UNLOCK_STABILIZE: Duration = Duration::from_secs(1);

    /// Delay between writing and reading back the mode key
    pub const VERIFY_DELAY: Duration = Duration::from_millis(300);

    /// Delay after re-sending the unlock flag before a retry
    pub const RELOCK_DELAY: Duration = Duration::from_millis(500);

    /// Write-verify-retry bound
    pub const MAX_WRITE_ATTEMPTS: u32 = 3;

    /// Curve cooldown before releasing fans back to automatic
    pub const CURVE_COOLDOWN: Duration = Duration::from_secs(30);

    /// Fixed-interval poll loop
    pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
}

/// Default curve points (temperature C, speed %)
pub mod default_curve {
    pub fn silent() -> Vec<(f64, f64)> {
        vec![(45.0, 0.0), (65.0, 20.0), (80.0, 60.0), (95.0, 100.0)]
    }

    pub fn balanced() -> Vec<(f64, f64)> {
        vec![(40.0, 0.0), (55.0, 30.0), (75.0, 70.0), (90.0, 100.0)]
    }

    pub fn performance() -> Vec<(f64, f64)> {
        vec![(35.0, 20.0), (50.0, 50.0), (65.0, 80.0), (80.0, 100.0)]
    }
}

/// Curve bounds
pub mod curve {
    pub const MIN_POINTS: usize = 2;
    pub const MIN_PERCENT: f64 = 0.0;
    pub const MAX_PERCENT: f64 = 100.0;
    pub const FLOAT_EPSILON: f64 = 0.001;
}
