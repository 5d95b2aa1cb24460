//! Application Settings
//!
//! Persistent settings stored as JSON in <config_dir>/fanbridge/settings.json

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fb_error::{FanbridgeError, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{connect, control, paths};
use crate::engine::{ControlMode, ControlTiming, CurvePreset, FanCurve};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub control: ControlSettings,

    #[serde(default)]
    pub daemon: DaemonSettings,

    /// Active profile handed over by the profile layer
    #[serde(default)]
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Sensor polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Used when FANBRIDGE_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ask for broker access on start
    #[serde(default = "default_true")]
    pub request_write_access: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSettings {
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_unlock_window")]
    pub unlock_poll_window_ms: u64,

    #[serde(default = "default_unlock_interval")]
    pub unlock_poll_interval_ms: u64,

    #[serde(default = "default_verify_delay")]
    pub verify_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Channel directory override; the well-known directory when unset
    #[serde(default)]
    pub channel_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileMode {
    Automatic,
    Manual,
    Curve,
}

/// A named profile: `{ name, mode, curve? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub mode: ProfileMode,

    #[serde(default)]
    pub manual_speed: Option<f64>,

    #[serde(default)]
    pub curve: Option<FanCurve>,
}

impl Profile {
    /// Control mode this profile asks for. A curve profile without points
    /// uses the balanced preset.
    pub fn control_mode(&self) -> Result<ControlMode> {
        match self.mode {
            ProfileMode::Automatic => Ok(ControlMode::Automatic),
            ProfileMode::Manual => {
                let pct = self.manual_speed.ok_or_else(|| {
                    FanbridgeError::config(format!("profile '{}' has no manual speed", self.name))
                })?;
                Ok(ControlMode::Manual(pct))
            }
            ProfileMode::Curve => Ok(ControlMode::Curve(
                self.curve.clone().unwrap_or_else(|| CurvePreset::Balanced.to_curve()),
            )),
        }
    }
}

fn default_poll_interval() -> u64 { control::POLL_INTERVAL.as_millis() as u64 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }
fn default_cooldown() -> u64 { control::CURVE_COOLDOWN.as_secs() }
fn default_command_timeout() -> u64 { connect::COMMAND_TIMEOUT.as_millis() as u64 }
fn default_unlock_window() -> u64 { control::UNLOCK_POLL_WINDOW.as_millis() as u64 }
fn default_unlock_interval() -> u64 { control::UNLOCK_POLL_INTERVAL.as_millis() as u64 }
fn default_verify_delay() -> u64 { control::VERIFY_DELAY.as_millis() as u64 }
fn default_max_attempts() -> u32 { control::MAX_WRITE_ATTEMPTS }

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            log_level: default_log_level(),
            request_write_access: true,
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
            command_timeout_ms: default_command_timeout(),
            unlock_poll_window_ms: default_unlock_window(),
            unlock_poll_interval_ms: default_unlock_interval(),
            verify_delay_ms: default_verify_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl GeneralSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }
}

impl ControlSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Orchestrator timing; at least one write attempt is always made
    pub fn timing(&self) -> ControlTiming {
        ControlTiming {
            unlock_poll_window: Duration::from_millis(self.unlock_poll_window_ms),
            unlock_poll_interval: Duration::from_millis(self.unlock_poll_interval_ms.max(1)),
            verify_delay: Duration::from_millis(self.verify_delay_ms),
            max_attempts: self.max_attempts.max(1),
            cooldown: Duration::from_secs(self.cooldown_secs),
            ..ControlTiming::default()
        }
    }
}

/// ~/Library/Application Support/fanbridge/settings.json on macOS
pub fn settings_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| FanbridgeError::config("Could not determine config directory"))?;
    Ok(dir.join(paths::APP_DIR).join(paths::SETTINGS_FILE))
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from(&settings_path()?)
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &settings_path()?)
}

/// Defaults when the file does not exist
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| FanbridgeError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content)
        .map_err(|e| FanbridgeError::config(format!("Failed to parse settings JSON: {}", e)))
}

/// Write to a temp file then rename over the old one
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            FanbridgeError::config(format!("Failed to create config directory: {}", e))
        })?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    let temp_path = path.with_extension("json.tmp");

    let write_err = |e| FanbridgeError::FileWrite {
        path: temp_path.clone(),
        source: e,
    };
    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(json.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| FanbridgeError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.general.poll_interval_ms, 2000);
        assert_eq!(settings.control.cooldown_secs, 30);
        assert_eq!(settings.control.command_timeout_ms, 5000);
        assert!(settings.profile.is_none());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"control":{"cooldown_secs":45}}"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.control.cooldown_secs, 45);
        assert_eq!(settings.control.max_attempts, 3);
        assert_eq!(settings.general.log_level, "info");
        assert_eq!(settings.control.timing().cooldown, Duration::from_secs(45));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = Settings::default();
        settings.profile = Some(Profile {
            name: "desk".into(),
            mode: ProfileMode::Curve,
            manual_speed: None,
            curve: Some(CurvePreset::Silent.to_curve()),
        });
        settings.daemon.channel_dir = Some(PathBuf::from("/tmp/fb-test"));

        save_settings_to(&settings, &path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn corrupt_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_settings_from(&path), Err(FanbridgeError::Config(_))));
    }

    #[test]
    fn profile_modes() {
        let manual = Profile {
            name: "loud".into(),
            mode: ProfileMode::Manual,
            manual_speed: Some(80.0),
            curve: None,
        };
        assert_eq!(manual.control_mode().unwrap(), ControlMode::Manual(80.0));

        let broken = Profile { manual_speed: None, ..manual };
        assert!(broken.control_mode().is_err());

        let curve = Profile {
            name: "auto-curve".into(),
            mode: ProfileMode::Curve,
            manual_speed: None,
            curve: None,
        };
        assert_eq!(curve.control_mode().unwrap(), ControlMode::Curve(FanCurve::default()));
    }
}
