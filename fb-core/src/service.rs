//! Service Management
//!
//! Installs the privileged broker as a launchd system daemon and launches
//! the single-shot helper. Every elevated action goes through one
//! `osascript ... with administrator privileges` call, so the user sees a
//! single password prompt per action.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use fb_error::{FanbridgeError, Result};
use tracing::{debug, info};

use crate::constants::{paths, service};
use crate::daemon_client::Elevator;
use crate::settings::DaemonSettings;

/// Where the broker's channels and ready marker live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub dir: PathBuf,
    pub request: PathBuf,
    pub response: PathBuf,
    pub ready: PathBuf,
}

impl ChannelPaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            request: dir.join(paths::REQUEST_CHANNEL),
            response: dir.join(paths::RESPONSE_CHANNEL),
            ready: dir.join(paths::READY_MARKER),
            dir,
        }
    }

    /// The well-known directory the installed broker uses
    pub fn system() -> Self {
        Self::in_dir(paths::CHANNEL_DIR)
    }

    pub fn from_settings(settings: &DaemonSettings) -> Self {
        match &settings.channel_dir {
            Some(dir) => Self::in_dir(dir),
            None => Self::system(),
        }
    }
}

impl Default for ChannelPaths {
    fn default() -> Self {
        Self::system()
    }
}

// ============================================================================
// Descriptor
// ============================================================================

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// launchd property list running `<binary> --daemon` at boot, restarted on exit
pub fn launchd_plist(binary: &Path) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{binary}</string>
        <string>{flag}</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{log}</string>
    <key>StandardErrorPath</key>
    <string>{log}</string>
</dict>
</plist>
"#,
        label = service::LABEL,
        binary = xml_escape(&binary.to_string_lossy()),
        flag = service::DAEMON_FLAG,
        log = paths::DAEMON_LOG,
    )
}

// ============================================================================
// Health
// ============================================================================

pub fn is_service_installed() -> bool {
    Path::new(service::DESCRIPTOR_PATH).exists()
}

/// The broker has created its channels and is waiting for a client
pub fn is_ready(paths: &ChannelPaths) -> bool {
    paths.ready.exists()
}

/// Service status as a human-readable string
pub fn service_status(paths: &ChannelPaths) -> String {
    match (is_service_installed(), is_ready(paths)) {
        (_, true) => format!("Broker ready ({})", paths.dir.display()),
        (true, false) => format!("Installed ({}) - broker not ready", service::LABEL),
        (false, false) => "Not installed".to_string(),
    }
}

// ============================================================================
// Installation
// ============================================================================

fn current_binary() -> Result<PathBuf> {
    std::env::current_exe()
        .map_err(|e| FanbridgeError::InstallFailed(format!("cannot locate own binary: {}", e)))
}

/// Install the descriptor and bootstrap it (one elevated prompt)
pub fn install_service() -> Result<()> {
    let binary = current_binary()?;
    let staged = std::env::temp_dir().join(format!("{}.plist", service::LABEL));
    fs::write(&staged, launchd_plist(&binary)).map_err(|e| FanbridgeError::FileWrite {
        path: staged.clone(),
        source: e,
    })?;

    let dest = shell_quote(service::DESCRIPTOR_PATH);
    let script = format!(
        "mkdir -p {dir} && cp {src} {dest} && chown root:wheel {dest} && chmod 644 {dest} && \
         (launchctl bootout system/{label} 2>/dev/null; true) && \
         launchctl bootstrap system {dest}",
        dir = shell_quote(service::DESCRIPTOR_DIR),
        src = shell_quote(&staged.to_string_lossy()),
        dest = dest,
        label = service::LABEL,
    );

    info!(binary = %binary.display(), "installing broker service");
    let result = run_elevated(&script).map_err(|e| FanbridgeError::InstallFailed(e.to_string()));
    let _ = fs::remove_file(&staged);
    result
}

pub fn uninstall_service() -> Result<()> {
    let script = format!(
        "(launchctl bootout system/{label} 2>/dev/null; true) && rm -f {dest}",
        label = service::LABEL,
        dest = shell_quote(service::DESCRIPTOR_PATH),
    );
    info!("uninstalling broker service");
    run_elevated(&script)
}

/// Start `<binary> --helper <dir>` elevated and in the background
pub fn launch_helper(dir: &Path) -> Result<()> {
    let binary = current_binary()?;
    let script = format!(
        "{bin} {flag} {dir} > /dev/null 2>&1 &",
        bin = shell_quote(&binary.to_string_lossy()),
        flag = service::HELPER_FLAG,
        dir = shell_quote(&dir.to_string_lossy()),
    );
    info!(dir = %dir.display(), "launching single-shot broker helper");
    run_elevated(&script)
}

/// Elevation through launchd and osascript
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceManager;

impl Elevator for ServiceManager {
    fn is_installed(&self) -> bool {
        is_service_installed()
    }

    fn install(&self) -> Result<()> {
        install_service()
    }

    fn launch_helper(&self, dir: &Path) -> Result<()> {
        launch_helper(dir)
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Single-quote for sh
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Escape for an AppleScript string literal
fn applescript_escape(s: &str) -> String {
    s.replace('\\', r"\\").replace('"', "\\\"")
}

fn run_elevated(script: &str) -> Result<()> {
    if !cfg!(target_os = "macos") {
        return Err(FanbridgeError::NotSupported(
            "privileged install needs macOS".to_string(),
        ));
    }

    let source = format!(
        "do shell script \"{}\" with administrator privileges",
        applescript_escape(script)
    );
    debug!("running elevated script");
    let output = Command::new("osascript")
        .args(["-e", &source])
        .output()
        .map_err(|e| FanbridgeError::PrivilegeEscalation(format!("Failed to run osascript: {}", e)))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(FanbridgeError::PrivilegeEscalation(format!(
            "Command failed: {}",
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plist_runs_daemon_mode_with_log_redirect() {
        let plist = launchd_plist(Path::new("/Applications/Fan & Co/fanbridge"));
        assert!(plist.contains("<string>io.fanbridge.daemon</string>"));
        assert!(plist.contains("<string>--daemon</string>"));
        assert!(plist.contains("<key>KeepAlive</key>"));
        assert!(plist.contains("<key>RunAtLoad</key>"));
        assert!(plist.contains("Fan &amp; Co"));
        assert_eq!(plist.matches("/var/log/fanbridge-daemon.log").count(), 2);
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(applescript_escape(r#"say "hi" \ bye"#), r#"say \"hi\" \\ bye"#);
    }

    #[test]
    fn channel_paths_share_a_directory() {
        let paths = ChannelPaths::in_dir("/tmp/fb-x");
        assert_eq!(paths.request, PathBuf::from("/tmp/fb-x/fanbridge.req"));
        assert_eq!(paths.response, PathBuf::from("/tmp/fb-x/fanbridge.resp"));
        assert_eq!(paths.ready, PathBuf::from("/tmp/fb-x/fanbridge.ready"));
        assert_eq!(ChannelPaths::default().dir, PathBuf::from("/tmp/fanbridge"));

        let settings = DaemonSettings {
            channel_dir: Some(PathBuf::from("/var/tmp/fb")),
        };
        assert_eq!(ChannelPaths::from_settings(&settings).dir, PathBuf::from("/var/tmp/fb"));
    }

    #[test]
    fn readiness_follows_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        assert!(!is_ready(&paths));
        fs::write(&paths.ready, b"").unwrap();
        assert!(is_ready(&paths));
        assert!(service_status(&paths).starts_with("Broker ready"));
    }
}
