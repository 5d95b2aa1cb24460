/*
 * This file is part of Fanbridge.
 *
 * Copyright (C) 2025 Fanbridge contributors
 *
 * Fanbridge is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fanbridge is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fanbridge. If not, see <https://www.gnu.org/licenses/>.
 */

//! Command line interface

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Default)]
#[command(name = "fanbridge")]
#[command(version)]
#[command(about = "Fanbridge - fan control for Macs")]
#[command(long_about = "Fanbridge - fan control for Macs

Reads controller telemetry without privileges and routes fan writes
through a small root broker installed as a launchd service.

EXAMPLES:
    fanbridge                          Run the control loop (automatic mode)
    fanbridge --manual 60              Hold every fan at 60%
    fanbridge --curve silent           Follow the silent curve
    fanbridge --once --json            Print one sensor snapshot as JSON
    fanbridge --install-service        Install the broker (admin prompt)
    sudo fanbridge --reset-fans        Hand every fan back to the system

ENVIRONMENT VARIABLES:
    FANBRIDGE_LOG=debug    Log filter (trace, debug, info, warn, error)

FILES:
    ~/Library/Application Support/fanbridge/settings.json
    /Library/LaunchDaemons/io.fanbridge.daemon.plist
    /var/log/fanbridge-daemon.log")]
pub struct Cli {
    /// Run as the persistent privileged broker (started by launchd)
    #[arg(long, conflicts_with_all = ["helper", "reset_fans"])]
    pub daemon: bool,

    /// Serve a single client from channels in DIR, then exit
    #[arg(long, value_name = "DIR", conflicts_with = "reset_fans")]
    pub helper: Option<PathBuf>,

    /// Return every fan to automatic control and exit
    #[arg(long)]
    pub reset_fans: bool,

    /// Print one sensor and fan snapshot, then exit
    #[arg(long)]
    pub once: bool,

    /// Emit the snapshot as JSON
    #[arg(long)]
    pub json: bool,

    /// List every controller key with its type
    #[arg(long)]
    pub list_keys: bool,

    /// Install the broker service (asks for an administrator password)
    #[arg(long, conflicts_with = "uninstall_service")]
    pub install_service: bool,

    /// Remove the broker service
    #[arg(long)]
    pub uninstall_service: bool,

    /// Show broker service status
    #[arg(long)]
    pub status: bool,

    /// Hold every fan at PCT percent of its range
    #[arg(long, value_name = "PCT", conflicts_with_all = ["auto", "curve"])]
    pub manual: Option<f64>,

    /// Leave fans under system control
    #[arg(long, conflicts_with = "curve")]
    pub auto: bool,

    /// Follow a built-in curve: silent, balanced or performance
    #[arg(long, value_name = "PRESET")]
    pub curve: Option<String>,

    /// Do not ask the broker for write access
    #[arg(long)]
    pub no_write_access: bool,

    /// Use a simulated two-fan machine instead of the real controller
    #[arg(long)]
    pub simulate: bool,

    /// Broker channel directory (default /tmp/fanbridge)
    #[arg(long, value_name = "DIR")]
    pub channel_dir: Option<PathBuf>,
}

/// What this invocation should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Daemon,
    Helper(PathBuf),
    ResetFans,
    InstallService,
    UninstallService,
    Status,
    ListKeys,
    Snapshot,
    Control,
}

impl Cli {
    pub fn mode(&self) -> Mode {
        if self.daemon {
            Mode::Daemon
        } else if let Some(dir) = &self.helper {
            Mode::Helper(dir.clone())
        } else if self.reset_fans {
            Mode::ResetFans
        } else if self.install_service {
            Mode::InstallService
        } else if self.uninstall_service {
            Mode::UninstallService
        } else if self.status {
            Mode::Status
        } else if self.list_keys {
            Mode::ListKeys
        } else if self.once {
            Mode::Snapshot
        } else {
            Mode::Control
        }
    }

    /// Broker modes log to stdout, which launchd redirects to the log file
    pub fn is_broker(&self) -> bool {
        matches!(self.mode(), Mode::Daemon | Mode::Helper(_))
    }
}
