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

use anyhow::Context;
use clap::Parser;
use fb_core::{load_settings, Settings};
use fb_daemon::ServeMode;
use tracing::{info, warn};

use fanbridge::app;
use fanbridge::cli::{Cli, Mode};
use fanbridge::logger;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // the broker runs as root and keeps no settings of its own
    let (settings, settings_error) = if cli.is_broker() {
        (Settings::default(), None)
    } else {
        match load_settings() {
            Ok(s) => (s, None),
            Err(e) => (Settings::default(), Some(e)),
        }
    };

    let level = logger::init(&settings.general.log_level, cli.is_broker());
    if let Some(e) = settings_error {
        warn!("Could not load settings ({}), using defaults", e);
    }
    info!("fanbridge {} (log level {})", env!("CARGO_PKG_VERSION"), level);

    match cli.mode() {
        Mode::Daemon => {
            let paths = app::channel_paths(&cli, &settings);
            let mut controller = app::Controller::open(cli.simulate).context("opening the controller")?;
            fb_daemon::run(paths, ServeMode::Persistent, &mut controller)
        }
        Mode::Helper(dir) => {
            let mut controller = app::Controller::open(cli.simulate).context("opening the controller")?;
            fb_daemon::run(fb_core::ChannelPaths::in_dir(dir), ServeMode::SingleShot, &mut controller)
        }
        Mode::ResetFans => app::reset_fans(),
        Mode::InstallService => app::install_service(),
        Mode::UninstallService => app::uninstall_service(),
        Mode::Status => {
            app::status(&cli, &settings);
            Ok(())
        }
        Mode::ListKeys => app::list_keys(&cli),
        Mode::Snapshot => app::snapshot(&cli),
        Mode::Control => app::run_control(&cli, &settings),
    }
}
