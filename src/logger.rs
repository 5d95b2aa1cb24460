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

//! Logging setup
//!
//! The filter comes from `FANBRIDGE_LOG`, then the settings file, then
//! `info`. The broker logs to stdout for launchd to capture; every other
//! mode logs to stderr so snapshot output on stdout stays clean.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FANBRIDGE_LOG";

/// Pick the filter directive to use
pub fn resolve_level(env_value: Option<String>, configured: &str) -> String {
    match env_value {
        Some(v) if !v.trim().is_empty() => v,
        _ if !configured.trim().is_empty() => configured.to_string(),
        _ => "info".to_string(),
    }
}

/// Install the global subscriber. Returns the directive in use.
pub fn init(configured: &str, broker: bool) -> String {
    let level = resolve_level(std::env::var(LOG_ENV).ok(), configured);
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|e| {
        eprintln!("Invalid log filter {:?} ({}), using info", level, e);
        EnvFilter::new("info")
    });

    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter);

    // a second init (tests) is harmless
    let _ = if broker {
        builder.with_writer(std::io::stdout).try_init()
    } else {
        builder.with_writer(std::io::stderr).try_init()
    };
    level
}
