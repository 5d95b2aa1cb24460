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

//! Process modes of the unprivileged binary
//!
//! The control loop owns two views of the controller: the orchestrator's
//! (moved onto the worker thread, writes routed to the broker) and the
//! poll loop's (reads only). Both fall back to the broker for reads when
//! the local handle cannot be opened.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use fb_core::service::{self, ChannelPaths};
use fb_core::smc::{self, fans};
use fb_core::temperature::{average_temperature, cpu_temperature_keys};
use fb_core::{
    ControlCommand, ControlMode, ControlWorker, CurvePreset, DaemonClient, FanOrchestrator,
    LatestTemperature, LocalSmc, MemorySmc, RawValue, RoutedAccess, SensorKey, ServiceManager,
    Settings, SmcAccess, SystemClock, TypeTag,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cli::Cli;
use crate::report;

/// Probed when the key list is unavailable (no local handle)
const FALLBACK_CPU_KEYS: [&str; 4] = ["TC0P", "TC0D", "Tp01", "Tp05"];

/// Fans in the `--simulate` machine
const SIMULATED_FANS: u32 = 2;

// ============================================================================
// Controller selection
// ============================================================================

/// The local controller, real or simulated
pub enum Controller {
    Local(LocalSmc),
    Simulated(MemorySmc),
}

impl Controller {
    pub fn open(simulate: bool) -> fb_core::Result<Self> {
        if simulate {
            return Ok(Controller::Simulated(MemorySmc::simulated_machine(SIMULATED_FANS)));
        }
        smc::open().map(Controller::Local)
    }

    /// A second handle onto the same controller
    pub fn reopen(&self) -> fb_core::Result<Self> {
        match self {
            Controller::Local(_) => smc::open().map(Controller::Local),
            Controller::Simulated(m) => Ok(Controller::Simulated(m.clone())),
        }
    }

    pub fn keys(&mut self) -> Vec<SensorKey> {
        match self {
            Controller::Local(s) => s.enumerate_keys(),
            Controller::Simulated(m) => m.keys(),
        }
    }
}

impl SmcAccess for Controller {
    fn read_raw(&mut self, key: SensorKey) -> Option<RawValue> {
        match self {
            Controller::Local(s) => s.read_raw(key),
            Controller::Simulated(m) => m.read_raw(key),
        }
    }

    fn write(&mut self, key: SensorKey, bytes: &[u8]) -> bool {
        match self {
            Controller::Local(s) => s.write(key, bytes),
            Controller::Simulated(m) => m.write(key, bytes),
        }
    }

    fn key_type(&mut self, key: SensorKey) -> Option<TypeTag> {
        match self {
            Controller::Local(s) => s.key_type(key),
            Controller::Simulated(m) => m.key_type(key),
        }
    }
}

pub fn channel_paths(cli: &Cli, settings: &Settings) -> ChannelPaths {
    match &cli.channel_dir {
        Some(dir) => ChannelPaths::in_dir(dir),
        None => ChannelPaths::from_settings(&settings.daemon),
    }
}

/// Command line first, then the active profile, then automatic
pub fn initial_mode(cli: &Cli, settings: &Settings) -> anyhow::Result<ControlMode> {
    if let Some(pct) = cli.manual {
        if !(0.0..=100.0).contains(&pct) {
            bail!("manual speed must be between 0 and 100, got {}", pct);
        }
        return Ok(ControlMode::Manual(pct));
    }
    if cli.auto {
        return Ok(ControlMode::Automatic);
    }
    if let Some(name) = &cli.curve {
        let preset = CurvePreset::from_str(name)?;
        return Ok(ControlMode::Curve(preset.to_curve()));
    }
    match &settings.profile {
        Some(profile) => {
            info!(profile = %profile.name, "using saved profile");
            Ok(profile.control_mode()?)
        }
        None => Ok(ControlMode::Automatic),
    }
}

fn cpu_keys(all: &[SensorKey]) -> Vec<SensorKey> {
    let found = cpu_temperature_keys(all);
    if !found.is_empty() {
        return found;
    }
    FALLBACK_CPU_KEYS
        .iter()
        .filter_map(|k| SensorKey::new(k).ok())
        .collect()
}

// ============================================================================
// Control loop
// ============================================================================

fn connect_broker(paths: ChannelPaths, settings: &Settings) -> Arc<Mutex<DaemonClient>> {
    let mut client = DaemonClient::new(paths, Box::new(ServiceManager))
        .with_command_timeout(settings.control.command_timeout());
    match client.request_access() {
        Ok(()) => info!("STARTUP: broker granted write access"),
        Err(e) => warn!("STARTUP: no write access ({}), fan writes will likely fail", e),
    }
    Arc::new(Mutex::new(client))
}

fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

/// Default mode: drive the fans until interrupted, then hand them back
pub fn run_control(cli: &Cli, settings: &Settings) -> anyhow::Result<()> {
    let mode = initial_mode(cli, settings)?;

    let (local, reader_local, keys) = match Controller::open(cli.simulate) {
        Ok(mut controller) => {
            let keys = controller.keys();
            let reader = controller.reopen().ok();
            (Some(controller), reader, keys)
        }
        Err(e) => {
            warn!("STARTUP: controller unavailable ({}), reading through the broker", e);
            (None, None, Vec::new())
        }
    };
    info!("STARTUP: {} controller keys", keys.len());

    let wants_broker = !cli.simulate && !cli.no_write_access && settings.general.request_write_access;
    let broker = wants_broker.then(|| connect_broker(channel_paths(cli, settings), settings));

    let latest = LatestTemperature::new();
    let access = RoutedAccess::new(
        local.map(|c| Box::new(c) as Box<dyn SmcAccess>),
        broker.clone(),
    );
    let mut orchestrator = FanOrchestrator::new(
        access,
        SystemClock::new(),
        Arc::new(latest.clone()),
        settings.control.timing(),
    );
    if orchestrator.discover() == 0 {
        warn!("STARTUP: no fans found");
    }
    let mut worker = ControlWorker::spawn(orchestrator)?;

    // SIGINT and SIGTERM both end the loop so the worker can reset the fans
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        warn!("Failed to set signal handler: {}. Fans are reset only on normal exit.", e);
    }

    let first = match mode {
        ControlMode::Manual(pct) => ControlCommand::SetManual(pct),
        other => ControlCommand::SetMode(other),
    };
    info!("STARTUP: control mode {}", first_mode_name(&first));
    worker.send(first);

    let mut reader = RoutedAccess::new(
        reader_local.map(|c| Box::new(c) as Box<dyn SmcAccess>),
        broker,
    );
    let cpu = cpu_keys(&keys);
    let interval = settings.general.poll_interval();
    let board = worker.board();

    while running.load(Ordering::SeqCst) {
        let temperature = average_temperature(&mut reader, &cpu);
        latest.set(temperature);
        if !worker.send(ControlCommand::Reevaluate) {
            warn!("control worker stopped unexpectedly");
            break;
        }
        for fan in board.snapshot().iter() {
            debug!(
                fan = fan.index,
                rpm = fan.current,
                target = fan.target,
                forced = fan.forced,
                "fan state"
            );
        }
        debug!(temperature = ?temperature, "poll");
        sleep_while_running(interval, &running);
    }

    info!("SHUTDOWN: returning fans to automatic");
    worker.shutdown();
    info!("SHUTDOWN: done");
    Ok(())
}

fn first_mode_name(command: &ControlCommand) -> &'static str {
    match command {
        ControlCommand::SetManual(_) => "manual",
        ControlCommand::SetMode(mode) => mode.name(),
        _ => "unknown",
    }
}

// ============================================================================
// One-shot modes
// ============================================================================

/// `--reset-fans`: no broker involved, needs root to take effect
pub fn reset_fans() -> anyhow::Result<()> {
    let mut smc = smc::open().context("cannot open the controller")?;
    // SAFETY: geteuid only returns the process's effective user ID.
    if unsafe { libc::geteuid() } != 0 {
        warn!("not running as root, the controller may refuse these writes");
    }

    let found = fans::discover_fans(&mut smc);
    if !fans::reset_all_to_automatic(&mut smc, &found) {
        bail!("some fans did not accept the reset");
    }
    println!("{} fan(s) returned to automatic control", found.len());
    Ok(())
}

pub fn snapshot(cli: &Cli) -> anyhow::Result<()> {
    let mut controller = Controller::open(cli.simulate).context("cannot open the controller")?;
    let keys = controller.keys();
    let snapshot = report::collect(&mut controller, &keys);
    if cli.json {
        println!("{}", report::render_json(&snapshot)?);
    } else {
        print!("{}", report::render_text(&snapshot));
    }
    Ok(())
}

pub fn list_keys(cli: &Cli) -> anyhow::Result<()> {
    let mut controller = Controller::open(cli.simulate).context("cannot open the controller")?;
    let keys = controller.keys();
    print!("{}", report::render_key_list(&mut controller, &keys));
    Ok(())
}

pub fn install_service() -> anyhow::Result<()> {
    service::install_service().context("service installation failed")?;
    println!("Broker service installed");
    Ok(())
}

pub fn uninstall_service() -> anyhow::Result<()> {
    service::uninstall_service().context("service removal failed")?;
    println!("Broker service removed");
    Ok(())
}

pub fn status(cli: &Cli, settings: &Settings) {
    println!("{}", service::service_status(&channel_paths(cli, settings)));
}
