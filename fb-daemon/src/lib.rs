//! Fanbridge broker
//!
//! The only privileged piece of Fanbridge. It owns the controller handle and
//! answers `READ` / `WRITE` lines from one unprivileged client at a time
//! over a pair of named pipes.
//!
//! # Modes
//! - **Persistent**: started by launchd as root, serves clients forever.
//! - **Single-shot**: started once through an elevation prompt when the
//!   service is missing, serves one client and exits.
//!
//! # Hygiene
//! - Refuses to run persistently unless euid is 0
//! - Working directory set to `/`
//! - Channel files removed on SIGINT/SIGTERM and on normal exit
//! - Fans handed back to automatic after every session that wrote

pub mod channels;
pub mod server;

use std::fs::File;
use std::time::Duration;

use anyhow::bail;
use fb_core::{ChannelPaths, SmcAccess};
use tracing::{debug, error, info, warn};

pub use server::{dispatch, release_fans, serve_session, SessionStats};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Persistent,
    SingleShot,
}

// ============================================================================
// Process hygiene
// ============================================================================

/// Log panics before unwinding
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC at {}: {}", location, message);
    }));
}

fn secure_working_directory() {
    if std::env::set_current_dir("/").is_err() {
        warn!("Could not chdir to /");
    }
    debug!("Working directory set to /");
}

fn verify_privileges() -> anyhow::Result<()> {
    // SAFETY: geteuid and getuid only return the process's user IDs.
    let euid = unsafe { libc::geteuid() };
    let uid = unsafe { libc::getuid() };

    if euid != 0 {
        bail!("broker must run as root (euid=0) to write controller keys");
    }
    if uid != 0 {
        warn!("Running as setuid root - this is not recommended");
    }

    info!("Running as root (uid={}, euid={})", uid, euid);
    Ok(())
}

fn install_signal_cleanup(paths: &ChannelPaths) {
    let paths = paths.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - removing channels");
        channels::cleanup(&paths);
        info!("SHUTDOWN: broker terminated");
        std::process::exit(0);
    }) {
        warn!("Failed to set signal handler: {}. Channel files may be left behind.", e);
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Consecutive failed accepts before a persistent broker gives up
const MAX_ACCEPT_FAILURES: u32 = 5;

/// Pause after the first failed accept; doubles up to `MAX_ACCEPT_BACKOFF`
const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(5);

fn accept_backoff(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(5);
    (ACCEPT_BACKOFF * factor).min(MAX_ACCEPT_BACKOFF)
}

/// Where a channel cycle failed
#[derive(Debug)]
enum CycleError {
    /// Channels could not be published; retrying will not help
    Publish(fb_error::FanbridgeError),
    /// No client got connected
    Accept(fb_error::FanbridgeError),
}

/// Publish the channels and wait for a client; the ready marker is gone on return
fn publish_and_accept(paths: &ChannelPaths) -> Result<(File, File), CycleError> {
    channels::prepare(paths).map_err(CycleError::Publish)?;
    debug!("waiting for a client");

    let accepted = channels::accept(paths);
    channels::clear_ready(paths);
    let pair = accepted.map_err(CycleError::Accept)?;
    info!("client connected");
    Ok(pair)
}

/// Serve one connected client. Returns whether it wrote anything.
fn serve_client(
    (mut request, mut response): (File, File),
    smc: &mut dyn SmcAccess,
) -> fb_error::Result<bool> {
    let stats = serve_session(&mut request, &mut response, smc)?;
    Ok(stats.writes > 0)
}

fn after_session(outcome: fb_error::Result<bool>, smc: &mut dyn SmcAccess) {
    match outcome {
        Ok(false) => {}
        Ok(true) => {
            if !release_fans(smc) {
                warn!("fans may still be forced after the client left");
            }
        }
        Err(e) => {
            warn!("session ended with error: {}", e);
            release_fans(smc);
        }
    }
}

/// Serve clients back to back until the process is signalled.
///
/// Failing to publish the channels is fatal. Failed accepts are retried
/// with a growing pause and become fatal after `MAX_ACCEPT_FAILURES` in a row.
pub fn run_persistent(paths: &ChannelPaths, smc: &mut dyn SmcAccess) -> anyhow::Result<()> {
    let mut failures = 0u32;
    loop {
        let pair = match publish_and_accept(paths) {
            Ok(pair) => {
                failures = 0;
                pair
            }
            Err(CycleError::Publish(e)) => {
                channels::cleanup(paths);
                bail!("cannot publish channels: {}", e);
            }
            Err(CycleError::Accept(e)) => {
                failures += 1;
                if failures >= MAX_ACCEPT_FAILURES {
                    channels::cleanup(paths);
                    bail!("giving up after {} failed accepts: {}", failures, e);
                }
                let pause = accept_backoff(failures);
                warn!(failures, ?pause, "accept failed: {}", e);
                std::thread::sleep(pause);
                continue;
            }
        };
        let outcome = serve_client(pair, smc);
        after_session(outcome, smc);
    }
}

/// Serve exactly one client, then remove the channel files
pub fn run_single_shot(paths: &ChannelPaths, smc: &mut dyn SmcAccess) -> anyhow::Result<()> {
    let pair = match publish_and_accept(paths) {
        Ok(pair) => pair,
        Err(CycleError::Publish(e)) | Err(CycleError::Accept(e)) => {
            channels::cleanup(paths);
            bail!("helper could not take a client: {}", e);
        }
    };
    let outcome = serve_client(pair, smc);
    let failed = outcome.as_ref().err().map(|e| e.to_string());
    after_session(outcome, smc);
    channels::cleanup(paths);

    match failed {
        Some(msg) => Err(anyhow::anyhow!("helper session failed: {}", msg)),
        None => Ok(()),
    }
}

/// Broker entry point for both modes.
///
/// Installs the hygiene hooks and serves `smc` until done.
pub fn run(paths: ChannelPaths, mode: ServeMode, smc: &mut dyn SmcAccess) -> anyhow::Result<()> {
    install_panic_hook();

    info!("STARTUP: fanbridge broker {} starting ({:?})", VERSION, mode);
    info!("STARTUP: Channel directory: {}", paths.dir.display());
    info!("STARTUP: PID: {}", std::process::id());

    if mode == ServeMode::Persistent {
        if let Err(e) = verify_privileges() {
            error!("{}", e);
            return Err(e);
        }
    }
    secure_working_directory();

    install_signal_cleanup(&paths);

    let result = match mode {
        ServeMode::Persistent => run_persistent(&paths, smc),
        ServeMode::SingleShot => run_single_shot(&paths, smc),
    };

    // one last reset in case the loop bailed while fans were forced
    release_fans(smc);
    channels::cleanup(&paths);
    info!("SHUTDOWN: broker stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use fb_core::{MemorySmc, SensorKey};
    use std::fs::OpenOptions;
    use std::io::{BufRead, BufReader, Write};
    use std::time::{Duration, Instant};

    fn wait_for(path: &std::path::Path) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn single_shot_serves_once_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let smc = MemorySmc::simulated_machine(1);

        let broker_paths = paths.clone();
        let mut broker_smc = smc.clone();
        let broker = std::thread::spawn(move || run_single_shot(&broker_paths, &mut broker_smc));

        wait_for(&paths.ready);
        // open order matches the broker: request first, then response
        let mut request = OpenOptions::new().write(true).open(&paths.request).unwrap();
        let response = std::fs::File::open(&paths.response).unwrap();
        let mut response = BufReader::new(response);

        request.write_all(b"WRITE F0Md 01\nREAD F0Md\n").unwrap();
        let mut line = String::new();
        response.read_line(&mut line).unwrap();
        assert_eq!(line, "OK\n");
        line.clear();
        response.read_line(&mut line).unwrap();
        assert_eq!(line, "VAL 1\n");

        drop(request);
        broker.join().unwrap().unwrap();

        assert!(!paths.request.exists());
        assert!(!paths.response.exists());
        assert!(!paths.ready.exists());
        // the session wrote, so the fan was handed back
        assert_eq!(smc.value(SensorKey::new("F0Md").unwrap()), Some(0.0));
    }

    #[test]
    fn persistent_broker_stops_when_channels_cannot_be_published() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        std::fs::create_dir(&paths.request).unwrap();
        std::fs::write(paths.request.join("keep"), b"x").unwrap();

        let broker_paths = paths.clone();
        let broker = std::thread::spawn(move || {
            let mut smc = MemorySmc::simulated_machine(1);
            run_persistent(&broker_paths, &mut smc)
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while !broker.is_finished() {
            assert!(Instant::now() < deadline, "broker kept retrying a fatal setup error");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(broker.join().unwrap().is_err());
    }

    #[test]
    fn accept_backoff_grows_and_is_capped() {
        assert_eq!(accept_backoff(1), ACCEPT_BACKOFF);
        assert_eq!(accept_backoff(2), ACCEPT_BACKOFF * 2);
        assert!(accept_backoff(3) > accept_backoff(2));
        assert_eq!(accept_backoff(40), MAX_ACCEPT_BACKOFF);
    }
}
