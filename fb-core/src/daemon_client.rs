//! Daemon Client
//!
//! Talks to the privileged broker over its request/response FIFOs. Finding
//! a broker is staged: an already-ready one, an installed one that is still
//! starting, a fresh install, and finally a single-shot elevated helper.
//! Each elevated action runs at most once per `request_access()` call.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use fb_error::{FanbridgeError, Result};
use fb_protocol::{Command, Reply, SensorKey, MAX_LINE_SIZE};
use tracing::{debug, info, warn};

use crate::constants::{connect, keys};
use crate::service::{is_ready, ChannelPaths};
use crate::smc::{codec, fans::fan_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Elevated actions the connection manager may trigger
#[cfg_attr(test, mockall::automock)]
pub trait Elevator: Send {
    fn is_installed(&self) -> bool;

    fn install(&self) -> Result<()>;

    fn launch_helper(&self, dir: &Path) -> Result<()>;
}

/// Poll windows for each connection stage
#[derive(Debug, Clone)]
pub struct ConnectWindows {
    pub installed: Duration,
    pub install: Duration,
    pub helper: Duration,
    pub poll: Duration,
}

impl Default for ConnectWindows {
    fn default() -> Self {
        Self {
            installed: connect::INSTALLED_WAIT,
            install: connect::INSTALL_WAIT,
            helper: connect::HELPER_WAIT,
            poll: connect::READY_POLL,
        }
    }
}

// ============================================================================
// Link
// ============================================================================

/// One open pair of broker channels
pub struct DaemonLink {
    writer: File,
    reader: File,
    buffer: Vec<u8>,
    timeout: Duration,
}

fn set_blocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fd is owned by `file` and open for the duration of both calls
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: as above; only O_NONBLOCK is cleared
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Wait until `fd` is readable. Ok(false) when the wait timed out.
fn wait_readable(fd: libc::c_int, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        // SAFETY: pfd is a valid pollfd and the count is 1
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc > 0 {
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(FanbridgeError::channel_dead(format!("poll failed: {}", err)));
        }
    }
}

/// Open the read end of the response channel within `timeout`.
///
/// The open blocks until the broker opens its write end, which never happens
/// if the broker dies between the two opens. The open runs on its own thread;
/// on timeout it is released by briefly opening the write end ourselves.
fn open_response(path: &Path, timeout: Duration) -> Result<File> {
    let (tx, rx) = mpsc::channel();
    let owned = path.to_path_buf();
    thread::Builder::new()
        .name("fb-open-response".into())
        .spawn(move || {
            let _ = tx.send(File::open(&owned));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(opened) => opened.map_err(|e| {
            FanbridgeError::channel_dead(format!("cannot open {}: {}", path.display(), e))
        }),
        Err(_) => {
            if let Ok(release) = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                drop(release);
            }
            Err(FanbridgeError::Timeout(format!(
                "broker never opened {} within {:?}",
                path.display(),
                timeout
            )))
        }
    }
}

impl DaemonLink {
    /// Connect to a broker waiting on `paths`.
    ///
    /// The request channel is opened non-blocking so a missing broker fails
    /// with ENXIO instead of hanging.
    pub fn open(paths: &ChannelPaths, timeout: Duration) -> Result<Self> {
        let writer = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&paths.request)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::ENXIO) => FanbridgeError::channel_dead("no broker listening"),
                _ => FanbridgeError::channel_dead(format!(
                    "cannot open {}: {}",
                    paths.request.display(),
                    e
                )),
            })?;
        set_blocking(&writer)?;

        let reader = open_response(&paths.response, timeout)?;

        debug!(dir = %paths.dir.display(), "broker channels open");
        Ok(Self {
            writer,
            reader,
            buffer: Vec::with_capacity(connect::INITIAL_BUFFER_SIZE),
            timeout,
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).trim_end_matches('\r').to_string())
    }

    /// Write one request line and wait for one reply line
    pub fn send(&mut self, line: &str) -> Result<String> {
        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
        self.writer
            .write_all(&out)
            .and_then(|_| self.writer.flush())
            .map_err(|e| FanbridgeError::channel_dead(format!("write failed: {}", e)))?;

        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; connect::INITIAL_BUFFER_SIZE];
        loop {
            if let Some(reply) = self.take_line() {
                return Ok(reply);
            }
            if self.buffer.len() > MAX_LINE_SIZE {
                return Err(FanbridgeError::LineTooLarge {
                    size: self.buffer.len(),
                    max_size: MAX_LINE_SIZE,
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !wait_readable(self.reader.as_raw_fd(), remaining)? {
                return Err(FanbridgeError::Timeout(format!(
                    "no reply to {:?} within {:?}",
                    line, self.timeout
                )));
            }

            match self.reader.read(&mut chunk) {
                Ok(0) => return Err(FanbridgeError::channel_dead("broker closed the response channel")),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FanbridgeError::channel_dead(format!("read failed: {}", e))),
            }
        }
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct DaemonClient {
    paths: ChannelPaths,
    elevator: Box<dyn Elevator>,
    windows: ConnectWindows,
    command_timeout: Duration,
    state: ConnectionState,
    link: Option<DaemonLink>,
    write_access: bool,
}

impl DaemonClient {
    pub fn new(paths: ChannelPaths, elevator: Box<dyn Elevator>) -> Self {
        Self {
            paths,
            elevator,
            windows: ConnectWindows::default(),
            command_timeout: connect::COMMAND_TIMEOUT,
            state: ConnectionState::Disconnected,
            link: None,
            write_access: false,
        }
    }

    pub fn with_windows(mut self, windows: ConnectWindows) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    pub fn has_write_access(&self) -> bool {
        self.state == ConnectionState::Connected && self.write_access
    }

    /// Connect to a broker, installing or launching one if needed, then
    /// return every fan to automatic before granting write access.
    pub fn request_access(&mut self) -> Result<()> {
        if self.has_write_access() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let link = match self.establish() {
            Ok(link) => link,
            Err(e) => {
                warn!("broker access not granted: {}", e);
                self.state = ConnectionState::Disconnected;
                self.write_access = false;
                return Err(e);
            }
        };
        self.link = Some(link);
        self.state = ConnectionState::Connected;
        info!(dir = %self.paths.dir.display(), "connected to broker");

        self.recover_fans();
        if self.state != ConnectionState::Connected {
            return Err(FanbridgeError::channel_dead("broker lost during fan recovery"));
        }
        self.write_access = true;
        Ok(())
    }

    fn establish(&mut self) -> Result<DaemonLink> {
        if is_ready(&self.paths) {
            match DaemonLink::open(&self.paths, self.command_timeout) {
                Ok(link) => return Ok(link),
                Err(e) => debug!("ready marker present but connect failed: {}", e),
            }
        }

        if self.elevator.is_installed() {
            info!("broker installed, waiting for it to become ready");
            if let Some(link) = self.wait_for_broker(self.windows.installed) {
                return Ok(link);
            }
            warn!("installed broker did not become ready");
        }

        match self.elevator.install() {
            Ok(()) => {
                return self.wait_for_broker(self.windows.install).ok_or_else(|| {
                    FanbridgeError::Timeout("installed broker did not become ready".to_string())
                });
            }
            Err(e) => warn!("broker install failed, trying single-shot helper: {}", e),
        }

        self.elevator
            .launch_helper(&self.paths.dir)
            .map_err(|e| FanbridgeError::InstallFailed(format!("helper launch failed: {}", e)))?;
        self.wait_for_broker(self.windows.helper)
            .ok_or_else(|| FanbridgeError::Timeout("helper broker did not become ready".to_string()))
    }

    fn wait_for_broker(&self, window: Duration) -> Option<DaemonLink> {
        let deadline = Instant::now() + window;
        loop {
            if is_ready(&self.paths) {
                match DaemonLink::open(&self.paths, self.command_timeout) {
                    Ok(link) => return Some(link),
                    Err(e) => debug!("broker not accepting yet: {}", e),
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(self.windows.poll);
        }
    }

    /// A previous session may have crashed with fans forced
    fn recover_fans(&mut self) {
        let count = self
            .read_value(keys::FAN_COUNT)
            .map(|n| n.max(0.0) as u32)
            .unwrap_or(0);
        let mode_keys: Vec<SensorKey> = (0..count)
            .filter_map(|i| fan_key(i, keys::FAN_MODE))
            .collect();

        for key in &mode_keys {
            self.write_key(*key, &[keys::MODE_AUTOMATIC]);
        }
        self.write_key(keys::FORCE_BITMASK, &[0, 0]);
        self.write_key(keys::UNLOCK_FLAG, &[0]);

        for key in &mode_keys {
            let mode = self.read_value(*key);
            debug!(key = %key, ?mode, "fan mode after recovery");
        }
        info!(fans = count, "fans returned to automatic after connect");
    }

    /// One request/response exchange. Transport failures drop the link.
    pub fn send(&mut self, command: &Command) -> Result<Reply> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| FanbridgeError::channel_dead("not connected"))?;

        match link.send(&command.to_line()) {
            Ok(line) => Reply::parse(&line).map_err(FanbridgeError::protocol),
            Err(e) => {
                // an oversized reply leaves the stream out of step too
                if e.is_transport_fatal() || matches!(e, FanbridgeError::LineTooLarge { .. }) {
                    warn!("broker link lost: {}", e);
                    self.drop_link();
                }
                Err(e)
            }
        }
    }

    pub fn read_value(&mut self, key: SensorKey) -> Option<f64> {
        match self.send(&Command::Read { key }) {
            Ok(Reply::Val(v)) => Some(v),
            Ok(Reply::Raw { type_tag, bytes }) => codec::decode(type_tag, &bytes),
            Ok(_) => None,
            Err(e) => {
                debug!(key = %key, "broker read failed: {}", e);
                None
            }
        }
    }

    pub fn write_key(&mut self, key: SensorKey, bytes: &[u8]) -> bool {
        match self.send(&Command::Write {
            key,
            bytes: bytes.to_vec(),
        }) {
            Ok(Reply::Ok) => true,
            Ok(reply) => {
                debug!(key = %key, ?reply, "broker refused write");
                false
            }
            Err(e) => {
                debug!(key = %key, "broker write failed: {}", e);
                false
            }
        }
    }

    fn drop_link(&mut self) {
        self.link = None;
        self.state = ConnectionState::Disconnected;
        self.write_access = false;
    }

    /// Close the channels; the broker sees end-of-stream and recycles
    pub fn disconnect(&mut self) {
        if self.link.is_some() {
            info!("disconnecting from broker");
        }
        self.drop_link();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader};
    use std::os::unix::ffi::OsStrExt;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    fn mkfifo(path: &Path) {
        let c = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c.as_ptr(), 0o600) }, 0);
    }

    fn short_windows() -> ConnectWindows {
        ConnectWindows {
            installed: Duration::from_millis(200),
            install: Duration::from_millis(500),
            helper: Duration::from_millis(500),
            poll: Duration::from_millis(10),
        }
    }

    /// Minimal broker: one fan, records every request line, replies from a
    /// fixed script. Exits when the client closes its end.
    fn fake_broker(paths: ChannelPaths, log: Arc<Mutex<Vec<String>>>) -> JoinHandle<()> {
        mkfifo(&paths.request);
        mkfifo(&paths.response);
        std::fs::write(&paths.ready, b"").unwrap();

        thread::spawn(move || {
            let req = File::open(&paths.request).unwrap();
            let mut resp = OpenOptions::new().write(true).open(&paths.response).unwrap();
            for line in BufReader::new(req).lines() {
                let Ok(line) = line else { break };
                let reply = if line == "READ FNum" {
                    "VAL 1".to_string()
                } else if line.starts_with("READ F0Md") {
                    "RAW ui8  00".to_string()
                } else if line.starts_with("WRITE") {
                    "OK".to_string()
                } else if line.starts_with("READ SLOW") {
                    continue;
                } else {
                    "ERR unknown_cmd".to_string()
                };
                log.lock().push(line);
                if writeln!(resp, "{}", reply).is_err() {
                    break;
                }
            }
        })
    }

    #[test]
    fn open_fails_fast_without_broker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        mkfifo(&paths.request);
        let err = DaemonLink::open(&paths, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, FanbridgeError::ChannelDead(_)));
    }

    #[test]
    fn open_gives_up_when_broker_never_answers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        mkfifo(&paths.request);
        mkfifo(&paths.response);

        // takes the request side, then dies before opening the response side
        let request_path = paths.request.clone();
        let broker = thread::spawn(move || {
            let req = File::open(&request_path).unwrap();
            thread::sleep(Duration::from_millis(600));
            drop(req);
        });
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        let err = DaemonLink::open(&paths, Duration::from_millis(200)).err().unwrap();
        assert!(matches!(err, FanbridgeError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        broker.join().unwrap();
    }

    #[test]
    fn ready_broker_connects_and_resets_fans() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let log = Arc::new(Mutex::new(Vec::new()));
        let broker = fake_broker(paths.clone(), log.clone());

        // the marker may appear before the broker thread blocks in open()
        let mut elevator = MockElevator::new();
        elevator.expect_is_installed().returning(|| true);
        elevator.expect_install().never();
        elevator.expect_launch_helper().never();

        let mut client = DaemonClient::new(paths, Box::new(elevator)).with_windows(short_windows());
        client.request_access().unwrap();
        assert!(client.has_write_access());

        assert_eq!(
            log.lock().clone(),
            vec!["READ FNum", "WRITE F0Md 00", "WRITE FS!  00 00", "WRITE Ftst 00", "READ F0Md"]
        );

        let md = SensorKey::new("F0Md").unwrap();
        assert_eq!(client.read_value(md), Some(0.0));
        assert!(client.write_key(md, &[1]));
        assert_eq!(client.read_value(SensorKey::new("TC0P").unwrap()), None);
        assert!(client.has_write_access());

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        broker.join().unwrap();
    }

    #[test]
    fn install_stage_runs_once_then_connects() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut elevator = MockElevator::new();
        elevator.expect_is_installed().times(1).returning(|| false);
        let (p, l) = (paths.clone(), log.clone());
        let started = Arc::new(Mutex::new(None));
        let slot = started.clone();
        elevator.expect_install().times(1).returning(move || {
            *slot.lock() = Some(fake_broker(p.clone(), l.clone()));
            Ok(())
        });
        elevator.expect_launch_helper().never();

        let mut client = DaemonClient::new(paths, Box::new(elevator)).with_windows(short_windows());
        client.request_access().unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        client.disconnect();
        let handle = started.lock().take().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn failed_install_falls_back_to_helper_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());

        let mut elevator = MockElevator::new();
        elevator.expect_is_installed().returning(|| false);
        elevator
            .expect_install()
            .times(1)
            .returning(|| Err(FanbridgeError::InstallFailed("user cancelled".into())));
        let expected_dir = paths.dir.clone();
        elevator
            .expect_launch_helper()
            .withf(move |dir: &Path| dir == expected_dir.as_path())
            .times(1)
            .returning(|_| Err(FanbridgeError::PrivilegeEscalation("denied".into())));

        let mut client = DaemonClient::new(paths, Box::new(elevator)).with_windows(short_windows());
        let err = client.request_access().unwrap_err();
        assert!(matches!(err, FanbridgeError::InstallFailed(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.has_write_access());
    }

    #[test]
    fn helper_that_never_becomes_ready_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());

        let mut elevator = MockElevator::new();
        elevator.expect_is_installed().returning(|| false);
        elevator
            .expect_install()
            .returning(|| Err(FanbridgeError::InstallFailed("no".into())));
        elevator.expect_launch_helper().times(1).returning(|_| Ok(()));

        let mut client = DaemonClient::new(paths, Box::new(elevator)).with_windows(short_windows());
        assert!(matches!(client.request_access(), Err(FanbridgeError::Timeout(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn silent_broker_times_out_and_drops_link() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let log = Arc::new(Mutex::new(Vec::new()));
        let broker = fake_broker(paths.clone(), log);

        let mut elevator = MockElevator::new();
        elevator.expect_is_installed().returning(|| true);
        let mut client = DaemonClient::new(paths, Box::new(elevator))
            .with_windows(short_windows())
            .with_command_timeout(Duration::from_millis(200));
        client.request_access().unwrap();

        let slow = SensorKey::new("SLOW").unwrap();
        let err = client.send(&Command::Read { key: slow }).unwrap_err();
        assert!(matches!(err, FanbridgeError::Timeout(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.has_write_access());

        client.disconnect();
        assert!(client.send(&Command::Read { key: keys::FAN_COUNT }).is_err());
        broker.join().unwrap();
    }
}
