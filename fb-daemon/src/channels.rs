//! Broker channel lifecycle
//!
//! Each serving cycle starts from scratch: stale files are removed, both
//! FIFOs are recreated world-writable so the unprivileged client can open
//! them, and the ready marker is written last.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use fb_core::ChannelPaths;
use fb_error::{FanbridgeError, Result};
use tracing::{debug, warn};

const CHANNEL_MODE: u32 = 0o666;
const MARKER_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FanbridgeError::config(format!("NUL byte in {}", path.display())))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    if unsafe { libc::mkfifo(c_path.as_ptr(), CHANNEL_MODE as libc::mode_t) } != 0 {
        return Err(FanbridgeError::FileWrite {
            path: path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    // umask strips bits from mkfifo's mode
    set_mode(path, CHANNEL_MODE)
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        FanbridgeError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Recreate both channels and announce readiness
pub fn prepare(paths: &ChannelPaths) -> Result<()> {
    if !paths.dir.exists() {
        fs::create_dir_all(&paths.dir).map_err(|e| FanbridgeError::FileWrite {
            path: paths.dir.clone(),
            source: e,
        })?;
        set_mode(&paths.dir, DIR_MODE)?;
    }

    for path in [&paths.ready, &paths.request, &paths.response] {
        if path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            warn!(path = %path.display(), "replacing symlink in channel directory");
        }
        remove_if_present(path).map_err(|e| FanbridgeError::FileWrite {
            path: path.clone(),
            source: e,
        })?;
    }

    make_fifo(&paths.request)?;
    make_fifo(&paths.response)?;

    File::create(&paths.ready).map_err(|e| FanbridgeError::FileWrite {
        path: paths.ready.clone(),
        source: e,
    })?;
    set_mode(&paths.ready, MARKER_MODE)?;

    debug!(dir = %paths.dir.display(), "channels ready");
    Ok(())
}

/// Block until a client opens both channels.
///
/// The request side is opened first; the client's non-blocking open of
/// its write end only succeeds while this open is pending.
pub fn accept(paths: &ChannelPaths) -> Result<(File, File)> {
    let request = File::open(&paths.request).map_err(|e| FanbridgeError::FileRead {
        path: paths.request.clone(),
        source: e,
    })?;
    let response = OpenOptions::new()
        .write(true)
        .open(&paths.response)
        .map_err(|e| FanbridgeError::FileWrite {
            path: paths.response.clone(),
            source: e,
        })?;
    Ok((request, response))
}

/// The broker is busy or gone; new clients must wait
pub fn clear_ready(paths: &ChannelPaths) {
    if let Err(e) = remove_if_present(&paths.ready) {
        warn!("Failed to remove ready marker: {}", e);
    }
}

/// Remove every broker file
pub fn cleanup(paths: &ChannelPaths) {
    for path in [&paths.ready, &paths.request, &paths.response] {
        if let Err(e) = remove_if_present(path) {
            warn!(path = %path.display(), "Failed to remove channel file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn prepare_creates_fifos_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path().join("broker"));
        prepare(&paths).unwrap();

        for fifo in [&paths.request, &paths.response] {
            let meta = fs::metadata(fifo).unwrap();
            assert!(meta.file_type().is_fifo());
            assert_eq!(meta.permissions().mode() & 0o777, 0o666);
        }
        let marker = fs::metadata(&paths.ready).unwrap();
        assert_eq!(marker.len(), 0);
        assert_eq!(marker.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn prepare_replaces_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        fs::write(&paths.request, b"stale").unwrap();
        prepare(&paths).unwrap();
        assert!(fs::metadata(&paths.request).unwrap().file_type().is_fifo());
        prepare(&paths).unwrap();
    }

    #[test]
    fn unremovable_stale_entry_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        fs::create_dir(&paths.request).unwrap();
        fs::write(paths.request.join("keep"), b"x").unwrap();

        let err = prepare(&paths).unwrap_err();
        assert!(matches!(err, FanbridgeError::FileWrite { .. }));
    }

    #[test]
    fn cleanup_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        prepare(&paths).unwrap();
        clear_ready(&paths);
        assert!(!paths.ready.exists());
        cleanup(&paths);
        assert!(!paths.request.exists());
        assert!(!paths.response.exists());
        cleanup(&paths);
    }
}
