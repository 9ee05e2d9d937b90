//! Detection of the host's communication point.
//!
//! A compatible host exposes a device named after its version. Its absence
//! means the agent runs on some other hypervisor and must not touch the VM.

use std::io;
use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const DEVICE_DIR: &str = "/dev";
#[cfg(target_os = "macos")]
const DEVICE_PREFIX: &str = "cu.tart-version-";

#[cfg(not(target_os = "macos"))]
const DEVICE_DIR: &str = "/dev/virtio-ports";
#[cfg(not(target_os = "macos"))]
const DEVICE_PREFIX: &str = "tart-version-";

/// Path of the host's version device, if present.
pub fn locate_communication_point() -> Option<PathBuf> {
    match find_in(Path::new(DEVICE_DIR), DEVICE_PREFIX) {
        Ok(found) => found,
        Err(e) => {
            tracing::debug!(dir = DEVICE_DIR, error = %e, "cannot list devices");
            None
        }
    }
}

/// First entry of `dir` whose name starts with `prefix`.
fn find_in(dir: &Path, prefix: &str) -> io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Asks the parent process to terminate.
pub fn terminate_parent() -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::getppid;

    kill(getppid(), Signal::SIGTERM).map_err(io::Error::from)
}
