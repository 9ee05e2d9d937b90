//! Pseudo-terminal spawning and window resize.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{OpenptyResult, Winsize, openpty};
use tga_proto::{Command, TerminalSize};
use tokio::process::Child;

/// Master side of a child's pseudo-terminal, kept for `TIOCSWINSZ`.
#[derive(Debug)]
pub struct Master {
    fd: OwnedFd,
}

impl Master {
    /// Applies new window dimensions.
    pub fn resize(&self, size: TerminalSize) -> io::Result<()> {
        let winsize = winsize(size);
        // SAFETY: TIOCSWINSZ reads a `winsize` struct that outlives the call.
        let rc = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::from_ref(&winsize),
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// A process attached to a fresh pseudo-terminal.
pub struct Spawned {
    /// The child; killed when dropped.
    pub child: Child,
    /// Resize handle for the master.
    pub master: Master,
    /// Reads the terminal output (stdout and stderr merged).
    pub reader: tokio::fs::File,
    /// Writes the terminal input.
    pub writer: tokio::fs::File,
}

/// Spawns `command` with a pseudo-terminal as its standard streams.
///
/// The child becomes a session leader (`setsid`) with the slave as its
/// controlling terminal (`TIOCSCTTY`). The slave is closed in the parent once
/// the child holds its copies, so reading the master fails with `EIO` after
/// the child exits.
pub fn spawn(command: &Command) -> io::Result<Spawned> {
    let winsize = winsize(command.terminal_size.unwrap_or_default());
    let OpenptyResult { master, slave } =
        openpty(Some(&winsize), None).map_err(|e| io::Error::other(format!("openpty: {e}")))?;

    let child = {
        let slave_raw_fd = slave.as_raw_fd();
        let mut cmd = tokio::process::Command::new(&command.name);
        cmd.args(&command.args)
            .stdin(Stdio::from(dup_fd(&slave, "stdin")?))
            .stdout(Stdio::from(dup_fd(&slave, "stdout")?))
            .stderr(Stdio::from(dup_fd(&slave, "stderr")?))
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(io::Error::from)?;
                if libc::ioctl(slave_raw_fd, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()?
        // `cmd` drops here and closes its copies of the slave.
    };
    drop(slave);

    let reader = std::fs::File::from(dup_fd(&master, "master read")?);
    let writer = std::fs::File::from(dup_fd(&master, "master write")?);

    Ok(Spawned {
        child,
        master: Master { fd: master },
        reader: tokio::fs::File::from_std(reader),
        writer: tokio::fs::File::from_std(writer),
    })
}

/// Converts protocol dimensions, saturating at the kernel's `u16` limit.
fn winsize(size: TerminalSize) -> Winsize {
    Winsize {
        ws_row: u16::try_from(size.rows).unwrap_or(u16::MAX),
        ws_col: u16::try_from(size.cols).unwrap_or(u16::MAX),
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Duplicates an `OwnedFd` with a descriptive error context.
fn dup_fd(fd: &OwnedFd, label: &str) -> io::Result<OwnedFd> {
    fd.try_clone()
        .map_err(|e| io::Error::new(e.kind(), format!("dup {label}: {e}")))
}
