//! Remote command execution over a streaming call.
//!
//! One call runs one process. The client's first [`ExecRequest`] describes
//! the command; later requests carry standard input and terminal resizes.
//! Output flows back as [`ExecResponse`] chunks, always terminated by exactly
//! one `Exit` (or one `Error` when the call fails).

mod pty;

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tga_proto::{Command, ErrorCode, ErrorInfo, ExecRequest, ExecResponse};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Read size of the output relays.
pub const STANDARD_STREAMS_BUFFER_SIZE: usize = 4096;

/// Sent to a terminal in place of an empty standard input chunk (Ctrl-D).
const EOF_CHAR: u8 = 0x04;

/// How long output still in flight is forwarded after the process exits.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// Output chunks buffered between the relays and the writer.
const RELAY_QUEUE: usize = 16;

/// Monotonic counter for generating execution IDs in logs.
static EXEC_SEQ: AtomicU64 = AtomicU64::new(1);

type Source = Box<dyn AsyncRead + Send + Unpin>;
type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Serves one exec call.
///
/// `r` is moved into the input-copy task; `w` is only written from this
/// function, so `Exit` is guaranteed to be the last frame. The child is
/// killed when the call ends early, including when `cancel` fires.
pub async fn handle<R, W>(r: R, w: &mut W, cancel: &CancellationToken) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + ?Sized,
{
    let exec_id = EXEC_SEQ.fetch_add(1, Ordering::Relaxed);
    match run(r, w, cancel, exec_id).await {
        Ok(code) => {
            debug!(exec_id, code, "process exited");
            tga_proto::send(w, &ExecResponse::Exit { code }).await
        }
        Err(info) => {
            if let Err(e) = tga_proto::send(w, &ExecResponse::Error(info.clone())).await {
                debug!(exec_id, error = %e, "cannot report exec failure");
            }
            Err(io::Error::other(info))
        }
    }
}

/// Runs the call up to process exit and returns its exit code.
async fn run<R, W>(
    mut r: R,
    w: &mut W,
    cancel: &CancellationToken,
    exec_id: u64,
) -> Result<i32, ErrorInfo>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + ?Sized,
{
    let command = match tga_proto::try_recv::<ExecRequest, _>(&mut r).await {
        Ok(Some(ExecRequest::Command(command))) => command,
        Ok(_) => {
            return Err(ErrorInfo::new(
                ErrorCode::InvalidArgument,
                "first exec request should describe a command to execute",
            ));
        }
        Err(e) => return Err(invalid_request(&e)),
    };

    info!(
        exec_id,
        tty = command.tty,
        interactive = command.interactive,
        "executing {}",
        quoted_argv(&command)
    );

    let Process {
        mut child,
        stdin,
        stdout,
        stderr,
        master,
    } = spawn(&command).map_err(|e| spawn_error(&command, &e))?;

    // Dropping the set aborts whatever is still running when the call ends.
    let mut tasks = JoinSet::new();
    let (out_tx, mut out_rx) = mpsc::channel(RELAY_QUEUE);
    tasks.spawn(copy_input(r, stdin, master, command.tty));
    tasks.spawn(relay(
        stdout,
        ExecResponse::StandardOutput,
        out_tx.clone(),
        command.tty,
    ));
    match stderr {
        Some(stderr) => {
            tasks.spawn(relay(stderr, ExecResponse::StandardError, out_tx, false));
        }
        None => drop(out_tx),
    }

    let status = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ErrorInfo::new(
                    ErrorCode::Unavailable,
                    "guest agent is shutting down",
                ));
            }
            Some(joined) = tasks.join_next() => task_result(joined)?,
            Some(msg) = out_rx.recv() => {
                tga_proto::send(w, &msg).await.map_err(|e| internal("sending output", &e))?;
            }
            status = child.wait() => {
                break status.map_err(|e| internal("waiting for process", &e))?;
            }
        }
    };

    let drain = async {
        while let Some(msg) = out_rx.recv().await {
            tga_proto::send(w, &msg).await?;
        }
        io::Result::Ok(())
    };
    match tokio::time::timeout(OUTPUT_GRACE, drain).await {
        Ok(sent) => sent.map_err(|e| internal("sending output", &e))?,
        Err(_) => debug!(exec_id, "output still pending after exit, discarding"),
    }

    Ok(exit_code(status))
}

/// A spawned child with its standard streams detached for relaying.
struct Process {
    child: Child,
    /// Present only for interactive commands.
    stdin: Option<Sink>,
    /// Standard output, or the merged terminal output in TTY mode.
    stdout: Source,
    /// Absent in TTY mode.
    stderr: Option<Source>,
    /// Terminal master, for resizes.
    master: Option<pty::Master>,
}

/// Starts `command` in pipe or TTY mode.
fn spawn(command: &Command) -> io::Result<Process> {
    if command.tty {
        let pty::Spawned {
            child,
            master,
            reader,
            writer,
        } = pty::spawn(command)?;
        return Ok(Process {
            child,
            stdin: command.interactive.then(|| Box::new(writer) as Sink),
            stdout: Box::new(reader),
            stderr: None,
            master: Some(master),
        });
    }

    let mut child = tokio::process::Command::new(&command.name)
        .args(&command.args)
        .stdin(if command.interactive {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take().map(|s| Box::new(s) as Sink);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr not captured"))?;

    Ok(Process {
        child,
        stdin,
        stdout: Box::new(stdout),
        stderr: Some(Box::new(stderr)),
        master: None,
    })
}

/// Feeds client requests to the process until the client stops sending.
///
/// Empty standard input means EOF: the pipe is closed, or a terminal receives
/// [`EOF_CHAR`]. Input for a non-interactive command is discarded, as are
/// resizes without a terminal.
async fn copy_input<R>(
    mut r: R,
    mut stdin: Option<Sink>,
    master: Option<pty::Master>,
    tty: bool,
) -> Result<(), ErrorInfo>
where
    R: AsyncRead + Unpin,
{
    loop {
        let request = match tga_proto::try_recv::<ExecRequest, _>(&mut r).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) if client_gone(&e) => {
                debug!(error = %e, "client stopped sending");
                return Ok(());
            }
            Err(e) => return Err(invalid_request(&e)),
        };

        match request {
            ExecRequest::StandardInput(data) => {
                if data.is_empty() && !tty {
                    stdin = None;
                    continue;
                }
                let Some(sink) = stdin.as_mut() else {
                    continue;
                };
                let bytes: &[u8] = if data.is_empty() { &[EOF_CHAR] } else { &data };
                match write_input(sink, bytes).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("process closed its standard input");
                        stdin = None;
                    }
                    Err(e) => return Err(internal("writing standard input", &e)),
                }
            }
            ExecRequest::TerminalResize(size) => {
                if let Some(master) = &master {
                    master
                        .resize(size)
                        .map_err(|e| internal("resizing terminal", &e))?;
                }
            }
            _ => debug!("ignoring repeated command request"),
        }
    }
}

/// The client tore the stream down rather than sending garbage.
fn client_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

async fn write_input(sink: &mut Sink, bytes: &[u8]) -> io::Result<()> {
    sink.write_all(bytes).await?;
    sink.flush().await
}

/// Forwards one output stream as `wrap`ped chunks until end-of-stream.
async fn relay(
    mut source: Source,
    wrap: fn(Vec<u8>) -> ExecResponse,
    out: mpsc::Sender<ExecResponse>,
    tty: bool,
) -> Result<(), ErrorInfo> {
    let mut buf = vec![0u8; STANDARD_STREAMS_BUFFER_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            // A terminal master reports EIO once the last slave is closed.
            Err(e) if tty && e.raw_os_error() == Some(libc::EIO) => return Ok(()),
            Err(e) => return Err(internal("reading process output", &e)),
        };
        if out.send(wrap(buf[..n].to_vec())).await.is_err() {
            return Ok(());
        }
    }
}

fn task_result(joined: Result<Result<(), ErrorInfo>, JoinError>) -> Result<(), ErrorInfo> {
    joined.unwrap_or_else(|e| {
        Err(ErrorInfo::new(
            ErrorCode::Internal,
            format!("exec task failed: {e}"),
        ))
    })
}

/// Exit code as a shell reports it: `128 + n` for death by signal `n`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(0)
}

fn quoted_argv(command: &Command) -> String {
    let argv: Vec<&str> = std::iter::once(command.name.as_str())
        .chain(command.args.iter().map(String::as_str))
        .collect();
    format!("{argv:?}")
}

fn spawn_error(command: &Command, e: &io::Error) -> ErrorInfo {
    let code = if e.kind() == io::ErrorKind::NotFound {
        ErrorCode::Unavailable
    } else {
        ErrorCode::Internal
    };
    ErrorInfo::new(code, format!("failed to start {:?}: {e}", command.name))
}

fn invalid_request(e: &io::Error) -> ErrorInfo {
    ErrorInfo::new(
        ErrorCode::InvalidArgument,
        format!("reading exec request: {e}"),
    )
}

fn internal(what: &str, e: &io::Error) -> ErrorInfo {
    ErrorInfo::new(ErrorCode::Internal, format!("{what}: {e}"))
}
