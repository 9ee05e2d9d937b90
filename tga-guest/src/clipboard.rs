//! Guest clipboard backed by the platform's command-line tools.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tga_spice::Clipboard;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interval between two clipboard polls of [`SystemClipboard::watch`].
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// An external program plus its fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Tool {
    program: String,
    args: Vec<String>,
}

impl Tool {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_owned(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }
}

/// Text clipboard driven by `pbpaste`/`pbcopy`, `wl-paste`/`wl-copy` or
/// `xclip`, picked at construction.
#[derive(Debug, Clone)]
pub struct SystemClipboard {
    paste: Tool,
    copy: Tool,
    poll_interval: Duration,
}

impl SystemClipboard {
    /// Picks the tools for the running platform and display server.
    pub fn detect() -> Self {
        let wayland = std::env::var_os("WAYLAND_DISPLAY").is_some_and(|v| !v.is_empty());
        let (paste, copy) = tools_for(cfg!(target_os = "macos"), wayland);
        Self {
            paste,
            copy,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Name of the program used to read the clipboard.
    pub fn paste_program(&self) -> &str {
        &self.paste.program
    }
}

fn tools_for(macos: bool, wayland: bool) -> (Tool, Tool) {
    if macos {
        (Tool::new("pbpaste", &[]), Tool::new("pbcopy", &[]))
    } else if wayland {
        (
            Tool::new("wl-paste", &["--no-newline", "--type", "text/plain"]),
            Tool::new("wl-copy", &["--type", "text/plain"]),
        )
    } else {
        (
            Tool::new("xclip", &["-selection", "clipboard", "-out"]),
            Tool::new("xclip", &["-selection", "clipboard", "-in"]),
        )
    }
}

/// Runs the paste tool.
///
/// A tool that runs but exits unsuccessfully is read as an empty clipboard;
/// `wl-paste` and `xclip` do so when nothing text-like is copied.
async fn paste(tool: &Tool) -> io::Result<Vec<u8>> {
    let output = tool
        .command()
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", tool.program)))?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Ok(Vec::new())
    }
}

async fn copy(tool: &Tool, data: &[u8]) -> io::Result<()> {
    let mut child = tool
        .command()
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", tool.program)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("stdin not captured"))?;
    stdin.write_all(data).await?;
    drop(stdin);

    let status = child.wait().await?;
    if !status.success() {
        return Err(io::Error::other(format!(
            "{} exited with {status}",
            tool.program
        )));
    }
    Ok(())
}

impl Clipboard for SystemClipboard {
    /// Proves the paste tool can be started.
    async fn init(&mut self) -> io::Result<()> {
        paste(&self.paste).await.map(drop)
    }

    async fn read(&mut self) -> io::Result<Vec<u8>> {
        paste(&self.paste).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        copy(&self.copy, data).await
    }

    /// Polls the clipboard, reporting contents that differ from the previous
    /// poll. The first poll only sets the baseline.
    fn watch(&mut self, cancel: CancellationToken) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(1);
        let tool = self.paste.clone();
        let period = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Vec<u8>> = None;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tx.closed() => return,
                    _ = ticker.tick() => {}
                }

                let current = match paste(&tool).await {
                    Ok(current) => current,
                    Err(e) => {
                        debug!(error = %e, "clipboard poll failed");
                        continue;
                    }
                };
                let changed = last.as_ref().is_some_and(|prev| *prev != current);
                if changed && tx.send(current.clone()).await.is_err() {
                    return;
                }
                last = Some(current);
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    /// A clipboard that keeps its contents in a plain file.
    fn file_clipboard(path: &Path, poll_interval: Duration) -> SystemClipboard {
        let path = path.to_string_lossy();
        SystemClipboard {
            paste: Tool::new("cat", &[path.as_ref()]),
            copy: Tool::new("sh", &["-c", &format!("cat > '{path}'")]),
            poll_interval,
        }
    }

    #[test]
    fn tool_selection() {
        assert_eq!(tools_for(true, true).0.program, "pbpaste");
        assert_eq!(tools_for(false, true).1.program, "wl-copy");
        let (paste, copy) = tools_for(false, false);
        assert_eq!(paste.program, "xclip");
        assert!(paste.args.contains(&"-out".to_owned()));
        assert!(copy.args.contains(&"-in".to_owned()));
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip");
        std::fs::write(&path, b"").unwrap();
        let mut clip = file_clipboard(&path, POLL_INTERVAL);

        clip.init().await.unwrap();
        clip.write(b"hello").await.unwrap();
        assert_eq!(clip.read().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn failing_paste_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut clip = file_clipboard(&dir.path().join("absent"), POLL_INTERVAL);
        assert!(clip.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_tool_fails_init() {
        let mut clip = SystemClipboard {
            paste: Tool::new("/nonexistent/paste", &[]),
            copy: Tool::new("/nonexistent/copy", &[]),
            poll_interval: POLL_INTERVAL,
        };
        assert!(clip.init().await.is_err());
    }

    #[tokio::test]
    async fn watch_reports_changes_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip");
        std::fs::write(&path, b"baseline").unwrap();
        let mut clip = file_clipboard(&path, Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let mut rx = clip.watch(cancel.clone());

        // Let the baseline poll happen, then change the contents.
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(&path, b"changed").unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot, b"changed");

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(end, None);
    }
}
