//! Clipboard synchronization state machine.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::{clipboard_type, selection};
use crate::{
    AgentMessage, Capabilities, Caps, Chunked, Clipboard, ClipboardData, ClipboardGrab,
    ClipboardRequest, Error, Message, MessageCodec, Result,
};

/// Capabilities this agent announces. Nothing else is claimed.
const AGENT_CAPS: Caps = Caps::CLIPBOARD_BY_DEMAND.union(Caps::CLIPBOARD_SELECTION);

/// Negotiation progress of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No capabilities exchanged yet.
    Idle,
    /// Capabilities exchanged at least once.
    Negotiated,
}

/// Guest clipboard watch lifecycle; only ever moves forward.
#[derive(Debug)]
enum Watch {
    /// The host has not been heard from yet.
    Uninitialized,
    /// Clipboard initialized, snapshots flowing.
    Initialized(mpsc::Receiver<Vec<u8>>),
}

/// SPICE clipboard agent bound to one serial channel.
///
/// A run ends on cancellation (`Ok`) or on the first error; the caller owns
/// any retry policy.
#[derive(Debug)]
pub struct Agent<S, C> {
    /// Chunked serial channel, split into agent messages.
    framed: Framed<Chunked<S>, MessageCodec>,
    /// Guest clipboard.
    clipboard: C,
    /// Negotiation phase.
    phase: Phase,
    /// Local clipboard watch.
    watch: Watch,
    /// Content last announced to (or received from) the host.
    last_clipboard: Vec<u8>,
}

impl<S, C> Agent<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Clipboard,
{
    /// Creates an agent over the raw serial stream `serial`.
    pub fn new(serial: S, clipboard: C) -> Self {
        Self {
            framed: Framed::new(Chunked::new(serial), MessageCodec),
            clipboard,
            phase: Phase::Idle,
            watch: Watch::Uninitialized,
            last_clipboard: Vec::new(),
        }
    }

    /// Processes inbound messages and local clipboard changes until `cancel`
    /// fires or an error occurs.
    ///
    /// If the channel fails before anything was read, the error is
    /// [`Error::NotConnected`].
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let watch_cancel = cancel.child_token();
        let _stop_watch = watch_cancel.clone().drop_guard();

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!(phase = ?self.phase, "clipboard agent cancelled");
                    return Ok(());
                }
                snapshot = next_snapshot(&mut self.watch) => match snapshot {
                    Some(snapshot) => self.local_changed(snapshot).await?,
                    None => return Err(Error::WatchClosed),
                },
                frame = self.framed.next() => {
                    let msg = self.inbound(frame)?;
                    self.init_clipboard(&watch_cancel).await?;
                    self.dispatch(msg).await?;
                }
            }
        }
    }

    /// Unwraps a read result, classifying failures.
    fn inbound(&self, frame: Option<Result<Message>>) -> Result<Message> {
        let err = match frame {
            Some(Ok(msg)) => return Ok(msg),
            Some(Err(Error::Io(e))) => e,
            Some(Err(e)) => return Err(e),
            None => io::Error::new(io::ErrorKind::UnexpectedEof, "serial channel closed"),
        };
        if matches!(self.watch, Watch::Uninitialized) {
            Err(Error::NotConnected(err))
        } else {
            Err(Error::Io(err))
        }
    }

    /// Initializes the clipboard and its watch on the first successful read.
    async fn init_clipboard(&mut self, cancel: &CancellationToken) -> Result<()> {
        if matches!(self.watch, Watch::Initialized(_)) {
            return Ok(());
        }
        self.clipboard.init().await.map_err(Error::Clipboard)?;
        self.watch = Watch::Initialized(self.clipboard.watch(cancel.clone()));
        debug!("SPICE connected, clipboard initialized");
        Ok(())
    }

    /// Reacts to one inbound message.
    async fn dispatch(&mut self, msg: Message) -> Result<()> {
        let msg = AgentMessage::decode(msg)?;
        debug!("inbound {msg}");

        match msg {
            AgentMessage::AnnounceCapabilities(peer) => {
                self.phase = Phase::Negotiated;
                if peer.request != 0 {
                    self.send(AgentMessage::AnnounceCapabilities(Capabilities {
                        request: 0,
                        caps: AGENT_CAPS,
                    }))
                    .await?;
                }
            }
            AgentMessage::ClipboardGrab(grab) => {
                self.send(AgentMessage::ClipboardRequest(ClipboardRequest {
                    selection: grab.selection,
                    data_type: grab.data_type,
                }))
                .await?;
            }
            AgentMessage::Clipboard(clip) if !is_shared(clip.selection, clip.data_type) => {
                debug!(
                    selection = clip.selection,
                    data_type = clip.data_type,
                    len = clip.data.len(),
                    "dropping data for unsupported clipboard"
                );
            }
            AgentMessage::Clipboard(clip) => {
                self.clipboard
                    .write(&clip.data)
                    .await
                    .map_err(Error::Clipboard)?;
                // The watch will report this content back; don't echo it.
                self.last_clipboard = clip.data.to_vec();
            }
            AgentMessage::ClipboardRequest(_) => {
                let data = self.clipboard.read().await.map_err(Error::Clipboard)?;
                self.send(AgentMessage::Clipboard(ClipboardData {
                    selection: selection::CLIPBOARD,
                    data_type: clipboard_type::UTF8_TEXT,
                    data: data.into(),
                }))
                .await?;
            }
            AgentMessage::Unhandled(raw) => {
                debug!(kind = raw.kind, "unhandled message type");
            }
        }
        Ok(())
    }

    /// Announces new local clipboard contents unless they were already announced.
    async fn local_changed(&mut self, snapshot: Vec<u8>) -> Result<()> {
        if snapshot == self.last_clipboard {
            return Ok(());
        }
        self.send(AgentMessage::ClipboardGrab(ClipboardGrab {
            selection: selection::CLIPBOARD,
            data_type: clipboard_type::UTF8_TEXT,
        }))
        .await?;
        self.last_clipboard = snapshot;
        Ok(())
    }

    /// Writes one message to the channel.
    async fn send(&mut self, msg: AgentMessage) -> Result<()> {
        self.framed.send(msg.encode()).await?;
        debug!("outbound {msg}");
        Ok(())
    }
}

/// Next watch snapshot; never resolves before the watch is initialized.
/// Only UTF-8 text on the regular clipboard is synchronized.
const fn is_shared(sel: u8, data_type: u32) -> bool {
    sel == selection::CLIPBOARD && data_type == clipboard_type::UTF8_TEXT
}

async fn next_snapshot(watch: &mut Watch) -> Option<Vec<u8>> {
    match watch {
        Watch::Uninitialized => std::future::pending().await,
        Watch::Initialized(rx) => rx.recv().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::kind;

    /// In-memory clipboard whose watch is fed by the test.
    struct MockClipboard {
        contents: Arc<Mutex<Vec<u8>>>,
        inits: Arc<AtomicUsize>,
        snapshots: Option<mpsc::Receiver<Vec<u8>>>,
    }

    impl Clipboard for MockClipboard {
        async fn init(&mut self) -> io::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.contents.lock().unwrap().clone())
        }

        async fn write(&mut self, data: &[u8]) -> io::Result<()> {
            *self.contents.lock().unwrap() = data.to_vec();
            Ok(())
        }

        fn watch(&mut self, _cancel: CancellationToken) -> mpsc::Receiver<Vec<u8>> {
            self.snapshots.take().unwrap()
        }
    }

    type Host = Framed<Chunked<DuplexStream>, MessageCodec>;

    struct Harness {
        host: Host,
        contents: Arc<Mutex<Vec<u8>>>,
        inits: Arc<AtomicUsize>,
        snapshots: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
        agent: JoinHandle<Result<()>>,
    }

    fn start(initial: &[u8]) -> Harness {
        let (guest, host) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(16);
        let contents = Arc::new(Mutex::new(initial.to_vec()));
        let inits = Arc::new(AtomicUsize::new(0));
        let clipboard = MockClipboard {
            contents: Arc::clone(&contents),
            inits: Arc::clone(&inits),
            snapshots: Some(rx),
        };
        let cancel = CancellationToken::new();
        let agent = tokio::spawn(Agent::new(guest, clipboard).run(cancel.clone()));
        Harness {
            host: Framed::new(Chunked::new(host), MessageCodec),
            contents,
            inits,
            snapshots: tx,
            cancel,
            agent,
        }
    }

    impl Harness {
        async fn send(&mut self, msg: AgentMessage) {
            self.host.send(msg.encode()).await.unwrap();
        }

        async fn recv(&mut self) -> AgentMessage {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.host.next())
                .await
                .expect("agent did not reply")
                .unwrap()
                .unwrap();
            AgentMessage::decode(msg).unwrap()
        }

        async fn assert_silent(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(100), self.host.next()).await;
            assert!(next.is_err(), "unexpected message: {next:?}");
        }

        /// Performs a no-reply capability exchange so the clipboard is initialized.
        async fn connect(&mut self) {
            self.send(AgentMessage::AnnounceCapabilities(Capabilities {
                request: 0,
                caps: Caps::CLIPBOARD_BY_DEMAND,
            }))
            .await;
            self.assert_silent().await;
        }
    }

    fn grab() -> AgentMessage {
        AgentMessage::ClipboardGrab(ClipboardGrab {
            selection: selection::CLIPBOARD,
            data_type: clipboard_type::UTF8_TEXT,
        })
    }

    #[tokio::test]
    async fn replies_to_capability_request() {
        let mut h = start(b"");
        h.send(AgentMessage::AnnounceCapabilities(Capabilities {
            request: 1,
            caps: Caps::all(),
        }))
        .await;

        let reply = h.recv().await;
        assert_eq!(
            reply,
            AgentMessage::AnnounceCapabilities(Capabilities {
                request: 0,
                caps: Caps::CLIPBOARD_BY_DEMAND | Caps::CLIPBOARD_SELECTION,
            })
        );
        h.assert_silent().await;

        h.send(AgentMessage::AnnounceCapabilities(Capabilities {
            request: 0,
            caps: Caps::all(),
        }))
        .await;
        h.assert_silent().await;
    }

    #[tokio::test]
    async fn grab_triggers_exactly_one_request() {
        let mut h = start(b"");
        h.send(grab()).await;

        assert_eq!(
            h.recv().await,
            AgentMessage::ClipboardRequest(ClipboardRequest {
                selection: selection::CLIPBOARD,
                data_type: clipboard_type::UTF8_TEXT,
            })
        );
        h.assert_silent().await;
    }

    #[tokio::test]
    async fn images_and_primary_selection_are_left_alone() {
        let mut h = start(b"guest text");
        for (sel, data_type) in [
            (selection::CLIPBOARD, clipboard_type::IMAGE_PNG),
            (selection::PRIMARY, clipboard_type::UTF8_TEXT),
        ] {
            h.send(AgentMessage::ClipboardGrab(ClipboardGrab {
                selection: sel,
                data_type,
            }))
            .await;
            assert_eq!(
                h.recv().await,
                AgentMessage::ClipboardRequest(ClipboardRequest {
                    selection: sel,
                    data_type,
                })
            );

            h.send(AgentMessage::Clipboard(ClipboardData {
                selection: sel,
                data_type,
                data: Bytes::from_static(b"\x89PNG\r\n"),
            }))
            .await;
            h.assert_silent().await;
        }
        assert_eq!(*h.contents.lock().unwrap(), b"guest text");
        assert!(!h.agent.is_finished());
    }

    #[tokio::test]
    async fn request_returns_local_clipboard() {
        let mut h = start(b"guest text");
        h.send(AgentMessage::ClipboardRequest(ClipboardRequest {
            selection: selection::CLIPBOARD,
            data_type: clipboard_type::UTF8_TEXT,
        }))
        .await;

        assert_eq!(
            h.recv().await,
            AgentMessage::Clipboard(ClipboardData {
                selection: selection::CLIPBOARD,
                data_type: clipboard_type::UTF8_TEXT,
                data: Bytes::from_static(b"guest text"),
            })
        );
        h.assert_silent().await;
    }

    #[tokio::test]
    async fn host_data_lands_in_guest_clipboard_without_echo() {
        let mut h = start(b"");
        h.send(AgentMessage::Clipboard(ClipboardData {
            selection: selection::CLIPBOARD,
            data_type: clipboard_type::UTF8_TEXT,
            data: Bytes::from_static(b"from host"),
        }))
        .await;
        h.assert_silent().await;
        assert_eq!(*h.contents.lock().unwrap(), b"from host");

        // The watch reporting the host's own content is not re-announced.
        h.snapshots.send(b"from host".to_vec()).await.unwrap();
        h.assert_silent().await;
    }

    #[tokio::test]
    async fn identical_snapshots_grab_once() {
        let mut h = start(b"");
        h.connect().await;

        for snapshot in [&b"one"[..], b"one", b"two", b"two", b"one"] {
            h.snapshots.send(snapshot.to_vec()).await.unwrap();
        }
        assert_eq!(h.recv().await, grab());
        assert_eq!(h.recv().await, grab());
        assert_eq!(h.recv().await, grab());
        h.assert_silent().await;
    }

    #[tokio::test]
    async fn clipboard_initialized_after_first_read() {
        let mut h = start(b"");
        h.assert_silent().await;
        assert_eq!(h.inits.load(Ordering::SeqCst), 0);

        h.connect().await;
        h.send(AgentMessage::Unhandled(Message::new(kind::MOUSE_STATE, vec![0u8; 4])))
            .await;
        h.assert_silent().await;
        assert_eq!(h.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_channel_before_first_read_is_not_connected() {
        let h = start(b"");
        drop(h.host);
        let result = h.agent.await.unwrap();
        assert!(matches!(result, Err(Error::NotConnected(_))), "{result:?}");
    }

    #[tokio::test]
    async fn closed_channel_after_connect_is_io_error() {
        let mut h = start(b"");
        h.connect().await;
        drop(h.host);
        let result = h.agent.await.unwrap();
        assert!(matches!(result, Err(Error::Io(_))), "{result:?}");
    }

    #[tokio::test]
    async fn cancellation_ends_run_cleanly() {
        let h = start(b"");
        h.cancel.cancel();
        assert!(h.agent.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn malformed_payload_is_protocol_error() {
        let mut h = start(b"");
        h.host
            .send(Message::new(kind::CLIPBOARD_GRAB, vec![0u8; 3]))
            .await
            .unwrap();
        let result = h.agent.await.unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))), "{result:?}");
    }
}
