//! Agent message envelope, payload catalogue and stream codec.
//!
//! Every message is a 20-byte little-endian envelope
//! `{protocol: u32, type: u32, opaque: u64, size: u32}` followed by exactly
//! `size` payload bytes.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Result};

/// Protocol version stamped on every envelope.
pub const VD_AGENT_PROTOCOL: u32 = 1;

/// Length of the message envelope in bytes.
pub const ENVELOPE_LEN: usize = 20;

/// Maximum accepted payload (16 MiB).
pub const MAX_MESSAGE: u32 = 16 * 1024 * 1024;

/// Envelope `type` values.
pub mod kind {
    /// Mouse state update.
    pub const MOUSE_STATE: u32 = 1;
    /// Monitor configuration.
    pub const MONITORS_CONFIG: u32 = 2;
    /// Generic reply.
    pub const REPLY: u32 = 3;
    /// Clipboard contents.
    pub const CLIPBOARD: u32 = 4;
    /// Display configuration.
    pub const DISPLAY_CONFIG: u32 = 5;
    /// Capability announcement.
    pub const ANNOUNCE_CAPABILITIES: u32 = 6;
    /// Clipboard ownership announcement.
    pub const CLIPBOARD_GRAB: u32 = 7;
    /// Request for clipboard contents.
    pub const CLIPBOARD_REQUEST: u32 = 8;
    /// Clipboard ownership release.
    pub const CLIPBOARD_RELEASE: u32 = 9;
    /// File transfer start.
    pub const FILE_XFER_START: u32 = 10;
    /// File transfer status.
    pub const FILE_XFER_STATUS: u32 = 11;
    /// File transfer data.
    pub const FILE_XFER_DATA: u32 = 12;
    /// The client side disconnected.
    pub const CLIENT_DISCONNECTED: u32 = 13;
    /// Maximum clipboard size.
    pub const MAX_CLIPBOARD: u32 = 14;
    /// Audio volume synchronization.
    pub const AUDIO_VOLUME_SYNC: u32 = 15;
    /// Graphics device information.
    pub const GRAPHICS_DEVICE_INFO: u32 = 16;
}

/// Clipboard selection identifiers.
pub mod selection {
    /// The regular clipboard.
    pub const CLIPBOARD: u8 = 0;
    /// The primary (text selection) buffer.
    pub const PRIMARY: u8 = 1;
    /// The secondary buffer.
    pub const SECONDARY: u8 = 2;
}

/// Clipboard content types.
pub mod clipboard_type {
    /// No content.
    pub const NONE: u32 = 0;
    /// UTF-8 text, the only type this agent produces.
    pub const UTF8_TEXT: u32 = 1;
    /// PNG image.
    pub const IMAGE_PNG: u32 = 2;
    /// BMP image.
    pub const IMAGE_BMP: u32 = 3;
    /// TIFF image.
    pub const IMAGE_TIFF: u32 = 4;
    /// JPEG image.
    pub const IMAGE_JPG: u32 = 5;
}

bitflags::bitflags! {
    /// Capability bitmask exchanged in [`Capabilities`].
    ///
    /// Bits without a name are kept as-is when parsing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Caps: u32 {
        /// Mouse state messages.
        const MOUSE_STATE = 1 << 0;
        /// Monitor layout configuration.
        const MONITORS_CONFIG = 1 << 1;
        /// Reply messages.
        const REPLY = 1 << 2;
        /// Legacy clipboard transfer.
        const CLIPBOARD = 1 << 3;
        /// Display configuration.
        const DISPLAY_CONFIG = 1 << 4;
        /// Clipboard data is sent only when requested.
        const CLIPBOARD_BY_DEMAND = 1 << 5;
        /// Clipboard messages carry a selection.
        const CLIPBOARD_SELECTION = 1 << 6;
        /// Monitor configuration may skip disabled monitors.
        const SPARSE_MONITORS_CONFIG = 1 << 7;
        /// Guest text uses LF line endings.
        const GUEST_LINEEND_LF = 1 << 8;
        /// Guest text uses CRLF line endings.
        const GUEST_LINEEND_CRLF = 1 << 9;
        /// Maximum clipboard size announcement.
        const MAX_CLIPBOARD = 1 << 10;
        /// Audio volume synchronization.
        const AUDIO_VOLUME_SYNC = 1 << 11;
        /// Monitor configuration includes positions.
        const MONITORS_CONFIG_POSITION = 1 << 12;
        /// File transfer is disabled.
        const FILE_XFER_DISABLED = 1 << 13;
        /// Detailed file transfer errors.
        const FILE_XFER_DETAILED_ERRORS = 1 << 14;
        /// Graphics device information.
        const GRAPHICS_DEVICE_INFO = 1 << 15;
        /// No release message precedes a re-grab.
        const CLIPBOARD_NO_RELEASE_ON_REGRAB = 1 << 16;
        /// Grabs carry a serial number.
        const CLIPBOARD_GRAB_SERIAL = 1 << 17;
    }
}

/// A raw agent message: envelope fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Protocol version.
    pub protocol: u32,
    /// Message type, see [`kind`].
    pub kind: u32,
    /// Opaque value, echoed by some replies.
    pub opaque: u64,
    /// Payload; its length is the envelope `size`.
    pub data: Bytes,
}

impl Message {
    /// Creates a message of `kind` with the current protocol version.
    pub fn new(kind: u32, data: impl Into<Bytes>) -> Self {
        Self {
            protocol: VD_AGENT_PROTOCOL,
            kind,
            opaque: 0,
            data: data.into(),
        }
    }
}

/// Splits a byte stream into [`Message`]s and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < ENVELOPE_LEN {
            src.reserve(ENVELOPE_LEN - src.len());
            return Ok(None);
        }

        let size = u32::from_le_bytes([src[16], src[17], src[18], src[19]]);
        if size > MAX_MESSAGE {
            return Err(Error::Protocol(format!(
                "message of {size} bytes exceeds the 16 MiB limit"
            )));
        }
        let total = ENVELOPE_LEN + size as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let protocol = src.get_u32_le();
        let kind = src.get_u32_le();
        let opaque = src.get_u64_le();
        src.advance(4);
        let data = src.split_to(size as usize).freeze();
        Ok(Some(Message {
            protocol,
            kind,
            opaque,
            data,
        }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let size = u32::try_from(msg.data.len())
            .ok()
            .filter(|size| *size <= MAX_MESSAGE)
            .ok_or_else(|| Error::Protocol("outbound message exceeds the 16 MiB limit".into()))?;
        dst.reserve(ENVELOPE_LEN + msg.data.len());
        dst.put_u32_le(msg.protocol);
        dst.put_u32_le(msg.kind);
        dst.put_u64_le(msg.opaque);
        dst.put_u32_le(size);
        dst.extend_from_slice(&msg.data);
        Ok(())
    }
}

/// Capability announcement payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Non-zero when the sender wants the receiver's capabilities back.
    pub request: u32,
    /// Announced capabilities.
    pub caps: Caps,
}

/// Clipboard grab payload: the sender now owns `selection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipboardGrab {
    /// Selection being grabbed, see [`selection`].
    pub selection: u8,
    /// Content type held, see [`clipboard_type`].
    pub data_type: u32,
}

/// Clipboard request payload: asks the owner for its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipboardRequest {
    /// Selection requested, see [`selection`].
    pub selection: u8,
    /// Content type wanted, see [`clipboard_type`].
    pub data_type: u32,
}

/// Clipboard data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardData {
    /// Selection the data belongs to.
    pub selection: u8,
    /// Content type of `data`.
    pub data_type: u32,
    /// Clipboard contents.
    pub data: Bytes,
}

/// Decoded agent message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AgentMessage {
    /// [`kind::ANNOUNCE_CAPABILITIES`]
    AnnounceCapabilities(Capabilities),
    /// [`kind::CLIPBOARD_GRAB`]
    ClipboardGrab(ClipboardGrab),
    /// [`kind::CLIPBOARD_REQUEST`]
    ClipboardRequest(ClipboardRequest),
    /// [`kind::CLIPBOARD`]
    Clipboard(ClipboardData),
    /// Any other message type, passed through untouched.
    Unhandled(Message),
}

/// Reads the `{selection: u8, reserved: [u8; 3], type: u32}` clipboard header.
fn clipboard_header(what: &str, mut data: &[u8]) -> Result<(u8, u32)> {
    if data.len() < 8 {
        return Err(Error::Protocol(format!(
            "{what} payload is {} bytes, expected at least 8",
            data.len()
        )));
    }
    let selection = data.get_u8();
    data.advance(3);
    Ok((selection, data.get_u32_le()))
}

/// Writes the clipboard header counterpart of [`clipboard_header`].
fn put_clipboard_header(dst: &mut BytesMut, selection: u8, data_type: u32) {
    dst.put_u8(selection);
    dst.put_bytes(0, 3);
    dst.put_u32_le(data_type);
}

impl AgentMessage {
    /// Decodes the payload of `msg` according to its type.
    pub fn decode(msg: Message) -> Result<Self> {
        match msg.kind {
            kind::ANNOUNCE_CAPABILITIES => {
                let mut data = &msg.data[..];
                if data.len() < 8 {
                    return Err(Error::Protocol(format!(
                        "capabilities payload is {} bytes, expected at least 8",
                        data.len()
                    )));
                }
                let request = data.get_u32_le();
                let caps = Caps::from_bits_retain(data.get_u32_le());
                Ok(Self::AnnounceCapabilities(Capabilities { request, caps }))
            }
            kind::CLIPBOARD_GRAB => {
                let (selection, data_type) = clipboard_header("clipboard grab", &msg.data)?;
                Ok(Self::ClipboardGrab(ClipboardGrab {
                    selection,
                    data_type,
                }))
            }
            kind::CLIPBOARD_REQUEST => {
                let (selection, data_type) = clipboard_header("clipboard request", &msg.data)?;
                Ok(Self::ClipboardRequest(ClipboardRequest {
                    selection,
                    data_type,
                }))
            }
            kind::CLIPBOARD => {
                let (selection, data_type) = clipboard_header("clipboard", &msg.data)?;
                Ok(Self::Clipboard(ClipboardData {
                    selection,
                    data_type,
                    data: msg.data.slice(8..),
                }))
            }
            _ => Ok(Self::Unhandled(msg)),
        }
    }

    /// Encodes the message into an envelope with the current protocol version.
    pub fn encode(&self) -> Message {
        let mut buf = BytesMut::new();
        let kind = match self {
            Self::AnnounceCapabilities(c) => {
                buf.put_u32_le(c.request);
                buf.put_u32_le(c.caps.bits());
                kind::ANNOUNCE_CAPABILITIES
            }
            Self::ClipboardGrab(g) => {
                put_clipboard_header(&mut buf, g.selection, g.data_type);
                kind::CLIPBOARD_GRAB
            }
            Self::ClipboardRequest(r) => {
                put_clipboard_header(&mut buf, r.selection, r.data_type);
                kind::CLIPBOARD_REQUEST
            }
            Self::Clipboard(c) => {
                put_clipboard_header(&mut buf, c.selection, c.data_type);
                buf.extend_from_slice(&c.data);
                kind::CLIPBOARD
            }
            Self::Unhandled(msg) => return msg.clone(),
        };
        Message::new(kind, buf.freeze())
    }
}

impl fmt::Display for AgentMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnnounceCapabilities(c) => {
                write!(f, "ANNOUNCE_CAPABILITIES(request={}, caps={:?})", c.request, c.caps)
            }
            Self::ClipboardGrab(g) => write!(
                f,
                "CLIPBOARD_GRAB(selection={}, type={})",
                g.selection, g.data_type
            ),
            Self::ClipboardRequest(r) => write!(
                f,
                "CLIPBOARD_REQUEST(selection={}, type={})",
                r.selection, r.data_type
            ),
            Self::Clipboard(c) => write!(
                f,
                "CLIPBOARD(selection={}, type={}, data={} bytes)",
                c.selection,
                c.data_type,
                c.data.len()
            ),
            Self::Unhandled(m) => write!(f, "type {} ({} bytes)", m.kind, m.data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &AgentMessage) -> AgentMessage {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg.encode(), &mut buf).unwrap();
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        AgentMessage::decode(decoded).unwrap()
    }

    #[test]
    fn capability_bits_are_contiguous() {
        assert_eq!(Caps::all().bits(), (1 << 18) - 1);
        assert_eq!(Caps::CLIPBOARD_BY_DEMAND.bits(), 1 << 5);
        assert_eq!(Caps::CLIPBOARD_GRAB_SERIAL.bits(), 1 << 17);
    }

    #[test]
    fn payloads_roundtrip() {
        let cases = [
            AgentMessage::AnnounceCapabilities(Capabilities {
                request: 1,
                caps: Caps::CLIPBOARD_BY_DEMAND | Caps::CLIPBOARD_SELECTION,
            }),
            AgentMessage::ClipboardGrab(ClipboardGrab {
                selection: selection::CLIPBOARD,
                data_type: clipboard_type::UTF8_TEXT,
            }),
            AgentMessage::ClipboardRequest(ClipboardRequest {
                selection: selection::PRIMARY,
                data_type: clipboard_type::IMAGE_PNG,
            }),
            AgentMessage::Clipboard(ClipboardData {
                selection: selection::CLIPBOARD,
                data_type: clipboard_type::UTF8_TEXT,
                data: Bytes::from_static(b"copied text"),
            }),
        ];
        for msg in &cases {
            assert_eq!(&roundtrip(msg), msg);
        }
    }

    #[test]
    fn envelope_layout() {
        let grab = AgentMessage::ClipboardGrab(ClipboardGrab {
            selection: 0,
            data_type: 1,
        });
        let mut buf = BytesMut::new();
        MessageCodec.encode(grab.encode(), &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[
                1, 0, 0, 0, // protocol
                7, 0, 0, 0, // type
                0, 0, 0, 0, 0, 0, 0, 0, // opaque
                8, 0, 0, 0, // size
                0, 0, 0, 0, 1, 0, 0, 0, // selection, reserved, type
            ]
        );
    }

    #[test]
    fn unknown_capability_bits_are_preserved() {
        let raw = Message::new(
            kind::ANNOUNCE_CAPABILITIES,
            [0u8, 0, 0, 0, 0x20, 0, 0, 0x80].to_vec(),
        );
        let AgentMessage::AnnounceCapabilities(caps) = AgentMessage::decode(raw).unwrap() else {
            panic!("expected capabilities");
        };
        assert_eq!(caps.caps.bits(), 0x8000_0020);
        assert!(caps.caps.contains(Caps::CLIPBOARD_BY_DEMAND));
    }

    #[test]
    fn decoder_waits_for_complete_message() {
        let mut full = BytesMut::new();
        MessageCodec
            .encode(Message::new(kind::CLIPBOARD, vec![0u8; 12]), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..ENVELOPE_LEN + 3]);
        assert!(MessageCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[ENVELOPE_LEN + 3..]);
        assert!(MessageCodec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn rejects_oversized_and_truncated() {
        let mut header = BytesMut::new();
        header.put_u32_le(VD_AGENT_PROTOCOL);
        header.put_u32_le(kind::CLIPBOARD);
        header.put_u64_le(0);
        header.put_u32_le(MAX_MESSAGE + 1);
        assert!(matches!(
            MessageCodec.decode(&mut header),
            Err(Error::Protocol(_))
        ));

        let short = Message::new(kind::CLIPBOARD_GRAB, vec![0u8; 4]);
        assert!(matches!(AgentMessage::decode(short), Err(Error::Protocol(_))));
    }

    #[test]
    fn unhandled_types_pass_through() {
        let raw = Message::new(kind::MONITORS_CONFIG, vec![1u8, 2, 3]);
        let decoded = AgentMessage::decode(raw.clone()).unwrap();
        assert_eq!(decoded, AgentMessage::Unhandled(raw.clone()));
        assert_eq!(decoded.encode(), raw);
    }
}
