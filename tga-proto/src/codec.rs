//! Length-prefixed frame codec over any `AsyncRead`/`AsyncWrite` stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Encodes `msg` as a length-prefixed postcard frame, writes it and flushes `w`.
pub async fn send<W>(w: &mut W, msg: &impl Serialize) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Reads one frame and decodes it, treating end-of-stream as an error.
pub async fn recv<T, R>(r: &mut R) -> io::Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    try_recv(r)
        .await?
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
}

/// Reads one frame and decodes it.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// End-of-stream inside a frame is an [`io::ErrorKind::UnexpectedEof`] error.
pub async fn try_recv<T, R>(r: &mut R) -> io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Call, Command, ErrorCode, ErrorInfo, ExecRequest, ExecResponse, TerminalSize};

    #[tokio::test]
    async fn roundtrip_exec_command() {
        let req = ExecRequest::Command(Command {
            name: "/bin/ls".into(),
            args: vec!["-la".into()],
            interactive: true,
            tty: true,
            terminal_size: Some(TerminalSize { rows: 24, cols: 80 }),
        });

        let mut buf = Vec::new();
        send(&mut buf, &Call::Exec).await.unwrap();
        send(&mut buf, &req).await.unwrap();

        let mut r = buf.as_slice();
        let call: Call = recv(&mut r).await.unwrap();
        assert_eq!(call, Call::Exec);
        let decoded: ExecRequest = recv(&mut r).await.unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut buf = Vec::new();
        send(&mut buf, &ExecResponse::Exit { code: 3 }).await.unwrap();

        let mut r = buf.as_slice();
        let first: Option<ExecResponse> = try_recv(&mut r).await.unwrap();
        assert_eq!(first, Some(ExecResponse::Exit { code: 3 }));
        let second: Option<ExecResponse> = try_recv(&mut r).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_unexpected_eof() {
        let mut buf = Vec::new();
        let err = ExecResponse::Error(ErrorInfo::new(ErrorCode::Internal, "boom"));
        send(&mut buf, &err).await.unwrap();
        buf.truncate(buf.len() - 1);

        let mut r = buf.as_slice();
        let result: io::Result<Option<ExecResponse>> = try_recv(&mut r).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);

        let mut partial_header: &[u8] = &[0, 0];
        let result: io::Result<Option<ExecResponse>> = try_recv(&mut partial_header).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        // Craft a frame header claiming 32 MiB
        let header = (32u32 * 1024 * 1024).to_be_bytes();
        let mut r = &header[..];
        let result: io::Result<ExecRequest> = recv(&mut r).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn roundtrip_resolve_ip_reply() {
        let reply: Result<crate::ResolveIpResponse, ErrorInfo> = Ok(crate::ResolveIpResponse {
            ip: "192.168.64.2".into(),
        });

        let mut buf = Vec::new();
        send(&mut buf, &reply).await.unwrap();

        let mut r = buf.as_slice();
        let decoded: Result<crate::ResolveIpResponse, ErrorInfo> = recv(&mut r).await.unwrap();
        assert_eq!(decoded, reply);
    }
}
