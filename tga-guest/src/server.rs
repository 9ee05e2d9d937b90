//! Vsock listener and per-connection call dispatch.

use std::io;
use std::time::Duration;

use tga_proto::{Call, ErrorCode, ErrorInfo, ResolveIpResponse};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{exec, resolve};

/// Time a client has to send its [`Call`] after connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts connections on `port` until `cancel` fires.
///
/// Each connection is served in its own task. An accept failure ends the
/// server so the caller can rebind.
#[cfg(target_os = "linux")]
pub async fn run(port: u32, cancel: CancellationToken) -> io::Result<()> {
    let listener = tga_vsock::Listener::bind(port)?;
    tracing::info!(port = %listener.local_addr(), "RPC server listening on AF_VSOCK");

    loop {
        let conn = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let peer = conn.remote_addr();
        debug!(%peer, "accepted connection");
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = session(conn, &cancel).await {
                tracing::warn!(%peer, error = %e, "session error");
            }
        });
    }
}

/// Reads the [`Call`] under [`HANDSHAKE_TIMEOUT`] and serves it.
#[cfg(target_os = "linux")]
async fn session(mut conn: tga_vsock::Connection, cancel: &CancellationToken) -> io::Result<()> {
    conn.set_read_deadline(Some(tokio::time::Instant::now() + HANDSHAKE_TIMEOUT));
    let call: Option<Call> = tga_proto::try_recv(&mut conn).await?;
    conn.set_read_deadline(None);

    match call {
        Some(call) => serve(call, conn, cancel).await,
        // Connected and left without calling anything.
        None => Ok(()),
    }
}

/// Serves one call on an established stream.
pub async fn serve<S>(call: Call, stream: S, cancel: &CancellationToken) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match call {
        Call::Exec => {
            let (r, mut w) = tokio::io::split(stream);
            exec::handle(BufReader::new(r), &mut w, cancel).await
        }
        Call::ResolveIp => {
            let mut stream = stream;
            let reply = resolve::resolve_ip()
                .map(|ip| ResolveIpResponse { ip: ip.to_string() })
                .map_err(|e| ErrorInfo::new(ErrorCode::Unavailable, e.to_string()));
            if let Err(info) = &reply {
                debug!(error = %info, "cannot resolve IP");
            }
            tga_proto::send(&mut stream, &reply).await
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported call {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use tga_proto::{Command, ExecRequest, ExecResponse};

    use super::*;

    #[tokio::test]
    async fn exec_call_runs_to_exit() {
        let (client, server) = tokio::io::duplex(4096);
        let task =
            tokio::spawn(async move { serve(Call::Exec, server, &CancellationToken::new()).await });

        let (mut r, mut w) = tokio::io::split(client);
        let command = Command {
            name: "true".to_owned(),
            ..Command::default()
        };
        tga_proto::send(&mut w, &ExecRequest::Command(command))
            .await
            .unwrap();

        let response: ExecResponse = tga_proto::recv(&mut r).await.unwrap();
        assert_eq!(response, ExecResponse::Exit { code: 0 });
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resolve_ip_replies_once() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            serve(Call::ResolveIp, server, &CancellationToken::new()).await
        });

        let reply: Result<ResolveIpResponse, ErrorInfo> =
            tga_proto::recv(&mut client).await.unwrap();
        match reply {
            Ok(resp) => assert!(resp.ip.parse::<std::net::Ipv4Addr>().is_ok()),
            Err(info) => assert_eq!(info.code, ErrorCode::Unavailable),
        }
        task.await.unwrap().unwrap();
        assert!(tga_proto::try_recv::<ExecResponse, _>(&mut client)
            .await
            .unwrap()
            .is_none());
    }
}
