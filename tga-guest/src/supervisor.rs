//! Restart loop for the agent's long-running components.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause before restarting a component that stopped.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Pause before retrying a SPICE channel whose host side is not connected.
pub const DISCONNECTED_DELAY: Duration = Duration::from_secs(30);

/// Runs `run_once` over and over until `cancel` fires.
///
/// Each run gets a child of `cancel`. Errors are logged, never propagated,
/// so one failing component cannot take down the others.
pub async fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, mut run_once: F)
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        info!(component = name, "starting");
        let delay = match run_once(cancel.child_token()).await {
            Ok(()) if cancel.is_cancelled() => break,
            Ok(()) => {
                warn!(component = name, "stopped unexpectedly");
                RESTART_DELAY
            }
            Err(e) => {
                let delay = restart_delay(&e);
                error!(
                    component = name,
                    retry_in = ?delay,
                    "failed: {e:#}"
                );
                delay
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    info!(component = name, "stopped");
}

fn restart_delay(e: &anyhow::Error) -> Duration {
    match e.downcast_ref::<tga_spice::Error>() {
        Some(tga_spice::Error::NotConnected(_)) => DISCONNECTED_DELAY,
        _ => RESTART_DELAY,
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Context;

    use super::*;

    #[test]
    fn not_connected_backs_off_longer() {
        let e = anyhow::Error::new(tga_spice::Error::NotConnected(io::ErrorKind::NotConnected.into()))
            .context("running vdagent");
        assert_eq!(restart_delay(&e), DISCONNECTED_DELAY);

        let e = anyhow::Error::new(tga_spice::Error::Protocol("short".to_owned()));
        assert_eq!(restart_delay(&e), RESTART_DELAY);

        let e = Err::<(), _>(io::Error::other("bind")).context("rpc").unwrap_err();
        assert_eq!(restart_delay(&e), RESTART_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_until_cancelled() {
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let started = tokio::time::Instant::now();
        supervise("test", cancel.clone(), |_| {
            let runs = Arc::clone(&runs);
            let cancel = cancel.clone();
            async move {
                if runs.fetch_add(1, Ordering::SeqCst) == 2 {
                    cancel.cancel();
                    return Ok(());
                }
                anyhow::bail!("boom")
            }
        })
        .await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= RESTART_DELAY * 2 && elapsed < RESTART_DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_delay() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        supervise("test", cancel, |_| async {
            Err(anyhow::Error::new(tga_spice::Error::NotConnected(
                io::ErrorKind::NotConnected.into(),
            )))
        })
        .await;
        assert!(started.elapsed() < DISCONNECTED_DELAY);
    }
}
