// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-period polling loop for server processes

use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// A server driven by periodic polling
pub trait ServerLoop {
    /// Drain and handle every queued transport event; returns how many
    fn poll_events(&mut self) -> usize;

    /// Disconnect every peer and forget all sessions
    fn shutdown(&mut self);
}

/// Poll `server` every `poll_interval` until `shutdown` resolves.
///
/// All handling happens on the calling task, one tick at a time.
pub async fn run_until<S, F>(server: &mut S, poll_interval: Duration, shutdown: F)
where
    S: ServerLoop,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                server.poll_events();
            }
        }
    }

    info!("Shutting down");
    server.poll_events();
    server.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        polls: usize,
        stopped: bool,
    }

    impl ServerLoop for Counter {
        fn poll_events(&mut self) -> usize {
            self.polls += 1;
            0
        }

        fn shutdown(&mut self) {
            self.stopped = true;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_shutdown() {
        let mut server = Counter::default();
        run_until(
            &mut server,
            Duration::from_millis(15),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await;

        assert!(server.polls >= 5);
        assert!(server.stopped);
    }
}
