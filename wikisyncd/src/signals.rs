//! Process signals for the daemon.
//!
//! SIGINT, SIGTERM and SIGHUP stop the service by cancelling the shutdown
//! token; a second stop signal force-exits. SIGUSR1 asks for an immediate sync.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    Interrupt,
    Terminate,
    Hangup,
    SyncRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Stop,
    ForceExit,
    Sync,
}

/// Shutdown token plus the manual sync trigger, shared by the runtime and the CLI modes.
#[derive(Clone, Default)]
pub struct ServiceSignals {
    shutdown: CancellationToken,
    sync: Arc<Notify>,
}

impl ServiceSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handlers and spawns the listener. Needs a running tokio runtime.
    pub fn install() -> io::Result<Self> {
        let signals = Self::new();
        let listeners = Listeners {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            user1: signal(SignalKind::user_defined1())?,
        };
        tokio::spawn(listen(signals.clone(), listeners));
        Ok(signals)
    }

    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_sync(&self) {
        self.sync.notify_one();
    }

    /// Resolves once per sync request; requests made while nobody waits are kept.
    pub async fn sync_requested(&self) {
        self.sync.notified().await;
    }

    fn dispatch(&self, received: Received, stops: &mut u32) -> Action {
        match received {
            Received::SyncRequest => {
                tracing::info!("manual sync requested");
                self.request_sync();
                Action::Sync
            }
            Received::Interrupt | Received::Terminate | Received::Hangup => {
                *stops += 1;
                if *stops > 1 {
                    tracing::warn!(signal = ?received, "force exit requested");
                    return Action::ForceExit;
                }
                tracing::info!(signal = ?received, "shutdown requested, keeping partial downloads for resume");
                self.shutdown.cancel();
                Action::Stop
            }
        }
    }
}

struct Listeners {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    user1: Signal,
}

async fn listen(signals: ServiceSignals, mut listeners: Listeners) {
    let mut stops = 0;
    loop {
        let received = tokio::select! {
            _ = listeners.interrupt.recv() => Received::Interrupt,
            _ = listeners.terminate.recv() => Received::Terminate,
            _ = listeners.hangup.recv() => Received::Hangup,
            _ = listeners.user1.recv() => Received::SyncRequest,
        };
        if signals.dispatch(received, &mut stops) == Action::ForceExit {
            std::process::exit(FORCED_EXIT_CODE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_stop_signal_cancels_and_second_forces_exit() {
        let signals = ServiceSignals::new();
        let mut stops = 0;

        assert_eq!(signals.dispatch(Received::Terminate, &mut stops), Action::Stop);
        assert!(signals.shutdown().is_cancelled());
        assert_eq!(signals.dispatch(Received::Interrupt, &mut stops), Action::ForceExit);
    }

    #[tokio::test]
    async fn sync_request_wakes_waiter_without_stopping() {
        let signals = ServiceSignals::new();
        let mut stops = 0;

        assert_eq!(signals.dispatch(Received::SyncRequest, &mut stops), Action::Sync);
        assert_eq!(stops, 0);
        assert!(!signals.shutdown().is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), signals.sync_requested())
            .await
            .expect("pending sync request");
    }

    #[tokio::test]
    async fn clones_share_one_trigger() {
        let signals = ServiceSignals::new();
        let daemon_side = signals.clone();
        signals.request_sync();
        tokio::time::timeout(Duration::from_secs(1), daemon_side.sync_requested())
            .await
            .expect("request seen through clone");
        assert!(
            tokio::time::timeout(Duration::from_millis(20), daemon_side.sync_requested())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn install_starts_live() {
        let signals = ServiceSignals::install().unwrap();
        assert!(!signals.shutdown().is_cancelled());
    }
}
