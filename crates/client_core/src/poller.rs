use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::info;

use crate::types::ConnectionState;

/// Something the poller can ask to re-fetch history without user-visible
/// side effects. Implementations swallow and log their own failures.
#[async_trait]
pub(crate) trait SilentReload: Send + Sync {
    async fn reload_silent(&self);

    fn connection_changed(&self, _state: ConnectionState) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    Idle,
    Polling,
}

impl PollerState {
    fn for_connection(state: ConnectionState) -> Self {
        if state.is_connected() {
            Self::Idle
        } else {
            Self::Polling
        }
    }
}

/// Bounds staleness while the live channel is down: reloads every `interval`
/// while disconnected, and once immediately when the connection comes back.
/// Never reloads while connected.
pub(crate) struct FallbackPoller {
    interval: Duration,
    connection: watch::Receiver<ConnectionState>,
}

impl FallbackPoller {
    pub(crate) fn new(interval: Duration, connection: watch::Receiver<ConnectionState>) -> Self {
        Self {
            interval,
            connection,
        }
    }

    /// Runs until the connection watch closes. Callers abort the task on teardown.
    pub(crate) async fn run(mut self, reloader: &dyn SilentReload) {
        let mut state = PollerState::for_connection(*self.connection.borrow_and_update());
        loop {
            state = match state {
                PollerState::Idle => match self.wait_for_change().await {
                    Some(ConnectionState::Disconnected) => {
                        reloader.connection_changed(ConnectionState::Disconnected);
                        info!(
                            interval_ms = self.interval.as_millis() as u64,
                            "poller: live channel down, polling history"
                        );
                        PollerState::Polling
                    }
                    // The watch only keeps the latest value, so a brief outage can
                    // surface as a lone `Connected`. Close the gap it left.
                    Some(ConnectionState::Connected) => {
                        reloader.connection_changed(ConnectionState::Connected);
                        info!("poller: live channel bounced, closing gap");
                        reloader.reload_silent().await;
                        PollerState::Idle
                    }
                    None => return,
                },
                PollerState::Polling => {
                    let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => reloader.reload_silent().await,
                            changed = self.wait_for_change() => match changed {
                                Some(ConnectionState::Connected) => {
                                    reloader.connection_changed(ConnectionState::Connected);
                                    info!("poller: live channel restored, closing gap");
                                    reloader.reload_silent().await;
                                    break PollerState::Idle;
                                }
                                Some(ConnectionState::Disconnected) => {}
                                None => return,
                            }
                        }
                    }
                }
            };
        }
    }

    async fn wait_for_change(&mut self) -> Option<ConnectionState> {
        self.connection.changed().await.ok()?;
        Some(*self.connection.borrow_and_update())
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
