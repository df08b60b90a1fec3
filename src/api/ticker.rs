//! Background clock for the served platform.
//!
//! The platform only advances when it is touched. Between client calls the
//! ticker pumps it so operations complete, metrics are sampled and events
//! are queued on schedule.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::state::ApiState;

/// Interval between pumps.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Periodically advances the platform until shutdown.
pub struct Ticker {
    state: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
}

impl Ticker {
    pub fn new(state: Arc<ApiState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            state,
            shutdown_rx,
            interval: TICK_INTERVAL,
        }
    }

    /// Override the tick interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until shutdown is signaled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(interval = ?self.interval, "ticker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.state.platform().pump(Duration::ZERO);
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("ticker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vboxctl_sim::Platform;

    fn ticker() -> (watch::Sender<bool>, Ticker) {
        let state = Arc::new(ApiState::new(Arc::new(Platform::demo())));
        let (tx, rx) = watch::channel(false);
        (tx, Ticker::new(state, rx).with_interval(Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_signal() {
        let (tx, ticker) = ticker();
        let task = tokio::spawn(ticker.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_sender_dropped() {
        let (tx, ticker) = ticker();
        let task = tokio::spawn(ticker.run());
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
