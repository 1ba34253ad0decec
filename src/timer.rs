//! Cancellable one-shot countdown.

use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;

/// A one-shot countdown with a cancellable wake.
///
/// [`wait`](Countdown::wait) resolves `true` when the duration elapses and
/// `false` when [`cancel`](Countdown::cancel) fires first. A cancel issued
/// while nothing is waiting is remembered and consumes the next wait, so a
/// shutdown racing the arm of an interval sleep still wins.
#[derive(Default)]
pub struct Countdown {
    cancel: Notify,
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts down `dura`, returning whether the countdown expired.
    pub async fn wait(&self, dura: Duration) -> bool {
        tokio::select! {
            _ = sleep(dura) => true,
            _ = self.cancel.notified() => false,
        }
    }

    /// Cancels the pending (or next) countdown.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }
}
