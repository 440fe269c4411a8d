//! Counter/gate hybrid for cooperative signalling.
//!
//! A [`FlagCounter`] counts how often a condition was raised and exposes a
//! [`Gate`] that fires exactly when the count transitions from zero to
//! positive. [`FlagCounter::reset`] swaps the gate object, so gates taken
//! before a reset that never fired stay pending forever.

use tokio::sync::watch;

/// A counter whose gate fires on the zero-to-positive transition.
#[derive(Debug)]
pub struct FlagCounter {
    count: u64,
    gate_tx: watch::Sender<bool>,
}

impl FlagCounter {
    /// Create a counter with the gate armed.
    pub fn new() -> Self {
        let (gate_tx, _gate_rx) = watch::channel(false);
        Self { count: 0, gate_tx }
    }

    /// Raise the flag once.
    pub fn flag(&mut self) {
        self.flag_many(1);
    }

    /// Raise the flag once if the condition holds.
    pub fn flag_if(&mut self, condition: bool) {
        if condition {
            self.flag();
        }
    }

    /// Raise the flag `count` times at once.
    pub fn flag_many(&mut self, count: u64) {
        let old = self.count;
        self.count += count;

        if old == 0 && count != 0 {
            let _ = self.gate_tx.send(true);
        }
    }

    /// Whether the count is positive.
    pub fn is_flagged(&self) -> bool {
        self.count > 0
    }

    /// The current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Clear the count and re-arm with a fresh gate.
    pub fn reset(&mut self) {
        self.count = 0;
        let (gate_tx, _gate_rx) = watch::channel(false);
        self.gate_tx = gate_tx;
    }

    /// Subscribe to the current gate.
    pub fn gate(&self) -> Gate {
        Gate {
            rx: self.gate_tx.subscribe(),
        }
    }
}

impl Default for FlagCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-shot gate handed out by [`FlagCounter::gate`].
#[derive(Debug, Clone)]
pub struct Gate {
    rx: watch::Receiver<bool>,
}

impl Gate {
    /// Wait until the gate fires.
    ///
    /// A gate abandoned by a reset never fires.
    pub async fn fired(mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Wait for an optional gate; an absent gate never fires.
pub async fn wait_opt(gate: Option<Gate>) {
    match gate {
        Some(gate) => gate.fired().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn gate_fires_on_first_flag() {
        let mut counter = FlagCounter::new();
        let gate = counter.gate();

        counter.flag();
        assert!(counter.is_flagged());
        assert_eq!(counter.count(), 1);

        tokio::time::timeout(Duration::from_secs(1), gate.fired())
            .await
            .expect("gate did not fire");
    }

    #[tokio::test]
    async fn flag_many_fires_once_and_counts() {
        let mut counter = FlagCounter::new();
        counter.reset();
        let gate = counter.gate();

        counter.flag_many(3);
        tokio::time::timeout(Duration::from_secs(1), gate.fired())
            .await
            .expect("gate did not fire");
        assert_eq!(counter.count(), 3);
    }

    #[tokio::test]
    async fn redundant_flags_do_not_rearm() {
        let mut counter = FlagCounter::new();
        counter.flag();
        counter.flag();

        // A gate taken after the transition observes the fired state.
        tokio::time::timeout(Duration::from_secs(1), counter.gate().fired())
            .await
            .expect("gate did not fire");
    }

    #[tokio::test]
    async fn reset_rearms_the_gate() {
        let mut counter = FlagCounter::new();
        counter.flag();
        counter.reset();
        assert!(!counter.is_flagged());
        assert_eq!(counter.count(), 0);

        let gate = counter.gate();
        let pending = tokio::time::timeout(Duration::from_millis(50), gate.fired()).await;
        assert!(pending.is_err());

        let gate = counter.gate();
        counter.flag();
        tokio::time::timeout(Duration::from_secs(1), gate.fired())
            .await
            .expect("gate did not fire");
    }

    #[tokio::test]
    async fn stale_gate_never_fires_after_reset() {
        let mut counter = FlagCounter::new();
        let stale = counter.gate();
        counter.reset();
        counter.flag();

        let pending = tokio::time::timeout(Duration::from_millis(50), stale.fired()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn flag_if_respects_the_condition() {
        let mut counter = FlagCounter::new();
        counter.flag_if(false);
        assert!(!counter.is_flagged());

        counter.flag_if(true);
        assert!(counter.is_flagged());
    }
}
