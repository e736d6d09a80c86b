use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    NegotiationDebounce,
    CapabilityRetry,
    IceRetry,
    GuestRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub seq: u64,
}

/// Named one-shot timers that report back through the orchestrator's inbox.
///
/// Scheduling a kind that is already pending replaces it. A firing is only honoured if
/// its sequence number is still the current one for that kind, so a timer cancelled after
/// its message was already queued is ignored.
pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    entries: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_seq: u64,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_seq += 1;
        let seq = self.next_seq;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { kind, seq });
        });
        self.entries.insert(kind, (seq, handle));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.entries.remove(&kind) {
            handle.abort();
        }
    }

    pub fn clear_all(&mut self) {
        for (_, (_, handle)) in self.entries.drain() {
            handle.abort();
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Consumes a firing; returns false for stale or cancelled timers.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.entries.get(&fired.kind) {
            Some((seq, _)) if *seq == fired.seq => {
                self.entries.remove(&fired.kind);
                true
            }
            _ => false,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKind::IceRetry, Duration::from_secs(1));
        timers.schedule(TimerKind::IceRetry, Duration::from_secs(5));
        assert_eq!(timers.pending(), 1);

        let fired = rx.recv().await.unwrap();
        assert!(timers.accept(fired));
        assert_eq!(timers.pending(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_firings_are_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKind::GuestRecovery, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        timers.cancel(TimerKind::GuestRecovery);
        let fired = rx.recv().await.unwrap();
        assert!(!timers.accept(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_leaves_nothing_to_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKind::NegotiationDebounce, Duration::from_millis(500));
        timers.schedule(TimerKind::CapabilityRetry, Duration::from_secs(2));
        timers.clear_all();
        assert_eq!(timers.pending(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
