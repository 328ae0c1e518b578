//! Single-slot coalescing wake-up signal between feed connectors and the
//! broadcaster.
//!
//! Backed by a capacity-1 `mpsc` channel with drop-on-full sends: a notify
//! never blocks and never queues more than one pending wake-up, so a burst of
//! ticks collapses into a single pass. Dropped notifies carry no data (the
//! price already sits in the price table), so losing them loses nothing.

use tokio::sync::mpsc;

/// Sending half. Cheap to clone; one per feed connector.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<()>,
}

/// Receiving half, owned by the broadcaster.
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::Receiver<()>,
}

/// Create a new signal pair.
#[must_use]
pub fn signal() -> (SignalSender, SignalReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (SignalSender { tx }, SignalReceiver { rx })
}

impl SignalSender {
    /// Request a broadcast pass. Returns `false` if a wake-up was already
    /// pending (coalesced) or the receiver is gone.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

impl SignalReceiver {
    /// Wait for the next wake-up. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_coalesces_into_one_wakeup() {
        let (tx, mut rx) = signal();
        assert!(tx.notify());
        assert!(!tx.notify());
        assert!(!tx.clone().notify());
        assert_eq!(rx.recv().await, Some(()));
        assert!(rx.rx.try_recv().is_err());
        assert!(tx.notify());
    }

    #[tokio::test]
    async fn closes_when_senders_drop() {
        let (tx, mut rx) = signal();
        tx.notify();
        drop(tx);
        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn notify_after_receiver_dropped() {
        let (tx, rx) = signal();
        drop(rx);
        assert!(!tx.notify());
    }
}
