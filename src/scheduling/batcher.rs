//! Pending-pod batching.
//!
//! Scheduling one pod at a time produces terrible packing, so pod events
//! open a window instead: the first trigger starts an idle timer and a max
//! timer, each further trigger resets the idle timer, and the batch closes
//! when either expires. The scheduler then sees every pod that arrived in
//! the window at once.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

pub const DEFAULT_IDLE: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX: Duration = Duration::from_secs(10);

/// Cloneable handle informers use to signal a pending pod.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::UnboundedSender<()>,
}

impl Trigger {
    pub fn poke(&self) {
        // A full window is already pending if the receiver lags; losing the
        // signal on shutdown is fine.
        let _ = self.tx.send(());
    }
}

pub struct Batcher {
    rx: mpsc::UnboundedReceiver<()>,
    idle: Duration,
    max: Duration,
}

impl Batcher {
    pub fn new(idle: Duration, max: Duration) -> (Trigger, Batcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Trigger { tx }, Batcher { rx, idle, max })
    }

    /// Block until a batch window closes. Returns false when every trigger
    /// handle is gone and no batch will ever form again (shutdown).
    pub async fn wait(&mut self) -> bool {
        if self.rx.recv().await.is_none() {
            return false;
        }
        trace!("batch window opened");
        let max_deadline = Instant::now() + self.max;
        let mut idle_deadline = Instant::now() + self.idle;
        loop {
            let deadline = idle_deadline.min(max_deadline);
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(()) => {
                        idle_deadline = Instant::now() + self.idle;
                    }
                    // Senders gone mid-window: close the batch normally.
                    None => return true,
                },
                _ = sleep_until(deadline) => {
                    trace!("batch window closed");
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn idle_timer_closes_the_window() {
        let (trigger, mut batcher) =
            Batcher::new(Duration::from_secs(1), Duration::from_secs(10));
        trigger.poke();
        let start = Instant::now();
        assert!(batcher.wait().await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_reset_the_idle_timer_until_max() {
        let (trigger, mut batcher) =
            Batcher::new(Duration::from_secs(1), Duration::from_secs(3));
        trigger.poke();

        let poker = tokio::spawn(async move {
            // Keep poking faster than the idle window forever; only the max
            // timer can end the batch.
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                trigger.poke();
            }
        });

        let start = Instant::now();
        assert!(batcher.wait().await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
        poker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_means_shutdown() {
        let (trigger, mut batcher) =
            Batcher::new(Duration::from_secs(1), Duration::from_secs(10));
        drop(trigger);
        assert!(!batcher.wait().await);
    }
}
