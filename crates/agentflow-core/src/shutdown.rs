use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shared stop flag observed by every background loop.
///
/// Cloning a `Shutdown` hands out another observer of the same signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Signal every observer to stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires (immediately if it already has).
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // An error means the sender is gone, which also means stop.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Run `tick` every `period` on its own task until the signal fires.
    ///
    /// A tick in progress is never interrupted; the loop exits at the next
    /// boundary.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(loop_name = name, period_ms = period.as_millis() as u64, "Loop started");
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(loop_name = name, "Loop stopped");
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();
        let waiter = tokio::spawn(async move { observer.wait().await });
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        let joined = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(joined, Ok(Ok(()))));
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_periodic_loop_stops_on_signal() {
        let shutdown = Shutdown::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = shutdown.spawn_periodic("counter", Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown.trigger();
        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(joined, Ok(Ok(()))));
        assert!(ticks.load(Ordering::SeqCst) >= 1);
    }
}
