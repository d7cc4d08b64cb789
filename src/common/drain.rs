//! Server-stop signaling.
//!
//! One [`Signal`] is held by the listening handle; every connection task
//! carries a [`Watch`] and checks it between exchanges and while idle.

use tokio::sync::watch;

pub(crate) fn channel() -> (Signal, Watch) {
    let (tx, rx) = watch::channel(false);
    (Signal { tx }, Watch { rx })
}

pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub(crate) fn drain(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub(crate) struct Watch {
    rx: watch::Receiver<bool>,
}

impl Watch {
    pub(crate) fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the signal fires. A dropped, never-fired signal means
    /// this connection is not participating in coordinated shutdown; the
    /// future then stays pending.
    pub(crate) async fn signaled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_wakes_watchers() {
        let (signal, watch) = channel();
        let mut w1 = watch.clone();
        let mut w2 = watch;
        assert!(!w1.is_signaled());

        let waiter = tokio::spawn(async move { w1.signaled().await });
        signal.drain();
        waiter.await.unwrap();
        assert!(w2.is_signaled());
        w2.signaled().await; // already signaled, resolves immediately
    }

    #[tokio::test]
    async fn dropped_signal_keeps_pending() {
        let (signal, mut watch) = channel();
        drop(signal);
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            watch.signaled(),
        )
        .await;
        assert!(pending.is_err(), "unfired dropped signal must stay pending");
    }
}
