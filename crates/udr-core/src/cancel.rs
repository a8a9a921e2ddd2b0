//! Cooperative cancellation observed between files and between reports.

use tokio::sync::watch;

/// Trips every [`CancelToken`] cloned from the same pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token nobody can trip.
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; never resolves when the handle is gone untripped.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
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
    async fn cancel_reaches_every_clone() {
        let (handle, token) = cancel_pair();
        let mut waiter = token.clone();
        assert!(!token.is_cancelled());
        let task = tokio::spawn(async move { waiter.cancelled().await });
        handle.cancel();
        task.await.expect("join");
        assert!(token.is_cancelled());
        assert!(handle.token().is_cancelled());
        assert!(!CancelToken::never().is_cancelled());
    }
}
