//! One-shot readiness latch.
//!
//! The OVN Southbound handle is initialized late, after the optional
//! privilege-separation fork. Accessors must block until `start()` has
//! populated the handle instead of observing a null value, so the handle
//! is published through this latch.

use tokio::sync::watch;

/// A value that is set once and awaited by any number of readers.
#[derive(Debug)]
pub struct Latch<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Latch<T> {
    /// Creates an empty latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Publishes the value. Later calls overwrite the published value;
    /// in practice the driver sets the latch exactly once in `start()`.
    pub fn set(&self, value: T) {
        // send only fails with no receivers; the latch keeps the state
        // in the channel itself, so that is fine.
        let _ = self.tx.send(Some(value));
    }

    /// Returns the value if already published.
    pub fn try_get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Waits until the value is published.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives as long as `self`, so this cannot close
            // while we are borrowing the latch.
            let _ = rx.changed().await;
        }
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_then_wait() {
        let latch = Latch::new();
        latch.set(7u32);
        assert_eq!(latch.wait().await, 7);
        assert_eq!(latch.try_get(), Some(7));
    }

    #[tokio::test]
    async fn test_wait_blocks_until_set() {
        let latch = Arc::new(Latch::new());
        assert_eq!(latch.try_get(), None);

        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.set("ready".to_string());

        assert_eq!(waiter.await.unwrap(), "ready");
    }
}
