//! Pending receipt tracking.
//!
//! Every receipted frame registers a waiter under a fresh id. The dispatcher
//! resolves the waiter when the matching RECEIPT arrives; connection
//! teardown resolves all remaining waiters with the terminating error.
//! Removal from the map is the resolution point, so the first of
//! {receipt, timeout, teardown} wins and later ones are no-ops.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::ConnError;

pub(crate) type ReceiptResult = Result<(), ConnError>;

#[derive(Debug, Default)]
struct Pending {
    next_id: u64,
    waiters: HashMap<String, oneshot::Sender<ReceiptResult>>,
    // set once the connection is gone; later registrations fail with it
    closed: Option<ConnError>,
}

/// The caller's half of a registered receipt.
#[derive(Debug)]
pub(crate) struct ReceiptWaiter {
    id: String,
    rx: oneshot::Receiver<ReceiptResult>,
}

impl ReceiptWaiter {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReceiptRegistry {
    inner: Mutex<Pending>,
}

impl ReceiptRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(pending: &mut Pending) -> String {
        let id = format!("rcpt-{}", pending.next_id);
        pending.next_id += 1;
        id
    }

    /// Reserve a receipt id without tracking it. A RECEIPT for it is
    /// dropped as unknown.
    pub(crate) fn allocate_id(&self) -> String {
        Self::next_id(&mut self.lock())
    }

    /// Register a waiter under a fresh id.
    pub(crate) fn register(&self) -> Result<ReceiptWaiter, ConnError> {
        let mut pending = self.lock();
        if let Some(err) = &pending.closed {
            return Err(err.clone());
        }
        let id = Self::next_id(&mut pending);
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(id.clone(), tx);
        Ok(ReceiptWaiter { id, rx })
    }

    /// Complete the waiter for `id`. Returns `false` if no waiter was
    /// pending under that id.
    pub(crate) fn resolve(&self, id: &str, result: ReceiptResult) -> bool {
        let Some(tx) = self.lock().waiters.remove(id) else {
            return false;
        };
        // the caller may have stopped waiting; the entry is gone either way
        let _ = tx.send(result);
        true
    }

    /// Stop tracking `id` without completing it.
    pub(crate) fn forget(&self, id: &str) -> bool {
        self.lock().waiters.remove(id).is_some()
    }

    /// Fail every pending waiter with `err` and refuse new registrations.
    pub(crate) fn resolve_all(&self, err: ConnError) {
        let drained: Vec<_> = {
            let mut pending = self.lock();
            pending.closed.get_or_insert_with(|| err.clone());
            pending.waiters.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), error = %err, "failing pending receipts");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Wait for the receipt, optionally bounded by `timeout`.
    ///
    /// On timeout the entry is removed and `on_timeout(id)` is returned. If
    /// the receipt was resolved concurrently with the timer, the resolution
    /// wins.
    pub(crate) async fn wait(
        &self,
        mut waiter: ReceiptWaiter,
        timeout: Option<Duration>,
        on_timeout: impl FnOnce(String) -> ConnError,
    ) -> ReceiptResult {
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut waiter.rx).await,
            None => Ok((&mut waiter.rx).await),
        };
        match outcome {
            Ok(Ok(result)) => result,
            // sender dropped without a result: the registry went away
            Ok(Err(_)) => Err(ConnError::Closed),
            Err(_elapsed) => self.expire(waiter, on_timeout),
        }
    }

    /// Settle a waiter whose deadline passed. A resolution that slipped in
    /// after the timer fired still wins.
    fn expire(
        &self,
        mut waiter: ReceiptWaiter,
        on_timeout: impl FnOnce(String) -> ConnError,
    ) -> ReceiptResult {
        if self.forget(&waiter.id) {
            tracing::debug!(receipt = %waiter.id, "receipt wait timed out");
            return Err(on_timeout(waiter.id));
        }
        match waiter.rx.try_recv() {
            Ok(result) => result,
            Err(_) => Err(on_timeout(waiter.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn receipt_timeout(id: String) -> ConnError {
        ConnError::ReceiptTimeout(id)
    }

    #[test]
    fn ids_are_unique_and_sequential() {
        let reg = ReceiptRegistry::new();
        let a = reg.register().unwrap();
        let b = reg.register().unwrap();
        let c = reg.allocate_id();
        assert_eq!(a.id(), "rcpt-0");
        assert_eq!(b.id(), "rcpt-1");
        assert_eq!(c, "rcpt-2");
        assert_eq!(reg.pending(), 2);
    }

    #[tokio::test]
    async fn resolve_completes_waiter_once() {
        let reg = ReceiptRegistry::new();
        let waiter = reg.register().unwrap();
        let id = waiter.id().to_string();
        assert!(reg.resolve(&id, Ok(())));
        assert!(!reg.resolve(&id, Ok(())));
        assert!(reg.wait(waiter, None, receipt_timeout).await.is_ok());
        assert_eq!(reg.pending(), 0);
    }

    #[tokio::test]
    async fn unknown_receipt_is_ignored() {
        let reg = ReceiptRegistry::new();
        assert!(!reg.resolve("rcpt-99", Ok(())));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let reg = ReceiptRegistry::new();
        let waiter = reg.register().unwrap();
        let id = waiter.id().to_string();
        let err = reg
            .wait(waiter, Some(Duration::from_millis(100)), receipt_timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::ReceiptTimeout(ref r) if *r == id));
        assert_eq!(reg.pending(), 0);
        // late receipt finds nothing
        assert!(!reg.resolve(&id, Ok(())));
    }

    #[test]
    fn resolution_before_expiry_wins() {
        let reg = ReceiptRegistry::new();
        let waiter = reg.register().unwrap();
        let id = waiter.id().to_string();
        // the RECEIPT lands between the timer firing and the entry removal
        assert!(reg.resolve(&id, Ok(())));
        assert!(reg.expire(waiter, receipt_timeout).is_ok());
        assert_eq!(reg.pending(), 0);

        let waiter = reg.register().unwrap();
        reg.resolve_all(ConnError::Closed);
        assert!(matches!(reg.expire(waiter, receipt_timeout), Err(ConnError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_at_the_deadline_resolves_exactly_once() {
        let reg = Arc::new(ReceiptRegistry::new());
        let limit = Duration::from_millis(100);
        let waiter = reg.register().unwrap();
        let id = waiter.id().to_string();

        let r = reg.clone();
        let receipt = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            r.resolve(&id, Ok(()))
        });
        let outcome = reg.wait(waiter, Some(limit), receipt_timeout).await;
        let delivered = receipt.await.unwrap();

        match outcome {
            Ok(()) => assert!(delivered),
            Err(ConnError::ReceiptTimeout(_)) => assert!(!delivered),
            Err(other) => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(reg.pending(), 0);
    }

    #[tokio::test]
    async fn resolve_all_fails_every_waiter_and_later_registrations() {
        let reg = Arc::new(ReceiptRegistry::new());
        let w1 = reg.register().unwrap();
        let w2 = reg.register().unwrap();

        let r = reg.clone();
        let t1 = tokio::spawn(async move { r.wait(w1, None, receipt_timeout).await });
        let r = reg.clone();
        let t2 = tokio::spawn(async move { r.wait(w2, None, receipt_timeout).await });

        reg.resolve_all(ConnError::Protocol("boom".into()));

        for t in [t1, t2] {
            let err = t.await.unwrap().unwrap_err();
            assert!(matches!(err, ConnError::Protocol(ref m) if m == "boom"));
        }
        assert!(matches!(reg.register(), Err(ConnError::Protocol(_))));
    }
}
