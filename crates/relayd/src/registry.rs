// ABOUTME: PID registry: relays that completed their handshake but are not yet claimed by a spawn.
// ABOUTME: The listener puts entries; spawners claim them, woken by notification instead of polling.

use crate::relay::Relay;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Default)]
pub struct PidRegistry {
    relays: Mutex<HashMap<i64, Relay>>,
    published: Notify,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn relays(&self) -> MutexGuard<'_, HashMap<i64, Relay>> {
        // Every critical section is a single map operation, so a poisoned map is still consistent.
        self.relays.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish the relay for `pid` and wake every waiting claimant.
    pub fn put(&self, pid: i64, relay: Relay) {
        let replaced = self.relays().insert(pid, relay);
        if replaced.is_some() {
            tracing::warn!(pid, "Replaced unclaimed relay for pid");
        }
        self.published.notify_waiters();
    }

    pub fn get(&self, pid: i64) -> Option<Relay> {
        self.relays().get(&pid).cloned()
    }

    pub fn remove(&self, pid: i64) -> Option<Relay> {
        self.relays().remove(&pid)
    }

    pub fn contains(&self, pid: i64) -> bool {
        self.relays().contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.relays().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays().is_empty()
    }

    /// Remove and return every unclaimed relay.
    pub fn drain(&self) -> Vec<(i64, Relay)> {
        self.relays().drain().collect()
    }

    /// Wait until a relay for `pid` is published, then remove and return it.
    ///
    /// Never completes on its own if no worker connects; callers bound it with a
    /// timeout or cancellation. Cancel-safe: the entry is only removed in the same
    /// poll that returns it.
    pub async fn claim(&self, pid: i64) -> Relay {
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            // Register before checking so a put between the check and the await still wakes us.
            notified.as_mut().enable();

            if let Some(relay) = self.remove(pid) {
                return relay;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::Frame;
    use std::sync::Arc;
    use std::time::Duration;

    fn relay() -> (Relay, Relay) {
        let (a, b) = tokio::io::duplex(1024);
        (Relay::new(a), Relay::new(b))
    }

    #[test]
    fn test_put_get_remove() {
        let registry = PidRegistry::new();
        let (host, _worker) = relay();

        assert!(registry.is_empty());
        registry.put(10, host);
        assert!(registry.contains(10));
        assert!(registry.get(10).is_some());
        assert_eq!(registry.len(), 1, "get must not remove the entry");

        assert!(registry.remove(10).is_some());
        assert!(registry.remove(10).is_none());
        assert!(registry.get(10).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let registry = PidRegistry::new();
        let (first, _w1) = relay();
        let (second, _w2) = relay();
        registry.put(10, first);
        registry.put(10, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain() {
        let registry = PidRegistry::new();
        let (a, _wa) = relay();
        let (b, _wb) = relay();
        registry.put(1, a);
        registry.put(2, b);

        let mut drained: Vec<i64> = registry.drain().into_iter().map(|(pid, _)| pid).collect();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_claim_existing_entry() {
        let registry = PidRegistry::new();
        let (host, _worker) = relay();
        registry.put(5, host);

        let claimed = tokio::time::timeout(Duration::from_millis(100), registry.claim(5)).await;
        assert!(claimed.is_ok());
        assert!(!registry.contains(5));
    }

    #[tokio::test]
    async fn test_claim_wakes_on_put() {
        let registry = Arc::new(PidRegistry::new());
        let (host, worker) = relay();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.claim(77).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        registry.put(77, host);

        let claimed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("claim should wake up")
            .unwrap();
        assert!(registry.is_empty());

        worker.send(&Frame::Stop).await.unwrap();
        assert_eq!(claimed.receive().await.unwrap(), Some(Frame::Stop));
    }

    #[tokio::test]
    async fn test_claim_ignores_other_pids() {
        let registry = Arc::new(PidRegistry::new());
        let (other, _w) = relay();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.claim(1).await })
        };
        registry.put(2, other);

        let result = tokio::time::timeout(Duration::from_millis(50), waiter).await;
        assert!(result.is_err(), "claim for pid 1 must not take pid 2's relay");
        assert!(registry.contains(2));
    }

    #[tokio::test]
    async fn test_concurrent_claims_match_by_pid() {
        let registry = Arc::new(PidRegistry::new());
        let mut waiters = Vec::new();
        for pid in 1..=8 {
            let registry = registry.clone();
            waiters.push(tokio::spawn(async move { (pid, registry.claim(pid).await) }));
        }

        let mut workers = Vec::new();
        for pid in (1..=8).rev() {
            let (host, worker) = relay();
            registry.put(pid, host);
            workers.push((pid, worker));
        }

        for (pid, worker) in &workers {
            worker
                .send(&Frame::Pid { pid: *pid })
                .await
                .unwrap();
        }

        for waiter in waiters {
            let (pid, relay) = waiter.await.unwrap();
            assert_eq!(relay.receive().await.unwrap(), Some(Frame::Pid { pid }));
        }
        assert!(registry.is_empty());
    }
}
