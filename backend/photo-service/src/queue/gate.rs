/// Bounded-concurrency gate for worker slots
///
/// Thin wrapper over a semaphore that also tracks the in-flight count
/// and its observed maximum, so the concurrency bound is a measurable
/// property rather than an article of faith.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
}

pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            high_water: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> GatePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed");

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(current, Ordering::SeqCst);

        GatePermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Wait until every outstanding permit has been returned.
    pub async fn drain(&self) {
        let _all = self
            .semaphore
            .clone()
            .acquire_many_owned(self.capacity as u32)
            .await
            .expect("gate semaphore is never closed");
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest in-flight count observed so far.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_burst_never_exceeds_capacity() {
        let gate = Arc::new(ConcurrencyGate::new(5));
        let mut handles = Vec::new();

        // 50-job burst against 5 slots
        for _ in 0..50 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let permit = gate.acquire().await;
                assert!(gate.in_flight() <= 5);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(gate.high_water() <= 5);
        assert!(gate.high_water() >= 1);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_outstanding_permits() {
        let gate = Arc::new(ConcurrencyGate::new(2));
        let permit = gate.acquire().await;

        let drain_gate = gate.clone();
        let drain = tokio::spawn(async move { drain_gate.drain().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());

        drop(permit);
        drain.await.unwrap();
    }
}
