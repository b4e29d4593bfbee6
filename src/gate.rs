//! FIFO admission gate bounding simultaneous browser pages.
//!
//! `tokio::sync::Semaphore` would cover the counting part, but it does not
//! expose its waiter queue for diagnostics, so the gate keeps its own. All
//! state lives behind a std mutex; nothing awaits while holding it. A
//! released slot is handed to the oldest waiter before it ever returns to
//! the free pool, so arrival order is service order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::core::types::GateSnapshot;

struct GateState {
    available: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

pub struct PageGate {
    max: usize,
    state: Mutex<GateState>,
}

impl PageGate {
    pub fn new(max: usize) -> Arc<Self> {
        let max = max.max(1);
        Arc::new(Self {
            max,
            state: Mutex::new(GateState {
                available: max,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Suspends (without consuming a worker thread) until a slot is free.
    /// The returned permit releases its slot on drop.
    pub async fn acquire(self: &Arc<Self>) -> PagePermit {
        loop {
            let rx = {
                let mut st = self.state.lock().unwrap();
                if st.available > 0 {
                    st.available -= 1;
                    return PagePermit {
                        gate: Arc::clone(self),
                    };
                }
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                rx
            };
            if rx.await.is_ok() {
                return PagePermit {
                    gate: Arc::clone(self),
                };
            }
            // Sender dropped without handing over a slot; queue again.
        }
    }

    fn release(&self) {
        let mut st = self.state.lock().unwrap();
        // Skip waiters that gave up (dropped receivers) so their slot is
        // not lost.
        while let Some(tx) = st.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        st.available += 1;
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let st = self.state.lock().unwrap();
        GateSnapshot {
            available: st.available,
            pending: st.waiters.len(),
            max: self.max,
        }
    }
}

/// RAII slot handle; dropping it wakes the longest-waiting caller, if any.
pub struct PagePermit {
    gate: Arc<PageGate>,
}

impl Drop for PagePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let gate = PageGate::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.snapshot().available, 2);
        assert_eq!(gate.snapshot().pending, 0);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let gate = PageGate::new(1);
        let first = gate.acquire().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..4u32 {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = gate.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Give each waiter time to park before the next arrives.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(gate.snapshot().pending, 4);
        drop(first);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn snapshot_reports_configured_max() {
        let gate = PageGate::new(3);
        let s = gate.snapshot();
        assert_eq!((s.available, s.pending, s.max), (3, 0, 3));

        let p = gate.acquire().await;
        assert_eq!(gate.snapshot().available, 2);
        drop(p);
        assert_eq!(gate.snapshot().available, 3);
    }
}
