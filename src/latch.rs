//! One-shot coordination primitives.
//!
//! The whole control plane composes out of `Latch` edges: a latch starts
//! un-fallen, falls exactly once, and every waiter past or future observes
//! the fall. Forwarding a latch into another builds a happens-before DAG
//! between lifecycle events (global shutdown into each container's close,
//! a container's failure into its own close) without shared mutable state.

use std::sync::Arc;

use tokio::sync::watch;

/// A monotonic one-shot flag with an awaitable edge.
///
/// Clones share the same underlying edge. `fall` is idempotent and safe from
/// any task; `wait` returns immediately once the latch has fallen.
#[derive(Clone, Debug)]
pub struct Latch {
    fallen: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { fallen: Arc::new(tx) }
    }

    /// Transition to fallen. Calling twice is indistinguishable from once.
    pub fn fall(&self) {
        self.fallen.send_replace(true);
    }

    /// Wait until the latch falls. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.fallen.subscribe();
        // The sender lives inside self, so wait_for cannot observe a closed
        // channel while we borrow it.
        let _ = rx.wait_for(|fallen| *fallen).await;
    }

    pub fn has_fallen(&self) -> bool {
        *self.fallen.borrow()
    }

    /// When `self` falls (now or later), `dst` falls too. The relay fires at
    /// most once, so accidental cycles cannot livelock.
    pub fn forward(&self, dst: &Latch) {
        let src = self.clone();
        let dst = dst.clone();
        tokio::spawn(async move {
            src.wait().await;
            dst.fall();
        });
    }

    /// Returns a guard that falls this latch when dropped. Used to guarantee
    /// a latch falls on every exit path of a function.
    pub fn fall_on_drop(&self) -> FallGuard {
        FallGuard(self.clone())
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Falls the wrapped latch when dropped.
pub struct FallGuard(Latch);

impl Drop for FallGuard {
    fn drop(&mut self) {
        self.0.fall();
    }
}

/// Counts outstanding activities (log streams, firewall-rule removals, kill
/// watchers) so that process exit can wait for all of them to finish.
///
/// Each activity holds a [`TaskGuard`]; `wait` resolves once every guard has
/// been dropped.
#[derive(Clone, Debug)]
pub struct TaskGroup {
    count: Arc<watch::Sender<usize>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    pub fn guard(&self) -> TaskGuard {
        self.count.send_modify(|c| *c += 1);
        TaskGuard(self.count.clone())
    }

    /// Wait until there are no outstanding guards.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|c| *c == 0).await;
    }

    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TaskGuard(Arc<watch::Sender<usize>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.send_modify(|c| *c -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_fall_returns_immediately() {
        let latch = Latch::new();
        latch.fall();
        // Must not block.
        tokio::time::timeout(Duration::from_millis(100), latch.wait())
            .await
            .expect("wait after fall should be instantaneous");
        assert!(latch.has_fallen());
    }

    #[tokio::test]
    async fn test_fall_is_idempotent() {
        let latch = Latch::new();
        latch.fall();
        latch.fall();
        assert!(latch.has_fallen());
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_wait_blocks_until_fall() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        latch.fall();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve once latch falls")
            .unwrap();
    }

    #[tokio::test]
    async fn test_forward_cascades() {
        let a = Latch::new();
        let b = Latch::new();
        a.forward(&b);
        a.fall();
        tokio::time::timeout(Duration::from_secs(1), b.wait())
            .await
            .expect("forward should fall destination");
    }

    #[tokio::test]
    async fn test_forward_after_fall() {
        let a = Latch::new();
        a.fall();
        let b = Latch::new();
        a.forward(&b);
        tokio::time::timeout(Duration::from_secs(1), b.wait())
            .await
            .expect("forward installed after fall should still relay");
    }

    #[tokio::test]
    async fn test_forward_cycle_does_not_hang() {
        let a = Latch::new();
        let b = Latch::new();
        a.forward(&b);
        b.forward(&a);
        a.fall();
        tokio::time::timeout(Duration::from_secs(1), async {
            a.wait().await;
            b.wait().await;
        })
        .await
        .expect("cyclic forwards must not deadlock");
    }

    #[tokio::test]
    async fn test_fall_guard() {
        let latch = Latch::new();
        {
            let _guard = latch.fall_on_drop();
            assert!(!latch.has_fallen());
        }
        assert!(latch.has_fallen());
    }

    #[tokio::test]
    async fn test_task_group_waits_for_guards() {
        let group = TaskGroup::new();
        let guard = group.guard();
        assert_eq!(group.outstanding(), 1);

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve once all guards drop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_task_group_empty_wait() {
        let group = TaskGroup::new();
        tokio::time::timeout(Duration::from_millis(100), group.wait())
            .await
            .expect("wait with no guards should return immediately");
    }
}
