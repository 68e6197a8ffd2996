//! Single-worker task plumbing.
//!
//! Both halves of the core serialize their background work through a
//! FIFO drained by one worker thread. A test-and-set gate keeps at
//! most one worker alive per service and lets callers observe an
//! in-progress run without blocking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// FIFO of pending tasks.
pub struct TaskQueue<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, task: T) {
        self.inner.lock().unwrap().push_back(task);
    }

    /// Fold `task` into a pending entry accepted by `matches`, or
    /// append it. Used to coalesce repeated refreshes of the same
    /// kind while a worker is still busy.
    pub fn push_or_merge(
        &self,
        task: T,
        matches: impl Fn(&T) -> bool,
        merge: impl FnOnce(&mut T, T),
    ) {
        let mut queue = self.inner.lock().unwrap();
        if let Some(pending) = queue.iter_mut().find(|t| matches(t)) {
            merge(pending, task);
        } else {
            queue.push_back(task);
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Test-and-set gate guarding a single worker.
#[derive(Debug, Default)]
pub struct WorkerGate {
    running: AtomicBool,
}

impl WorkerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate. Returns false when a worker already holds it.
    pub fn try_acquire(&self) -> bool {
        !self.running.swap(true, Ordering::AcqRel)
    }

    pub fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = TaskQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_coalesce_same_kind() {
        let q: TaskQueue<(u8, Vec<&str>)> = TaskQueue::new();
        q.push_or_merge((1, vec!["a"]), |t| t.0 == 1, |p, t| p.1.extend(t.1));
        q.push_or_merge((1, vec!["b"]), |t| t.0 == 1, |p, t| p.1.extend(t.1));
        q.push_or_merge((2, vec!["c"]), |t| t.0 == 2, |p, t| p.1.extend(t.1));

        assert_eq!(q.pop(), Some((1, vec!["a", "b"])));
        assert_eq!(q.pop(), Some((2, vec!["c"])));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_gate_is_exclusive() {
        let gate = WorkerGate::new();
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert!(gate.is_running());
        gate.release();
        assert!(gate.try_acquire());
    }
}
