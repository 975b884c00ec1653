//! Deferred destruction of GPU objects.
//!
//! A [`CleanupQueue`] holds teardown actions and runs them in reverse
//! registration order when flushed, so an object registered after the
//! objects it depends on is destroyed before them.
//!
//! Two scopes exist: the session queue owned by
//! [`RenderContext`](crate::context::RenderContext), flushed once after the
//! device is idle, and one queue per frame slot, flushed when the slot's
//! fence proves the GPU is done with that frame.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use kiln_renderer::cleanup::CleanupQueue;
//!
//! let order = Arc::new(Mutex::new(Vec::new()));
//! let mut queue = CleanupQueue::new();
//! for i in 1..=3 {
//!     let order = order.clone();
//!     queue.push(move || order.lock().unwrap().push(i));
//! }
//!
//! queue.flush();
//! assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
//! ```

use tracing::{debug, warn};

type Action = Box<dyn FnOnce() + Send>;

/// LIFO queue of teardown actions.
#[derive(Default)]
pub struct CleanupQueue {
    actions: Vec<Action>,
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action to run on the next [`flush`](Self::flush).
    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions.push(Box::new(action));
    }

    /// Takes ownership of `resource` and drops it on the next flush.
    pub fn defer_drop<T>(&mut self, resource: T)
    where
        T: Send + 'static,
    {
        self.push(move || drop(resource));
    }

    /// Runs every pending action, newest first.
    pub fn flush(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        let count = self.actions.len();
        while let Some(action) = self.actions.pop() {
            action();
        }
        debug!("Flushed {} cleanup action(s)", count);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Debug for CleanupQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupQueue")
            .field("pending", &self.actions.len())
            .finish()
    }
}

impl Drop for CleanupQueue {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(
                "Cleanup queue dropped with {} pending action(s); flushing",
                self.actions.len()
            );
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_flush_runs_newest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut queue = CleanupQueue::new();
        for name in ["pool", "layout", "pipeline"] {
            let order = order.clone();
            queue.push(move || order.lock().unwrap().push(name));
        }

        queue.flush();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["pipeline", "layout", "pool"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_second_flush_is_noop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut queue = CleanupQueue::new();
        let counter = runs.clone();
        queue.push(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue.flush();
        queue.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_defer_drop_owns_resource() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = CleanupQueue::new();
        queue.defer_drop(Tracked(drops.clone()));
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);

        queue.flush();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_flushes_pending_actions() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let mut queue = CleanupQueue::new();
            let counter = runs.clone();
            queue.push(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_is_reusable_after_flush() {
        let mut queue = CleanupQueue::new();
        queue.push(|| {});
        queue.flush();
        queue.push(|| {});
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cleanup_queue_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CleanupQueue>();
    }
}
