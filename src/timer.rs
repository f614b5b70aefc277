//! Connection idle timers.
//!
//! Indexed binary min-heap keyed by deadline. An id to heap-position map
//! is kept in lockstep with every swap, so any live timer can be deleted
//! or re-deadlined in O(log n). The heap is owned by the event loop
//! thread and eviction callbacks run there, from `tick`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

type EvictionCallback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: usize,
    expires: Instant,
    callback: EvictionCallback,
}

/// Min-heap of eviction deadlines with O(log n) removal by id.
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    pos: HashMap<usize, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            pos: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Schedule `callback` to fire `timeout` from now.
    ///
    /// # Panics
    /// Panics if `id` already has a live timer.
    pub fn add(&mut self, id: usize, timeout: Duration, callback: impl FnOnce() + Send + 'static) {
        assert!(
            !self.pos.contains_key(&id),
            "timer id {id} already scheduled"
        );
        let index = self.heap.len();
        self.pos.insert(id, index);
        self.heap.push(TimerNode {
            id,
            expires: Instant::now() + timeout,
            callback: Box::new(callback),
        });
        self.sift_up(index);
    }

    /// Push `id`'s deadline out to `timeout` from now.
    ///
    /// Deadlines only ever move later here, so heap order is restored
    /// with a sift-down from the node's current position.
    ///
    /// # Panics
    /// Panics if `id` has no live timer.
    pub fn adjust(&mut self, id: usize, timeout: Duration) {
        let index = self.pos[&id];
        self.heap[index].expires = Instant::now() + timeout;
        self.sift_down(index, self.heap.len());
    }

    /// Drop `id`'s timer and run its callback immediately, due or not.
    ///
    /// # Panics
    /// Panics if `id` has no live timer.
    pub fn fire(&mut self, id: usize) {
        let index = self.pos[&id];
        let node = self.remove(index);
        (node.callback)();
    }

    /// Run the callback of every timer whose deadline has passed.
    pub fn tick(&mut self) {
        while let Some(front) = self.heap.first() {
            if front.expires > Instant::now() {
                break;
            }
            let node = self.remove(0);
            (node.callback)();
        }
    }

    /// Run `tick`, then return milliseconds until the next deadline.
    ///
    /// Returns 0 when nothing is scheduled.
    pub fn next_tick(&mut self) -> u64 {
        self.tick();
        match self.heap.first() {
            Some(node) => node
                .expires
                .saturating_duration_since(Instant::now())
                .as_millis() as u64,
            None => 0,
        }
    }

    /// Drop `id`'s timer without firing it.
    ///
    /// Returns false when no timer with that id is live.
    pub fn cancel(&mut self, id: usize) -> bool {
        match self.pos.get(&id).copied() {
            Some(index) => {
                self.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop the earliest timer without firing it.
    ///
    /// # Panics
    /// Panics if the heap is empty.
    pub fn pop(&mut self) {
        assert!(!self.heap.is_empty(), "pop from empty timer heap");
        self.remove(0);
    }

    /// Drop every timer without firing any callback.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.pos.clear();
    }

    /// Remove the node at `index` and restore heap order around the hole.
    fn remove(&mut self, index: usize) -> TimerNode {
        debug_assert!(index < self.heap.len());
        let last = self.heap.len() - 1;
        if index != last {
            self.swap_nodes(index, last);
        }
        let node = self.heap.pop().unwrap();
        self.pos.remove(&node.id);
        if index < self.heap.len() && !self.sift_down(index, self.heap.len()) {
            self.sift_up(index);
        }
        node
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.pos.insert(self.heap[i].id, i);
        self.pos.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(parent, i);
            i = parent;
        }
    }

    /// Returns true when the node actually moved.
    fn sift_down(&mut self, start: usize, end: usize) -> bool {
        let mut i = start;
        let mut child = i * 2 + 1;
        while child < end {
            if child + 1 < end && self.heap[child].expires > self.heap[child + 1].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > start
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn assert_heap_consistent(timer: &TimerHeap) {
        assert_eq!(timer.pos.len(), timer.heap.len());
        for (i, node) in timer.heap.iter().enumerate() {
            assert_eq!(
                timer.pos[&node.id], i,
                "position map out of sync for id {}",
                node.id
            );
            let left = i * 2 + 1;
            let right = i * 2 + 2;
            if left < timer.heap.len() {
                assert!(node.expires <= timer.heap[left].expires);
            }
            if right < timer.heap.len() {
                assert!(node.expires <= timer.heap[right].expires);
            }
        }
    }

    #[test]
    fn test_heap_order_across_operations() {
        let mut timer = TimerHeap::new();
        for (id, ms) in [(1, 500), (2, 90), (3, 700), (4, 50), (5, 300), (6, 120)] {
            timer.add(id, Duration::from_millis(ms), || {});
            assert_heap_consistent(&timer);
        }

        timer.adjust(4, Duration::from_millis(900));
        assert_heap_consistent(&timer);

        timer.fire(3);
        assert_heap_consistent(&timer);
        assert_eq!(timer.len(), 5);

        timer.pop();
        assert_heap_consistent(&timer);
        assert_eq!(timer.len(), 4);

        timer.clear();
        assert!(timer.is_empty());
        assert_heap_consistent(&timer);
    }

    #[test]
    fn test_tick_fires_only_due_timers() {
        let mut timer = TimerHeap::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (id, ms) in [(1, 10_000), (2, 25), (3, 20_000)] {
            let log = Arc::clone(&fired);
            timer.add(id, Duration::from_millis(ms), move || {
                log.lock().unwrap().push(id)
            });
        }

        thread::sleep(Duration::from_millis(100));
        timer.tick();

        assert_eq!(*fired.lock().unwrap(), vec![2]);
        assert_eq!(timer.len(), 2);
        assert_heap_consistent(&timer);
    }

    #[test]
    fn test_fire_runs_callback_and_removes() {
        let mut timer = TimerHeap::new();
        let count = Arc::new(AtomicUsize::new(0));
        for id in [1, 2, 3] {
            let count = Arc::clone(&count);
            timer.add(id, Duration::from_secs(60), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        timer.fire(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(timer.len(), 2);
        assert_heap_consistent(&timer);

        // the survivors were not fired
        timer.clear();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_removes_without_firing() {
        let mut timer = TimerHeap::new();
        let count = Arc::new(AtomicUsize::new(0));
        for id in [1, 2, 3] {
            let count = Arc::clone(&count);
            timer.add(id, Duration::from_secs(60), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(timer.cancel(2));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.len(), 2);
        assert_heap_consistent(&timer);

        assert!(!timer.cancel(2));
        assert!(!timer.cancel(99));
    }

    #[test]
    fn test_next_tick_zero_when_empty_and_bounded_otherwise() {
        let mut timer = TimerHeap::new();
        assert_eq!(timer.next_tick(), 0);

        timer.add(1, Duration::from_secs(5), || {});
        let ms = timer.next_tick();
        assert!(ms > 0 && ms <= 5_000);
    }

    #[test]
    fn test_next_tick_fires_due_callbacks_first() {
        let mut timer = TimerHeap::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timer.add(1, Duration::from_millis(0), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.next_tick(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_add_duplicate_id_panics() {
        let mut timer = TimerHeap::new();
        timer.add(7, Duration::from_secs(1), || {});
        timer.add(7, Duration::from_secs(2), || {});
    }

    #[test]
    #[should_panic]
    fn test_adjust_missing_id_panics() {
        let mut timer = TimerHeap::new();
        timer.add(1, Duration::from_secs(1), || {});
        timer.adjust(2, Duration::from_secs(1));
    }
}
