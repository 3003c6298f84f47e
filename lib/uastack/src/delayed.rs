//! MPSC queue of one-shot callbacks executed on the loop thread. Producers
//! on any thread enqueue through a `DelayedSender`; the loop checks the
//! queue out wholesale once per iteration. A shared pending counter lets the
//! loop detect work that arrived while it was draining, and removal works by
//! checking out the queue and re-enqueuing everything but the victim.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

pub type DelayedId = u64;

struct DelayedEntry<C> {
    id: DelayedId,
    callback: C,
}

/// Queue half owned by the event loop. Generic over the callback payload so
/// it can be exercised standalone.
pub struct DelayedQueue<C> {
    tx: Sender<DelayedEntry<C>>,
    rx: Receiver<DelayedEntry<C>>,
    pending: Arc<AtomicUsize>,
    ids: Arc<AtomicU64>,
}

/// Cloneable cross-thread handle for enqueueing.
pub struct DelayedSender<C> {
    tx: Sender<DelayedEntry<C>>,
    pending: Arc<AtomicUsize>,
    ids: Arc<AtomicU64>,
}

impl<C> Clone for DelayedSender<C> {
    fn clone(&self) -> DelayedSender<C> {
        DelayedSender {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
            ids: Arc::clone(&self.ids),
        }
    }
}

impl<C> DelayedSender<C> {
    /// Enqueues a callback and returns its id. Succeeds silently even if the
    /// loop is gone; the callback is then dropped.
    pub fn add(&self, callback: C) -> DelayedId {
        let id = self.ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(DelayedEntry { id, callback }).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        id
    }
}

impl<C> DelayedQueue<C> {
    pub fn new() -> DelayedQueue<C> {
        let (tx, rx) = channel();
        DelayedQueue {
            tx,
            rx,
            pending: Arc::new(AtomicUsize::new(0)),
            ids: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn sender(&self) -> DelayedSender<C> {
        DelayedSender {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
            ids: Arc::clone(&self.ids),
        }
    }

    pub fn add(&self, callback: C) -> DelayedId {
        self.sender().add(callback)
    }

    /// True if no callback is waiting. Callbacks enqueued concurrently may
    /// be missed by one iteration, which is fine: the producer ordering
    /// guarantee only covers entries enqueued before the check.
    pub fn is_empty(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    /// Checks out the queue. Entries enqueued while draining end up in the
    /// returned batch or in the next one, in producer order either way.
    pub fn drain(&mut self) -> Vec<C> {
        let mut batch = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            batch.push(entry.callback);
        }
        batch
    }

    /// Removes a pending callback by id: the queue is checked out and
    /// everything except the victim is re-enqueued. Loop-thread only.
    pub fn remove(&mut self, id: DelayedId) {
        let mut kept = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            if entry.id != id {
                kept.push(entry);
            }
        }
        for entry in kept {
            self.pending.fetch_add(1, Ordering::AcqRel);
            // send to ourselves cannot fail while rx is alive
            let _ = self.tx.send(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_single_producer() {
        let mut queue: DelayedQueue<u32> = DelayedQueue::new();
        queue.add(1);
        queue.add(2);
        queue.add(3);
        assert!(!queue.is_empty());
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut queue: DelayedQueue<u32> = DelayedQueue::new();
        queue.add(1);
        let id = queue.add(2);
        queue.add(3);
        queue.remove(id);
        assert_eq!(queue.drain(), vec![1, 3]);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let mut queue: DelayedQueue<u32> = DelayedQueue::new();
        queue.add(1);
        queue.remove(999);
        assert_eq!(queue.drain(), vec![1]);
    }

    #[test]
    fn test_cross_thread_every_callback_exactly_once() {
        let mut queue: DelayedQueue<(u32, u32)> = DelayedQueue::new();
        let producers: u32 = 4;
        let per_producer = 100u32;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let sender = queue.sender();
                thread::spawn(move || {
                    for i in 0..per_producer {
                        sender.add((p, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut drained = Vec::new();
        while !queue.is_empty() {
            drained.extend(queue.drain());
        }
        assert_eq!(drained.len(), (producers * per_producer) as usize);

        // per-producer enqueue order is preserved
        for p in 0..producers {
            let seen: Vec<u32> = drained.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            let expected: Vec<u32> = (0..per_producer).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn test_sender_survives_queue_drop() {
        let queue: DelayedQueue<u32> = DelayedQueue::new();
        let sender = queue.sender();
        drop(queue);
        // does not panic, silently drops the callback
        sender.add(5);
    }
}
