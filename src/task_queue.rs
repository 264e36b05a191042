//! Thread-safe FIFO task queue that assigns ids and drains on close.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::types::TaskId;

/// A synchronized FIFO queue of `(TaskId, J)` pairs.
///
/// The queue starts closed; `open` lets producers push. Ids are assigned
/// under the queue lock, so id order always equals queue order.
pub struct TaskQueue<J> {
    inner: Mutex<TaskQueueState<J>>,
    available: Condvar,
}

struct TaskQueueState<J> {
    queue: VecDeque<(TaskId, J)>,
    next_id: TaskId,
    open: bool,
}

impl<J> TaskQueue<J> {
    /// Create an empty, closed task queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TaskQueueState {
                queue: VecDeque::new(),
                next_id: 0,
                open: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Start accepting pushes.
    pub fn open(&self) {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.open = true;
    }

    /// Push a job, returning its assigned id; returns the job back if closed.
    pub fn push(&self, job: J) -> Result<TaskId, J> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        if !guard.open {
            return Err(job);
        }
        let id = guard.next_id;
        guard.next_id += 1;
        guard.queue.push_back((id, job));
        self.available.notify_one();
        Ok(id)
    }

    /// Try to pop immediately without blocking.
    pub fn try_pop(&self) -> Option<(TaskId, J)> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.queue.pop_front()
    }

    /// Block until a job is available, or the queue is closed and empty.
    ///
    /// Jobs pushed before `close` are still handed out after it.
    pub fn pop_blocking_or_closed(&self) -> Option<(TaskId, J)> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        loop {
            if let Some(entry) = guard.queue.pop_front() {
                return Some(entry);
            }
            if !guard.open {
                return None;
            }
            // Wait releases the lock and re-acquires it before returning.
            guard = self.available.wait(guard).expect("condvar wait failed");
        }
    }

    /// Close the queue and wake all blocked consumers.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.open = false;
        self.available.notify_all();
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> TaskId {
        let guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.next_id
    }

    /// Current number of queued jobs.
    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.queue.len()
    }
}

impl<J> Default for TaskQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn open_queue() -> TaskQueue<&'static str> {
        let queue = TaskQueue::new();
        queue.open();
        queue
    }

    #[test]
    fn push_rejected_until_opened() {
        let queue: TaskQueue<&str> = TaskQueue::new();
        assert_eq!(queue.push("early"), Err("early"));
        queue.open();
        assert_eq!(queue.push("late"), Ok(0));
    }

    #[test]
    fn ids_follow_queue_order_across_producers() {
        let queue = Arc::new(TaskQueue::new());
        queue.open();
        let producers = 4;
        let per_producer = 250;
        let barrier = Arc::new(Barrier::new(producers));

        let mut handles = Vec::new();
        for _ in 0..producers {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_producer {
                    queue.push(()).expect("task queue closed");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("producer thread panicked");
        }

        assert_eq!(queue.issued(), (producers * per_producer) as u64);
        let mut expected = 0;
        while let Some((id, ())) = queue.try_pop() {
            // Popped ids must be strictly sequential.
            assert_eq!(id, expected);
            expected += 1;
        }
        assert_eq!(expected, (producers * per_producer) as u64);
    }

    #[test]
    fn blocked_consumer_receives_pushes_with_sequential_ids() {
        let queue = Arc::new(open_queue());
        let (received_tx, received_rx) = mpsc::channel();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                while let Some(entry) = queue.pop_blocking_or_closed() {
                    received_tx.send(entry).expect("send entry");
                }
            })
        };

        // The consumer is idle-waiting on an empty queue; each push wakes it.
        for (expected_id, job) in ["first", "second", "third"].into_iter().enumerate() {
            assert_eq!(queue.push(job), Ok(expected_id as TaskId));
            let entry = received_rx
                .recv_timeout(Duration::from_secs(1))
                .expect("consumer woke");
            assert_eq!(entry, (expected_id as TaskId, job));
        }

        queue.close();
        consumer.join().expect("consumer thread panicked");
        assert_eq!(queue.issued(), 3);
    }

    #[test]
    fn close_drains_queued_jobs_before_reporting_closed() {
        let queue = open_queue();
        queue.push("a").expect("task queue closed");
        queue.push("b").expect("task queue closed");
        queue.close();

        assert!(queue.push("c").is_err());
        assert_eq!(queue.pop_blocking_or_closed(), Some((0, "a")));
        assert_eq!(queue.pop_blocking_or_closed(), Some((1, "b")));
        assert_eq!(queue.pop_blocking_or_closed(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn close_releases_idle_consumer_after_backlog() {
        let queue = Arc::new(open_queue());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                ready_tx.send(()).expect("ready");
                let mut drained = Vec::new();
                while let Some((id, _)) = queue.pop_blocking_or_closed() {
                    drained.push(id);
                }
                done_tx.send(drained).expect("done");
            })
        };

        ready_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("ready");
        queue.push("late-a").expect("task queue closed");
        queue.push("late-b").expect("task queue closed");
        queue.close();
        assert!(queue.push("rejected").is_err());

        // Everything pushed before close is handed out, then the consumer exits.
        let drained = done_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("done recv");
        assert_eq!(drained, vec![0, 1]);
        // A rejected push does not consume an id.
        assert_eq!(queue.issued(), 2);
        consumer.join().expect("consumer thread panicked");
    }

    #[test]
    fn each_job_popped_once() {
        let queue = Arc::new(TaskQueue::new());
        queue.open();
        for n in 0..100u32 {
            queue.push(n).expect("task queue closed");
        }
        queue.close();

        let consumers = 4;
        let barrier = Arc::new(Barrier::new(consumers));
        let (seen_tx, seen_rx) = mpsc::channel();
        let mut handles = Vec::new();
        for _ in 0..consumers {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            let seen_tx = seen_tx.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                while let Some((id, _)) = queue.pop_blocking_or_closed() {
                    seen_tx.send(id).expect("send id");
                }
            }));
        }
        drop(seen_tx);
        for handle in handles {
            handle.join().expect("consumer thread panicked");
        }

        let mut seen = HashSet::new();
        for id in seen_rx {
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 100);
    }
}
