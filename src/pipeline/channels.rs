//! Task and result queues shared by the pipeline stages.

use crate::core::error::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Shared wall-clock deadline for a run.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// An unbounded multi-producer multi-consumer queue.
///
/// Holding both ends keeps the channel connected for the whole run, so
/// consumers stop on the deadline rather than on disconnection.
pub struct Queue<T> {
    name: &'static str,
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> Queue<T> {
    pub fn unbounded(name: &'static str) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            name,
            sender,
            receiver,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of queued items.
    pub fn depth(&self) -> usize {
        self.receiver.len()
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.sender
            .send(item)
            .map_err(|_| Error::channel_send(self.name))
    }

    /// Blocking take bounded by `poll_interval` and the deadline.
    pub fn take(&self, deadline: &Deadline, poll_interval: Duration) -> Take<T> {
        if deadline.expired() {
            return Take::Expired;
        }
        match self.receiver.recv_timeout(poll_interval.min(deadline.remaining())) {
            Ok(item) => Take::Item(item),
            Err(RecvTimeoutError::Timeout) if deadline.expired() => Take::Expired,
            Err(RecvTimeoutError::Timeout) => Take::Empty,
            Err(RecvTimeoutError::Disconnected) => Take::Closed,
        }
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// Result of a bounded take.
#[derive(Debug, PartialEq, Eq)]
pub enum Take<T> {
    Item(T),
    /// Nothing arrived within the poll interval
    Empty,
    /// The deadline has passed
    Expired,
    /// Every sender is gone
    Closed,
}

/// A task queue together with the queue its consumers report to.
pub struct ChannelPair<T, R> {
    pub tasks: Queue<T>,
    pub results: Queue<R>,
}

impl<T, R> Clone for ChannelPair<T, R> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            results: self.results.clone(),
        }
    }
}

impl<T, R> ChannelPair<T, R> {
    pub fn unbounded(tasks: &'static str, results: &'static str) -> Self {
        Self {
            tasks: Queue::unbounded(tasks),
            results: Queue::unbounded(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline() {
        let past = Deadline::after(Duration::ZERO);
        assert!(past.expired());
        assert_eq!(past.remaining(), Duration::ZERO);

        let future = Deadline::after(Duration::from_secs(60));
        assert!(!future.expired());
        assert!(future.remaining() > Duration::from_secs(50));
    }

    #[test]
    fn test_queue_depth_and_take() {
        let queue: Queue<u32> = Queue::unbounded("numbers");
        let deadline = Deadline::after(Duration::from_secs(60));

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.depth(), 2);

        assert_eq!(queue.take(&deadline, Duration::from_millis(10)), Take::Item(1));
        assert_eq!(queue.try_take(), Some(2));
        assert_eq!(queue.take(&deadline, Duration::from_millis(10)), Take::Empty);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_take_after_deadline() {
        let queue: Queue<u32> = Queue::unbounded("numbers");
        queue.push(7).unwrap();

        let deadline = Deadline::after(Duration::ZERO);
        assert_eq!(queue.take(&deadline, Duration::from_millis(10)), Take::Expired);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_clones_share_items() {
        let pair: ChannelPair<u32, String> = ChannelPair::unbounded("tasks", "results");
        let other = pair.clone();
        pair.tasks.push(5).unwrap();
        assert_eq!(other.tasks.try_take(), Some(5));
        assert_eq!(other.results.name(), "results");
    }
}
