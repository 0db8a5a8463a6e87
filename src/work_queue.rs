use crossbeam_channel::{Receiver, Sender};

/// Multi-producer multi-consumer queue shared by the coordinator and the
/// worker pool. Consumers see the queue as closed once every sender is gone.
pub struct WorkQueue<T> {
    pub sender: Sender<T>,
    pub receiver: Receiver<T>,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, item: T) -> bool {
        self.sender.send(item).is_ok()
    }

    /// Discard everything still queued and return how many items were dropped.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }

    /// Give up this handle's sender so consumers can observe closure, keeping
    /// the receiver.
    pub fn close(self) -> Receiver<T> {
        self.receiver
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_items_arrive_in_push_order() {
        let queue = WorkQueue::new();
        assert!(queue.push(1));
        assert!(queue.push(2));
        let receiver = queue.close();
        assert_eq!(receiver.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_push_fails_once_receivers_are_gone() {
        let WorkQueue { sender, receiver } = WorkQueue::new();
        drop(receiver);
        let queue = WorkQueue {
            sender,
            receiver: crossbeam_channel::never(),
        };
        assert!(!queue.push(1));
    }

    #[test]
    fn test_consumers_stop_after_close() {
        let queue = WorkQueue::new();
        for i in 0..10 {
            queue.push(i);
        }
        let receiver = queue.close();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let rx = receiver.clone();
                thread::spawn(move || rx.iter().count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_drain_discards_pending() {
        let queue = WorkQueue::new();
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.drain(), 2);
        assert_eq!(queue.drain(), 0);
    }
}
