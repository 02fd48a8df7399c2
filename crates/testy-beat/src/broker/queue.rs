use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::message::Delivery;

/// Options for declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Kept only for reporting; the in-process broker holds nothing on disk.
    pub durable: bool,
    /// Owned by the declaring channel and deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a private reply queue.
    pub fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A consumer attached to a queue.
#[derive(Debug)]
pub(crate) struct ConsumerSlot {
    pub(crate) tag: String,
    pub(crate) channel_id: u64,
    pub(crate) tx: mpsc::UnboundedSender<Delivery>,
}

/// Why a message could not be accepted.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EnqueueError {
    Full(usize),
}

/// A declared queue: pending messages plus round-robin consumers.
#[derive(Debug)]
pub(crate) struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<Delivery>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl Queue {
    pub(crate) fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        Self {
            options,
            owner,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    pub(crate) fn options(&self) -> QueueOptions {
        self.options
    }

    /// Channel that owns this queue, if it is exclusive.
    pub(crate) fn owner(&self) -> Option<u64> {
        self.owner
    }

    pub(crate) fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Hand a message to a consumer, or hold it until one attaches.
    pub(crate) fn enqueue(
        &mut self,
        delivery: Delivery,
        capacity: usize,
    ) -> Result<(), EnqueueError> {
        // Keep publish order: nothing overtakes messages already waiting.
        if self.messages.is_empty() {
            match self.dispatch(delivery) {
                None => return Ok(()),
                Some(undelivered) => return self.hold(undelivered, capacity),
            }
        }
        self.hold(delivery, capacity)
    }

    fn hold(&mut self, delivery: Delivery, capacity: usize) -> Result<(), EnqueueError> {
        if self.messages.len() >= capacity {
            return Err(EnqueueError::Full(capacity));
        }
        self.messages.push_back(delivery);
        Ok(())
    }

    pub(crate) fn add_consumer(&mut self, slot: ConsumerSlot) {
        self.consumers.push(slot);
        self.flush();
    }

    pub(crate) fn remove_consumer(&mut self, tag: &str) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.tag != tag);
        before != self.consumers.len()
    }

    /// Drop every consumer registered by `channel_id`, returning how many.
    pub(crate) fn remove_channel_consumers(&mut self, channel_id: u64) -> usize {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.channel_id != channel_id);
        before - self.consumers.len()
    }

    /// Deliver waiting messages in order until no consumer is left.
    fn flush(&mut self) {
        while let Some(delivery) = self.messages.pop_front() {
            if let Some(undelivered) = self.dispatch(delivery) {
                self.messages.push_front(undelivered);
                break;
            }
        }
    }

    /// Round-robin a delivery; returns it back if no live consumer took it.
    fn dispatch(&mut self, mut delivery: Delivery) -> Option<Delivery> {
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            match self.consumers[index].tx.send(delivery) {
                Ok(()) => {
                    self.next_consumer = index + 1;
                    return None;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // The consumer's stream was dropped without a cancel.
                    self.consumers.remove(index);
                    delivery = returned;
                }
            }
        }
        Some(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Properties;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: String::new(),
            routing_key: "q".to_string(),
            properties: Properties::default(),
            body: format!("m{}", tag).into_bytes(),
        }
    }

    fn slot(tag: &str, channel_id: u64) -> (ConsumerSlot, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConsumerSlot {
                tag: tag.to_string(),
                channel_id,
                tx,
            },
            rx,
        )
    }

    #[test]
    fn test_holds_until_consumer_attaches() {
        let mut queue = Queue::new(QueueOptions::default(), None);
        queue.enqueue(delivery(1), 10).unwrap();
        queue.enqueue(delivery(2), 10).unwrap();
        assert_eq!(queue.message_count(), 2);

        let (slot, mut rx) = slot("c1", 1);
        queue.add_consumer(slot);

        assert_eq!(queue.message_count(), 0);
        assert_eq!(rx.try_recv().unwrap().delivery_tag, 1);
        assert_eq!(rx.try_recv().unwrap().delivery_tag, 2);
    }

    #[test]
    fn test_round_robin() {
        let mut queue = Queue::new(QueueOptions::default(), None);
        let (a, mut rx_a) = slot("a", 1);
        let (b, mut rx_b) = slot("b", 1);
        queue.add_consumer(a);
        queue.add_consumer(b);

        for tag in 1..=4 {
            queue.enqueue(delivery(tag), 10).unwrap();
        }

        assert_eq!(rx_a.try_recv().unwrap().delivery_tag, 1);
        assert_eq!(rx_b.try_recv().unwrap().delivery_tag, 2);
        assert_eq!(rx_a.try_recv().unwrap().delivery_tag, 3);
        assert_eq!(rx_b.try_recv().unwrap().delivery_tag, 4);
    }

    #[test]
    fn test_dropped_consumer_is_skipped() {
        let mut queue = Queue::new(QueueOptions::default(), None);
        let (a, rx_a) = slot("a", 1);
        let (b, mut rx_b) = slot("b", 1);
        queue.add_consumer(a);
        queue.add_consumer(b);
        drop(rx_a);

        queue.enqueue(delivery(1), 10).unwrap();

        assert_eq!(rx_b.try_recv().unwrap().delivery_tag, 1);
        assert_eq!(queue.consumer_count(), 1);
    }

    #[test]
    fn test_capacity_rejects_overflow() {
        let mut queue = Queue::new(QueueOptions::default(), None);
        queue.enqueue(delivery(1), 1).unwrap();

        assert_eq!(queue.enqueue(delivery(2), 1), Err(EnqueueError::Full(1)));
        assert_eq!(queue.message_count(), 1);
    }

    #[test]
    fn test_remove_channel_consumers() {
        let mut queue = Queue::new(QueueOptions::default(), None);
        let (a, _rx_a) = slot("a", 1);
        let (b, _rx_b) = slot("b", 2);
        queue.add_consumer(a);
        queue.add_consumer(b);

        assert_eq!(queue.remove_channel_consumers(1), 1);
        assert!(!queue.remove_consumer("a"));
        assert!(queue.remove_consumer("b"));
        assert_eq!(queue.consumer_count(), 0);
    }
}
