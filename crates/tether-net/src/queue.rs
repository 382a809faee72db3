//! Outbound message buffering while disconnected, and the inbound channel
//! between the transport reader and message processing.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::message::Message;
use crate::transport::RawFrame;

// ---------------------------------------------------------------------------
// Outbound queue
// ---------------------------------------------------------------------------

/// Why a message could not be buffered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("message queue is disabled")]
    Disabled,

    #[error("message queue full ({max} messages)")]
    Full { max: usize },
}

/// Bounded FIFO of messages waiting for a connection.
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<Message>,
    max_size: usize,
    enabled: bool,
    dropped: u64,
}

impl MessageQueue {
    /// Empty queue holding at most `max_size` messages.
    pub fn new(max_size: usize, enabled: bool) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            enabled,
            dropped: 0,
        }
    }

    /// Append a message. Returns the new queue length.
    pub fn enqueue(&mut self, message: Message) -> Result<usize, QueueError> {
        if !self.enabled {
            self.dropped += 1;
            return Err(QueueError::Disabled);
        }
        if self.items.len() >= self.max_size {
            self.dropped += 1;
            return Err(QueueError::Full { max: self.max_size });
        }
        self.items.push_back(message);
        Ok(self.items.len())
    }

    /// Oldest buffered message.
    pub fn pop_front(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    /// Put a message back at the head after a failed flush.
    pub fn requeue_front(&mut self, message: Message) {
        self.items.push_front(message);
    }

    /// Turn queueing on with a new bound. Messages beyond the bound are
    /// dropped, newest first.
    pub fn enable(&mut self, max_size: usize) {
        self.enabled = true;
        self.max_size = max_size;
        while self.items.len() > max_size {
            self.items.pop_back();
            self.dropped += 1;
        }
    }

    /// Turn queueing off and discard what was buffered. Returns the number discarded.
    pub fn disable(&mut self) -> usize {
        self.enabled = false;
        self.clear()
    }

    /// Discard everything buffered. Returns the number discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        self.dropped += n as u64;
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Messages rejected or discarded over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ---------------------------------------------------------------------------
// Inbound channel
// ---------------------------------------------------------------------------

/// Sending half of the inbound frame channel.
pub type InboundSender = mpsc::Sender<RawFrame>;
/// Receiving half of the inbound frame channel.
pub type InboundReceiver = mpsc::Receiver<RawFrame>;

/// Create the bounded channel carrying received frames to the processor.
pub fn inbound_channel(buffer: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(buffer.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u32) -> Message {
        Message::new("move", json!({ "n": n }))
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = MessageQueue::new(10, true);
        for n in 0..3 {
            queue.enqueue(msg(n)).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front())
            .map(|m| m.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut queue = MessageQueue::new(2, true);
        assert_eq!(queue.enqueue(msg(0)), Ok(1));
        assert_eq!(queue.enqueue(msg(1)), Ok(2));
        assert_eq!(queue.enqueue(msg(2)), Err(QueueError::Full { max: 2 }));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_disabled_queue_rejects() {
        let mut queue = MessageQueue::new(2, false);
        assert_eq!(queue.enqueue(msg(0)), Err(QueueError::Disabled));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_head_position() {
        let mut queue = MessageQueue::new(10, true);
        queue.enqueue(msg(0)).unwrap();
        queue.enqueue(msg(1)).unwrap();
        let head = queue.pop_front().unwrap();
        queue.requeue_front(head);
        assert_eq!(queue.pop_front().unwrap().payload["n"], 0);
    }

    #[test]
    fn test_enable_with_smaller_bound_truncates_newest() {
        let mut queue = MessageQueue::new(10, true);
        for n in 0..5 {
            queue.enqueue(msg(n)).unwrap();
        }
        queue.enable(2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().payload["n"], 0);
        assert_eq!(queue.pop_front().unwrap().payload["n"], 1);
    }

    #[test]
    fn test_disable_discards() {
        let mut queue = MessageQueue::new(10, true);
        queue.enqueue(msg(0)).unwrap();
        assert_eq!(queue.disable(), 1);
        assert!(!queue.is_enabled());
        assert!(queue.is_empty());
    }
}
