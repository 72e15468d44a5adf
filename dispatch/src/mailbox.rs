//! Priority-ordered mailbox.
//!
//! Every attached work process owns one `Mailbox`. The queue is an ordered
//! list, not a heap: the insertion position is computed at enqueue time so
//! the list is always sorted by priority, ties broken by arrival order.

use crate::hiid::HIID;
use crate::message::Message;

use tracing::debug;

use std::collections::VecDeque;

/// Status codes of the synchronous mailbox accessor, the closed set consumed
/// by adapter-layer wrappers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventStatus {
    /// A matching message was available.
    Success,
    /// The queue is empty; the caller should wait.
    Wait,
    /// The mailbox has been closed (the owner stopped).
    Closed,
    /// The head of the queue does not match the requested mask. Recoverable:
    /// the caller can retry with another mask or drain the head.
    OutOfSeq,
}

/// Ordered message queue of a work process.
///
/// Higher-priority messages sit nearer the head; equal priorities keep
/// arrival order. The `need_repoll` flag tells the dispatcher the head of
/// the queue changed and the owner must be reconsidered by the event loop.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: VecDeque<Message>,
    need_repoll: bool,
    closed: bool,
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Mailbox::default()
    }

    /// Inserts a message at the position dictated by its priority, scanning
    /// from the head: before the first entry with strictly lower priority.
    /// Returns true iff the message became the new head, in which case the
    /// repoll flag is raised.
    ///
    /// Messages enqueued into a closed mailbox are dropped.
    pub fn enqueue(&mut self, msg: Message) -> bool {
        if self.closed {
            debug!(id = %msg.id, "dropping message for closed mailbox");
            return false;
        }
        let pos = self
            .queue
            .iter()
            .position(|queued| queued.priority < msg.priority)
            .unwrap_or(self.queue.len());
        let new_head = pos == 0;
        self.queue.insert(pos, msg);
        if new_head {
            self.need_repoll = true;
        }
        new_head
    }

    /// Removes messages matching `mask`. With `all` set, every match is
    /// removed; otherwise only the first. Returns the removed messages in
    /// queue order.
    pub fn dequeue_mask(&mut self, mask: &HIID, all: bool) -> Vec<Message> {
        let mut removed = Vec::new();
        let mut pos = 0;
        while pos < self.queue.len() {
            if mask.matches(&self.queue[pos].id) {
                if let Some(msg) = self.queue.remove(pos) {
                    if pos == 0 {
                        self.need_repoll = !self.queue.is_empty();
                    }
                    removed.push(msg);
                }
                if !all {
                    break;
                }
            } else {
                pos += 1;
            }
        }
        removed
    }

    /// Removes and returns the message at `pos`, if any.
    pub fn dequeue_at(&mut self, pos: usize) -> Option<Message> {
        let msg = self.queue.remove(pos);
        if msg.is_some() && pos == 0 {
            self.need_repoll = !self.queue.is_empty();
        }
        msg
    }

    /// Position of the first message at or after `start` whose id matches
    /// `mask`.
    pub fn search(&self, mask: &HIID, start: usize) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, msg)| mask.matches(&msg.id))
            .map(|(pos, _)| pos)
    }

    /// OR-merges readiness bits into the state of the message at `pos`.
    pub fn or_state(&mut self, pos: usize, bits: u32) {
        if let Some(msg) = self.queue.get_mut(pos) {
            msg.state |= bits;
        }
    }

    /// Head of the queue, if any.
    pub fn head(&self) -> Option<&Message> {
        self.queue.front()
    }

    /// Pops the head of the queue.
    pub fn pop_head(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    /// Puts a message back at the head, unpolled.
    pub fn push_head(&mut self, msg: Message) {
        self.queue.push_front(msg);
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Repoll flag: the head changed and the owner must be reconsidered.
    pub fn need_repoll(&self) -> bool {
        self.need_repoll
    }

    /// Sets the repoll flag.
    pub fn set_repoll(&mut self, repoll: bool) {
        self.need_repoll = repoll;
    }

    /// Closes the mailbox; further enqueues are dropped.
    pub fn close(&mut self) {
        self.closed = true;
        self.need_repoll = false;
    }

    /// True once the mailbox has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Synchronous accessor over the head of the queue. Returns the head
    /// message when it matches `mask`, else the status an adapter needs to
    /// decide whether to wait, resynchronize or give up.
    pub fn get_event(&mut self, mask: &HIID) -> (EventStatus, Option<Message>) {
        if self.closed {
            return (EventStatus::Closed, None);
        }
        match self.queue.front() {
            None => (EventStatus::Wait, None),
            Some(head) if mask.matches(&head.id) => {
                let msg = self.queue.pop_front();
                self.need_repoll = !self.queue.is_empty();
                (EventStatus::Success, msg)
            }
            Some(_) => (EventStatus::OutOfSeq, None),
        }
    }
}
