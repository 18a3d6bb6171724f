//! The bounded message FIFO joining the session layer to a wire.
//!
//! A queue has a cooperative capacity: producers are never blocked by
//! the queue itself, but two listener edges report when the consumer
//! falls behind, and the session's outbound latch translates them
//! into backpressure. Safe under many producers and one consumer.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::asq::error::*;
use crate::asq::protocol::{Control, Message};

/// Observer of a queue's two watermark edges.
///
/// Implementations override the edges they care about.
pub trait QueueListener: Send + Sync {
    /// The queue transitioned between "something to poll" and empty.
    fn pollable(&self, _queue: &MessageQueue, _pollable: bool) {}

    /// The queue crossed its capacity watermarks: `false` once the
    /// length reaches the capacity, `true` again once it drains to
    /// half. The hysteresis keeps the edge from flapping.
    fn offerable(&self, _queue: &MessageQueue, _offerable: bool) {}
}

struct QueueState {
    items: VecDeque<Message>,
    // close() was called; the terminal marker is queued or delivered
    closed: bool,
    // the terminal marker was handed to the consumer
    terminated: bool,
    offerable: bool,
    waker: Option<Waker>,
}

/// A bounded FIFO of messages with pollable/offerable listener edges.
pub struct MessageQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    listeners: Mutex<SmallVec<[Arc<dyn QueueListener>; 4]>>,
}

impl MessageQueue {
    /// Creates a queue with the given cooperative capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                terminated: false,
                offerable: true,
                waker: None,
            }),
            listeners: Mutex::new(SmallVec::new()),
        }
    }

    /// The cooperative capacity this queue was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of queued messages.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Whether `close()` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Subscribes a listener to the watermark edges.
    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) {
        self.listeners.lock().push(listener);
    }

    /// Appends a message. Rejected once the queue is closed.
    pub fn offer(&self, message: Message) -> Result<()> {
        let (pollable, offerable) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err("Queue is closed").wrapped(ErrorKind::CommunicationQueue);
            }
            let was_empty = state.items.is_empty();
            state.items.push_back(message);
            let pollable = if was_empty { Some(true) } else { None };
            let offerable = if state.offerable && state.items.len() >= self.capacity {
                state.offerable = false;
                Some(false)
            } else {
                None
            };
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
            (pollable, offerable)
        };
        self.fire(pollable, offerable);
        Ok(())
    }

    /// Removes and returns the next message, if any.
    ///
    /// After `close()` the terminal end-of-message marker is returned
    /// exactly once; every later call yields `None`.
    pub fn poll(&self) -> Option<Message> {
        let (message, pollable, offerable) = {
            let mut state = self.state.lock();
            let (message, pollable, offerable) = Self::pop_locked(&mut state, self.capacity);
            (message, pollable, offerable)
        };
        self.fire(pollable, offerable);
        message
    }

    /// Closes the queue, inserting the terminal marker.
    ///
    /// Offers are rejected from here on; the consumer drains whatever
    /// was queued, then observes the marker.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.items.push_back(Message::Control(Control::end_of_message()));
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Waits for the next message.
    ///
    /// Resolves to `None` once the terminal marker is reached. This
    /// is the single logical consumer's iteration primitive.
    pub fn recv(&self) -> Recv<'_> {
        Recv { queue: self }
    }

    fn pop_locked(
        state: &mut QueueState,
        capacity: usize,
    ) -> (Option<Message>, Option<bool>, Option<bool>) {
        if state.terminated {
            return (None, None, None);
        }
        let message = match state.items.pop_front() {
            Some(message) => message,
            None => return (None, None, None),
        };
        if let Message::Control(control) = &message {
            if control.code() == Control::END_OF_MESSAGE {
                state.terminated = true;
                return (Some(message), None, None);
            }
        }
        // the pollable edge stays quiet while the terminal marker is
        // the only thing left in the queue
        let drained = state.items.is_empty()
            || matches!(
                state.items.front(),
                Some(Message::Control(c)) if c.code() == Control::END_OF_MESSAGE
            );
        let pollable = if drained && !state.closed {
            Some(false)
        } else {
            None
        };
        let offerable = if !state.offerable && state.items.len() <= capacity / 2 {
            state.offerable = true;
            Some(true)
        } else {
            None
        };
        (Some(message), pollable, offerable)
    }

    fn fire(&self, pollable: Option<bool>, offerable: Option<bool>) {
        if pollable.is_none() && offerable.is_none() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            if let Some(edge) = pollable {
                listener.pollable(self, edge);
            }
            if let Some(edge) = offerable {
                listener.offerable(self, edge);
            }
        }
    }
}

/// Future returned by [`MessageQueue::recv`].
pub struct Recv<'a> {
    queue: &'a MessageQueue,
}

impl Future for Recv<'_> {
    type Output = Option<Message>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let (outcome, pollable, offerable) = {
            let mut state = self.queue.state.lock();
            if state.terminated {
                (Poll::Ready(None), None, None)
            } else {
                let (message, pollable, offerable) =
                    MessageQueue::pop_locked(&mut state, self.queue.capacity);
                match message {
                    Some(Message::Control(ref control))
                        if control.code() == Control::END_OF_MESSAGE =>
                    {
                        (Poll::Ready(None), pollable, offerable)
                    }
                    Some(message) => (Poll::Ready(Some(message)), pollable, offerable),
                    None => {
                        state.waker = Some(cx.waker().clone());
                        (Poll::Pending, None, None)
                    }
                }
            }
        };
        self.queue.fire(pollable, offerable);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asq::protocol::{Block, PipeId};

    use std::sync::atomic::{AtomicI32, Ordering};

    fn block(n: u16) -> Message {
        Message::Block(Block::new(PipeId::from(n), vec![]))
    }

    #[derive(Default)]
    struct Edges {
        pollable: AtomicI32,
        offerable: AtomicI32,
    }

    impl QueueListener for Edges {
        fn pollable(&self, _queue: &MessageQueue, pollable: bool) {
            self.pollable
                .fetch_add(if pollable { 1 } else { -1 }, Ordering::SeqCst);
        }

        fn offerable(&self, _queue: &MessageQueue, offerable: bool) {
            self.offerable
                .fetch_add(if offerable { 1 } else { -1 }, Ordering::SeqCst);
        }
    }

    #[test]
    fn fifo_order() {
        let queue = MessageQueue::new(8);
        queue.offer(block(1)).unwrap();
        queue.offer(block(2)).unwrap();
        assert_eq!(queue.poll(), Some(block(1)));
        assert_eq!(queue.poll(), Some(block(2)));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn pollable_edges_fire_on_empty_transitions() {
        let queue = MessageQueue::new(8);
        let edges = Arc::new(Edges::default());
        queue.add_listener(edges.clone());

        queue.offer(block(1)).unwrap();
        assert_eq!(edges.pollable.load(Ordering::SeqCst), 1);
        queue.offer(block(2)).unwrap();
        assert_eq!(edges.pollable.load(Ordering::SeqCst), 1);

        queue.poll();
        assert_eq!(edges.pollable.load(Ordering::SeqCst), 1);
        queue.poll();
        assert_eq!(edges.pollable.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn offerable_hysteresis() {
        let queue = MessageQueue::new(4);
        let edges = Arc::new(Edges::default());
        queue.add_listener(edges.clone());

        for n in 0..4 {
            queue.offer(block(n)).unwrap();
        }
        // reached capacity: one downward edge
        assert_eq!(edges.offerable.load(Ordering::SeqCst), -1);

        queue.poll();
        // 3 > capacity/2, still gated
        assert_eq!(edges.offerable.load(Ordering::SeqCst), -1);

        queue.poll();
        // drained to half, one upward edge
        assert_eq!(edges.offerable.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn close_rejects_offers_and_terminates_once() {
        let queue = MessageQueue::new(4);
        queue.offer(block(1)).unwrap();
        queue.close();
        assert!(queue.offer(block(2)).is_err());

        assert_eq!(queue.poll(), Some(block(1)));
        match queue.poll() {
            Some(Message::Control(control)) => {
                assert_eq!(control.code(), Control::END_OF_MESSAGE)
            }
            other => panic!("expected the terminal marker, got {:?}", other),
        }
        assert_eq!(queue.poll(), None);
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn recv_drains_then_reports_termination() {
        let queue = MessageQueue::new(4);
        queue.offer(block(7)).unwrap();
        queue.close();

        futures::executor::block_on(async {
            assert_eq!(queue.recv().await, Some(block(7)));
            assert_eq!(queue.recv().await, None);
        });
    }

    #[test]
    fn recv_wakes_on_offer() {
        let queue = Arc::new(MessageQueue::new(4));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                queue.offer(block(3)).unwrap();
            })
        };
        let got = futures::executor::block_on(queue.recv());
        assert_eq!(got, Some(block(3)));
        producer.join().unwrap();
    }
}
