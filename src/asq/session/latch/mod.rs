//! The outbound gate translating queue watermarks into backpressure.
//!
//! A latch closes when the session's outbound queue reports "not
//! offerable" and opens again once the queue drains past its low
//! watermark. Every non-Control outbound message acquires the latch
//! first; Control messages bypass it so a session-close can always be
//! posted.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::asq::communication::queue::{MessageQueue, QueueListener};

struct LatchState {
    open: bool,
    waiters: Vec<Waker>,
}

/// An async gate with open/close edges.
pub struct Latch {
    state: Mutex<LatchState>,
}

impl Latch {
    /// Creates a latch in the given initial state.
    pub fn new(open: bool) -> Self {
        Self {
            state: Mutex::new(LatchState {
                open,
                waiters: Vec::new(),
            }),
        }
    }

    /// Opens the gate, releasing every waiter.
    pub fn open(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.open = true;
            std::mem::take(&mut state.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// Closes the gate; subsequent acquires suspend.
    pub fn close(&self) {
        self.state.lock().open = false;
    }

    /// Whether the gate is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Waits until the gate is open.
    pub fn acquire(&self) -> Acquire<'_> {
        Acquire { latch: self }
    }
}

/// Future returned by [`Latch::acquire`].
pub struct Acquire<'a> {
    latch: &'a Latch,
}

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.latch.state.lock();
        if state.open {
            Poll::Ready(())
        } else {
            state.waiters.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

// the session subscribes its latch directly to the outbound queue
impl QueueListener for Latch {
    fn offerable(&self, _queue: &MessageQueue, offerable: bool) {
        if offerable {
            self.open();
        } else {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn acquire_passes_through_an_open_gate() {
        let latch = Latch::new(true);
        futures::executor::block_on(latch.acquire());
    }

    #[test]
    fn acquire_suspends_until_opened() {
        let latch = Arc::new(Latch::new(false));
        let opener = {
            let latch = latch.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                latch.open();
            })
        };
        futures::executor::block_on(latch.acquire());
        assert!(latch.is_open());
        opener.join().unwrap();
    }
}
