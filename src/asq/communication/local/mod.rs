//! A loopback wire pair connecting two endpoints in one process.
//!
//! The two halves share their queues crosswired: what one half
//! offers outbound is what the other drains inbound. Used by the
//! test suite and the demos; a network transport replaces this
//! behind the same trait.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::Certificate;
use smallvec::SmallVec;

use crate::asq::communication::queue::MessageQueue;
use crate::asq::communication::{Wire, WireListener};
use crate::asq::globals::Flag;

/// One half of a loopback connection.
pub struct LocalWire {
    inbound: Arc<MessageQueue>,
    outbound: Arc<MessageQueue>,
    primary: bool,
    peer_certs: Option<Vec<Certificate>>,
    closed: Flag,
    listeners: Mutex<SmallVec<[Arc<dyn WireListener>; 4]>>,
}

impl LocalWire {
    /// Default cooperative capacity of the loopback queues.
    pub const DEFAULT_CAPACITY: usize = 64;
}

/// Creates a connected wire pair; the first half is primary.
pub fn pair(capacity: usize) -> (Arc<LocalWire>, Arc<LocalWire>) {
    pair_with_certs(capacity, None, None)
}

/// Creates a connected wire pair with injected peer certificates.
///
/// `primary_sees` is what the primary half reports as its peer's
/// chain, and vice versa.
pub fn pair_with_certs(
    capacity: usize,
    primary_sees: Option<Vec<Certificate>>,
    secondary_sees: Option<Vec<Certificate>>,
) -> (Arc<LocalWire>, Arc<LocalWire>) {
    let up = Arc::new(MessageQueue::new(capacity));
    let down = Arc::new(MessageQueue::new(capacity));

    let primary = Arc::new(LocalWire {
        inbound: down.clone(),
        outbound: up.clone(),
        primary: true,
        peer_certs: primary_sees,
        closed: Flag::new(),
        listeners: Mutex::new(SmallVec::new()),
    });
    let secondary = Arc::new(LocalWire {
        inbound: up,
        outbound: down,
        primary: false,
        peer_certs: secondary_sees,
        closed: Flag::new(),
        listeners: Mutex::new(SmallVec::new()),
    });
    (primary, secondary)
}

impl Wire for LocalWire {
    fn inbound(&self) -> &MessageQueue {
        &self.inbound
    }

    fn outbound(&self) -> &MessageQueue {
        &self.outbound
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_primary(&self) -> bool {
        self.primary
    }

    fn peer_certificates(&self) -> Option<Vec<Certificate>> {
        self.peer_certs.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.test()
    }

    fn close(&self) {
        if self.closed.test() {
            return;
        }
        self.closed.set();
        // both directions terminate; the peer half observes the
        // marker on its own inbound drain
        self.outbound.close();
        self.inbound.close();
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.wire_closed(self);
        }
    }

    fn add_listener(&self, listener: Arc<dyn WireListener>) {
        self.listeners.lock().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asq::protocol::{Control, Message};

    #[test]
    fn halves_are_crosswired() {
        let (primary, secondary) = pair(8);
        assert!(primary.is_primary());
        assert!(!secondary.is_primary());

        primary
            .outbound()
            .offer(Message::Control(Control::close()))
            .unwrap();
        assert_eq!(
            secondary.inbound().poll(),
            Some(Message::Control(Control::close()))
        );
    }

    #[test]
    fn close_terminates_both_directions() {
        let (primary, secondary) = pair(8);
        primary.close();
        assert!(primary.is_closed());
        assert!(primary.outbound().offer(Message::Control(Control::close())).is_err());
        assert!(secondary.outbound().offer(Message::Control(Control::close())).is_err());
    }
}
