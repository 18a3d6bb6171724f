//! Communication primitives for `asterisque`: the abstract wire and
//! the message queues feeding it.
//!
//! A [`Wire`] is an opaque duplex endpoint: messages in, messages
//! out, may fail, carries the peer's certificates. The concrete
//! transport (the project binds WebSocket over TLS externally) plugs
//! in behind this trait; the crate ships a loopback implementation
//! for exercising the stack in one process.

pub mod local;
pub mod queue;

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::Certificate;

use crate::asq::communication::queue::MessageQueue;
use crate::asq::error::Error;

/// Observer of a wire's lifecycle.
pub trait WireListener: Send + Sync {
    /// The wire was closed, locally or by transport failure.
    fn wire_closed(&self, _wire: &dyn Wire) {}

    /// The transport reported an error on this wire.
    fn wire_error(&self, _wire: &dyn Wire, _error: &Error) {}
}

/// An abstract duplex message channel between two endpoints.
///
/// `inbound` is drained only by the session bound to the wire;
/// `outbound` is drained only by the transport. The transport must
/// preserve message order in both directions.
pub trait Wire: Send + Sync {
    /// Messages arriving from the peer.
    fn inbound(&self) -> &MessageQueue;

    /// Messages leaving for the peer.
    fn outbound(&self) -> &MessageQueue;

    /// The local endpoint address, if the transport has one.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// The peer endpoint address, if the transport has one.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Whether this endpoint was designated primary when the
    /// connection was established. Exactly one side of a wire is.
    fn is_primary(&self) -> bool;

    /// The peer's TLS certificate chain, when the transport carries
    /// one.
    fn peer_certificates(&self) -> Option<Vec<Certificate>>;

    /// Whether the wire was closed.
    fn is_closed(&self) -> bool;

    /// Closes both directions and notifies listeners.
    fn close(&self);

    /// Subscribes a lifecycle listener.
    fn add_listener(&self, listener: Arc<dyn WireListener>);
}
