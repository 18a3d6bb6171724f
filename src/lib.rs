//! # asterisque
//!
//! A bidirectional, symmetric RPC and asynchronous messaging runtime for
//! peer-to-peer distributed systems.
//!
//! A connected pair of nodes may concurrently initiate remote function
//! calls against each other. Every call is a *pipe*, over which additional
//! payload blocks may flow in both directions until the call completes.
//! The runtime layers a framed binary protocol, a per-session pipe space
//! multiplexing thousands of concurrent calls over one transport, a
//! dispatcher driving the connection handshake and message routing, a
//! codec for a fixed set of transferable values, and a signed-envelope
//! trust model for peer verification.
//!
//! The entry points are [`asq::init`], which bootstraps the global
//! runtime, and [`asq::dispatcher::Dispatcher`], which owns the service
//! registry and binds wires into live sessions.

pub mod asq;
