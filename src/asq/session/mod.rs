//! The per-connection orchestrator.
//!
//! A session owns one wire and one pipe space. It drains the wire's
//! inbound queue, routes `Block`/`Close` frames to live pipes, turns
//! peer `Open`s into service invocations, and gates every non-Control
//! outbound frame behind a latch driven by the outbound queue's
//! watermarks. Sessions are born from a completed handshake; see the
//! dispatcher.

pub mod latch;
pub mod pipe;

use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::asq::async_runtime as rt;
use crate::asq::communication::Wire;
use crate::asq::dispatcher::Services;
use crate::asq::error::*;
use crate::asq::globals::Flag;
use crate::asq::protocol::value::Value;
use crate::asq::protocol::{Abort, Close, Control, Message, Open};
use crate::asq::session::latch::Latch;
use crate::asq::session::pipe::{AcceptError, Call, Pipe, PipeSpace, PipeStub};

/// Observer of a session's lifecycle.
pub trait SessionListener: Send + Sync {
    /// The session closed. Fired exactly once, however the close was
    /// initiated.
    fn session_closed(&self, session: &Session);
}

/// A live connection to one peer, multiplexing concurrent calls.
pub struct Session {
    id: Uuid,
    primary: bool,
    service_id: String,
    ping_interval: i32,
    session_timeout: i32,
    wire: Arc<dyn Wire>,
    pipes: PipeSpace,
    latch: Arc<Latch>,
    stub: Arc<SessionStub>,
    services: Arc<Services>,
    closed: Flag,
    listeners: Mutex<SmallVec<[Arc<dyn SessionListener>; 4]>>,
}

impl Session {
    /// Builds a session over a wire whose handshake completed, and
    /// starts draining its inbound queue.
    ///
    /// `service_id` names the local service the peer asked for; every
    /// inbound `Open` dispatches to it.
    pub(crate) fn new(
        id: Uuid,
        wire: Arc<dyn Wire>,
        service_id: String,
        ping_interval: i32,
        session_timeout: i32,
        services: Arc<Services>,
    ) -> Arc<Self> {
        let latch = Arc::new(Latch::new(true));
        wire.outbound().add_listener(latch.clone());

        let primary = wire.is_primary();
        let session = Arc::new_cyclic(|weak: &Weak<Session>| {
            let stub = Arc::new(SessionStub {
                session: weak.clone(),
            });
            Session {
                id,
                primary,
                service_id,
                ping_interval,
                session_timeout,
                pipes: PipeSpace::new(primary),
                latch,
                stub,
                wire,
                services,
                closed: Flag::new(),
                listeners: Mutex::new(SmallVec::new()),
            }
        });
        rt::spawn(Self::run(session.clone()));
        session
    }

    /// The session id assigned by the primary during the handshake.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether this endpoint is the primary of the session.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// The local service inbound calls dispatch to.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// The keep-alive interval negotiated during the handshake, in
    /// seconds. Honoring it is the transport binding's concern.
    pub fn ping_interval(&self) -> i32 {
        self.ping_interval
    }

    /// The negotiated session timeout, in seconds.
    pub fn session_timeout(&self) -> i32 {
        self.session_timeout
    }

    /// The space of in-flight pipes.
    pub fn pipes(&self) -> &PipeSpace {
        &self.pipes
    }

    /// Whether the session was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.test()
    }

    /// Subscribes a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().push(listener);
    }

    /// Starts a call to the peer's function `function_id`.
    ///
    /// Allocates a pipe, emits the `Open`, and hands back the future
    /// of the final result.
    pub async fn open(
        &self,
        priority: i8,
        function_id: u16,
        params: Vec<Value>,
    ) -> Result<Call> {
        let pipe = self
            .pipes
            .create(self.stub.clone(), priority, function_id, params, false)?;
        let call = pipe.call()?;
        pipe.send_open().await?;
        Ok(call)
    }

    /// Like [`open`](Self::open), with stream reception enabled: the
    /// returned pipe exposes the peer's payload blocks.
    pub async fn open_streaming(
        &self,
        priority: i8,
        function_id: u16,
        params: Vec<Value>,
    ) -> Result<(Arc<Pipe>, Call)> {
        let pipe = self
            .pipes
            .create(self.stub.clone(), priority, function_id, params, true)?;
        let call = pipe.call()?;
        pipe.send_open().await?;
        Ok((pipe, call))
    }

    /// Closes the session.
    ///
    /// A graceful close aborts every in-flight pipe with a
    /// session-closing `Close` frame and posts the orderly teardown
    /// control before dropping the wire; a forced close only fails
    /// the local futures. Idempotent, and listeners are notified
    /// exactly once.
    pub async fn close(&self, graceful: bool) {
        self.shutdown(graceful, graceful).await
    }

    async fn run(session: Arc<Session>) {
        loop {
            match session.wire.inbound().recv().await {
                Some(message) => session.deliver(message).await,
                None => break,
            }
        }
        // the wire terminated underneath the session
        session.shutdown(false, false).await;
    }

    async fn deliver(&self, message: Message) {
        match message {
            Message::Control(control) => self.deliver_control(control).await,
            Message::Open(open) => self.deliver_open(open).await,
            Message::Block(block) => match self.pipes.get(block.pipe_id()) {
                Some(pipe) => {
                    let _ = pipe.deliver_block(block).await;
                }
                None => {
                    let close = Close::with_error(
                        block.pipe_id(),
                        Abort::DESTINATION_PIPE_UNREACHABLE,
                        "no pipe behind the block's id",
                    );
                    let _ = self.stub.post(Message::Close(close)).await;
                }
            },
            Message::Close(close) => match self.pipes.get(close.pipe_id()) {
                Some(pipe) => pipe.deliver_close(close),
                None => {
                    // closing twice is allowed; nothing to route to
                    debug!(session = %self.id, pipe = %close.pipe_id(),
                        "ignoring a close for an unknown pipe");
                }
            },
        }
    }

    async fn deliver_control(&self, control: Control) {
        match control.code() {
            Control::SYNC_SESSION => {
                // the handshake completed before this session existed
                warn!(session = %self.id, "handshake control after bind; aborting the wire");
                self.shutdown(false, false).await;
            }
            Control::CLOSE => {
                self.shutdown(false, false).await;
            }
            code => {
                debug!(session = %self.id, code, "ignoring an unknown control");
            }
        }
    }

    async fn deliver_open(&self, open: Open) {
        let service = match self.services.get(&self.service_id) {
            Some(service) => service,
            None => {
                let close = Close::with_error(
                    open.pipe_id(),
                    Abort::SERVICE_UNDEFINED,
                    format!("no service bound under '{}'", self.service_id),
                );
                let _ = self.stub.post(Message::Close(close)).await;
                return;
            }
        };
        let stream = service.receives_blocks(open.function_id());
        match self.pipes.accept(self.stub.clone(), &open, stream) {
            Ok(pipe) => {
                let future = service.invoke(pipe.clone());
                rt::spawn(async move {
                    let result = future.await;
                    let _ = pipe.close_with(result).await;
                });
            }
            Err(AcceptError::WrongSide(id)) => {
                warn!(session = %self.id, pipe = %id,
                    "open with this side's own id bit; aborting the wire");
                self.shutdown(false, false).await;
            }
            Err(AcceptError::Duplicate(id)) => {
                warn!(session = %self.id, pipe = %id, "open on a pipe id already in use");
                let close = Close::with_error(id, Abort::UNEXPECTED, "duplicate pipe id");
                let _ = self.stub.post(Message::Close(close)).await;
            }
            Err(AcceptError::Closed) => {
                let close =
                    Close::with_error(open.pipe_id(), Abort::SESSION_CLOSING, "session closing");
                let _ = self.stub.post(Message::Close(close)).await;
            }
        }
    }

    async fn shutdown(&self, close_pipes_on_wire: bool, send_control: bool) {
        if !self.closed.test_and_set() {
            return;
        }
        let pipes = self.pipes.close();
        for pipe in pipes {
            if close_pipes_on_wire {
                let close = Close::with_error(
                    pipe.id(),
                    Abort::SESSION_CLOSING,
                    "session closing",
                );
                // best effort; teardown never suspends on the latch
                let _ = self.wire.outbound().offer(Message::Close(close));
            }
            pipe.abort_local(Abort::new(Abort::SESSION_CLOSING, "session closing"));
        }
        if send_control {
            let _ = self
                .wire
                .outbound()
                .offer(Message::Control(Control::close()));
        }
        self.wire.close();
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener.session_closed(self);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Session({}, {}, service={})",
            self.id,
            if self.primary { "primary" } else { "secondary" },
            self.service_id,
        )
    }
}

struct SessionStub {
    session: Weak<Session>,
}

impl PipeStub for SessionStub {
    fn post(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let session = self
                .session
                .upgrade()
                .ok_or_else(|| Error::simple(ErrorKind::Session))?;
            if !matches!(message, Message::Control(_)) {
                session.latch.acquire().await;
            }
            session.wire.outbound().offer(message)
        })
    }

    fn closed(&self, pipe: &Pipe) {
        if let Some(session) = self.session.upgrade() {
            session.pipes.destroy(pipe.id());
        }
    }
}
