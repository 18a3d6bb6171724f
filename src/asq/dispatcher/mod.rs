//! The node-wide coordinator.
//!
//! A dispatcher owns the node id, the service registry and the set of
//! live sessions. [`Dispatcher::bind`] drives the handshake on a
//! freshly connected wire: both endpoints exchange a `SyncSession`
//! control as their first frame, the primary assigns the session id,
//! and a [`Session`] is born once the pair agrees.

pub mod remote;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::asq::codec::convert::VariableCodec;
use crate::asq::collections::{self, HashMap};
use crate::asq::communication::Wire;
use crate::asq::error::*;
use crate::asq::protocol::{Control, Message, SyncSession};
use crate::asq::session::pipe::{CallResult, Pipe};
use crate::asq::session::{Session, SessionListener};
use crate::asq::timeouts;
use crate::asq::trust;

/// The future a service returns for one accepted call.
pub type ServiceFuture = BoxFuture<'static, CallResult>;

/// A remotely callable service.
///
/// Invoked on the shared runtime with the pipe of the accepted call;
/// the returned future's result becomes the pipe's `Close`. Services
/// must not block: return promptly and let the future do the work.
pub trait Service: Send + Sync {
    /// Whether `function` consumes inbound payload blocks. Pipes of
    /// functions that don't are closed on the first stray block.
    fn receives_blocks(&self, _function: u16) -> bool {
        false
    }

    /// Accepts one call.
    fn invoke(&self, pipe: Arc<Pipe>) -> ServiceFuture;
}

/// The process-wide mapping from service ids to services.
pub struct Services {
    map: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl Services {
    fn new() -> Self {
        Self {
            map: RwLock::new(collections::hash_map()),
        }
    }

    /// Binds `service` under `service_id`, replacing any previous
    /// binding. Service ids carry at most 255 UTF-8 bytes.
    pub fn set(&self, service_id: &str, service: Arc<dyn Service>) -> Result<()> {
        if service_id.len() > SyncSession::MAX_SERVICE_ID {
            return Err("Service id exceeds 255 bytes").wrapped(ErrorKind::Dispatcher);
        }
        self.map.write().insert(service_id.to_owned(), service);
        Ok(())
    }

    /// Looks up the service bound under `service_id`.
    pub fn get(&self, service_id: &str) -> Option<Arc<dyn Service>> {
        self.map.read().get(service_id).cloned()
    }

    /// Drops the binding under `service_id`.
    pub fn remove(&self, service_id: &str) -> Option<Arc<dyn Service>> {
        self.map.write().remove(service_id)
    }
}

/// Configuration of a [`Dispatcher`].
pub struct DispatcherConfig {
    /// This node's identity.
    pub node_id: Uuid,
    /// How long a handshake may take before the wire is dropped.
    pub handshake_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// The node-level entity owning services and live sessions.
pub struct Dispatcher {
    node_id: Uuid,
    codec: VariableCodec,
    services: Arc<Services>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    handshake_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher. Run after library init: the value codec
    /// snapshot is taken here.
    pub fn new(config: DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id,
            codec: VariableCodec::global(),
            services: Arc::new(Services::new()),
            sessions: RwLock::new(collections::hash_map()),
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// This node's identity.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// The service registry.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The value conversion codec snapshotted at construction.
    pub fn codec(&self) -> &VariableCodec {
        &self.codec
    }

    /// Looks up a live session.
    pub fn session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// The number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Performs the handshake on a connected wire and binds the
    /// resulting session.
    ///
    /// `service_id` names the service this node asks the peer to
    /// dispatch its calls to. The first inbound frame must be the
    /// peer's `SyncSession`; anything else, a bad session id, or a
    /// version mismatch aborts the wire.
    pub async fn bind(
        self: &Arc<Self>,
        wire: Arc<dyn Wire>,
        service_id: &str,
        ping_interval: i32,
        session_timeout: i32,
    ) -> Result<Arc<Session>> {
        let proposed = if wire.is_primary() {
            self.fresh_session_id()
        } else {
            Uuid::nil()
        };
        let local = SyncSession {
            version: SyncSession::VERSION_1_0,
            node_id: self.node_id,
            session_id: proposed,
            service_id: service_id.to_owned(),
            utc_time: utc_now_millis(),
            ping_interval,
            session_timeout,
        };

        // controls bypass the latch; there is no session yet anyway
        wire.outbound().offer(Message::Control(local.to_control()?))?;

        let remote = match self.await_handshake(&wire).await {
            Ok(remote) => remote,
            Err(e) => {
                wire.close();
                return Err(e);
            }
        };

        if remote.version != SyncSession::VERSION_1_0 {
            wire.close();
            return Err("Unsupported protocol version in handshake")
                .wrapped(ErrorKind::Dispatcher);
        }

        // when the transport authenticated the peer, its certificate
        // must name the node id it claims
        if let Some(certs) = wire.peer_certificates() {
            if let Some(leaf) = certs.first() {
                let matches = match trust::certificate_names_node(leaf, &remote.node_id) {
                    Ok(matches) => matches,
                    Err(e) => {
                        wire.close();
                        return Err(e);
                    }
                };
                if !matches {
                    wire.close();
                    return Err("Peer certificate does not name the claimed node id")
                        .wrapped(ErrorKind::Dispatcher);
                }
            }
        }

        let (primary, _secondary) = if wire.is_primary() {
            (&local, &remote)
        } else {
            (&remote, &local)
        };
        let session_id = primary.session_id;
        let ping = primary.ping_interval;
        let timeout = primary.session_timeout;

        if session_id.is_nil() || self.sessions.read().contains_key(&session_id) {
            warn!(session = %session_id, "unusable session id negotiated; closing");
            let _ = wire.outbound().offer(Message::Control(Control::close()));
            wire.close();
            return Err("The negotiated session id is zero or already bound")
                .wrapped(ErrorKind::Dispatcher);
        }

        debug!(session = %session_id, node = %remote.node_id, service = %remote.service_id,
            "session established");

        let session = Session::new(
            session_id,
            wire,
            remote.service_id,
            ping,
            timeout,
            self.services.clone(),
        );
        self.sessions.write().insert(session_id, session.clone());
        session.add_listener(Arc::new(Unregister {
            dispatcher: Arc::downgrade(self),
        }));
        if session.is_closed() {
            // lost a race with an immediate close
            self.sessions.write().remove(&session_id);
        }
        Ok(session)
    }

    async fn await_handshake(&self, wire: &Arc<dyn Wire>) -> Result<SyncSession> {
        let first = timeouts::timeout(self.handshake_timeout, wire.inbound().recv()).await?;
        match first {
            Some(Message::Control(ref control)) if control.code() == Control::SYNC_SESSION => {
                SyncSession::from_control(control)
            }
            Some(other) => {
                warn!(node = %self.node_id, "first frame was not a handshake: {:?}", other);
                Err("The first frame on the wire must be a handshake")
                    .wrapped(ErrorKind::Dispatcher)
            }
            None => Err("The wire terminated during the handshake").wrapped(ErrorKind::Dispatcher),
        }
    }

    fn fresh_session_id(&self) -> Uuid {
        let sessions = self.sessions.read();
        loop {
            let id = Uuid::new_v4();
            if !id.is_nil() && !sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

struct Unregister {
    dispatcher: std::sync::Weak<Dispatcher>,
}

impl SessionListener for Unregister {
    fn session_closed(&self, session: &Session) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.sessions.write().remove(&session.id());
        }
    }
}

fn utc_now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::remote::FunctionTable;
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Once;

    use futures::join;
    use futures_timer::Delay;

    use crate::asq::async_runtime as rt;
    use crate::asq::communication::local;
    use crate::asq::protocol::value::Value;
    use crate::asq::protocol::{Abort, Open, PipeId};

    fn init_runtime() {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| unsafe {
            crate::asq::async_runtime::init(2).expect("runtime init failed");
        });
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(DispatcherConfig {
            node_id: Uuid::new_v4(),
            handshake_timeout: Duration::from_millis(500),
        })
    }

    fn echo_service() -> Arc<FunctionTable> {
        let table = FunctionTable::new()
            .bind(10, |pipe| {
                Box::pin(async move {
                    match pipe.params().first() {
                        Some(Value::Text(text)) => Ok(Value::Text(text.clone())),
                        _ => Err(Abort::new(Abort::FUNCTION_FAILED, "expected a string")),
                    }
                })
            })
            .bind_streaming(20, |pipe| {
                Box::pin(async move {
                    let source = match pipe.blocks() {
                        Ok(source) => source,
                        Err(_) => return Err(Abort::new(Abort::FUNCTION_FAILED, "no stream")),
                    };
                    let mut count = 0i32;
                    while let Some(chunk) = source.next().await {
                        count += 1;
                        if pipe.send_block(&chunk).await.is_err() {
                            return Err(Abort::new(Abort::FUNCTION_FAILED, "echo failed"));
                        }
                    }
                    let _ = pipe.send_eof().await;
                    Ok(Value::Int32(count))
                })
            });
        Arc::new(table)
    }

    async fn connect(
        caller: &Arc<Dispatcher>,
        callee: &Arc<Dispatcher>,
    ) -> (Arc<Session>, Arc<Session>) {
        let (primary_wire, secondary_wire) = local::pair(64);
        let (callee_session, caller_session) = join!(
            callee.bind(primary_wire, "echo", 10, 30),
            caller.bind(secondary_wire, "echo", 10, 30),
        );
        (
            caller_session.expect("caller handshake failed"),
            callee_session.expect("callee handshake failed"),
        )
    }

    async fn settle<F: Fn() -> bool>(ready: F) {
        for _ in 0..200 {
            if ready() {
                return;
            }
            Delay::new(Duration::from_millis(5)).await;
        }
        panic!("condition never settled");
    }

    #[test]
    fn minimal_rpc_round_trip() {
        init_runtime();
        let caller = dispatcher();
        let callee = dispatcher();
        callee.services().set("echo", echo_service()).unwrap();

        rt::block_on(async {
            let (session, peer) = connect(&caller, &callee).await;

            let call = session
                .open(0, 10, vec![Value::Text("hi".into())])
                .await
                .unwrap();
            assert_eq!(call.await, Ok(Value::Text("hi".into())));

            // the pipe leaves both spaces once closed in both
            // directions
            settle(|| session.pipes().is_empty()).await;
            settle(|| peer.pipes().is_empty()).await;
        });
    }

    #[test]
    fn unknown_function_aborts_the_call() {
        init_runtime();
        let caller = dispatcher();
        let callee = dispatcher();
        callee.services().set("echo", echo_service()).unwrap();

        rt::block_on(async {
            let (session, _peer) = connect(&caller, &callee).await;
            let call = session.open(0, 9999, vec![]).await.unwrap();
            let abort = call.await.unwrap_err();
            assert_eq!(abort.code(), Abort::FUNCTION_UNDEFINED);
        });
    }

    #[test]
    fn unknown_service_aborts_the_call() {
        init_runtime();
        let caller = dispatcher();
        let callee = dispatcher();
        // nothing registered under "echo" on the callee

        rt::block_on(async {
            let (session, _peer) = connect(&caller, &callee).await;
            let call = session.open(0, 10, vec![]).await.unwrap();
            let abort = call.await.unwrap_err();
            assert_eq!(abort.code(), Abort::SERVICE_UNDEFINED);
        });
    }

    #[test]
    fn streaming_echo_preserves_order() {
        init_runtime();
        let caller = dispatcher();
        let callee = dispatcher();
        callee.services().set("echo", echo_service()).unwrap();

        rt::block_on(async {
            let (session, _peer) = connect(&caller, &callee).await;

            let (pipe, call) = session.open_streaming(0, 20, vec![]).await.unwrap();
            let source = pipe.blocks().unwrap();

            pipe.send_block(&[0x01]).await.unwrap();
            pipe.send_block(&[0x02]).await.unwrap();
            pipe.send_block(&[0x03]).await.unwrap();
            pipe.send_eof().await.unwrap();

            assert_eq!(source.next().await, Some(vec![0x01]));
            assert_eq!(source.next().await, Some(vec![0x02]));
            assert_eq!(source.next().await, Some(vec![0x03]));
            assert_eq!(source.next().await, None);

            assert_eq!(call.await, Ok(Value::Int32(3)));
        });
    }

    struct CloseCounter {
        fired: AtomicUsize,
    }

    impl SessionListener for CloseCounter {
        fn session_closed(&self, _session: &Session) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn graceful_close_aborts_in_flight_pipes() {
        init_runtime();
        let caller = dispatcher();
        let callee = dispatcher();
        // a service that never completes, keeping pipes in flight
        let stuck = FunctionTable::new().bind(30, |_pipe| Box::pin(futures::future::pending()));
        callee.services().set("echo", Arc::new(stuck)).unwrap();

        rt::block_on(async {
            let (session, peer) = connect(&caller, &callee).await;

            let counter = Arc::new(CloseCounter {
                fired: AtomicUsize::new(0),
            });
            session.add_listener(counter.clone());
            let peer_counter = Arc::new(CloseCounter {
                fired: AtomicUsize::new(0),
            });
            peer.add_listener(peer_counter.clone());

            let first = session.open(0, 30, vec![]).await.unwrap();
            let second = session.open(0, 30, vec![]).await.unwrap();
            settle(|| peer.pipes().len() == 2).await;

            peer.close(true).await;

            let abort = first.await.unwrap_err();
            assert_eq!(abort.code(), Abort::SESSION_CLOSING);
            let abort = second.await.unwrap_err();
            assert_eq!(abort.code(), Abort::SESSION_CLOSING);

            settle(|| counter.fired.load(Ordering::SeqCst) == 1).await;
            assert!(session.is_closed());
            assert_eq!(peer_counter.fired.load(Ordering::SeqCst), 1);

            // closing again notifies nobody
            peer.close(true).await;
            session.close(false).await;
            assert_eq!(peer_counter.fired.load(Ordering::SeqCst), 1);
            assert_eq!(counter.fired.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn wrong_side_pipe_id_tears_the_session_down() {
        init_runtime();
        let caller = dispatcher();
        let callee = dispatcher();
        callee.services().set("echo", echo_service()).unwrap();

        rt::block_on(async {
            let (primary_wire, secondary_wire) = local::pair(64);
            let (callee_session, caller_session) = join!(
                callee.bind(primary_wire, "echo", 10, 30),
                caller.bind(secondary_wire.clone(), "echo", 10, 30),
            );
            let peer = callee_session.unwrap();
            let _session = caller_session.unwrap();

            // inject an open carrying the primary's own id bit, as if
            // the secondary had allocated from the wrong half
            let rogue = Open::new(PipeId::from(0x8001), 0, 10, vec![]);
            secondary_wire
                .outbound()
                .offer(Message::Open(rogue))
                .unwrap();

            settle(|| peer.is_closed()).await;
            assert!(peer.pipes().is_empty());
        });
    }

    #[test]
    fn sessions_unregister_on_close() {
        init_runtime();
        let caller = dispatcher();
        let callee = dispatcher();
        callee.services().set("echo", echo_service()).unwrap();

        rt::block_on(async {
            let (session, peer) = connect(&caller, &callee).await;
            assert_eq!(caller.session_count(), 1);
            assert_eq!(callee.session_count(), 1);
            assert_eq!(session.id(), peer.id());
            assert!(caller.session(&session.id()).is_some());

            session.close(true).await;
            settle(|| caller.session_count() == 0).await;
            settle(|| callee.session_count() == 0).await;
        });
    }

    #[test]
    fn handshake_rejects_a_non_handshake_first_frame() {
        init_runtime();
        let caller = dispatcher();

        rt::block_on(async {
            let (primary_wire, secondary_wire) = local::pair(64);
            // the "peer" speaks out of turn instead of shaking hands
            secondary_wire
                .outbound()
                .offer(Message::Control(Control::close()))
                .unwrap();

            let bound = caller.bind(primary_wire.clone(), "echo", 10, 30).await;
            assert!(bound.is_err());
            assert!(primary_wire.is_closed());
        });
    }

    #[test]
    fn handshake_rejects_a_nil_session_id() {
        init_runtime();
        let caller = dispatcher();

        rt::block_on(async {
            let (primary_wire, secondary_wire) = local::pair(64);
            // a rogue primary proposing the nil session id
            let rogue = SyncSession {
                version: SyncSession::VERSION_1_0,
                node_id: Uuid::new_v4(),
                session_id: Uuid::nil(),
                service_id: "echo".into(),
                utc_time: 0,
                ping_interval: 10,
                session_timeout: 30,
            };
            primary_wire
                .outbound()
                .offer(Message::Control(rogue.to_control().unwrap()))
                .unwrap();

            let bound = caller.bind(secondary_wire.clone(), "echo", 10, 30).await;
            assert!(bound.is_err());
            assert!(secondary_wire.is_closed());
        });
    }

    #[test]
    fn handshake_times_out_without_a_peer() {
        init_runtime();
        let caller = Dispatcher::new(DispatcherConfig {
            node_id: Uuid::new_v4(),
            handshake_timeout: Duration::from_millis(100),
        });

        rt::block_on(async {
            let (primary_wire, _secondary_wire) = local::pair(64);
            let bound = caller.bind(primary_wire.clone(), "echo", 10, 30).await;
            assert!(bound.is_err());
            assert!(primary_wire.is_closed());
        });
    }
}
