//! One concurrent call and the per-session space keeping calls
//! disjoint.
//!
//! A [`Pipe`] tracks the lifecycle of a single call: `Open` starts
//! it, `Block`s stream payload in both directions, and the first
//! `Close` in either direction terminates it and completes the call
//! future exactly once. A [`PipeSpace`] maps 16-bit pipe ids onto
//! live pipes, allocating locally-unique ids without peer
//! coordination by partitioning on the primary bit.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::future::BoxFuture;
use intmap::IntMap;
use parking_lot::{Mutex, RwLock};

use crate::asq::error::*;
use crate::asq::globals::Flag;
use crate::asq::protocol::value::Value;
use crate::asq::protocol::{Abort, Block, Close, Message, Open, PipeId};

/// The final result of a call, as completed on its future.
pub type CallResult = std::result::Result<Value, Abort>;

/// The narrow handle a pipe holds back into its session.
///
/// Only two capabilities: posting a message on the session's
/// outbound path, and announcing that the pipe reached its terminal
/// state. The session holds the pipes; pipes hold this stub. No
/// circular strong ownership.
pub trait PipeStub: Send + Sync {
    /// Posts a message, suspending on outbound backpressure.
    fn post(&self, message: Message) -> BoxFuture<'_, Result<()>>;

    /// The pipe terminated; drop it from the pipe space.
    fn closed(&self, pipe: &Pipe);
}

struct SourceState {
    chunks: VecDeque<Vec<u8>>,
    eof: bool,
    waker: Option<Waker>,
}

/// The inbound payload stream of a pipe created with stream
/// reception enabled. Terminated by the peer's EOF block.
#[derive(Clone)]
pub struct BlockSource {
    state: Arc<Mutex<SourceState>>,
}

impl BlockSource {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                chunks: VecDeque::new(),
                eof: false,
                waker: None,
            })),
        }
    }

    fn push(&self, chunk: Vec<u8>) {
        let mut state = self.state.lock();
        state.chunks.push_back(chunk);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    fn push_eof(&self) {
        let mut state = self.state.lock();
        state.eof = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Waits for the next payload; `None` once the stream hit EOF.
    pub fn next(&self) -> NextBlock<'_> {
        NextBlock { source: self }
    }
}

/// Future returned by [`BlockSource::next`].
pub struct NextBlock<'a> {
    source: &'a BlockSource,
}

impl Future for NextBlock<'_> {
    type Output = Option<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.source.state.lock();
        if let Some(chunk) = state.chunks.pop_front() {
            return Poll::Ready(Some(chunk));
        }
        if state.eof {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// The handle completed exactly once with the final result of a
/// call.
pub struct Call {
    receiver: oneshot::Receiver<CallResult>,
}

impl Future for Call {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Abort::new(
                Abort::UNEXPECTED,
                "the pipe was dropped before completing",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The state of one call multiplexed over a session.
pub struct Pipe {
    id: PipeId,
    priority: i8,
    function_id: u16,
    params: Vec<Value>,
    local_origin: bool,
    stub: Arc<dyn PipeStub>,
    sender: Mutex<Option<oneshot::Sender<CallResult>>>,
    receiver: Mutex<Option<oneshot::Receiver<CallResult>>>,
    source: Option<BlockSource>,
    closed: Flag,
    eof_sent: Flag,
}

impl Pipe {
    fn new(
        id: PipeId,
        priority: i8,
        function_id: u16,
        params: Vec<Value>,
        local_origin: bool,
        stream_receive: bool,
        stub: Arc<dyn PipeStub>,
    ) -> Arc<Self> {
        let (sender, receiver) = oneshot::channel();
        Arc::new(Self {
            id,
            priority,
            function_id,
            params,
            local_origin,
            stub,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            source: stream_receive.then(BlockSource::new),
            closed: Flag::new(),
            eof_sent: Flag::new(),
        })
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn function_id(&self) -> u16 {
        self.function_id
    }

    /// The call arguments carried by the `Open`.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Whether this endpoint opened the pipe, as opposed to having
    /// accepted the peer's `Open`.
    pub fn is_local_origin(&self) -> bool {
        self.local_origin
    }

    /// Whether a `Close` was sent or received on this pipe.
    pub fn is_closed(&self) -> bool {
        self.closed.test()
    }

    /// Takes the call future. Yields it once; a second take fails.
    pub fn call(&self) -> Result<Call> {
        match self.receiver.lock().take() {
            Some(receiver) => Ok(Call { receiver }),
            None => Err("The call future was already taken").wrapped(ErrorKind::SessionPipe),
        }
    }

    /// The inbound payload stream, for pipes that declared stream
    /// reception.
    pub fn blocks(&self) -> Result<BlockSource> {
        match &self.source {
            Some(source) => Ok(source.clone()),
            None => {
                Err("The pipe didn't declare stream reception").wrapped(ErrorKind::SessionPipe)
            }
        }
    }

    /// Emits the `Open` frame that starts the call.
    pub(crate) async fn send_open(&self) -> Result<()> {
        let open = Open::new(self.id, self.priority, self.function_id, self.params.clone());
        self.stub.post(Message::Open(open)).await
    }

    /// Enqueues one non-terminal payload block.
    pub async fn send_block(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > Block::MAX_PAYLOAD {
            // fail at the encode stage, before anything is queued
            return Err("Block payload exceeds the maximum size").wrapped(ErrorKind::Codec);
        }
        if self.closed.test() {
            return Err("The pipe is closed").wrapped(ErrorKind::SessionPipe);
        }
        if self.eof_sent.test() {
            return Err("EOF was already sent on this pipe").wrapped(ErrorKind::SessionPipe);
        }
        let block = Block::new(self.id, payload.to_vec());
        self.stub.post(Message::Block(block)).await
    }

    /// Terminates the outbound stream with an empty EOF block.
    pub async fn send_eof(&self) -> Result<()> {
        if self.closed.test() {
            return Err("The pipe is closed").wrapped(ErrorKind::SessionPipe);
        }
        if self.eof_sent.test() {
            return Ok(());
        }
        self.eof_sent.set();
        self.stub.post(Message::Block(Block::eof(self.id))).await
    }

    /// Splices an arbitrary byte stream into payload blocks.
    pub async fn write(&self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(Block::MAX_PAYLOAD) {
            self.send_block(chunk).await?;
        }
        Ok(())
    }

    /// Closes the pipe reporting a successful result.
    pub async fn close_success(&self, value: Value) -> Result<()> {
        self.close_with(Ok(value)).await
    }

    /// Closes the pipe reporting a failure.
    pub async fn close_failure<S: Into<String>>(&self, code: i32, message: S) -> Result<()> {
        self.close_with(Err(Abort::new(code, message))).await
    }

    /// Emits a `Close`, completes the future, and destroys the pipe.
    ///
    /// Idempotent: whoever wins the race on the closed flag completes
    /// the future; a second close is a no-op.
    pub async fn close_with(&self, result: CallResult) -> Result<()> {
        let sender = match self.sender.lock().take() {
            Some(sender) => sender,
            None => return Ok(()),
        };
        self.closed.set();
        let close = match &result {
            Ok(value) => Close::with_success(self.id, value.clone()),
            Err(abort) => Close::with_abort(self.id, abort.clone()),
        };
        // a session already tearing down can no longer carry the
        // frame; the local future still completes
        let posted = self.stub.post(Message::Close(close)).await;
        if let Some(source) = &self.source {
            source.push_eof();
        }
        let _ = sender.send(result);
        self.stub.closed(self);
        posted
    }

    /// Routes a peer block into the pipe.
    ///
    /// Blocks arriving on a pipe that never declared stream reception
    /// terminate the call instead.
    pub(crate) async fn deliver_block(&self, block: Block) -> Result<()> {
        let source = match &self.source {
            Some(source) => source,
            None => {
                return self
                    .close_failure(
                        Abort::FUNCTION_CANNOT_RECEIVE_BLOCK,
                        "the function does not receive blocks",
                    )
                    .await;
            }
        };
        if block.is_eof() {
            source.push_eof();
        } else {
            source.push(block.into_payload());
        }
        Ok(())
    }

    /// Routes the peer's `Close` into the pipe, completing the
    /// future. Loses silently against a local close that already
    /// won the race.
    pub(crate) fn deliver_close(&self, close: Close) {
        let sender = match self.sender.lock().take() {
            Some(sender) => sender,
            None => return,
        };
        self.closed.set();
        if let Some(source) = &self.source {
            source.push_eof();
        }
        // leave the space before completing, so a caller awaiting the
        // future observes the pipe already gone
        self.stub.closed(self);
        let _ = sender.send(close.into_result());
    }

    /// Fails the future locally without emitting a frame; the forced
    /// session-teardown path.
    pub(crate) fn abort_local(&self, abort: Abort) {
        let sender = match self.sender.lock().take() {
            Some(sender) => sender,
            None => return,
        };
        self.closed.set();
        if let Some(source) = &self.source {
            source.push_eof();
        }
        let _ = sender.send(Err(abort));
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipe({}, fn={}, {})",
            self.id,
            self.function_id,
            if self.local_origin { "local" } else { "remote" },
        )
    }
}

/// Why a peer's `Open` was refused by the pipe space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AcceptError {
    /// The id carries the wrong primary bit for the sending side; a
    /// protocol violation fatal to the session.
    WrongSide(PipeId),
    /// The id is already bound to a live pipe; the affected pipe is
    /// refused but the session survives.
    Duplicate(PipeId),
    /// The space stopped accepting new pipes.
    Closed,
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::WrongSide(id) => {
                write!(f, "pipe id {} carries the sender's own side bit", id)
            }
            AcceptError::Duplicate(id) => write!(f, "pipe id {} is already in use", id),
            AcceptError::Closed => write!(f, "the pipe space is closed"),
        }
    }
}

impl std::error::Error for AcceptError {}

/// Per-session registry of in-flight pipes, keyed by pipe id.
pub struct PipeSpace {
    // 0x8000 when the owning session is primary, else 0
    mask: u16,
    counter: AtomicU32,
    pipes: RwLock<IntMap<Arc<Pipe>>>,
    closed: Flag,
}

impl PipeSpace {
    /// Upper bound on id-allocation attempts; half the id space.
    const MAX_ATTEMPTS: usize = 1 << 15;

    /// Creates the pipe space of a session with the given role.
    pub fn new(primary: bool) -> Self {
        Self {
            mask: if primary { PipeId::PRIMARY_MASK } else { 0 },
            counter: AtomicU32::new(0),
            pipes: RwLock::new(IntMap::new()),
            closed: Flag::new(),
        }
    }

    /// The number of live pipes.
    pub fn len(&self) -> usize {
        self.pipes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.read().len() == 0
    }

    /// Creates a locally-originated pipe on a fresh id.
    ///
    /// Ids are drawn from this side's half of the id space; a bounded
    /// retry skips ids still bound to live pipes.
    pub(crate) fn create(
        &self,
        stub: Arc<dyn PipeStub>,
        priority: i8,
        function_id: u16,
        params: Vec<Value>,
        stream_receive: bool,
    ) -> Result<Arc<Pipe>> {
        if self.closed.test() {
            return Err("The pipe space is closed").wrapped(ErrorKind::SessionPipe);
        }
        for _ in 0..Self::MAX_ATTEMPTS {
            let raw = (self.counter.fetch_add(1, Ordering::Relaxed) as u16 & 0x7FFF) | self.mask;
            if raw == 0 {
                continue;
            }
            let id = PipeId::from(raw);
            let mut pipes = self.pipes.write();
            if pipes.contains_key(raw as u64) {
                continue;
            }
            let pipe = Pipe::new(
                id,
                priority,
                function_id,
                params,
                true,
                stream_receive,
                stub,
            );
            pipes.insert(raw as u64, pipe.clone());
            return Ok(pipe);
        }
        Err("All pipe ids are in flight").wrapped(ErrorKind::SessionPipe)
    }

    /// Installs a pipe for a peer's `Open`.
    ///
    /// The incoming id must carry the opposite primary bit: a primary
    /// session only accepts ids without the mask, a secondary session
    /// only ids with it.
    pub(crate) fn accept(
        &self,
        stub: Arc<dyn PipeStub>,
        open: &Open,
        stream_receive: bool,
    ) -> std::result::Result<Arc<Pipe>, AcceptError> {
        if self.closed.test() {
            return Err(AcceptError::Closed);
        }
        let id = open.pipe_id();
        let expected_remote = self.mask == 0;
        if id.on_primary_side() != expected_remote {
            return Err(AcceptError::WrongSide(id));
        }
        let raw: u16 = id.into();
        let mut pipes = self.pipes.write();
        if pipes.contains_key(raw as u64) {
            return Err(AcceptError::Duplicate(id));
        }
        let pipe = Pipe::new(
            id,
            open.priority(),
            open.function_id(),
            open.params().to_vec(),
            false,
            stream_receive,
            stub,
        );
        pipes.insert(raw as u64, pipe.clone());
        Ok(pipe)
    }

    /// Looks up a live pipe.
    pub fn get(&self, id: PipeId) -> Option<Arc<Pipe>> {
        self.pipes.read().get(u64::from(id)).cloned()
    }

    /// Drops a pipe from the space.
    pub fn destroy(&self, id: PipeId) {
        self.pipes.write().remove(u64::from(id));
    }

    /// Stops accepting pipes and drains the remaining ones.
    ///
    /// The session aborts each returned pipe, emitting the
    /// session-closing `Close` per pipe when the teardown is
    /// graceful.
    pub(crate) fn close(&self) -> Vec<Arc<Pipe>> {
        self.closed.set();
        let mut pipes = self.pipes.write();
        let drained = pipes.iter().map(|(_, pipe)| pipe.clone()).collect();
        pipes.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::executor::block_on;

    struct RecordingStub {
        posts: Mutex<Vec<Message>>,
    }

    impl RecordingStub {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                posts: Mutex::new(Vec::new()),
            })
        }

        fn posted(&self) -> Vec<Message> {
            self.posts.lock().clone()
        }
    }

    impl PipeStub for RecordingStub {
        fn post(&self, message: Message) -> BoxFuture<'_, Result<()>> {
            self.posts.lock().push(message);
            Box::pin(async { Ok(()) })
        }

        fn closed(&self, _pipe: &Pipe) {}
    }

    fn open_with_id(raw: u16) -> Open {
        Open::new(PipeId::from(raw), 0, 1, vec![])
    }

    #[test]
    fn created_ids_carry_the_session_side_bit() {
        let stub = RecordingStub::new();

        let primary = PipeSpace::new(true);
        for _ in 0..100 {
            let pipe = primary
                .create(stub.clone(), 0, 1, vec![], false)
                .expect("id available");
            assert!(pipe.id().on_primary_side());
        }

        let secondary = PipeSpace::new(false);
        for _ in 0..100 {
            let pipe = secondary
                .create(stub.clone(), 0, 1, vec![], false)
                .expect("id available");
            assert!(!pipe.id().on_primary_side());
        }
    }

    #[test]
    fn accept_enforces_the_opposite_side_bit() {
        let stub = RecordingStub::new();

        let primary = PipeSpace::new(true);
        assert!(primary.accept(stub.clone(), &open_with_id(0x0001), false).is_ok());
        assert_eq!(
            primary
                .accept(stub.clone(), &open_with_id(0x8001), false)
                .unwrap_err(),
            AcceptError::WrongSide(PipeId::from(0x8001)),
        );

        let secondary = PipeSpace::new(false);
        assert!(secondary.accept(stub.clone(), &open_with_id(0x8001), false).is_ok());
        assert_eq!(
            secondary
                .accept(stub, &open_with_id(0x0001), false)
                .unwrap_err(),
            AcceptError::WrongSide(PipeId::from(0x0001)),
        );
    }

    #[test]
    fn accept_refuses_duplicates() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        space.accept(stub.clone(), &open_with_id(7), false).unwrap();
        assert_eq!(
            space.accept(stub, &open_with_id(7), false).unwrap_err(),
            AcceptError::Duplicate(PipeId::from(7)),
        );
    }

    #[test]
    fn id_allocation_skips_live_pipes_and_exhausts() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(false);
        // fill the entire secondary half of the id space
        let mut pipes = Vec::new();
        for _ in 0..(1 << 15) - 1 {
            pipes.push(space.create(stub.clone(), 0, 1, vec![], false).unwrap());
        }
        assert!(space.create(stub, 0, 1, vec![], false).is_err());
    }

    #[test]
    fn close_future_completes_exactly_once() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        let pipe = space.create(stub.clone(), 0, 9, vec![], false).unwrap();
        let call = pipe.call().unwrap();

        block_on(async {
            pipe.close_success(Value::Int32(5)).await.unwrap();
            // the loser of the race is dropped silently
            pipe.close_failure(Abort::UNEXPECTED, "ignored").await.unwrap();
            pipe.deliver_close(Close::with_success(pipe.id(), Value::Null));

            assert_eq!(call.await, Ok(Value::Int32(5)));
        });

        // only the winning close emitted a frame
        let frames = stub.posted();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Message::Close(c) if c.result().is_ok()));
    }

    #[test]
    fn peer_close_completes_the_future() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        let pipe = space.create(stub, 0, 9, vec![], false).unwrap();
        let call = pipe.call().unwrap();

        pipe.deliver_close(Close::with_error(pipe.id(), Abort::FUNCTION_FAILED, "boom"));
        let result = block_on(call);
        assert_eq!(result.unwrap_err().code(), Abort::FUNCTION_FAILED);
    }

    #[test]
    fn oversize_block_fails_without_posting() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        let pipe = space.create(stub.clone(), 0, 9, vec![], false).unwrap();

        let buf = vec![0; Block::MAX_PAYLOAD + 1];
        assert!(block_on(pipe.send_block(&buf)).is_err());
        assert!(stub.posted().is_empty());
        assert!(!pipe.is_closed());
    }

    #[test]
    fn write_chunks_at_the_payload_cap() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        let pipe = space.create(stub.clone(), 0, 9, vec![], false).unwrap();

        let buf = vec![7; Block::MAX_PAYLOAD + 100];
        block_on(pipe.write(&buf)).unwrap();

        let frames = stub.posted();
        assert_eq!(frames.len(), 2);
        match (&frames[0], &frames[1]) {
            (Message::Block(a), Message::Block(b)) => {
                assert_eq!(a.payload().len(), Block::MAX_PAYLOAD);
                assert_eq!(b.payload().len(), 100);
            }
            other => panic!("expected two blocks, got {:?}", other),
        }
    }

    #[test]
    fn no_blocks_after_eof() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        let pipe = space.create(stub, 0, 9, vec![], false).unwrap();

        block_on(async {
            pipe.send_block(&[1]).await.unwrap();
            pipe.send_eof().await.unwrap();
            assert!(pipe.send_block(&[2]).await.is_err());
        });
    }

    #[test]
    fn blocks_stream_in_order_until_eof() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        let pipe = space.create(stub, 0, 9, vec![], true).unwrap();
        let source = pipe.blocks().unwrap();

        block_on(async {
            pipe.deliver_block(Block::new(pipe.id(), vec![1])).await.unwrap();
            pipe.deliver_block(Block::new(pipe.id(), vec![2])).await.unwrap();
            pipe.deliver_block(Block::eof(pipe.id())).await.unwrap();

            assert_eq!(source.next().await, Some(vec![1]));
            assert_eq!(source.next().await, Some(vec![2]));
            assert_eq!(source.next().await, None);
        });
    }

    #[test]
    fn blocks_at_a_non_streaming_pipe_terminate_the_call() {
        let stub = RecordingStub::new();
        let space = PipeSpace::new(true);
        let pipe = space.create(stub.clone(), 0, 9, vec![], false).unwrap();
        let call = pipe.call().unwrap();

        block_on(async {
            pipe.deliver_block(Block::new(pipe.id(), vec![1])).await.unwrap();
            let result = call.await;
            assert_eq!(
                result.unwrap_err().code(),
                Abort::FUNCTION_CANNOT_RECEIVE_BLOCK,
            );
        });
    }
}
