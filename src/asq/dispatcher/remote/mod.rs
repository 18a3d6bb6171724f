//! Explicit stubs and skeletons over function-id tables.
//!
//! Where the original design resolved remote interfaces through
//! reflective proxies, calls here are bound to numeric function ids
//! directly: a [`FunctionTable`] maps ids onto handlers on the
//! serving side, and a [`Remote`] wraps a session into per-call
//! helpers on the calling side. Typed wrappers are one generated (or
//! hand-written) function away; nothing in the core dispatches
//! dynamically to unknown methods.

use std::sync::Arc;

use crate::asq::collections::{self, HashMap};
use crate::asq::dispatcher::{Service, ServiceFuture};
use crate::asq::error::*;
use crate::asq::protocol::value::Value;
use crate::asq::protocol::Abort;
use crate::asq::session::pipe::{Call, Pipe};
use crate::asq::session::Session;

type Handler = Arc<dyn Fn(Arc<Pipe>) -> ServiceFuture + Send + Sync>;

struct FunctionEntry {
    streaming: bool,
    handler: Handler,
}

/// A service built from a function-id table.
///
/// Ids without a binding answer `FUNCTION_UNDEFINED`; an empty table
/// is the default "function not found" service.
#[derive(Default)]
pub struct FunctionTable {
    functions: HashMap<u16, FunctionEntry>,
}

impl FunctionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            functions: collections::hash_map(),
        }
    }

    /// Binds `handler` under `function_id`.
    pub fn bind<F>(mut self, function_id: u16, handler: F) -> Self
    where
        F: Fn(Arc<Pipe>) -> ServiceFuture + Send + Sync + 'static,
    {
        self.functions.insert(
            function_id,
            FunctionEntry {
                streaming: false,
                handler: Arc::new(handler),
            },
        );
        self
    }

    /// Binds `handler` under `function_id`, declaring that the
    /// function consumes inbound payload blocks.
    pub fn bind_streaming<F>(mut self, function_id: u16, handler: F) -> Self
    where
        F: Fn(Arc<Pipe>) -> ServiceFuture + Send + Sync + 'static,
    {
        self.functions.insert(
            function_id,
            FunctionEntry {
                streaming: true,
                handler: Arc::new(handler),
            },
        );
        self
    }
}

impl Service for FunctionTable {
    fn receives_blocks(&self, function: u16) -> bool {
        self.functions
            .get(&function)
            .map(|entry| entry.streaming)
            .unwrap_or(false)
    }

    fn invoke(&self, pipe: Arc<Pipe>) -> ServiceFuture {
        match self.functions.get(&pipe.function_id()) {
            Some(entry) => (entry.handler)(pipe),
            None => Box::pin(async move {
                Err(Abort::new(
                    Abort::FUNCTION_UNDEFINED,
                    format!("function {} is not defined", pipe.function_id()),
                ))
            }),
        }
    }
}

/// The default service: answers every call with `FUNCTION_UNDEFINED`.
pub fn undefined() -> Arc<dyn Service> {
    Arc::new(FunctionTable::new())
}

/// A calling-side stub over one session.
///
/// The thin base every generated wrapper rests on: pick a function
/// id, pass the arguments, get the future of the result.
pub struct Remote {
    session: Arc<Session>,
    priority: i8,
}

impl Remote {
    /// Wraps a session at the default priority.
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            priority: 0,
        }
    }

    /// Sets the priority stamped onto every call's `Open`.
    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    /// The session behind this stub.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Calls the peer's function `function_id`.
    pub async fn call(&self, function_id: u16, params: Vec<Value>) -> Result<Call> {
        self.session.open(self.priority, function_id, params).await
    }

    /// Calls the peer's function `function_id` with stream reception
    /// enabled on the returned pipe.
    pub async fn call_streaming(
        &self,
        function_id: u16,
        params: Vec<Value>,
    ) -> Result<(Arc<Pipe>, Call)> {
        self.session
            .open_streaming(self.priority, function_id, params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_is_the_undefined_service() {
        let table = FunctionTable::new();
        assert!(!table.receives_blocks(1));

        let service = undefined();
        assert!(!service.receives_blocks(42));
    }

    #[test]
    fn streaming_flag_follows_the_binding() {
        let table = FunctionTable::new()
            .bind(1, |_| Box::pin(async { Ok(Value::Null) }))
            .bind_streaming(2, |_| Box::pin(async { Ok(Value::Null) }));
        assert!(!table.receives_blocks(1));
        assert!(table.receives_blocks(2));
        assert!(!table.receives_blocks(3));
    }
}
