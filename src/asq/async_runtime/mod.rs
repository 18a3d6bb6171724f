//! Abstractions over the async runtime driving the library.
//!
//! Every executor reference in the crate resolves to the runtime
//! installed here during `init`. Session dispatch work, service
//! invocations, outbound writes and inbound deliveries all run as
//! tasks of this runtime.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
use self::tokio as rt;

use std::future::Future;

use crate::asq::error::*;
use crate::asq::globals::Global;

static RUNTIME: Global<rt::Runtime> = Global::new();

/// A handle to a task spawned into the runtime.
pub type JoinHandle<T> = rt::JoinHandle<T>;

/// Initializes the global runtime with `num_threads` worker threads.
pub unsafe fn init(num_threads: usize) -> Result<()> {
    let runtime = rt::init(num_threads)?;
    RUNTIME.set(runtime);
    Ok(())
}

/// Drops the global runtime.
pub unsafe fn drop() -> Result<()> {
    RUNTIME.unset();
    Ok(())
}

/// Spawns a new task `future` into the global runtime.
///
/// Panics if the runtime hasn't been initialized yet.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    runtime().spawn(future)
}

/// Blocks on a task `future` until it completes.
///
/// Panics if the runtime hasn't been initialized yet.
pub fn block_on<F: Future>(future: F) -> F::Output {
    runtime().block_on(future)
}

fn runtime() -> &'static rt::Runtime {
    match RUNTIME.get() {
        Some(runtime) => runtime,
        None => panic!("async runtime wasn't initialized"),
    }
}
