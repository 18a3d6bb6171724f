//! This module contains the implementation details of `asterisque`.
//!
//! The submodules map onto the layers of the runtime: the framed
//! `protocol` and its `codec`, the `communication` primitives carrying
//! frames, the `session` layer multiplexing pipes, the node-wide
//! `dispatcher`, and the `envelope`/`trust` machinery for peer
//! verification.

pub mod async_runtime;
pub mod codec;
pub mod collections;
pub mod communication;
pub mod crypto;
pub mod dispatcher;
pub mod envelope;
pub mod error;

#[cfg(not(feature = "expose_impl"))]
mod globals;

#[cfg(feature = "expose_impl")]
pub mod globals;

pub mod protocol;
pub mod session;
pub mod timeouts;
pub mod trust;

use std::ops::Drop;

use error::*;
use globals::Flag;

static INITIALIZED: Flag = Flag::new();

/// Configure the init process of the library.
pub struct InitConfig {
    /// Number of threads used by the async runtime.
    pub async_threads: usize,
}

/// Handle to the global data.
///
/// When dropped, the data is deinitialized.
pub struct InitGuard;

/// Initializes global data.
///
/// Should always be called before other methods, otherwise runtime
/// panics may ensue. Value conversion extensions must be registered
/// before this call; the registry is frozen here.
pub unsafe fn init(c: InitConfig) -> Result<Option<InitGuard>> {
    if INITIALIZED.test() {
        return Ok(None);
    }
    async_runtime::init(c.async_threads)?;
    codec::convert::init()?;
    INITIALIZED.set();
    Ok(Some(InitGuard))
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        unsafe { drop().unwrap() }
    }
}

unsafe fn drop() -> Result<()> {
    INITIALIZED.unset();
    async_runtime::drop()?;
    codec::convert::drop()?;
    Ok(())
}
