//! Time limits on futures, used to bound the connection handshake.

use std::future::Future;
use std::time::Duration;

use futures::future::{self, Either};
use futures::pin_mut;
use futures_timer::Delay;

use crate::asq::error::*;

/// Drives `future` to completion, or gives up after `duration`,
/// reporting a timeout error.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    pin_mut!(future);
    match future::select(future, Delay::new(duration)).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err("Operation timed out").wrapped(ErrorKind::Timeouts),
    }
}
