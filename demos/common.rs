use std::sync::Arc;
use std::time::Duration;

use asterisque::asq::dispatcher::remote::FunctionTable;
use asterisque::asq::dispatcher::{Dispatcher, DispatcherConfig};
use asterisque::asq::protocol::value::Value;
use asterisque::asq::protocol::Abort;
use asterisque::asq::{init as runtime_init, InitConfig, InitGuard};

use uuid::Uuid;

/// Bootstraps logging and the library runtime.
pub fn init() -> InitGuard {
    tracing_subscriber::fmt::init();
    let conf = InitConfig {
        async_threads: num_cpus::get(),
    };
    unsafe { runtime_init(conf).unwrap().unwrap() }
}

/// A dispatcher with a short handshake timeout, enough for loopback.
pub fn dispatcher() -> Arc<Dispatcher> {
    Dispatcher::new(DispatcherConfig {
        node_id: Uuid::new_v4(),
        handshake_timeout: Duration::from_secs(2),
    })
}

/// The demo service: function 10 echoes its first string argument,
/// function 20 echoes payload blocks until EOF and reports the count.
pub fn echo_service() -> Arc<FunctionTable> {
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
                let mut count = 0i64;
                while let Some(chunk) = source.next().await {
                    count += 1;
                    if pipe.send_block(&chunk).await.is_err() {
                        return Err(Abort::new(Abort::FUNCTION_FAILED, "echo failed"));
                    }
                }
                let _ = pipe.send_eof().await;
                Ok(Value::Int64(count))
            })
        });
    Arc::new(table)
}
