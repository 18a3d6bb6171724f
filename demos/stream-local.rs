mod common;

use common::*;

use asterisque::asq::async_runtime as rt;
use asterisque::asq::communication::local;
use asterisque::asq::dispatcher::remote::Remote;

use futures::join;

fn main() {
    let _guard = init();
    rt::block_on(async_main());
}

async fn async_main() {
    let server = dispatcher();
    let client = dispatcher();
    server.services().set("echo", echo_service()).unwrap();

    let (server_wire, client_wire) = local::pair(64);
    let (server_session, client_session) = join!(
        server.bind(server_wire, "echo", 10, 30),
        client.bind(client_wire, "echo", 10, 30),
    );
    let server_session = server_session.unwrap();
    let client_session = client_session.unwrap();

    let remote = Remote::new(client_session);
    let (pipe, call) = remote.call_streaming(20, vec![]).await.unwrap();
    let source = pipe.blocks().unwrap();

    // write a payload larger than one block, then a couple of small
    // chunks, and read the echo back
    pipe.write(&vec![0x5A; 100_000]).await.unwrap();
    pipe.send_block(b"tail-1").await.unwrap();
    pipe.send_block(b"tail-2").await.unwrap();
    pipe.send_eof().await.unwrap();

    let mut echoed = 0usize;
    while let Some(chunk) = source.next().await {
        echoed += chunk.len();
    }
    println!("echoed {} bytes back, result: {:?}", echoed, call.await);

    server_session.close(true).await;
}
