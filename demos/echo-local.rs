mod common;

use common::*;

use asterisque::asq::async_runtime as rt;
use asterisque::asq::communication::local;
use asterisque::asq::dispatcher::remote::Remote;
use asterisque::asq::protocol::value::Value;

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
    for word in ["hello", "asterisque", "goodbye"] {
        let call = remote
            .call(10, vec![Value::Text(word.into())])
            .await
            .unwrap();
        println!("echo({:?}) => {:?}", word, call.await);
    }

    server_session.close(true).await;
}
