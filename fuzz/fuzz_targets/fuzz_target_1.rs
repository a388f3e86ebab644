#![no_main]

use libfuzzer_sys::fuzz_target;
use socket_flow_core::{Connection, Options, Role};
use tokio::io::{duplex, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio::time::{timeout, Duration};

// Feeds arbitrary bytes straight into a Connection's reader task as if they
// arrived off the wire, exercising the frame parser, message assembler,
// UTF-8 validation and close-handshake paths without a real socket. The
// connection core must never panic on malformed input; at worst it closes.
fuzz_target!(|data: &[u8]| {
    let runtime = Runtime::new().unwrap();
    let data = data.to_vec();

    runtime.block_on(async move {
        let (mut peer, local) = duplex(8192);

        let mut options = Options::default();
        options.heartbeat_enabled = false;

        let connection = Connection::new(local, Role::Responder, options).await;

        let _ = peer.write_all(&data).await;
        drop(peer);

        loop {
            match timeout(Duration::from_millis(200), connection.receive()).await {
                Ok(Ok(Some(message))) => {
                    let _ = timeout(Duration::from_millis(200), message.into_body().collect()).await;
                }
                Ok(Ok(None)) => break,
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }
    });
});
