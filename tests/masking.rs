//! Masking-discipline enforcement: a server drops unmasked client frames
//! and a client drops masked server frames, in both cases without
//! dispatching the offending payload.

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use common::{RawPeer, raw_upgrade, spawn_echo_server, within_a_second};
use sockframe::{Event, Role, WsClient, handshake};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn server_closes_on_unmasked_frame_without_dispatch() {
    let (server, addr) = spawn_echo_server().await;
    let dispatched = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dispatched);
    server.on(Event::Text, move |_conn, _payload| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let stream = raw_upgrade(addr).await;
    let mut peer = RawPeer::new(stream, Role::Client);

    // Text frame "hi" with the mask bit clear: a violation from a client.
    peer.send_bytes(&[0x81, 0x02, b'h', b'i']).await;

    within_a_second(peer.expect_close()).await;
    assert!(
        !dispatched.load(Ordering::SeqCst),
        "violating frame must not reach handlers"
    );

    server.stop().await;
}

#[tokio::test]
async fn client_closes_on_masked_frame_without_dispatch() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind raw server");
    let addr = listener.local_addr().expect("local addr");

    // Raw acceptor: complete the upgrade, then misbehave by masking a
    // server-to-client frame.
    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake::accept(&mut stream).await.expect("upgrade");
        stream
            .write_all(&[0x81, 0x82, 7, 7, 7, 7, b'h' ^ 7, b'i' ^ 7])
            .await
            .expect("write masked frame");
        stream
    });

    let session = WsClient::builder()
        .connect("127.0.0.1", addr.port())
        .await
        .expect("connect");

    let dispatched = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dispatched);
    session.on(Event::Text, move |_conn, _payload| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(true, Ordering::SeqCst);
        }
    });
    session.serve();

    within_a_second(session.closed()).await;
    assert!(!session.is_serving());
    assert!(
        !dispatched.load(Ordering::SeqCst),
        "violating frame must not reach handlers"
    );

    let _ = server_task.await;
}
