//! Router lifecycle, auto-dial, counters and handshake negotiation, over
//! both the TCP and the in-process transport.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use cothority::core::registry::register_message;
use cothority::core::Packet;
use cothority::router::{Processor, Router};
use cothority::transport::{self, new_host};
use cothority::{Address, Config, Error, Keypair, Message};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SimpleMessage {
    i: u64,
}

impl Message for SimpleMessage {
    const NAME: &'static str = "test.router.SimpleMessage";
}

struct SimpleProc {
    relay: mpsc::UnboundedSender<SimpleMessage>,
}

#[async_trait]
impl Processor for SimpleProc {
    async fn process(&self, packet: Packet) {
        let msg = packet.take::<SimpleMessage>().expect("simple message");
        let _ = self.relay.send(msg);
    }
}

fn new_tcp_router(port: u16) -> Router {
    let keypair = Keypair::generate(Address::tcp(format!("127.0.0.1:{port}")));
    let config = Config::default();
    let host = new_host(
        keypair.identity().address.clone(),
        config.dial_timeout,
        config.max_frame_size,
    );
    Router::new(keypair.identity().clone(), host, config)
}

fn new_local_router(name: &str) -> Router {
    let keypair = Keypair::generate(Address::local(name.to_string()));
    let config = Config::default();
    let host = new_host(
        keypair.identity().address.clone(),
        config.dial_timeout,
        config.max_frame_size,
    );
    Router::new(keypair.identity().clone(), host, config)
}

async fn start_and_wait(router: &Router) -> tokio::task::JoinHandle<()> {
    let mut running = router.running();
    let r = router.clone();
    let handle = tokio::spawn(async move {
        r.start().await.expect("router start");
    });
    running.wait_for(|ready| *ready).await.expect("router up");
    handle
}

fn register_relay(router: &Router) -> mpsc::UnboundedReceiver<SimpleMessage> {
    register_message::<SimpleMessage>();
    let (tx, rx) = mpsc::unbounded_channel();
    router.register_processor(
        Arc::new(SimpleProc { relay: tx }),
        &[cothority::core::registry::message_type_id::<SimpleMessage>()],
    );
    rx
}

async fn test_lifecycle(router: Router) {
    let handle = start_and_wait(&router).await;
    sleep(Duration::from_millis(250)).await;
    router.stop().await.expect("stop");
    timeout(Duration::from_millis(500), handle)
        .await
        .expect("start should have returned by now")
        .expect("start task");
    // Idempotent.
    router.stop().await.expect("second stop");
}

#[tokio::test]
async fn router_lifecycle_tcp() {
    test_lifecycle(new_tcp_router(2004)).await;
}

#[tokio::test]
async fn router_lifecycle_local() {
    test_lifecycle(new_local_router("lifecycle")).await;
}

async fn test_auto_connection(r1: Router, r2: Router) {
    let handle = start_and_wait(&r2).await;
    let mut relay = register_relay(&r2);

    r1.send(r2.identity(), &SimpleMessage { i: 12 })
        .await
        .expect("send with auto-dial");

    let msg = timeout(Duration::from_millis(500), relay.recv())
        .await
        .expect("message within deadline")
        .expect("relay open");
    assert_eq!(msg.i, 12);

    r1.stop().await.expect("stop r1");
    r2.stop().await.expect("stop r2");
    let _ = handle.await;
}

#[tokio::test]
async fn router_auto_connection_tcp() {
    test_auto_connection(new_tcp_router(2007), new_tcp_router(2008)).await;
}

#[tokio::test]
async fn router_auto_connection_local() {
    test_auto_connection(new_local_router("auto-1"), new_local_router("auto-2")).await;
}

#[tokio::test]
async fn router_messaging_and_counters() {
    let h1 = new_tcp_router(2009);
    let h2 = new_tcp_router(2010);
    let t1 = start_and_wait(&h1).await;
    let t2 = start_and_wait(&h2).await;

    let mut relay1 = register_relay(&h1);
    let mut relay2 = register_relay(&h2);

    h1.send(h2.identity(), &SimpleMessage { i: 3 }).await.expect("h1 -> h2");
    let msg = timeout(Duration::from_millis(500), relay2.recv())
        .await
        .expect("h2 receives")
        .expect("relay open");
    assert_eq!(msg.i, 3);

    // The reverse direction also proves h2's table registered the edge.
    h2.send(h1.identity(), &SimpleMessage { i: 3 }).await.expect("h2 -> h1");
    let msg = timeout(Duration::from_millis(500), relay1.recv())
        .await
        .expect("h1 receives")
        .expect("relay open");
    assert_eq!(msg.i, 3);

    let written = h1.tx();
    let read = h2.rx();
    assert!(written > 0, "Tx must be counted");
    assert!(read > 0, "Rx must be counted");
    assert_eq!(written, read, "h1.tx() and h2.rx() must agree");

    h1.stop().await.expect("stop h1");
    h2.stop().await.expect("stop h2");
    let _ = t1.await;
    let _ = t2.await;
}

async fn test_duplex(h1: Router, h2: Router) {
    let t1 = start_and_wait(&h1).await;
    let t2 = start_and_wait(&h2).await;
    let mut relay1 = register_relay(&h1);
    let mut relay2 = register_relay(&h2);

    h1.send(h2.identity(), &SimpleMessage { i: 5 }).await.expect("h1 -> h2");
    timeout(Duration::from_millis(500), relay2.recv())
        .await
        .expect("h2 receives")
        .expect("relay open");

    h2.send(h1.identity(), &SimpleMessage { i: 5 }).await.expect("h2 -> h1");
    timeout(Duration::from_millis(500), relay1.recv())
        .await
        .expect("h1 receives")
        .expect("relay open");

    h1.stop().await.expect("stop h1");
    h2.stop().await.expect("stop h2");
    let _ = t1.await;
    let _ = t2.await;
}

#[tokio::test]
async fn router_send_duplex_tcp() {
    test_duplex(new_tcp_router(2011), new_tcp_router(2012)).await;
}

#[tokio::test]
async fn router_send_duplex_local() {
    test_duplex(new_local_router("duplex-1"), new_local_router("duplex-2")).await;
}

#[tokio::test]
async fn router_exchange() {
    let router1 = new_tcp_router(7878);
    let router2 = new_tcp_router(8787);
    let handle = start_and_wait(&router1).await;
    let config = Config::default();

    // Well-formed negotiation succeeds.
    let conn = transport::dial(
        router2.identity().address.clone(),
        &router1.identity().address,
        config.dial_timeout,
        config.max_frame_size,
    )
    .await
    .expect("dial router1");
    router2
        .negotiate_open(router1.identity(), &conn)
        .await
        .expect("correct negotiation");
    conn.close().await;

    // Expecting the wrong identity aborts.
    let conn = transport::dial(
        router2.identity().address.clone(),
        &router1.identity().address,
        config.dial_timeout,
        config.max_frame_size,
    )
    .await
    .expect("dial router1 again");
    let err = router2
        .negotiate_open(router2.identity(), &conn)
        .await
        .expect_err("negotiation should have aborted");
    assert!(
        matches!(
            err,
            Error::WrongPeer { .. } | Error::Closed | Error::Io(_) | Error::DialTimeout(_)
        ),
        "unexpected error: {err:?}"
    );
    conn.close().await;

    router2.stop().await.expect("stop router2");
    router1.stop().await.expect("stop router1");
    let _ = handle.await;
}

#[tokio::test]
async fn send_to_self_dispatches_locally() {
    let router = new_local_router("self-send");
    let mut relay = register_relay(&router);
    router
        .send(&router.identity().clone(), &SimpleMessage { i: 7 })
        .await
        .expect("self send");
    let msg = timeout(Duration::from_millis(200), relay.recv())
        .await
        .expect("local dispatch")
        .expect("relay open");
    assert_eq!(msg.i, 7);
}

#[tokio::test]
async fn send_after_stop_fails_fast() {
    let router = new_local_router("stopped-send");
    let handle = start_and_wait(&router).await;
    router.stop().await.expect("stop");
    let err = router
        .send(
            &Keypair::generate(Address::local("nowhere")).identity().clone(),
            &SimpleMessage { i: 1 },
        )
        .await
        .expect_err("send after stop");
    assert!(matches!(err, Error::Closed));
    let _ = handle.await;
}
