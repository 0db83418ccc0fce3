//! End-to-end epoch run of the timestamp service: pooled statements get a
//! Merkle proof and a collective signature that verify on the client side.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::time::Duration;
use tokio::time::{sleep, timeout};

use cothority::overlay::Roster;
use cothority::service::Client;
use cothority::testing::LocalSet;
use cothority::timestamp::{
    self, FetchProofRequest, FetchProofResponse, SignatureRequest, SignatureResponse,
    TimestampService, SERVICE_NAME,
};
use cothority::Config;

const EPOCH: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(5);

/// Serializes the register-then-instantiate window: the factory is a
/// process-wide slot and each test parameterizes it with its own roster.
static REGISTRY_GUARD: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn start_cothority(n: usize) -> (LocalSet, Roster) {
    let _guard = REGISTRY_GUARD.lock().await;
    let keypairs = LocalSet::fresh_keypairs(n);
    let roster = Roster::new(keypairs.iter().map(|k| k.identity().clone()).collect());
    TimestampService::register_with(EPOCH, DEADLINE, Some(roster.clone()));
    let set = LocalSet::with_keypairs(keypairs, Config::default()).await;
    (set, roster)
}

/// Poll for the statement's proof, resubmitting it when it missed the last
/// completed epoch (the documented client behavior for the fire-and-forget
/// contract).
async fn fetch_until_proved(
    client: &Client,
    dst: &cothority::ServerIdentity,
    message: &[u8],
) -> FetchProofResponse {
    let give_up = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let packet = client
            .send(dst, &FetchProofRequest { message: message.to_vec() })
            .await
            .expect("fetch proof round-trip");
        let resp = packet.take::<FetchProofResponse>().expect("typed response");
        if resp.proof.is_some() {
            return resp;
        }
        assert!(
            tokio::time::Instant::now() < give_up,
            "no proof for statement after several epochs"
        );
        client
            .send(dst, &SignatureRequest { message: message.to_vec() })
            .await
            .expect("resubmission round-trip");
        sleep(EPOCH).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn epoch_signs_batch_and_vends_proofs() {
    let (set, roster) = start_cothority(4).await;

    let client = Client::new(SERVICE_NAME);
    let root = set.server(0).identity().clone();
    let statements: Vec<Vec<u8>> = (0..3)
        .map(|i| format!("statement-{i}").into_bytes())
        .collect();

    // Submit the whole batch within one epoch; the immediate replies are
    // fire-and-forget and carry no proof.
    for statement in &statements {
        let packet = timeout(
            Duration::from_secs(5),
            client.send(&root, &SignatureRequest { message: statement.clone() }),
        )
        .await
        .expect("reply within deadline")
        .expect("signature request round-trip");
        let resp = packet.take::<SignatureResponse>().expect("typed response");
        assert!(resp.proof.is_none());
    }

    // After the next epochs each statement's inclusion proof verifies
    // against its root, and the signature covers root ‖ varint(time).
    for statement in &statements {
        let resp = fetch_until_proved(&client, &root, statement).await;
        assert!(
            timestamp::verify_response(&roster, statement, &resp),
            "proof or signature failed verification"
        );
        assert!(resp.timestamp > 0);
        assert!(
            !timestamp::verify_response(&roster, b"forged statement", &resp),
            "verification must bind the statement"
        );
    }

    set.close_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signature_request_returns_previous_epoch() {
    let (set, _roster) = start_cothority(2).await;

    let client = Client::new(SERVICE_NAME);
    let root = set.server(0).identity().clone();

    // Before any epoch completed there is nothing to hand out.
    let packet = client
        .send(&root, &SignatureRequest { message: b"first".to_vec() })
        .await
        .expect("first request");
    let first = packet.take::<SignatureResponse>().expect("typed response");
    assert!(first.signature.is_none());

    // Once an epoch has signed, later requests see a (stale) signature.
    let _ = fetch_until_proved(&client, &root, b"first").await;
    let packet = client
        .send(&root, &SignatureRequest { message: b"second".to_vec() })
        .await
        .expect("second request");
    let second = packet.take::<SignatureResponse>().expect("typed response");
    assert!(second.signature.is_some());
    assert!(second.proof.is_none(), "immediate replies never carry a proof");

    set.close_all().await;
}
