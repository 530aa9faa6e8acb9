//! Request/response correlation: replies find their callers, timeouts and
//! disconnects settle the table, late replies fall through to the handler.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use seine::{Client, ClientConfig, Error, IoConfig};
use seine_testkit::{
    init_tracing, loopback_dialer, wait_until, CallCodec, CallMsg, CallResponder, CountingHandler,
};

fn call_client(responder: Arc<CallResponder>) -> Client {
    let dial = loopback_dialer(Arc::new(CallCodec), responder, IoConfig::default());
    let client = Client::new(dial, ClientConfig::default());
    client.set_codec(Arc::new(CallCodec));
    client
}

#[tokio::test]
async fn call_receives_its_response() {
    init_tracing();
    let responder = CallResponder::new();
    let client = call_client(responder.clone());
    client.dial("loopback").await.unwrap();

    let reply = client.call(CallMsg::request(42, "ping")).await.unwrap();
    let reply = reply.downcast_ref::<CallMsg>().unwrap();
    assert_eq!(reply.id, 42);
    assert!(reply.reply);
    assert_eq!(reply.body, "ping");
    assert_eq!(responder.served.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_calls(), 0);
    client.close();
}

#[tokio::test]
async fn concurrent_calls_resolve_independently() {
    let client = call_client(CallResponder::new());
    client.dial("loopback").await.unwrap();

    let mut calls = Vec::new();
    for id in 1..=8u64 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client
                .call(CallMsg::request(id, format!("body-{id}")))
                .await
        }));
    }
    for (i, call) in calls.into_iter().enumerate() {
        let id = (i + 1) as u64;
        let reply = call.await.unwrap().unwrap();
        let reply = reply.downcast_ref::<CallMsg>().unwrap();
        assert_eq!(reply.id, id);
        assert_eq!(reply.body, format!("body-{id}"));
    }
    assert_eq!(client.pending_calls(), 0);
    client.close();
}

#[tokio::test]
async fn silent_peer_times_out_and_empties_table() {
    let client = call_client(CallResponder::silent());
    client.dial("loopback").await.unwrap();

    let started = Instant::now();
    let err = client
        .call_timeout(CallMsg::request(42, "ping"), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(client.pending_calls(), 0);
    client.close();
}

#[tokio::test]
async fn late_response_is_forwarded_to_user_handler() {
    let client = call_client(CallResponder::delayed(Duration::from_millis(150)));
    let user = CountingHandler::new();
    client.set_handler(user.clone());
    client.dial("loopback").await.unwrap();

    let err = client
        .call_timeout(CallMsg::request(7, "slow"), Duration::from_millis(40))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(client.pending_calls(), 0);

    // The response eventually arrives, finds no pending entry, and lands in
    // the user handler instead.
    wait_until(|| user.message_count() == 1).await;
    assert_eq!(user.messages.lock()[0], "slow");
    client.close();
}

#[tokio::test]
async fn disconnect_settles_outstanding_calls() {
    let client = call_client(CallResponder::silent());
    let user = CountingHandler::new();
    client.set_handler(user.clone());
    client.dial("loopback").await.unwrap();

    let mut outstanding = Vec::new();
    for id in [1u64, 2] {
        let client = client.clone();
        outstanding.push(tokio::spawn(async move {
            client.call(CallMsg::request(id, "stuck")).await
        }));
    }
    wait_until(|| client.pending_calls() == 2).await;

    client.disconnect().await;

    for call in outstanding {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Disconnected), "got {err}");
    }
    assert_eq!(client.pending_calls(), 0);
    wait_until(|| user.disconnected.load(Ordering::SeqCst) == 1).await;
    client.close();
}

#[tokio::test]
async fn session_loss_settles_with_generic_close_error() {
    let client = call_client(CallResponder::silent());
    client.dial("loopback").await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call(CallMsg::request(9, "stuck")).await })
    };
    wait_until(|| client.pending_calls() == 1).await;

    // Transport loss without a recorded error: the generic close settles it.
    client.session().unwrap().close();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ClientClosed), "got {err}");
    assert_eq!(client.pending_calls(), 0);
    client.close();
}

#[tokio::test]
async fn close_fails_outstanding_calls_fast() {
    let client = call_client(CallResponder::silent());
    client.dial("loopback").await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call(CallMsg::request(3, "stuck")).await })
    };
    wait_until(|| client.pending_calls() == 1).await;

    client.close();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ClientClosed), "got {err}");
}
