//! Pool behavior through the public surface: pre-warm shape, saturation
//! blocking, live accounting, sentinel handles, close idempotence.

use std::sync::atomic::Ordering;
use std::time::Duration;

use seine::{Error, Pool, PoolConfig};
use seine_testkit::{init_tracing, wait_until, LoopbackFactory, TextMsg};

#[tokio::test]
async fn prewarm_then_saturate_2_4_4() {
    init_tracing();
    let factory = LoopbackFactory::echo();
    let pool = Pool::new(
        factory.clone(),
        PoolConfig {
            idle_min: 2,
            idle_max: 4,
            max: 4,
        },
    );
    pool.open().await.unwrap();
    assert_eq!(pool.live(), 2);
    assert_eq!(factory.built.load(Ordering::SeqCst), 2);

    let handles = vec![
        pool.get().await,
        pool.get().await,
        pool.get().await,
        pool.get().await,
    ];
    assert!(handles.iter().all(|h| h.error().is_none()));
    assert_eq!(pool.live(), 4);
    assert_eq!(factory.built.load(Ordering::SeqCst), 4);

    // Fifth acquisition blocks until a handle comes back.
    let blocked = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    handles[0].close();
    let fifth = blocked.await.unwrap();
    assert!(fifth.error().is_none());
    assert_eq!(pool.live(), 4);

    drop(handles);
    drop(fifth);
    pool.close().await;
    assert_eq!(pool.live(), 0);
}

#[tokio::test]
async fn handles_carry_working_clients() {
    let factory = LoopbackFactory::echo();
    let pool = Pool::new(
        factory.clone(),
        PoolConfig {
            idle_min: 1,
            idle_max: 1,
            max: 1,
        },
    );
    pool.open().await.unwrap();

    let handle = pool.get().await;
    assert!(handle.is_connected());
    handle.send(TextMsg::new("via pool")).await.unwrap();
    wait_until(|| {
        factory
            .peer_handler
            .messages
            .lock()
            .iter()
            .any(|m| m == "via pool")
    })
    .await;

    // Returning and re-acquiring reuses the same live client.
    handle.close();
    let again = pool.get().await;
    assert!(again.error().is_none());
    assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    assert_eq!(pool.live(), 1);

    again.close();
    pool.close().await;
    assert_eq!(pool.live(), 0);
}

#[tokio::test]
async fn operations_on_returned_handle_fail_closed() {
    let factory = LoopbackFactory::echo();
    let pool = Pool::new(
        factory,
        PoolConfig {
            idle_min: 0,
            idle_max: 1,
            max: 1,
        },
    );
    pool.open().await.unwrap();

    let handle = pool.get().await;
    handle.close();
    let err = handle.send(TextMsg::new("too late")).await.unwrap_err();
    assert!(matches!(err, Error::ClientClosed));

    pool.close().await;
}

#[tokio::test]
async fn double_close_and_post_close_sentinels() {
    let factory = LoopbackFactory::echo();
    let pool = Pool::new(
        factory,
        PoolConfig {
            idle_min: 1,
            idle_max: 2,
            max: 2,
        },
    );
    pool.open().await.unwrap();

    pool.close().await;
    pool.close().await;
    assert_eq!(pool.live(), 0);

    let sentinel = pool.get().await;
    assert!(matches!(sentinel.error(), Some(Error::PoolClosed)));
    let err = sentinel.send(TextMsg::new("nope")).await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed));
}
